//! Average-linkage agglomerative clustering.

use ndarray::ArrayView2;

use crate::error::{MvaError, Result};
use crate::metrics::pairwise_distances;

/// Merges singleton clusters bottom-up under average linkage until
/// `n_clusters` remain; labels are assigned by first-member order.
///
/// Quadratic in samples; the clustering engine only feeds it the masked,
/// optionally PCA-reduced source matrix.
pub fn agglomerative(data: &ArrayView2<'_, f64>, n_clusters: usize) -> Result<Vec<usize>> {
    let n = data.nrows();
    if n_clusters == 0 || n_clusters > n {
        return Err(MvaError::Validation(format!(
            "cannot form {n_clusters} clusters from {n} samples"
        )));
    }
    let distances = pairwise_distances(data);
    let mut clusters: Vec<Vec<usize>> = (0..n).map(|i| vec![i]).collect();

    while clusters.len() > n_clusters {
        let mut best = (0usize, 1usize);
        let mut best_linkage = f64::INFINITY;
        for a in 0..clusters.len() {
            for b in (a + 1)..clusters.len() {
                let mut sum = 0.0;
                for &i in &clusters[a] {
                    for &j in &clusters[b] {
                        sum += distances[[i, j]];
                    }
                }
                let linkage = sum / (clusters[a].len() * clusters[b].len()) as f64;
                if linkage < best_linkage {
                    best_linkage = linkage;
                    best = (a, b);
                }
            }
        }
        let merged = clusters.remove(best.1);
        clusters[best.0].extend(merged);
    }

    // Stable labels: clusters ordered by their smallest member index.
    clusters.sort_by_key(|members| members.iter().copied().min().unwrap_or(usize::MAX));
    let mut labels = vec![0usize; n];
    for (label, members) in clusters.iter().enumerate() {
        for &i in members {
            labels[i] = label;
        }
    }
    Ok(labels)
}
