//! Distance-based cluster quality metrics.

use ndarray::{Array2, ArrayView2};

/// Pairwise Euclidean distances between the rows of `data`.
pub fn pairwise_distances(data: &ArrayView2<'_, f64>) -> Array2<f64> {
    let n = data.nrows();
    let mut out = Array2::zeros((n, n));
    for i in 0..n {
        for j in (i + 1)..n {
            let mut acc = 0.0;
            for k in 0..data.ncols() {
                let d = data[[i, k]] - data[[j, k]];
                acc += d * d;
            }
            let d = acc.sqrt();
            out[[i, j]] = d;
            out[[j, i]] = d;
        }
    }
    out
}

/// Sum over clusters of the within-cluster dispersion
/// `sum(pairwise distances) / (2 * |cluster|)`.
///
/// With `squared`, squared Euclidean distances are summed instead (the
/// inertia-style variant used by the elbow sweep).
pub fn within_cluster_dispersion(
    data: &ArrayView2<'_, f64>,
    labels: &[usize],
    squared: bool,
) -> f64 {
    let n_clusters = labels.iter().copied().max().map_or(0, |m| m + 1);
    let mut total = 0.0;
    for cluster in 0..n_clusters {
        let members: Vec<usize> = labels
            .iter()
            .enumerate()
            .filter_map(|(i, &l)| (l == cluster).then_some(i))
            .collect();
        if members.is_empty() {
            continue;
        }
        let mut acc = 0.0;
        for (a, &i) in members.iter().enumerate() {
            for &j in &members[a + 1..] {
                let mut sq = 0.0;
                for k in 0..data.ncols() {
                    let d = data[[i, k]] - data[[j, k]];
                    sq += d * d;
                }
                // Off-diagonal pairs count twice in the full matrix sum.
                acc += if squared { 2.0 * sq } else { 2.0 * sq.sqrt() };
            }
        }
        total += acc / (2.0 * members.len() as f64);
    }
    total
}

/// Mean silhouette coefficient over all samples.
///
/// Samples in singleton clusters score 0. Requires at least two clusters;
/// callers enforce that before sweeping.
pub fn silhouette_score(data: &ArrayView2<'_, f64>, labels: &[usize]) -> f64 {
    let n = data.nrows();
    let n_clusters = labels.iter().copied().max().map_or(0, |m| m + 1);
    let distances = pairwise_distances(data);
    let mut counts = vec![0usize; n_clusters];
    for &l in labels {
        counts[l] += 1;
    }

    let mut total = 0.0;
    for i in 0..n {
        let own = labels[i];
        if counts[own] <= 1 {
            continue;
        }
        let mut sums = vec![0.0; n_clusters];
        for j in 0..n {
            if j != i {
                sums[labels[j]] += distances[[i, j]];
            }
        }
        let a = sums[own] / (counts[own] - 1) as f64;
        let b = (0..n_clusters)
            .filter(|&c| c != own && counts[c] > 0)
            .map(|c| sums[c] / counts[c] as f64)
            .fold(f64::INFINITY, f64::min);
        total += (b - a) / a.max(b);
    }
    total / n as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn pairwise_distances_are_symmetric_with_zero_diagonal() {
        let data = array![[0.0, 0.0], [3.0, 4.0], [6.0, 8.0]];
        let d = pairwise_distances(&data.view());
        assert_abs_diff_eq!(d[[0, 1]], 5.0, epsilon = 1e-12);
        assert_abs_diff_eq!(d[[1, 0]], 5.0, epsilon = 1e-12);
        assert_abs_diff_eq!(d[[0, 2]], 10.0, epsilon = 1e-12);
        assert_abs_diff_eq!(d[[1, 1]], 0.0, epsilon = 1e-12);
    }

    #[test]
    fn dispersion_of_a_pair_is_its_distance() {
        // One cluster of two points at distance 2: sum(pairwise) = 4,
        // divided by 2*|c| = 4 gives 1; unsquared variant gives d/2 * 2 = 2/2.
        let data = array![[0.0], [2.0]];
        let labels = [0, 0];
        let w = within_cluster_dispersion(&data.view(), &labels, false);
        assert_abs_diff_eq!(w, 1.0, epsilon = 1e-12);
        let w2 = within_cluster_dispersion(&data.view(), &labels, true);
        assert_abs_diff_eq!(w2, 2.0, epsilon = 1e-12);
    }

    #[test]
    fn dispersion_ignores_singletons_and_sums_clusters() {
        let data = array![[0.0], [2.0], [100.0]];
        let labels = [0, 0, 1];
        let w = within_cluster_dispersion(&data.view(), &labels, false);
        assert_abs_diff_eq!(w, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn silhouette_prefers_the_separated_labeling() {
        let data = array![[0.0], [0.1], [10.0], [10.1]];
        let good = silhouette_score(&data.view(), &[0, 0, 1, 1]);
        let bad = silhouette_score(&data.view(), &[0, 1, 0, 1]);
        assert!(good > 0.9);
        assert!(bad < good);
    }
}
