//! Cluster analysis over raw signals or decomposition loadings.

use log::{debug, info};
use ndarray::{Array1, Array2, ArrayD, Axis};
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;

use crate::agglomerative::agglomerative;
use crate::dataset::Dataset;
use crate::elbow::estimate_elbow_position;
use crate::error::{MvaError, Result};
use crate::kmeans::KMeans;
use crate::mask::{masked_submatrix, Selector};
use crate::metrics::{silhouette_score, within_cluster_dispersion};
use crate::registry::ClusterAlgorithm;
use crate::results::{ClusterCount, ClusterRecord, SweepRecord};
use crate::scaling::Scaling;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterMetric {
    Elbow,
    Silhouette,
    Gap,
}

impl ClusterMetric {
    fn as_str(&self) -> &'static str {
        match self {
            ClusterMetric::Elbow => "elbow",
            ClusterMetric::Silhouette => "silhouette",
            ClusterMetric::Gap => "gap",
        }
    }
}

pub struct ClusterOptions {
    pub algorithm: ClusterAlgorithm,
    /// Cluster count; falls back to an unambiguous stored estimate.
    pub n_clusters: Option<usize>,
    pub scaling: Scaling,
    /// Cluster the decomposition loadings instead of the raw signals.
    pub use_decomposition_results: bool,
    /// Build cluster centres from the reconstructed decomposition model
    /// instead of raw signal means.
    pub use_decomposition_for_centers: bool,
    /// Components consulted when the decomposition is the source; falls
    /// back to the stored significant-component count.
    pub number_pca_components: Option<usize>,
    pub navigation_mask: Option<ArrayD<bool>>,
    /// Only meaningful when clustering raw signals.
    pub signal_mask: Option<ArrayD<bool>>,
    pub n_init: usize,
    pub max_iter: usize,
    pub tolerance: f64,
    pub seed: Option<u64>,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        ClusterOptions {
            algorithm: ClusterAlgorithm::KMeans,
            n_clusters: None,
            scaling: Scaling::default(),
            use_decomposition_results: false,
            use_decomposition_for_centers: false,
            number_pca_components: None,
            navigation_mask: None,
            signal_mask: None,
            n_init: 10,
            max_iter: 300,
            tolerance: 1e-4,
            seed: None,
        }
    }
}

pub struct ClusterSweepOptions {
    pub base: ClusterOptions,
    pub max_clusters: usize,
    pub metric: ClusterMetric,
    /// Reference resamples per candidate count (gap statistic only).
    pub n_ref: usize,
}

impl Default for ClusterSweepOptions {
    fn default() -> Self {
        ClusterSweepOptions {
            base: ClusterOptions::default(),
            max_clusters: 12,
            metric: ClusterMetric::Gap,
            n_ref: 10,
        }
    }
}

impl Dataset {
    /// Partitions the samples into clusters and derives per-cluster centres
    /// and a presence matrix over the native navigation axes.
    pub fn cluster_analysis(&mut self, options: ClusterOptions) -> Result<()> {
        if self.navigation_size() < 2 {
            return Err(MvaError::Validation(
                "cluster analysis needs at least two samples".into(),
            ));
        }
        let n_clusters = options
            .n_clusters
            .or_else(|| {
                self.learning_results
                    .number_of_clusters
                    .as_ref()
                    .and_then(ClusterCount::single)
            })
            .ok_or_else(|| {
                MvaError::Validation(
                    "n_clusters not given and no unambiguous estimate is stored; \
                     run estimate_number_of_clusters or pick a count"
                        .into(),
                )
            })?;
        if n_clusters < 2 {
            return Err(MvaError::Validation(format!(
                "n_clusters must be at least 2, got {n_clusters}"
            )));
        }
        let navigation = Selector::from_mask(
            options.navigation_mask.as_ref(),
            &self.navigation_shape().to_vec(),
            "navigation_mask",
        )?;

        let did_unfold = self.unfold();
        let outcome = (|| -> Result<ClusterRecord> {
            info!(
                "clustering {} samples into {} clusters with {}",
                navigation.count(self.navigation_size()),
                n_clusters,
                options.algorithm.as_str()
            );
            let scaled = self.scale_data_for_clustering(&options, &navigation)?;
            let labels = run_cluster_kernel(&options, n_clusters, &scaled, 0)?;
            let (membership, labels_matrix, centers) =
                self.create_cluster_centers(&labels, &navigation, &options)?;
            Ok(ClusterRecord {
                algorithm: options.algorithm.as_str().to_string(),
                membership,
                labels_matrix,
                centers,
                number_of_clusters: n_clusters,
                unfolded: did_unfold,
                original_shape: did_unfold.then(|| self.original_shape()),
            })
        })();
        self.fold();
        let record = outcome?;
        self.learning_results.commit_clustering(record);
        Ok(())
    }

    /// Sweeps candidate cluster counts and records the metric curve plus
    /// the count (or counts) it suggests.
    pub fn estimate_number_of_clusters(&mut self, options: ClusterSweepOptions) -> Result<()> {
        let ClusterSweepOptions {
            mut base,
            max_clusters,
            metric,
            n_ref,
        } = options;
        if max_clusters < 2 {
            return Err(MvaError::Validation(format!(
                "max_clusters must be at least 2, got {max_clusters}"
            )));
        }
        if metric == ClusterMetric::Gap && base.algorithm != ClusterAlgorithm::KMeans {
            return Err(MvaError::Validation(
                "the gap statistic is only defined for k-means".into(),
            ));
        }
        if metric == ClusterMetric::Gap {
            // The reference spread is only meaningful for single restarts.
            base.n_init = 1;
        }
        let navigation = Selector::from_mask(
            base.navigation_mask.as_ref(),
            &self.navigation_shape().to_vec(),
            "navigation_mask",
        )?;
        let scaled = self.scale_data_for_clustering(&base, &navigation)?;
        if scaled.nrows() <= max_clusters {
            return Err(MvaError::Validation(format!(
                "max_clusters {} must be below the {} samples available",
                max_clusters,
                scaled.nrows()
            )));
        }

        let min_k = if metric == ClusterMetric::Silhouette
            || base.algorithm == ClusterAlgorithm::Agglomerative
        {
            2
        } else {
            1
        };
        info!(
            "estimating the number of clusters over {}..={} with the {} metric",
            min_k,
            max_clusters,
            metric.as_str()
        );

        let ks: Vec<usize> = (min_k..=max_clusters).collect();
        let mut curve = Vec::with_capacity(ks.len());
        let mut std_errors = Vec::with_capacity(ks.len());
        for &k in &ks {
            let labels = run_cluster_kernel(&base, k, &scaled, 0)?;
            match metric {
                ClusterMetric::Elbow => {
                    let w = within_cluster_dispersion(&scaled.view(), &labels, true);
                    debug!("k = {k}: within-cluster dispersion {w:.6e}");
                    curve.push(w.max(1e-30).ln());
                }
                ClusterMetric::Silhouette => {
                    let score = silhouette_score(&scaled.view(), &labels);
                    debug!("k = {k}: silhouette {score:.4}");
                    curve.push(score);
                }
                ClusterMetric::Gap => {
                    let w = within_cluster_dispersion(&scaled.view(), &labels, false);
                    let data_inertia = w.max(1e-30).ln();
                    let (gap, std_error) =
                        gap_reference(&base, k, &scaled, n_ref, data_inertia)?;
                    debug!("k = {k}: gap {gap:.4} (se {std_error:.4})");
                    curve.push(gap);
                    std_errors.push(std_error);
                }
            }
        }

        let number_of_clusters = match metric {
            ClusterMetric::Elbow => {
                let arr = Array1::from(curve.clone());
                ClusterCount::Single(estimate_elbow_position(&arr.view(), false, 20) + min_k)
            }
            ClusterMetric::Silhouette => {
                ClusterCount::Candidates(silhouette_candidates(&curve, min_k))
            }
            ClusterMetric::Gap => {
                ClusterCount::Single(select_k_by_gap(&curve, &std_errors, min_k))
            }
        };

        self.learning_results.commit_sweep(SweepRecord {
            metric: metric.as_str().to_string(),
            metric_index: ks,
            metric_data: Array1::from(curve),
            number_of_clusters,
        });
        Ok(())
    }

    /// Assembles the matrix the clustering kernel sees: loadings columns or
    /// the doubly-masked raw data, then the configured scaling.
    fn scale_data_for_clustering(
        &self,
        options: &ClusterOptions,
        navigation: &Selector,
    ) -> Result<Array2<f64>> {
        let source = if options.use_decomposition_results {
            let loadings = self
                .learning_results
                .loadings
                .as_ref()
                .ok_or(MvaError::MissingDecomposition("cluster analysis on loadings"))?;
            let n_pca = self.cluster_component_count(options, loadings.ncols())?;
            let trimmed = loadings.slice_axis(Axis(1), (0..n_pca).into()).to_owned();
            navigation.select_rows(&trimmed.view())
        } else {
            let signal = Selector::from_mask(
                options.signal_mask.as_ref(),
                &self.signal_shape().to_vec(),
                "signal_mask",
            )?;
            masked_submatrix(&self.data(), navigation, &signal)
        };
        Ok(options.scaling.apply(&source.view()))
    }

    fn cluster_component_count(&self, options: &ClusterOptions, available: usize) -> Result<usize> {
        let n = options
            .number_pca_components
            .or(self.learning_results.number_significant_components)
            .ok_or_else(|| {
                MvaError::Validation(
                    "number_pca_components not given and no significant-component \
                     estimate is stored"
                        .into(),
                )
            })?;
        if n == 0 || n > available {
            return Err(MvaError::Validation(format!(
                "number_pca_components {n} out of range ({available} stored)"
            )));
        }
        Ok(n)
    }

    /// Relabels clusters by decreasing population and derives the presence
    /// matrix (NaN where the mask dropped a sample) and per-cluster centres.
    fn create_cluster_centers(
        &self,
        labels: &[usize],
        navigation: &Selector,
        options: &ClusterOptions,
    ) -> Result<(Vec<usize>, Array2<f64>, Array2<f64>)> {
        let n_clusters = labels.iter().copied().max().map_or(0, |m| m + 1);
        let mut sizes = vec![0usize; n_clusters];
        for &l in labels {
            sizes[l] += 1;
        }
        // Stable sort: equal populations keep their original label order.
        let mut order: Vec<usize> = (0..n_clusters).collect();
        order.sort_by_key(|&c| std::cmp::Reverse(sizes[c]));
        let mut lut = vec![0usize; n_clusters];
        for (new, &old) in order.iter().enumerate() {
            lut[old] = new;
        }
        let membership: Vec<usize> = labels.iter().map(|&l| lut[l]).collect();

        let total_samples = self.navigation_size();
        let kept = navigation.indices(total_samples);
        let mut labels_matrix = Array2::from_elem((n_clusters, total_samples), f64::NAN);
        for (pos, &full) in kept.iter().enumerate() {
            for cluster in 0..n_clusters {
                labels_matrix[[cluster, full]] =
                    if membership[pos] == cluster { 1.0 } else { 0.0 };
            }
        }

        let centers = if options.use_decomposition_for_centers {
            let loadings = self
                .learning_results
                .loadings
                .as_ref()
                .ok_or(MvaError::MissingDecomposition("decomposition-based centres"))?;
            let factors = self
                .learning_results
                .factors
                .as_ref()
                .ok_or(MvaError::MissingDecomposition("decomposition-based centres"))?;
            let n_pca =
                self.cluster_component_count(options, loadings.ncols().min(factors.ncols()))?;
            let l = loadings.slice_axis(Axis(1), (0..n_pca).into());
            let f = factors.slice_axis(Axis(1), (0..n_pca).into());
            let reconstructed = l.dot(&f.t());
            mean_rows_per_cluster(&reconstructed, &kept, &membership, n_clusters, &sizes, &order)
        } else {
            mean_rows_per_cluster(
                &self.data().to_owned(),
                &kept,
                &membership,
                n_clusters,
                &sizes,
                &order,
            )
        };
        Ok((membership, labels_matrix, centers))
    }
}

/// Per-cluster means of the rows the mask kept, in relabeled order.
fn mean_rows_per_cluster(
    source: &Array2<f64>,
    kept: &[usize],
    membership: &[usize],
    n_clusters: usize,
    sizes: &[usize],
    order: &[usize],
) -> Array2<f64> {
    let mut sums = Array2::<f64>::zeros((n_clusters, source.ncols()));
    for (pos, &full) in kept.iter().enumerate() {
        let cluster = membership[pos];
        let mut row = sums.row_mut(cluster);
        row += &source.row(full);
    }
    for (new, mut row) in sums.axis_iter_mut(Axis(0)).enumerate() {
        let size = sizes[order[new]].max(1);
        row.mapv_inplace(|v| v / size as f64);
    }
    sums
}

fn run_cluster_kernel(
    options: &ClusterOptions,
    n_clusters: usize,
    data: &Array2<f64>,
    seed_offset: u64,
) -> Result<Vec<usize>> {
    match options.algorithm {
        ClusterAlgorithm::KMeans => {
            let mut km = KMeans::new(n_clusters)
                .with_max_iter(options.max_iter)
                .with_tolerance(options.tolerance)
                .with_n_init(options.n_init);
            if let Some(seed) = options.seed {
                km = km.with_seed(seed.wrapping_add(seed_offset));
            }
            km.fit(&data.view())?;
            km.labels()
                .map(<[usize]>::to_vec)
                .ok_or_else(|| MvaError::Validation("k-means produced no labels".into()))
        }
        ClusterAlgorithm::Agglomerative => agglomerative(&data.view(), n_clusters),
    }
}

/// Gap statistic reference term: expected log dispersion under a uniform
/// null drawn per feature over the data's bounding box.
fn gap_reference(
    options: &ClusterOptions,
    k: usize,
    data: &Array2<f64>,
    n_ref: usize,
    data_inertia: f64,
) -> Result<(f64, f64)> {
    if n_ref == 0 {
        return Err(MvaError::Validation(
            "the gap statistic needs at least one reference resample".into(),
        ));
    }
    let mins: Vec<f64> = data
        .axis_iter(Axis(1))
        .map(|c| c.iter().copied().fold(f64::INFINITY, f64::min))
        .collect();
    let maxs: Vec<f64> = data
        .axis_iter(Axis(1))
        .map(|c| c.iter().copied().fold(f64::NEG_INFINITY, f64::max))
        .collect();
    let base_seed = options.seed.unwrap_or(0);

    let reference_inertias: Vec<f64> = (0..n_ref)
        .into_par_iter()
        .map(|r| -> Result<f64> {
            let mut rng =
                ChaCha8Rng::seed_from_u64(base_seed.wrapping_add((k as u64) << 20).wrapping_add(r as u64));
            let mut reference = Array2::zeros(data.raw_dim());
            for j in 0..data.ncols() {
                let span = maxs[j] - mins[j];
                for i in 0..data.nrows() {
                    reference[[i, j]] = mins[j] + rng.gen::<f64>() * span;
                }
            }
            let labels = run_cluster_kernel(options, k, &reference, 1 + r as u64)?;
            let w = within_cluster_dispersion(&reference.view(), &labels, false);
            Ok(w.max(1e-30).ln())
        })
        .collect::<Result<Vec<f64>>>()?;

    let n = reference_inertias.len() as f64;
    let mean = reference_inertias.iter().sum::<f64>() / n;
    let variance = reference_inertias
        .iter()
        .map(|v| (v - mean) * (v - mean))
        .sum::<f64>()
        / n;
    let std_error = (1.0 + 1.0 / n).sqrt() * variance.sqrt();
    Ok((mean - data_inertia, std_error))
}

/// First candidate count whose gap beats the next one less its spread;
/// falls back to the smallest count swept.
fn select_k_by_gap(gap: &[f64], std_error: &[f64], min_k: usize) -> usize {
    for i in 1..gap.len().saturating_sub(1) {
        if gap[i] >= gap[i + 1] - std_error[i + 1] {
            return i + min_k;
        }
    }
    min_k
}

/// Interior silhouette maxima in ascending count order. The smallest count
/// is admitted at the front when it beats every interior peak, and is the
/// sole candidate when the curve has no interior peak at all.
fn silhouette_candidates(scores: &[f64], min_k: usize) -> Vec<usize> {
    let mut peaks: Vec<usize> = Vec::new();
    for i in 1..scores.len().saturating_sub(1) {
        if scores[i] > scores[i - 1] && scores[i] > scores[i + 1] {
            peaks.push(i);
        }
    }
    if peaks.is_empty() {
        return vec![min_k];
    }
    if let Some(&first) = scores.first() {
        if peaks.iter().all(|&p| first > scores[p]) {
            peaks.insert(0, 0);
        }
    }
    peaks.into_iter().map(|p| p + min_k).collect()
}
