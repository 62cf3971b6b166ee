//! The learning-results record and its on-disk archive.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use log::{info, warn};
use ndarray::{Array1, Array2, ArrayD, Axis};
use serde::{Deserialize, Serialize};

use crate::error::{MvaError, Result};
use crate::svd_pca::Centre;

/// Either a committed cluster count or the candidate list a silhouette
/// sweep produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterCount {
    Single(usize),
    Candidates(Vec<usize>),
}

impl ClusterCount {
    /// The committed count, if the estimate is unambiguous.
    pub fn single(&self) -> Option<usize> {
        match self {
            ClusterCount::Single(n) => Some(*n),
            ClusterCount::Candidates(_) => None,
        }
    }
}

/// Everything the decomposition, demixing and clustering engines learn
/// about one dataset.
///
/// Engines never write fields here directly: each builds a private record
/// and commits it wholesale, so a failed run can never leave a torn state.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct LearningResults {
    // Decomposition.
    pub factors: Option<Array2<f64>>,
    pub loadings: Option<Array2<f64>>,
    pub explained_variance: Option<Array1<f64>>,
    /// Ratio over the full component set, frozen before any crop.
    pub explained_variance_ratio: Option<Array1<f64>>,
    pub number_significant_components: Option<usize>,
    pub decomposition_algorithm: Option<String>,
    pub poissonian_noise_normalized: bool,
    pub output_dimension: Option<usize>,
    pub mean: Option<Array1<f64>>,
    pub centre: Option<Centre>,

    // Blind source separation.
    pub bss_algorithm: Option<String>,
    pub unmixing_matrix: Option<Array2<f64>>,
    pub bss_factors: Option<Array2<f64>>,
    pub bss_loadings: Option<Array2<f64>>,
    /// Whether the demixing ran on loadings rather than factors.
    pub on_loadings: bool,

    // Clustering.
    pub cluster_algorithm: Option<String>,
    pub cluster_membership: Option<Vec<usize>>,
    /// One row per cluster over all original samples; NaN marks samples the
    /// navigation mask excluded.
    pub cluster_labels: Option<Array2<f64>>,
    pub cluster_centers: Option<Array2<f64>>,
    pub number_of_clusters: Option<ClusterCount>,
    pub cluster_metric: Option<String>,
    pub cluster_metric_index: Option<Vec<usize>>,
    pub cluster_metric_data: Option<Array1<f64>>,

    // Shape bookkeeping and the masks the last run used.
    pub unfolded: bool,
    pub original_shape: Option<Vec<usize>>,
    pub navigation_mask: Option<ArrayD<bool>>,
    pub signal_mask: Option<ArrayD<bool>>,
}

/// Staged output of a decomposition run. `stored` flips once the kernel
/// results have been recorded; the commit is a no-op before that point, so
/// validation and kernel failures leave earlier results untouched.
#[derive(Debug, Default)]
pub(crate) struct DecompositionRecord {
    pub stored: bool,
    pub factors: Option<Array2<f64>>,
    pub loadings: Option<Array2<f64>>,
    pub explained_variance: Option<Array1<f64>>,
    pub explained_variance_ratio: Option<Array1<f64>>,
    pub number_significant_components: Option<usize>,
    pub algorithm: Option<String>,
    pub poissonian_noise_normalized: bool,
    pub output_dimension: Option<usize>,
    pub mean: Option<Array1<f64>>,
    pub centre: Option<Centre>,
    pub unfolded: bool,
    pub original_shape: Option<Vec<usize>>,
    pub navigation_mask: Option<ArrayD<bool>>,
    pub signal_mask: Option<ArrayD<bool>>,
}

impl DecompositionRecord {
    /// Trims the stored factors, loadings and explained variance to the
    /// first `n` components. The ratio stays full-length.
    pub fn crop(&mut self, n: usize) {
        if let Some(f) = &self.factors {
            if f.ncols() > n {
                self.factors = Some(f.slice_axis(Axis(1), (0..n).into()).to_owned());
            }
        }
        if let Some(l) = &self.loadings {
            if l.ncols() > n {
                self.loadings = Some(l.slice_axis(Axis(1), (0..n).into()).to_owned());
            }
        }
        if let Some(ev) = &self.explained_variance {
            if ev.len() > n {
                self.explained_variance = Some(ev.slice_axis(Axis(0), (0..n).into()).to_owned());
            }
        }
    }
}

#[derive(Debug)]
pub(crate) struct BssRecord {
    pub algorithm: String,
    pub unmixing_matrix: Array2<f64>,
    pub bss_factors: Array2<f64>,
    pub bss_loadings: Array2<f64>,
    pub on_loadings: bool,
}

#[derive(Debug)]
pub(crate) struct ClusterRecord {
    pub algorithm: String,
    pub membership: Vec<usize>,
    pub labels_matrix: Array2<f64>,
    pub centers: Array2<f64>,
    pub number_of_clusters: usize,
    pub unfolded: bool,
    pub original_shape: Option<Vec<usize>>,
}

#[derive(Debug)]
pub(crate) struct SweepRecord {
    pub metric: String,
    pub metric_index: Vec<usize>,
    pub metric_data: Array1<f64>,
    pub number_of_clusters: ClusterCount,
}

impl LearningResults {
    pub(crate) fn commit_decomposition(&mut self, record: DecompositionRecord) {
        if !record.stored {
            return;
        }
        self.factors = record.factors;
        self.loadings = record.loadings;
        self.explained_variance = record.explained_variance;
        self.explained_variance_ratio = record.explained_variance_ratio;
        self.number_significant_components = record.number_significant_components;
        self.decomposition_algorithm = record.algorithm;
        self.poissonian_noise_normalized = record.poissonian_noise_normalized;
        self.output_dimension = record.output_dimension;
        self.mean = record.mean;
        self.centre = record.centre;
        self.unfolded = record.unfolded;
        self.original_shape = record.original_shape;
        self.navigation_mask = record.navigation_mask;
        self.signal_mask = record.signal_mask;
        // Any previous demixing no longer matches the new factors.
        self.unmixing_matrix = None;
        self.bss_algorithm = None;
    }

    pub(crate) fn commit_bss(&mut self, record: BssRecord) {
        self.bss_algorithm = Some(record.algorithm);
        self.unmixing_matrix = Some(record.unmixing_matrix);
        self.bss_factors = Some(record.bss_factors);
        self.bss_loadings = Some(record.bss_loadings);
        self.on_loadings = record.on_loadings;
    }

    pub(crate) fn commit_clustering(&mut self, record: ClusterRecord) {
        self.cluster_algorithm = Some(record.algorithm);
        self.cluster_membership = Some(record.membership);
        self.cluster_labels = Some(record.labels_matrix);
        self.cluster_centers = Some(record.centers);
        self.number_of_clusters = Some(ClusterCount::Single(record.number_of_clusters));
        self.unfolded = record.unfolded;
        if record.original_shape.is_some() {
            self.original_shape = record.original_shape;
        }
    }

    pub(crate) fn commit_sweep(&mut self, record: SweepRecord) {
        self.cluster_metric = Some(record.metric);
        self.cluster_metric_index = Some(record.metric_index);
        self.cluster_metric_data = Some(record.metric_data);
        self.number_of_clusters = Some(record.number_of_clusters);
    }

    /// Logs and returns a short description of what has been learned.
    pub fn summary(&self) -> String {
        let mut out = String::from("Learning results\n");
        if let Some(alg) = &self.decomposition_algorithm {
            out.push_str(&format!("  decomposition: {alg}"));
            if let Some(d) = self.output_dimension {
                out.push_str(&format!(" ({d} components)"));
            }
            if self.poissonian_noise_normalized {
                out.push_str(", Poisson-normalized");
            }
            out.push('\n');
        }
        if let Some(n) = self.number_significant_components {
            out.push_str(&format!("  significant components: {n}\n"));
        }
        if let Some(alg) = &self.bss_algorithm {
            let source = if self.on_loadings { "loadings" } else { "factors" };
            out.push_str(&format!("  demixing: {alg} on {source}\n"));
        }
        if let Some(alg) = &self.cluster_algorithm {
            out.push_str(&format!("  clustering: {alg}"));
            if let Some(ClusterCount::Single(k)) = &self.number_of_clusters {
                out.push_str(&format!(" ({k} clusters)"));
            }
            out.push('\n');
        }
        info!("{out}");
        out
    }

    /// Trims factors, loadings and explained variance in place.
    pub fn crop_decomposition_dimension(&mut self, n: usize) {
        if let Some(f) = &self.factors {
            if f.ncols() > n {
                self.factors = Some(f.slice_axis(Axis(1), (0..n).into()).to_owned());
            }
        }
        if let Some(l) = &self.loadings {
            if l.ncols() > n {
                self.loadings = Some(l.slice_axis(Axis(1), (0..n).into()).to_owned());
            }
        }
        if let Some(ev) = &self.explained_variance {
            if ev.len() > n {
                self.explained_variance = Some(ev.slice_axis(Axis(0), (0..n).into()).to_owned());
            }
        }
        self.output_dimension = Some(n);
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        bincode::serde::encode_into_std_write(
            self.to_archive(),
            &mut writer,
            bincode::config::standard(),
        )
        .map_err(|e| MvaError::Persistence(e.to_string()))?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        let archive: BTreeMap<String, StoredValue> =
            bincode::serde::decode_from_std_read(&mut reader, bincode::config::standard())
                .map_err(|e| MvaError::Persistence(e.to_string()))?;
        Self::from_archive(archive)
    }

    fn to_archive(&self) -> BTreeMap<String, StoredValue> {
        use StoredValue::*;
        let mut map = BTreeMap::new();
        let mut put = |key: &str, value: Option<StoredValue>| {
            if let Some(v) = value {
                map.insert(key.to_string(), v);
            }
        };
        put("factors", self.factors.clone().map(Matrix));
        put("loadings", self.loadings.clone().map(Matrix));
        put(
            "explained_variance",
            self.explained_variance.clone().map(Vector),
        );
        put(
            "explained_variance_ratio",
            self.explained_variance_ratio.clone().map(Vector),
        );
        put(
            "number_significant_components",
            self.number_significant_components.map(Count),
        );
        put(
            "decomposition_algorithm",
            self.decomposition_algorithm.clone().map(Text),
        );
        put(
            "poissonian_noise_normalized",
            Some(Flag(self.poissonian_noise_normalized)),
        );
        put("output_dimension", self.output_dimension.map(Count));
        put("mean", self.mean.clone().map(Vector));
        put(
            "centre",
            self.centre.map(|c| {
                Text(
                    match c {
                        Centre::Navigation => "navigation",
                        Centre::Signal => "signal",
                        Centre::Samples => "samples",
                    }
                    .to_string(),
                )
            }),
        );
        put("bss_algorithm", self.bss_algorithm.clone().map(Text));
        put("unmixing_matrix", self.unmixing_matrix.clone().map(Matrix));
        put("bss_factors", self.bss_factors.clone().map(Matrix));
        put("bss_loadings", self.bss_loadings.clone().map(Matrix));
        put("on_loadings", Some(Flag(self.on_loadings)));
        put("cluster_algorithm", self.cluster_algorithm.clone().map(Text));
        put(
            "cluster_membership",
            self.cluster_membership.clone().map(Counts),
        );
        put("cluster_labels", self.cluster_labels.clone().map(Matrix));
        put("cluster_centers", self.cluster_centers.clone().map(Matrix));
        put(
            "number_of_clusters",
            self.number_of_clusters.clone().map(|c| match c {
                ClusterCount::Single(n) => Count(n),
                ClusterCount::Candidates(v) => Counts(v),
            }),
        );
        put("cluster_metric", self.cluster_metric.clone().map(Text));
        put(
            "cluster_metric_index",
            self.cluster_metric_index.clone().map(Counts),
        );
        put(
            "cluster_metric_data",
            self.cluster_metric_data.clone().map(Vector),
        );
        put("unfolded", Some(Flag(self.unfolded)));
        put("original_shape", self.original_shape.clone().map(Shape));
        put("navigation_mask", self.navigation_mask.clone().map(Mask));
        put("signal_mask", self.signal_mask.clone().map(Mask));
        map
    }

    fn from_archive(archive: BTreeMap<String, StoredValue>) -> Result<Self> {
        let mut results = LearningResults::default();
        for (key, value) in archive {
            let key = match legacy_rename(&key) {
                LegacyKey::Renamed(new) => new.to_string(),
                LegacyKey::Dropped => continue,
                LegacyKey::AsIs => key,
            };
            results.assign(&key, value)?;
        }
        Ok(results)
    }

    fn assign(&mut self, key: &str, value: StoredValue) -> Result<()> {
        use StoredValue::*;
        let mismatch = |expected: &'static str| {
            Err(MvaError::Persistence(format!(
                "field '{key}' holds the wrong kind of value (expected {expected})"
            )))
        };
        match (key, value) {
            ("factors", Matrix(m)) => self.factors = Some(m),
            ("loadings", Matrix(m)) => self.loadings = Some(m),
            ("explained_variance", Vector(v)) => self.explained_variance = Some(v),
            ("explained_variance_ratio", Vector(v)) => self.explained_variance_ratio = Some(v),
            ("number_significant_components", Count(n)) => {
                self.number_significant_components = Some(n)
            }
            ("decomposition_algorithm", Text(t)) => self.decomposition_algorithm = Some(t),
            ("poissonian_noise_normalized", Flag(b)) => self.poissonian_noise_normalized = b,
            ("output_dimension", Count(n)) => self.output_dimension = Some(n),
            ("mean", Vector(v)) => self.mean = Some(v),
            ("centre", Text(t)) => {
                self.centre = Some(match t.as_str() {
                    "navigation" => Centre::Navigation,
                    "signal" => Centre::Signal,
                    "samples" => Centre::Samples,
                    other => {
                        return Err(MvaError::Persistence(format!(
                            "unknown centre mode '{other}'"
                        )))
                    }
                })
            }
            ("bss_algorithm", Text(t)) => self.bss_algorithm = Some(t),
            ("unmixing_matrix", Matrix(m)) => self.unmixing_matrix = Some(m),
            ("bss_factors", Matrix(m)) => self.bss_factors = Some(m),
            ("bss_loadings", Matrix(m)) => self.bss_loadings = Some(m),
            ("on_loadings", Flag(b)) => self.on_loadings = b,
            ("cluster_algorithm", Text(t)) => self.cluster_algorithm = Some(t),
            ("cluster_membership", Counts(v)) => self.cluster_membership = Some(v),
            ("cluster_labels", Matrix(m)) => self.cluster_labels = Some(m),
            ("cluster_centers", Matrix(m)) => self.cluster_centers = Some(m),
            ("number_of_clusters", Count(n)) => {
                self.number_of_clusters = Some(ClusterCount::Single(n))
            }
            ("number_of_clusters", Counts(v)) => {
                self.number_of_clusters = Some(ClusterCount::Candidates(v))
            }
            ("cluster_metric", Text(t)) => self.cluster_metric = Some(t),
            ("cluster_metric_index", Counts(v)) => self.cluster_metric_index = Some(v),
            ("cluster_metric_data", Vector(v)) => self.cluster_metric_data = Some(v),
            ("unfolded", Flag(b)) => self.unfolded = b,
            ("original_shape", Shape(s)) => self.original_shape = Some(s),
            ("navigation_mask", Mask(m)) => self.navigation_mask = Some(m),
            ("signal_mask", Mask(m)) => self.signal_mask = Some(m),
            ("factors" | "loadings" | "unmixing_matrix", _) => return mismatch("matrix"),
            (other, _) => {
                warn!("ignoring unknown results field '{other}'");
            }
        }
        Ok(())
    }
}

/// Values the archive can hold. One entry per stored field keeps the format
/// self-describing and lets old archives migrate key by key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StoredValue {
    Matrix(Array2<f64>),
    Vector(Array1<f64>),
    Mask(ArrayD<bool>),
    Shape(Vec<usize>),
    Count(usize),
    Counts(Vec<usize>),
    Flag(bool),
    Text(String),
}

enum LegacyKey {
    Renamed(&'static str),
    Dropped,
    AsIs,
}

/// Renames applied when loading archives written by older tools.
fn legacy_rename(key: &str) -> LegacyKey {
    match key {
        "algorithm" | "pca_algorithm" => LegacyKey::Renamed("decomposition_algorithm"),
        "ica_algorithm" => LegacyKey::Renamed("bss_algorithm"),
        "V" => LegacyKey::Renamed("explained_variance"),
        "w" => LegacyKey::Renamed("unmixing_matrix"),
        "v" | "scores" => LegacyKey::Renamed("loadings"),
        "pc" => LegacyKey::Renamed("factors"),
        "ica_scores" => LegacyKey::Renamed("bss_loadings"),
        "ica_factors" => LegacyKey::Renamed("bss_factors"),
        "variance2one" | "centered" => LegacyKey::Dropped,
        _ => LegacyKey::AsIs,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn populated() -> LearningResults {
        LearningResults {
            factors: Some(array![[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]]),
            loadings: Some(array![[0.1, 0.2], [0.3, 0.4]]),
            explained_variance: Some(array![4.0, 1.0]),
            explained_variance_ratio: Some(array![0.8, 0.2]),
            number_significant_components: Some(1),
            decomposition_algorithm: Some("svd".into()),
            poissonian_noise_normalized: true,
            output_dimension: Some(2),
            ..LearningResults::default()
        }
    }

    #[test]
    fn crop_trims_components_but_not_the_ratio() {
        let mut results = populated();
        results.crop_decomposition_dimension(1);
        assert_eq!(results.factors.as_ref().unwrap().shape(), &[3, 1]);
        assert_eq!(results.loadings.as_ref().unwrap().shape(), &[2, 1]);
        assert_eq!(results.explained_variance.as_ref().unwrap().len(), 1);
        assert_eq!(results.explained_variance_ratio.as_ref().unwrap().len(), 2);
        assert_eq!(results.output_dimension, Some(1));
    }

    #[test]
    fn unstored_decomposition_record_is_a_no_op() {
        let mut results = populated();
        results.commit_decomposition(DecompositionRecord::default());
        assert!(results.factors.is_some());
        assert_eq!(results.decomposition_algorithm.as_deref(), Some("svd"));
    }

    #[test]
    fn committing_a_decomposition_clears_stale_demixing() {
        let mut results = populated();
        results.unmixing_matrix = Some(array![[1.0]]);
        results.bss_algorithm = Some("fastica".into());
        let record = DecompositionRecord {
            stored: true,
            algorithm: Some("mlpca".into()),
            ..DecompositionRecord::default()
        };
        results.commit_decomposition(record);
        assert!(results.unmixing_matrix.is_none());
        assert!(results.bss_algorithm.is_none());
        assert_eq!(results.decomposition_algorithm.as_deref(), Some("mlpca"));
        assert!(results.factors.is_none());
    }

    #[test]
    fn archive_round_trip_preserves_fields() {
        let results = populated();
        let restored =
            LearningResults::from_archive(results.to_archive()).expect("round trip");
        assert_eq!(restored.factors, results.factors);
        assert_eq!(restored.explained_variance, results.explained_variance);
        assert_eq!(
            restored.number_significant_components,
            results.number_significant_components
        );
        assert!(restored.poissonian_noise_normalized);
        assert_eq!(restored.decomposition_algorithm.as_deref(), Some("svd"));
    }

    #[test]
    fn legacy_keys_migrate_on_load() {
        let mut archive = BTreeMap::new();
        archive.insert(
            "pca_algorithm".to_string(),
            StoredValue::Text("svd".into()),
        );
        archive.insert("V".to_string(), StoredValue::Vector(array![2.0, 1.0]));
        archive.insert("w".to_string(), StoredValue::Matrix(array![[1.0]]));
        archive.insert("variance2one".to_string(), StoredValue::Flag(true));
        let results = LearningResults::from_archive(archive).unwrap();
        assert_eq!(results.decomposition_algorithm.as_deref(), Some("svd"));
        assert_eq!(results.explained_variance, Some(array![2.0, 1.0]));
        assert!(results.unmixing_matrix.is_some());
    }

    #[test]
    fn wrong_value_kind_is_a_persistence_error() {
        let mut archive = BTreeMap::new();
        archive.insert("factors".to_string(), StoredValue::Flag(true));
        assert!(matches!(
            LearningResults::from_archive(archive),
            Err(MvaError::Persistence(_))
        ));
    }

    #[test]
    fn save_and_load_through_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.bin");
        let results = populated();
        results.save(&path).unwrap();
        let restored = LearningResults::load(&path).unwrap();
        assert_eq!(restored.loadings, results.loadings);
        assert_eq!(restored.output_dimension, Some(2));
    }
}
