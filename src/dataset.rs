//! The dataset wrapper the engines operate on.
//!
//! Data is held unfolded as a samples x features matrix together with the
//! native navigation/signal shapes, so folding and unfolding reduce to
//! shape bookkeeping. Treatments (Poisson normalization) mutate the matrix
//! in place and are undone from a backup copy, never recomputed.

use log::debug;
use ndarray::{Array1, Array2, ArrayD, Axis, IxDyn};

use crate::error::{MvaError, Result};
use crate::mask::{masked_submatrix, Selector};
use crate::results::LearningResults;

#[derive(Debug, Clone)]
pub struct Dataset {
    data: Array2<f64>,
    navigation_shape: Vec<usize>,
    signal_shape: Vec<usize>,
    unfolded: bool,
    data_before_treatments: Option<Array2<f64>>,
    pub(crate) root_ag: Option<Array1<f64>>,
    pub(crate) root_bh: Option<Array1<f64>>,
    pub learning_results: LearningResults,
}

impl Dataset {
    /// A dataset that is already two-dimensional: one navigation axis of
    /// samples, one signal axis of features.
    pub fn new(data: Array2<f64>) -> Self {
        let navigation_shape = vec![data.nrows()];
        let signal_shape = vec![data.ncols()];
        Dataset {
            data,
            navigation_shape,
            signal_shape,
            unfolded: false,
            data_before_treatments: None,
            root_ag: None,
            root_bh: None,
            learning_results: LearningResults::default(),
        }
    }

    /// Builds a dataset from an N-dimensional array whose first
    /// `navigation_ndim` axes are navigation and the rest signal.
    pub fn from_native(data: ArrayD<f64>, navigation_ndim: usize) -> Result<Self> {
        let ndim = data.ndim();
        if navigation_ndim == 0 || navigation_ndim >= ndim {
            return Err(MvaError::Validation(format!(
                "navigation_ndim {navigation_ndim} must split a {ndim}-dimensional array \
                 into non-empty navigation and signal parts"
            )));
        }
        let navigation_shape = data.shape()[..navigation_ndim].to_vec();
        let signal_shape = data.shape()[navigation_ndim..].to_vec();
        let n: usize = navigation_shape.iter().product();
        let m: usize = signal_shape.iter().product();
        let flat = data
            .to_shape((n, m))
            .map_err(|e| MvaError::Validation(format!("cannot unfold data: {e}")))?
            .to_owned();
        Ok(Dataset {
            data: flat,
            navigation_shape,
            signal_shape,
            unfolded: false,
            data_before_treatments: None,
            root_ag: None,
            root_bh: None,
            learning_results: LearningResults::default(),
        })
    }

    pub fn data(&self) -> ndarray::ArrayView2<'_, f64> {
        self.data.view()
    }

    pub fn navigation_shape(&self) -> &[usize] {
        &self.navigation_shape
    }

    pub fn signal_shape(&self) -> &[usize] {
        &self.signal_shape
    }

    pub fn navigation_size(&self) -> usize {
        self.navigation_shape.iter().product()
    }

    pub fn signal_size(&self) -> usize {
        self.signal_shape.iter().product()
    }

    /// Native shape: navigation axes followed by signal axes.
    pub fn original_shape(&self) -> Vec<usize> {
        let mut shape = self.navigation_shape.clone();
        shape.extend_from_slice(&self.signal_shape);
        shape
    }

    /// Marks the dataset unfolded for the duration of an engine run.
    /// Returns true when folding state actually changed (i.e. the native
    /// layout has more than one axis on either side).
    pub(crate) fn unfold(&mut self) -> bool {
        let multi_axis = self.navigation_shape.len() > 1 || self.signal_shape.len() > 1;
        if multi_axis && !self.unfolded {
            self.unfolded = true;
            return true;
        }
        false
    }

    pub(crate) fn fold(&mut self) {
        self.unfolded = false;
    }

    /// Reshapes a samples x anything matrix back to the native navigation
    /// axes (trailing axis kept as-is).
    pub fn fold_rows(&self, matrix: &Array2<f64>) -> Result<ArrayD<f64>> {
        if matrix.nrows() != self.navigation_size() {
            return Err(MvaError::ShapeMismatch {
                name: "matrix rows",
                expected: format!("{}", self.navigation_size()),
                actual: format!("{}", matrix.nrows()),
            });
        }
        let mut shape = self.navigation_shape.clone();
        shape.push(matrix.ncols());
        matrix
            .to_shape(IxDyn(&shape))
            .map(|v| v.to_owned())
            .map_err(|e| MvaError::Validation(format!("cannot fold matrix: {e}")))
    }

    /// Reshapes a full samples x features matrix (a reconstruction model)
    /// back to the native navigation and signal axes.
    pub fn fold_full(&self, matrix: &Array2<f64>) -> Result<ArrayD<f64>> {
        if matrix.nrows() != self.navigation_size() || matrix.ncols() != self.signal_size() {
            return Err(MvaError::ShapeMismatch {
                name: "model matrix",
                expected: format!("{}x{}", self.navigation_size(), self.signal_size()),
                actual: format!("{}x{}", matrix.nrows(), matrix.ncols()),
            });
        }
        let shape = self.original_shape();
        matrix
            .to_shape(IxDyn(&shape))
            .map(|v| v.to_owned())
            .map_err(|e| MvaError::Validation(format!("cannot fold model: {e}")))
    }

    pub(crate) fn backup_data(&mut self) {
        if self.data_before_treatments.is_none() {
            self.data_before_treatments = Some(self.data.clone());
        }
    }

    /// Restores the data captured by the last backup, dropping the backup
    /// and any normalization state.
    pub fn undo_treatments(&mut self) -> Result<()> {
        let backup = self.data_before_treatments.take().ok_or_else(|| {
            MvaError::Validation(
                "nothing to undo: run a treatment with copy enabled first".into(),
            )
        })?;
        debug!("restoring data from the pre-treatment backup");
        self.data = backup;
        Ok(())
    }

    pub(crate) fn has_backup(&self) -> bool {
        self.data_before_treatments.is_some()
    }

    /// Keenan & Kotula scaling for Poisson-dominated noise: divide each
    /// selected element by the square root of its row-sum times column-sum
    /// aggregation factors. Zero rows and columns scale to zero.
    pub(crate) fn normalize_poissonian_noise(
        &mut self,
        navigation: &Selector,
        signal: &Selector,
    ) -> Result<()> {
        debug!("normalizing Poissonian noise");
        let selected = masked_submatrix(&self.data.view(), navigation, signal);
        if selected.iter().any(|&v| v < 0.0) {
            return Err(MvaError::Validation(
                "data contains negative values; the Poisson noise model does not apply".into(),
            ));
        }
        let ag = selected.sum_axis(Axis(1));
        let bh = selected.sum_axis(Axis(0));
        let root_ag = ag.mapv(f64::sqrt);
        let root_bh = bh.mapv(f64::sqrt);

        let rows = navigation.indices(self.data.nrows());
        let cols = signal.indices(self.data.ncols());
        for (ri, &row) in rows.iter().enumerate() {
            for (ci, &col) in cols.iter().enumerate() {
                let denom = root_ag[ri] * root_bh[ci];
                self.data[[row, col]] = if denom > 0.0 {
                    self.data[[row, col]] / denom
                } else {
                    0.0
                };
            }
        }
        self.root_ag = Some(root_ag);
        self.root_bh = Some(root_bh);
        Ok(())
    }

    pub(crate) fn clear_normalization(&mut self) {
        self.root_ag = None;
        self.root_bh = None;
    }
}

/// Which components take part in a model reconstruction.
#[derive(Debug, Clone, Default)]
pub enum ComponentSelection {
    #[default]
    All,
    First(usize),
    Indices(Vec<usize>),
}

impl ComponentSelection {
    fn pick(&self, available: usize) -> Result<Vec<usize>> {
        let indices: Vec<usize> = match self {
            ComponentSelection::All => (0..available).collect(),
            ComponentSelection::First(n) => {
                if *n > available {
                    return Err(MvaError::Validation(format!(
                        "requested {n} components but only {available} are stored"
                    )));
                }
                (0..*n).collect()
            }
            ComponentSelection::Indices(list) => {
                if let Some(&bad) = list.iter().find(|&&i| i >= available) {
                    return Err(MvaError::Validation(format!(
                        "component index {bad} out of range ({available} stored)"
                    )));
                }
                list.clone()
            }
        };
        Ok(indices)
    }
}

impl Dataset {
    /// Rebuilds the dataset from stored decomposition components:
    /// `loadings . factors^T`, plus the recorded mean when present.
    pub fn decomposition_model(&self, components: &ComponentSelection) -> Result<Array2<f64>> {
        let factors = self
            .learning_results
            .factors
            .as_ref()
            .ok_or(MvaError::MissingDecomposition("decomposition_model"))?;
        let loadings = self
            .learning_results
            .loadings
            .as_ref()
            .ok_or(MvaError::MissingDecomposition("decomposition_model"))?;
        self.reconstruct(factors, loadings, components, self.learning_results.mean.as_ref())
    }

    /// Rebuilds the dataset from demixed components.
    pub fn bss_model(&self, components: &ComponentSelection) -> Result<Array2<f64>> {
        let factors = self
            .learning_results
            .bss_factors
            .as_ref()
            .ok_or(MvaError::MissingDecomposition("bss_model"))?;
        let loadings = self
            .learning_results
            .bss_loadings
            .as_ref()
            .ok_or(MvaError::MissingDecomposition("bss_model"))?;
        self.reconstruct(factors, loadings, components, None)
    }

    fn reconstruct(
        &self,
        factors: &Array2<f64>,
        loadings: &Array2<f64>,
        components: &ComponentSelection,
        mean: Option<&Array1<f64>>,
    ) -> Result<Array2<f64>> {
        let indices = components.pick(factors.ncols().min(loadings.ncols()))?;
        let f = factors.select(Axis(1), &indices);
        let l = loadings.select(Axis(1), &indices);
        let mut model = l.dot(&f.t());
        if let Some(mean) = mean {
            if mean.len() == model.ncols() {
                model += mean;
            }
        }
        Ok(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, ArrayD};

    #[test]
    fn from_native_unfolds_navigation_and_signal_axes() {
        let data = ArrayD::from_shape_vec(
            IxDyn(&[2, 3, 4]),
            (0..24).map(|v| v as f64).collect(),
        )
        .unwrap();
        let ds = Dataset::from_native(data, 2).unwrap();
        assert_eq!(ds.navigation_shape(), &[2, 3]);
        assert_eq!(ds.signal_shape(), &[4]);
        assert_eq!(ds.data().shape(), &[6, 4]);
        assert_eq!(ds.original_shape(), vec![2, 3, 4]);
    }

    #[test]
    fn from_native_rejects_a_degenerate_split() {
        let data = ArrayD::from_elem(IxDyn(&[4, 5]), 1.0);
        assert!(Dataset::from_native(data.clone(), 0).is_err());
        assert!(Dataset::from_native(data, 2).is_err());
    }

    #[test]
    fn unfold_only_reports_a_change_for_multi_axis_layouts() {
        let mut flat = Dataset::new(Array2::zeros((4, 3)));
        assert!(!flat.unfold());

        let native = ArrayD::from_elem(IxDyn(&[2, 2, 3]), 0.0);
        let mut ds = Dataset::from_native(native, 2).unwrap();
        assert!(ds.unfold());
        assert!(!ds.unfold());
        ds.fold();
        assert!(ds.unfold());
    }

    #[test]
    fn poisson_normalization_and_undo_round_trip() {
        let mut ds = Dataset::new(array![[4.0, 0.0], [1.0, 1.0]]);
        ds.backup_data();
        ds.normalize_poissonian_noise(&Selector::All, &Selector::All)
            .unwrap();
        // Row sums [4, 2], column sums [5, 1].
        let expected = 4.0 / (4.0f64.sqrt() * 5.0f64.sqrt());
        assert_abs_diff_eq!(ds.data()[[0, 0]], expected, epsilon = 1e-12);
        ds.undo_treatments().unwrap();
        assert_abs_diff_eq!(ds.data()[[0, 0]], 4.0, epsilon = 1e-12);
        assert!(ds.undo_treatments().is_err());
    }

    #[test]
    fn poisson_normalization_zeroes_empty_rows() {
        let mut ds = Dataset::new(array![[0.0, 0.0], [1.0, 3.0]]);
        ds.normalize_poissonian_noise(&Selector::All, &Selector::All)
            .unwrap();
        assert_abs_diff_eq!(ds.data()[[0, 0]], 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(ds.data()[[0, 1]], 0.0, epsilon = 1e-12);
    }

    #[test]
    fn poisson_normalization_rejects_negative_data() {
        let mut ds = Dataset::new(array![[1.0, -2.0]]);
        let err = ds
            .normalize_poissonian_noise(&Selector::All, &Selector::All)
            .unwrap_err();
        assert!(matches!(err, MvaError::Validation(_)));
    }

    #[test]
    fn poisson_normalization_respects_masks() {
        let mut ds = Dataset::new(array![[1.0, 5.0], [2.0, 6.0]]);
        let nav = Selector::Keep(vec![1]);
        let sig = Selector::All;
        ds.normalize_poissonian_noise(&nav, &sig).unwrap();
        // The masked-out first row is untouched.
        assert_abs_diff_eq!(ds.data()[[0, 0]], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(ds.data()[[0, 1]], 5.0, epsilon = 1e-12);
        // The kept row scales by sqrt(rowsum) * sqrt(colsum) of the submatrix.
        let expected = 2.0 / (8.0f64.sqrt() * 2.0f64.sqrt());
        assert_abs_diff_eq!(ds.data()[[1, 0]], expected, epsilon = 1e-12);
    }

    #[test]
    fn reconstruction_matches_the_stored_components() {
        let mut ds = Dataset::new(Array2::zeros((2, 3)));
        ds.learning_results.factors = Some(array![[1.0, 0.0], [0.0, 1.0], [1.0, 1.0]]);
        ds.learning_results.loadings = Some(array![[2.0, 3.0], [4.0, 5.0]]);
        let model = ds.decomposition_model(&ComponentSelection::All).unwrap();
        assert_eq!(model, array![[2.0, 3.0, 5.0], [4.0, 5.0, 9.0]]);

        let first = ds
            .decomposition_model(&ComponentSelection::First(1))
            .unwrap();
        assert_eq!(first, array![[2.0, 0.0, 2.0], [4.0, 0.0, 4.0]]);

        assert!(ds
            .decomposition_model(&ComponentSelection::First(3))
            .is_err());
        assert!(ds
            .decomposition_model(&ComponentSelection::Indices(vec![2]))
            .is_err());
    }

    #[test]
    fn reconstruction_adds_the_recorded_mean() {
        let mut ds = Dataset::new(Array2::zeros((2, 2)));
        ds.learning_results.factors = Some(array![[1.0], [0.0]]);
        ds.learning_results.loadings = Some(array![[1.0], [2.0]]);
        ds.learning_results.mean = Some(array![10.0, 20.0]);
        let model = ds.decomposition_model(&ComponentSelection::All).unwrap();
        assert_eq!(model, array![[11.0, 20.0], [12.0, 20.0]]);
    }

    #[test]
    fn models_fold_back_to_the_native_shape() {
        let native = ArrayD::from_shape_vec(
            IxDyn(&[2, 2, 3]),
            (0..12).map(|v| v as f64).collect(),
        )
        .unwrap();
        let ds = Dataset::from_native(native.clone(), 2).unwrap();
        let folded = ds.fold_full(&ds.data().to_owned()).unwrap();
        assert_eq!(folded, native);
        assert!(ds.fold_full(&Array2::zeros((4, 2))).is_err());
    }

    #[test]
    fn bss_model_requires_demixing_results() {
        let ds = Dataset::new(Array2::zeros((2, 2)));
        assert!(matches!(
            ds.bss_model(&ComponentSelection::All),
            Err(MvaError::MissingDecomposition(_))
        ));
    }
}
