//! The decomposition engine: validate, treat, dispatch, derive, commit.

use log::{info, warn};
use ndarray::{Array1, Array2, ArrayD, Axis};

use crate::dataset::Dataset;
use crate::elbow::estimate_elbow_position;
use crate::error::{MvaError, Result};
use crate::estimator::{run_estimator, Estimator};
use crate::mask::{masked_submatrix, Selector};
use crate::mlpca::mlpca;
use crate::ornmf::ornmf;
use crate::registry::DecompositionAlgorithm;
use crate::results::DecompositionRecord;
use crate::rpca::{orpca, rpca_godec};
use crate::svd_pca::{svd_pca, Centre};

/// A built-in kernel by name, or a user-supplied estimator.
pub enum Algorithm {
    Named(DecompositionAlgorithm),
    Custom(Box<dyn Estimator>),
}

impl Algorithm {
    fn name(&self) -> &'static str {
        match self {
            Algorithm::Named(alg) => alg.as_str(),
            Algorithm::Custom(_) => "custom",
        }
    }
}

/// Which part of the dataset is re-expressed in the learned basis after
/// the masked fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reproject {
    /// Compute loadings for every sample, masked ones included.
    Navigation,
    /// Compute factors for every feature, masked ones included.
    Signal,
    Both,
}

pub struct DecompositionOptions {
    pub algorithm: Algorithm,
    pub output_dimension: Option<usize>,
    pub centre: Option<Centre>,
    pub normalize_poissonian_noise: bool,
    /// Exclusion mask over the navigation axes, native shape, true = drop.
    pub navigation_mask: Option<ArrayD<bool>>,
    /// Exclusion mask over the signal axes, native shape, true = drop.
    pub signal_mask: Option<ArrayD<bool>>,
    pub reproject: Option<Reproject>,
    /// Back up the data and restore it once the run finishes.
    pub copy: bool,
    /// Per-element variances for mlpca; defaults to the data (Poisson).
    pub var_array: Option<Array2<f64>>,
    /// Regularization for the robust/online family.
    pub lambda: Option<f64>,
    pub max_iter: usize,
    pub tolerance: f64,
    pub seed: Option<u64>,
}

impl Default for DecompositionOptions {
    fn default() -> Self {
        DecompositionOptions {
            algorithm: Algorithm::Named(DecompositionAlgorithm::Svd),
            output_dimension: None,
            centre: None,
            normalize_poissonian_noise: false,
            navigation_mask: None,
            signal_mask: None,
            reproject: None,
            copy: true,
            var_array: None,
            lambda: None,
            max_iter: 100,
            tolerance: 1e-9,
            seed: None,
        }
    }
}

impl Dataset {
    /// Decomposes the dataset into factors and loadings.
    ///
    /// Results land in [`learning_results`](Dataset::learning_results) in a
    /// single commit; validation or kernel failures leave any earlier
    /// results in place. With `copy` (the default) the data itself comes
    /// back untouched even when Poisson normalization ran.
    pub fn decomposition(&mut self, mut options: DecompositionOptions) -> Result<()> {
        if self.navigation_size() < 2 {
            return Err(MvaError::Validation(
                "decomposition needs at least two samples along the navigation axis".into(),
            ));
        }
        if let Algorithm::Named(alg) = &options.algorithm {
            if alg.requires_output_dimension() && options.output_dimension.is_none() {
                return Err(MvaError::Validation(format!(
                    "algorithm '{}' requires output_dimension",
                    alg.as_str()
                )));
            }
            if *alg == DecompositionAlgorithm::Mlpca && options.normalize_poissonian_noise {
                warn!(
                    "normalize_poissonian_noise is ignored for mlpca; its variance \
                     weights already model the noise"
                );
                options.normalize_poissonian_noise = false;
            }
        }
        if options.normalize_poissonian_noise && options.centre.is_some() {
            return Err(MvaError::Validation(
                "centring is incompatible with Poisson noise normalization".into(),
            ));
        }
        if let Some(d) = options.output_dimension {
            let limit = self.navigation_size().min(self.signal_size());
            if d == 0 || d > limit {
                return Err(MvaError::Validation(format!(
                    "output_dimension {d} out of range (at most {limit})"
                )));
            }
        }
        let navigation = Selector::from_mask(
            options.navigation_mask.as_ref(),
            &self.navigation_shape().to_vec(),
            "navigation_mask",
        )?;
        let signal = Selector::from_mask(
            options.signal_mask.as_ref(),
            &self.signal_shape().to_vec(),
            "signal_mask",
        )?;

        if options.copy {
            self.backup_data();
        }
        let did_unfold = self.unfold();
        let mut record = DecompositionRecord::default();
        let outcome =
            self.run_decomposition(&mut options, &navigation, &signal, did_unfold, &mut record);

        // Cleanup runs on success and failure alike.
        self.fold();
        self.learning_results.commit_decomposition(record);
        self.clear_normalization();
        if options.copy && self.has_backup() {
            self.undo_treatments()?;
        }
        outcome
    }

    fn run_decomposition(
        &mut self,
        options: &mut DecompositionOptions,
        navigation: &Selector,
        signal: &Selector,
        did_unfold: bool,
        record: &mut DecompositionRecord,
    ) -> Result<()> {
        info!(
            "performing {} decomposition on a {}x{} dataset",
            options.algorithm.name(),
            self.navigation_size(),
            self.signal_size()
        );
        if options.normalize_poissonian_noise {
            self.normalize_poissonian_noise(navigation, signal)?;
        }
        let data = masked_submatrix(&self.data(), navigation, signal);

        let params = KernelParams {
            output_dimension: options.output_dimension,
            centre: options.centre,
            var_array: options.var_array.take(),
            lambda: options.lambda,
            max_iter: options.max_iter,
            tolerance: options.tolerance,
            seed: options.seed,
        };
        let mut centre = options.centre;
        let (factors, loadings, explained_variance, mean) = match &mut options.algorithm {
            Algorithm::Named(alg) => dispatch_named(*alg, &data, &params)?,
            Algorithm::Custom(estimator) => {
                let out = run_estimator(estimator.as_mut(), &data.view())?;
                if out.mean.is_some() {
                    centre = Some(Centre::Samples);
                }
                (out.factors, out.loadings, out.explained_variance, out.mean)
            }
        };

        let (ratio, significant) = match &explained_variance {
            Some(ev) => {
                let total = ev.sum();
                let ratio = ev.mapv(|v| v / total.max(f64::MIN_POSITIVE));
                let knee = estimate_elbow_position(&ratio.view(), true, 20) + 1;
                (Some(ratio), Some(knee))
            }
            None => (None, None),
        };

        record.factors = Some(factors);
        record.loadings = Some(loadings);
        record.explained_variance = explained_variance;
        record.explained_variance_ratio = ratio;
        record.number_significant_components = significant;
        record.algorithm = Some(options.algorithm.name().to_string());
        record.poissonian_noise_normalized = options.normalize_poissonian_noise;
        record.output_dimension = options.output_dimension;
        record.mean = mean;
        record.centre = centre;
        record.unfolded = did_unfold;
        record.original_shape = did_unfold.then(|| self.original_shape());
        record.stored = true;
        if let Some(d) = options.output_dimension {
            record.crop(d);
        }

        let reproject = self.reproject_components(options, navigation, signal, record)?;
        self.rescale_poisson(options, navigation, signal, record);
        remask(options, navigation, signal, reproject, record, self.signal_size(), self.navigation_size());
        Ok(())
    }

    /// Re-expresses the unmasked parts of the dataset in the learned basis.
    fn reproject_components(
        &self,
        options: &mut DecompositionOptions,
        navigation: &Selector,
        signal: &Selector,
        record: &mut DecompositionRecord,
    ) -> Result<Option<Reproject>> {
        let mut reproject = options.reproject;
        if matches!(reproject, Some(Reproject::Signal) | Some(Reproject::Both))
            && matches!(options.algorithm, Algorithm::Custom(_))
        {
            warn!("signal reprojection is not supported with a custom estimator; skipping it");
            reproject = match reproject {
                Some(Reproject::Both) => Some(Reproject::Navigation),
                _ => None,
            };
        }

        if matches!(reproject, Some(Reproject::Navigation) | Some(Reproject::Both)) {
            let all_samples = signal.select_cols(&self.data());
            let loadings = match &options.algorithm {
                // The estimator centres internally, exactly as during the fit.
                Algorithm::Custom(estimator) => estimator.transform(&all_samples.view())?,
                Algorithm::Named(_) => {
                    let centered = subtract_mean(all_samples, record.mean.as_ref());
                    let factors = record
                        .factors
                        .as_ref()
                        .ok_or(MvaError::MissingDecomposition("reprojection"))?;
                    centered.dot(factors)
                }
            };
            record.loadings = Some(loadings);
        }
        if matches!(reproject, Some(Reproject::Signal) | Some(Reproject::Both)) {
            let masked_loadings = match reproject {
                // With both sides reprojected, the masked-sample loadings
                // used for the fit are gone; recompute them from the basis.
                Some(Reproject::Both) => {
                    let fit_data = masked_submatrix(&self.data(), navigation, signal);
                    let centered = subtract_mean(fit_data, record.mean.as_ref());
                    let factors = record
                        .factors
                        .as_ref()
                        .ok_or(MvaError::MissingDecomposition("reprojection"))?;
                    centered.dot(factors)
                }
                _ => record
                    .loadings
                    .clone()
                    .ok_or(MvaError::MissingDecomposition("reprojection"))?,
            };
            let pinv_loadings = crate::linalg::pinv(&masked_loadings.view())?;
            let all_features = navigation.select_rows(&self.data());
            let centered = subtract_mean(all_features, record.mean.as_ref());
            record.factors = Some(pinv_loadings.dot(&centered).t().to_owned());
        }
        Ok(reproject)
    }

    /// Multiplies the Poisson scaling back into the stored components.
    /// Reprojected components span the full axis while the scaling was
    /// computed on the masked selection, so the vector is stretched back
    /// first; positions outside the selection were never normalized and
    /// keep a unit scale.
    fn rescale_poisson(
        &self,
        options: &DecompositionOptions,
        navigation: &Selector,
        signal: &Selector,
        record: &mut DecompositionRecord,
    ) {
        if !options.normalize_poissonian_noise {
            return;
        }
        if let (Some(root_ag), Some(root_bh)) = (&self.root_ag, &self.root_bh) {
            if let Some(factors) = &mut record.factors {
                match expand_scale(root_bh, signal, factors.nrows()) {
                    Some(scale) => scale_rows(factors, &scale),
                    None => warn!(
                        "factor rows no longer match the normalization vector; skipping rescale"
                    ),
                }
            }
            if let Some(loadings) = &mut record.loadings {
                match expand_scale(root_ag, navigation, loadings.nrows()) {
                    Some(scale) => scale_rows(loadings, &scale),
                    None => warn!(
                        "loading rows no longer match the normalization vector; skipping rescale"
                    ),
                }
            }
        }
    }
}

/// Everything a built-in kernel needs, detached from the options struct so
/// the estimator slot can stay mutably borrowed during dispatch.
struct KernelParams {
    output_dimension: Option<usize>,
    centre: Option<Centre>,
    var_array: Option<Array2<f64>>,
    lambda: Option<f64>,
    max_iter: usize,
    tolerance: f64,
    seed: Option<u64>,
}

fn dispatch_named(
    algorithm: DecompositionAlgorithm,
    data: &Array2<f64>,
    params: &KernelParams,
) -> Result<(Array2<f64>, Array2<f64>, Option<Array1<f64>>, Option<Array1<f64>>)> {
    let dimension = |name: &'static str| {
        params.output_dimension.ok_or_else(|| {
            MvaError::Validation(format!("algorithm '{name}' requires output_dimension"))
        })
    };
    match algorithm {
        DecompositionAlgorithm::Svd => {
            let out = svd_pca(&data.view(), params.output_dimension, params.centre)?;
            Ok((out.factors, out.loadings, Some(out.explained_variance), out.mean))
        }
        DecompositionAlgorithm::Mlpca => {
            let variance = match &params.var_array {
                Some(v) => v.clone(),
                None => data.clone(),
            };
            let (u, s, v) = mlpca(
                &data.view(),
                &variance.view(),
                dimension("mlpca")?,
                params.max_iter,
                params.tolerance,
            )?;
            let loadings = scale_columns(u, &s);
            let explained_variance = s.mapv(|x| x * x / v.nrows() as f64);
            Ok((v, loadings, Some(explained_variance), None))
        }
        DecompositionAlgorithm::Rpca => {
            let out = rpca_godec(
                &data.view(),
                dimension("rpca")?,
                params.lambda,
                params.max_iter,
                params.tolerance,
            )?;
            let loadings = scale_columns(out.u, &out.s);
            let explained_variance = out.s.mapv(|x| x * x / out.v.nrows() as f64);
            Ok((out.v, loadings, Some(explained_variance), None))
        }
        DecompositionAlgorithm::Orpca => {
            let lambda = default_lambda(params, data);
            let (loadings, factors) =
                orpca(&data.view(), dimension("orpca")?, lambda, params.seed)?;
            Ok((factors, loadings, None, None))
        }
        DecompositionAlgorithm::Ornmf => {
            let lambda = default_lambda(params, data);
            let (loadings, factors) =
                ornmf(&data.view(), dimension("ornmf")?, lambda, params.seed)?;
            Ok((factors, loadings, None, None))
        }
    }
}

fn default_lambda(params: &KernelParams, data: &Array2<f64>) -> f64 {
    params
        .lambda
        .unwrap_or(1.0 / (data.nrows().max(data.ncols()) as f64).sqrt())
}

fn scale_columns(mut matrix: Array2<f64>, scale: &Array1<f64>) -> Array2<f64> {
    for (mut col, s) in matrix.axis_iter_mut(Axis(1)).zip(scale.iter()) {
        col.mapv_inplace(|v| v * s);
    }
    matrix
}

fn scale_rows(matrix: &mut Array2<f64>, scale: &Array1<f64>) {
    for (mut row, s) in matrix.axis_iter_mut(Axis(0)).zip(scale.iter()) {
        row.mapv_inplace(|v| v * s);
    }
}

/// Stretches a per-row scale computed on the masked selection back to the
/// full axis extent, or passes it through when the lengths already agree.
fn expand_scale(scale: &Array1<f64>, selector: &Selector, rows: usize) -> Option<Array1<f64>> {
    if scale.len() == rows {
        return Some(scale.clone());
    }
    if let Selector::Keep(kept) = selector {
        if kept.len() == scale.len() && kept.iter().all(|&row| row < rows) {
            let mut full = Array1::ones(rows);
            for (ri, &row) in kept.iter().enumerate() {
                full[row] = scale[ri];
            }
            return Some(full);
        }
    }
    None
}

fn subtract_mean(mut matrix: Array2<f64>, mean: Option<&Array1<f64>>) -> Array2<f64> {
    if let Some(mean) = mean {
        if mean.len() == matrix.ncols() {
            matrix -= mean;
        }
    }
    matrix
}

/// Expands masked-out rows back as NaN and stores the masks used, so the
/// stored components line up with the native axes.
fn remask(
    options: &DecompositionOptions,
    navigation: &Selector,
    signal: &Selector,
    reproject: Option<Reproject>,
    record: &mut DecompositionRecord,
    signal_size: usize,
    navigation_size: usize,
) {
    if let Selector::Keep(kept) = signal {
        record.signal_mask = options.signal_mask.clone();
        if !matches!(reproject, Some(Reproject::Signal) | Some(Reproject::Both)) {
            if let Some(factors) = &record.factors {
                record.factors = Some(expand_rows(factors, kept, signal_size));
            }
        }
    }
    if let Selector::Keep(kept) = navigation {
        record.navigation_mask = options.navigation_mask.clone();
        if !matches!(reproject, Some(Reproject::Navigation) | Some(Reproject::Both)) {
            if let Some(loadings) = &record.loadings {
                record.loadings = Some(expand_rows(loadings, kept, navigation_size));
            }
        }
    }
}

fn expand_rows(matrix: &Array2<f64>, kept: &[usize], full_rows: usize) -> Array2<f64> {
    let mut full = Array2::from_elem((full_rows, matrix.ncols()), f64::NAN);
    for (compact, &original) in kept.iter().enumerate() {
        full.row_mut(original).assign(&matrix.row(compact));
    }
    full
}
