//! Blind source separation on stored decomposition components.

use log::info;
use ndarray::{s, Array1, Array2, Axis};

use crate::dataset::Dataset;
use crate::error::{MvaError, Result};
use crate::estimator::Estimator;
use crate::fastica::FastIca;
use crate::linalg::invert_with_fallback;
use crate::orthomax::orthomax;
use crate::results::BssRecord;
use crate::whitening::{whiten_data, WhitenMethod};

pub enum BssAlgorithm {
    Orthomax,
    FastIca,
    Custom(Box<dyn Estimator>),
}

impl BssAlgorithm {
    fn name(&self) -> &'static str {
        match self {
            BssAlgorithm::Orthomax => "orthomax",
            BssAlgorithm::FastIca => "fastica",
            BssAlgorithm::Custom(_) => "custom",
        }
    }
}

/// Which demixed side decides a component's sign.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReverseCriterion {
    Factors,
    Loadings,
}

/// Which side a normalization divides; the other side is multiplied so the
/// product stays unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormalizationTarget {
    Factors,
    Loadings,
}

pub struct BssOptions {
    pub algorithm: BssAlgorithm,
    /// Demix the first n stored components. Falls back to the stored
    /// output dimension when neither this nor `comp_list` is given.
    pub number_of_components: Option<usize>,
    /// Explicit component indices to demix; overrides `number_of_components`.
    pub comp_list: Option<Vec<usize>>,
    /// Demix the loadings instead of the factors.
    pub on_loadings: bool,
    /// Differencing order applied along the observation axis before demixing.
    pub diff_order: usize,
    /// An external factor-like matrix to demix instead of the stored one
    /// (observations x components). The stored decomposition still provides
    /// the components that get unmixed.
    pub factors: Option<Array2<f64>>,
    /// Exclusion mask over the observation axis, true = drop.
    pub mask: Option<Array1<bool>>,
    /// Whitening applied before the demixing kernel; composed into the
    /// stored unmixing matrix. None runs the kernel on the raw selection.
    pub whiten_method: Option<WhitenMethod>,
    pub reverse_component_criterion: ReverseCriterion,
    pub max_iter: usize,
    pub tolerance: f64,
    pub seed: Option<u64>,
}

impl Default for BssOptions {
    fn default() -> Self {
        BssOptions {
            algorithm: BssAlgorithm::FastIca,
            number_of_components: None,
            comp_list: None,
            on_loadings: false,
            diff_order: 1,
            factors: None,
            mask: None,
            whiten_method: Some(WhitenMethod::Pca),
            reverse_component_criterion: ReverseCriterion::Factors,
            max_iter: 200,
            tolerance: 1e-10,
            seed: None,
        }
    }
}

impl Dataset {
    /// Separates the stored components into (more) independent sources.
    ///
    /// The learned unmixing matrix, with whitening folded in, is applied to
    /// the stored factors and loadings; the results are committed together.
    pub fn blind_source_separation(&mut self, mut options: BssOptions) -> Result<()> {
        let stored_factors = self
            .learning_results
            .factors
            .clone()
            .ok_or(MvaError::MissingDecomposition("blind_source_separation"))?;
        let stored_loadings = self
            .learning_results
            .loadings
            .clone()
            .ok_or(MvaError::MissingDecomposition("blind_source_separation"))?;

        let source = match &options.factors {
            Some(external) => {
                if external.ncols() < 2 {
                    return Err(MvaError::Validation(
                        "the supplied factor matrix needs at least two components".into(),
                    ));
                }
                external.clone()
            }
            None => {
                if options.on_loadings {
                    stored_loadings.clone()
                } else {
                    stored_factors.clone()
                }
            }
        };

        let selection = self.select_components(&options, source.ncols())?;
        if selection.len() < 2 {
            return Err(MvaError::Validation(
                "blind source separation needs at least two components".into(),
            ));
        }
        let mut matrix = source.select(Axis(1), &selection);

        let mut mask: Option<Vec<bool>> = match &options.mask {
            Some(m) => {
                if m.len() != matrix.nrows() {
                    return Err(MvaError::ShapeMismatch {
                        name: "mask",
                        expected: format!("{}", matrix.nrows()),
                        actual: format!("{}", m.len()),
                    });
                }
                Some(m.iter().copied().collect())
            }
            None => None,
        };

        if options.diff_order > 0 {
            for _ in 0..options.diff_order {
                matrix = diff_rows(&matrix);
            }
            // Differencing mixes neighbours, so the exclusion zone around a
            // masked observation widens with the order; NaN propagation
            // through the same differences computes exactly that dilation.
            if let Some(m) = mask.take() {
                let mut carrier: Vec<f64> =
                    m.iter().map(|&x| if x { f64::NAN } else { 1.0 }).collect();
                for _ in 0..options.diff_order {
                    carrier = carrier.windows(2).map(|w| w[1] - w[0]).collect();
                }
                mask = Some(carrier.iter().map(|v| v.is_nan()).collect());
            }
        }
        if let Some(m) = &mask {
            let kept: Vec<usize> = m
                .iter()
                .enumerate()
                .filter_map(|(i, &drop)| (!drop).then_some(i))
                .collect();
            matrix = matrix.select(Axis(0), &kept);
        }
        if matrix.nrows() < 2 {
            return Err(MvaError::Validation(
                "too few observations left after differencing and masking".into(),
            ));
        }

        let mut whitening = None;
        if let Some(method) = options.whiten_method {
            let (white, w) = whiten_data(&matrix.view(), true, method)?;
            matrix = white;
            whitening = Some(w);
        }

        info!(
            "demixing {} components with {}",
            selection.len(),
            options.algorithm.name()
        );
        let unmixing = match &mut options.algorithm {
            BssAlgorithm::Orthomax => {
                let (_, rotation) =
                    orthomax(&matrix.view(), 1.0, options.tolerance, options.max_iter)?;
                rotation.t().to_owned()
            }
            BssAlgorithm::FastIca => {
                let mut ica = FastIca::new()
                    .with_max_iter(options.max_iter)
                    .with_tolerance(options.tolerance);
                if let Some(seed) = options.seed {
                    ica = ica.with_seed(seed);
                }
                ica.fit(&matrix.view())?;
                ica.components()
                    .ok_or_else(|| MvaError::Validation("FastICA produced no components".into()))?
                    .to_owned()
            }
            BssAlgorithm::Custom(estimator) => {
                estimator.fit(&matrix.view())?;
                estimator
                    .components()
                    .ok_or_else(|| {
                        MvaError::Validation("fitted estimator exposes no components".into())
                    })?
                    .to_owned()
            }
        };

        let mut w = match whitening {
            Some(k) => unmixing.dot(&k),
            None => unmixing,
        };
        self.reorder_by_variance(&mut w, &selection);

        let inverse = invert_with_fallback(&w.view())?.into_matrix();
        let factors_sel = stored_factors.select(Axis(1), &selection);
        let loadings_sel = stored_loadings.select(Axis(1), &selection);
        let (bss_factors, bss_loadings) = if options.on_loadings {
            (factors_sel.dot(&inverse), loadings_sel.dot(&w.t()))
        } else {
            (factors_sel.dot(&w.t()), loadings_sel.dot(&inverse))
        };

        let mut record = BssRecord {
            algorithm: options.algorithm.name().to_string(),
            unmixing_matrix: w,
            bss_factors,
            bss_loadings,
            on_loadings: options.on_loadings,
        };
        auto_reverse(&mut record, options.reverse_component_criterion);
        self.learning_results.commit_bss(record);
        Ok(())
    }

    fn select_components(&self, options: &BssOptions, available: usize) -> Result<Vec<usize>> {
        if let Some(list) = &options.comp_list {
            if let Some(&bad) = list.iter().find(|&&i| i >= available) {
                return Err(MvaError::Validation(format!(
                    "component index {bad} out of range ({available} stored)"
                )));
            }
            return Ok(list.clone());
        }
        let n = options
            .number_of_components
            .or(self.learning_results.output_dimension)
            .ok_or_else(|| {
                MvaError::Validation(
                    "provide number_of_components or comp_list, or run a decomposition \
                     with output_dimension set"
                        .into(),
                )
            })?;
        if n == 0 || n > available {
            return Err(MvaError::Validation(format!(
                "number_of_components {n} out of range ({available} stored)"
            )));
        }
        Ok((0..n).collect())
    }

    /// Sorts unmixing rows so components come out in decreasing share of the
    /// decomposition variance. Stable: ties keep their original order.
    fn reorder_by_variance(&self, w: &mut Array2<f64>, selection: &[usize]) {
        let ev = match &self.learning_results.explained_variance {
            Some(ev) => ev,
            None => return,
        };
        if selection.iter().any(|&i| i >= ev.len()) {
            return;
        }
        let ev_sel: Vec<f64> = selection.iter().map(|&i| ev[i]).collect();
        let mut order: Vec<usize> = (0..w.nrows()).collect();
        let score = |row: usize| -> f64 {
            w.row(row)
                .iter()
                .zip(ev_sel.iter())
                .map(|(v, e)| v.abs() * e)
                .sum()
        };
        order.sort_by(|&a, &b| {
            score(b)
                .partial_cmp(&score(a))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        *w = w.select(Axis(0), &order);
    }

    /// Flips the sign of the listed decomposition components in place.
    pub fn reverse_decomposition_component(&mut self, indices: &[usize]) -> Result<()> {
        let lr = &mut self.learning_results;
        let (factors, loadings) = match (&mut lr.factors, &mut lr.loadings) {
            (Some(f), Some(l)) => (f, l),
            _ => return Err(MvaError::MissingDecomposition("reverse_decomposition_component")),
        };
        negate_columns(factors, indices)?;
        negate_columns(loadings, indices)?;
        Ok(())
    }

    /// Flips the sign of the listed demixed components, keeping the
    /// unmixing matrix consistent.
    pub fn reverse_bss_component(&mut self, indices: &[usize]) -> Result<()> {
        let lr = &mut self.learning_results;
        let (factors, loadings, unmixing) = match (
            &mut lr.bss_factors,
            &mut lr.bss_loadings,
            &mut lr.unmixing_matrix,
        ) {
            (Some(f), Some(l), Some(w)) => (f, l, w),
            _ => return Err(MvaError::MissingDecomposition("reverse_bss_component")),
        };
        negate_columns(factors, indices)?;
        negate_columns(loadings, indices)?;
        for &i in indices {
            if i < unmixing.nrows() {
                unmixing.row_mut(i).mapv_inplace(|v| -v);
            }
        }
        Ok(())
    }

    /// Rescales each component so the target side's columns sum to one; the
    /// other side absorbs the scale. Order-dependent by construction.
    pub fn normalize_decomposition_components(
        &mut self,
        target: NormalizationTarget,
    ) -> Result<()> {
        let lr = &mut self.learning_results;
        let (factors, loadings) = match (&mut lr.factors, &mut lr.loadings) {
            (Some(f), Some(l)) => (f, l),
            _ => {
                return Err(MvaError::MissingDecomposition(
                    "normalize_decomposition_components",
                ))
            }
        };
        match target {
            NormalizationTarget::Factors => normalize_pair(factors, loadings),
            NormalizationTarget::Loadings => normalize_pair(loadings, factors),
        }
    }

    pub fn normalize_bss_components(&mut self, target: NormalizationTarget) -> Result<()> {
        let lr = &mut self.learning_results;
        let (factors, loadings) = match (&mut lr.bss_factors, &mut lr.bss_loadings) {
            (Some(f), Some(l)) => (f, l),
            _ => return Err(MvaError::MissingDecomposition("normalize_bss_components")),
        };
        match target {
            NormalizationTarget::Factors => normalize_pair(factors, loadings),
            NormalizationTarget::Loadings => normalize_pair(loadings, factors),
        }
    }
}

fn diff_rows(matrix: &Array2<f64>) -> Array2<f64> {
    let upper = matrix.slice(s![1.., ..]);
    let lower = matrix.slice(s![..-1, ..]);
    &upper - &lower
}

fn negate_columns(matrix: &mut Array2<f64>, indices: &[usize]) -> Result<()> {
    if let Some(&bad) = indices.iter().find(|&&i| i >= matrix.ncols()) {
        return Err(MvaError::Validation(format!(
            "component index {bad} out of range ({} stored)",
            matrix.ncols()
        )));
    }
    for &i in indices {
        matrix.column_mut(i).mapv_inplace(|v| -v);
    }
    Ok(())
}

fn normalize_pair(target: &mut Array2<f64>, other: &mut Array2<f64>) -> Result<()> {
    let sums: Vec<f64> = target
        .axis_iter(Axis(1))
        .map(|col| col.iter().filter(|v| v.is_finite()).sum())
        .collect();
    if let Some(i) = sums.iter().position(|&s| s.abs() < f64::EPSILON) {
        return Err(MvaError::Validation(format!(
            "component {i} sums to zero and cannot be normalized"
        )));
    }
    for ((mut t, mut o), s) in target
        .axis_iter_mut(Axis(1))
        .zip(other.axis_iter_mut(Axis(1)))
        .zip(sums.iter())
    {
        t.mapv_inplace(|v| v / s);
        o.mapv_inplace(|v| v * s);
    }
    Ok(())
}

/// Canonicalizes each component's polarity: when the criterion side dips
/// further below zero than it rises above, the component is flipped.
fn auto_reverse(record: &mut BssRecord, criterion: ReverseCriterion) {
    let reference = match criterion {
        ReverseCriterion::Factors => record.bss_factors.clone(),
        ReverseCriterion::Loadings => record.bss_loadings.clone(),
    };
    for (i, col) in reference.axis_iter(Axis(1)).enumerate() {
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        for &v in col.iter().filter(|v| v.is_finite()) {
            min = min.min(v);
            max = max.max(v);
        }
        if min < 0.0 && -min > max {
            record.bss_factors.column_mut(i).mapv_inplace(|v| -v);
            record.bss_loadings.column_mut(i).mapv_inplace(|v| -v);
            if i < record.unmixing_matrix.nrows() {
                record.unmixing_matrix.row_mut(i).mapv_inplace(|v| -v);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decomposition::DecompositionOptions;
    use approx::assert_abs_diff_eq;
    use ndarray::Array2;
    use ndarray_rand::RandomExt;
    use rand::Rng;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    /// Two non-Gaussian sources mixed into a 3-feature dataset.
    fn mixed_dataset(seed: u64) -> Dataset {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let n = 400;
        let mut sources = Array2::zeros((n, 2));
        for i in 0..n {
            sources[[i, 0]] = if rng.gen::<f64>() < 0.5 { 1.0 } else { -1.0 };
            sources[[i, 1]] = rng.gen::<f64>() * 2.0 - 1.0;
        }
        let mixing = ndarray::array![[1.0, 0.3, 0.5], [0.2, 1.0, 0.4]];
        Dataset::new(sources.dot(&mixing))
    }

    fn decomposed(seed: u64) -> Dataset {
        let mut ds = mixed_dataset(seed);
        ds.decomposition(DecompositionOptions {
            output_dimension: Some(2),
            ..DecompositionOptions::default()
        })
        .unwrap();
        ds
    }

    #[test]
    fn requires_a_prior_decomposition() {
        let mut ds = Dataset::new(Array2::zeros((5, 3)));
        let err = ds.blind_source_separation(BssOptions::default()).unwrap_err();
        assert!(matches!(err, MvaError::MissingDecomposition(_)));
    }

    #[test]
    fn fastica_on_loadings_commits_consistent_results() {
        let mut ds = decomposed(71);
        ds.blind_source_separation(BssOptions {
            on_loadings: true,
            diff_order: 0,
            seed: Some(5),
            ..BssOptions::default()
        })
        .unwrap();
        let lr = &ds.learning_results;
        assert_eq!(lr.bss_algorithm.as_deref(), Some("fastica"));
        assert!(lr.on_loadings);
        let w = lr.unmixing_matrix.as_ref().unwrap();
        assert_eq!(w.shape(), &[2, 2]);
        assert_eq!(lr.bss_factors.as_ref().unwrap().shape(), &[3, 2]);
        assert_eq!(lr.bss_loadings.as_ref().unwrap().shape(), &[400, 2]);

        // The demixed pair must reproduce the same model as the original.
        let original = lr.loadings.as_ref().unwrap().dot(&lr.factors.as_ref().unwrap().t());
        let demixed = lr
            .bss_loadings
            .as_ref()
            .unwrap()
            .dot(&lr.bss_factors.as_ref().unwrap().t());
        for (a, b) in demixed.iter().zip(original.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-6);
        }
    }

    #[test]
    fn orthomax_demixing_on_factors() {
        let mut ds = decomposed(72);
        ds.blind_source_separation(BssOptions {
            algorithm: BssAlgorithm::Orthomax,
            diff_order: 0,
            whiten_method: None,
            tolerance: 1e-6,
            ..BssOptions::default()
        })
        .unwrap();
        let lr = &ds.learning_results;
        assert_eq!(lr.bss_algorithm.as_deref(), Some("orthomax"));
        assert!(!lr.on_loadings);
        // Orthogonal unmixing: the model is preserved exactly.
        let original = lr.loadings.as_ref().unwrap().dot(&lr.factors.as_ref().unwrap().t());
        let demixed = lr
            .bss_loadings
            .as_ref()
            .unwrap()
            .dot(&lr.bss_factors.as_ref().unwrap().t());
        for (a, b) in demixed.iter().zip(original.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-6);
        }
    }

    #[test]
    fn polarity_canonicalization_leaves_no_dominantly_negative_component() {
        let mut ds = decomposed(73);
        ds.blind_source_separation(BssOptions {
            diff_order: 0,
            seed: Some(11),
            ..BssOptions::default()
        })
        .unwrap();
        let factors = ds.learning_results.bss_factors.as_ref().unwrap();
        for col in factors.axis_iter(Axis(1)) {
            let min = col.iter().cloned().fold(f64::INFINITY, f64::min);
            let max = col.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            assert!(!(min < 0.0 && -min > max), "column still reversed");
        }
    }

    #[test]
    fn differencing_shortens_and_mask_dilates() {
        let mut ds = decomposed(74);
        let n_obs = 3; // factors observations = features here
        let mut mask = Array1::from_elem(n_obs, false);
        mask[1] = true;
        // With diff order 1 on 3 observations only 2 rows remain and the
        // dilated mask kills both, so the run must fail cleanly.
        let err = ds
            .blind_source_separation(BssOptions {
                diff_order: 1,
                mask: Some(mask),
                ..BssOptions::default()
            })
            .unwrap_err();
        assert!(matches!(err, MvaError::Validation(_)));
    }

    #[test]
    fn comp_list_selects_specific_components() {
        let mut ds = mixed_dataset(75);
        ds.decomposition(DecompositionOptions {
            output_dimension: Some(3),
            ..DecompositionOptions::default()
        })
        .unwrap();
        ds.blind_source_separation(BssOptions {
            comp_list: Some(vec![0, 2]),
            diff_order: 0,
            seed: Some(2),
            ..BssOptions::default()
        })
        .unwrap();
        assert_eq!(
            ds.learning_results.unmixing_matrix.as_ref().unwrap().shape(),
            &[2, 2]
        );
    }

    #[test]
    fn singular_unmixing_falls_back_to_a_pseudo_inverse() {
        struct FlatDemixer {
            w: Array2<f64>,
        }
        impl Estimator for FlatDemixer {
            fn fit(&mut self, _: &ndarray::ArrayView2<'_, f64>) -> Result<()> {
                Ok(())
            }
            fn transform(&self, data: &ndarray::ArrayView2<'_, f64>) -> Result<Array2<f64>> {
                Ok(data.to_owned())
            }
            fn components(&self) -> Option<ndarray::ArrayView2<'_, f64>> {
                Some(self.w.view())
            }
        }

        let mut ds = decomposed(78);
        // A rank-one unmixing matrix has no exact inverse; the run must
        // still commit finite demixed components.
        ds.blind_source_separation(BssOptions {
            algorithm: BssAlgorithm::Custom(Box::new(FlatDemixer {
                w: ndarray::array![[1.0, 1.0], [1.0, 1.0]],
            })),
            diff_order: 0,
            whiten_method: None,
            ..BssOptions::default()
        })
        .unwrap();
        let lr = &ds.learning_results;
        assert_eq!(lr.bss_algorithm.as_deref(), Some("custom"));
        let factors = lr.bss_factors.as_ref().unwrap();
        let loadings = lr.bss_loadings.as_ref().unwrap();
        assert_eq!(factors.shape(), &[3, 2]);
        assert_eq!(loadings.shape(), &[400, 2]);
        assert!(factors.iter().all(|v| v.is_finite()));
        assert!(loadings.iter().all(|v| v.is_finite()));
        assert_eq!(lr.unmixing_matrix.as_ref().unwrap().shape(), &[2, 2]);
    }

    #[test]
    fn reverse_bss_component_round_trips() {
        let mut ds = decomposed(76);
        ds.blind_source_separation(BssOptions {
            diff_order: 0,
            seed: Some(3),
            ..BssOptions::default()
        })
        .unwrap();
        let before = ds.learning_results.bss_factors.clone().unwrap();
        ds.reverse_bss_component(&[0]).unwrap();
        ds.reverse_bss_component(&[0]).unwrap();
        let after = ds.learning_results.bss_factors.clone().unwrap();
        for (a, b) in after.iter().zip(before.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-12);
        }
        assert!(ds.reverse_bss_component(&[9]).is_err());
    }

    #[test]
    fn normalization_preserves_the_model() {
        let mut ds = decomposed(77);
        let lr = &ds.learning_results;
        let model_before = lr.loadings.as_ref().unwrap().dot(&lr.factors.as_ref().unwrap().t());
        ds.normalize_decomposition_components(NormalizationTarget::Factors)
            .unwrap();
        let lr = &ds.learning_results;
        let factors = lr.factors.as_ref().unwrap();
        for col in factors.axis_iter(Axis(1)) {
            assert_abs_diff_eq!(col.sum(), 1.0, epsilon = 1e-9);
        }
        let model_after = lr.loadings.as_ref().unwrap().dot(&factors.t());
        for (a, b) in model_after.iter().zip(model_before.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-9);
        }
    }
}
