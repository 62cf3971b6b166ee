//! The seam for user-supplied decomposition and demixing algorithms.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2};

use crate::error::{MvaError, Result};

/// A fit/transform style algorithm plugged into the decomposition or
/// demixing engines.
///
/// `components()` must return the learned mixing components after `fit`,
/// shaped (k, n_input_columns); for demixing algorithms this is the
/// unmixing matrix. `explained_variance()` and `mean()` are optional and
/// only consulted when present.
pub trait Estimator: Send {
    fn fit(&mut self, data: &ArrayView2<'_, f64>) -> Result<()>;

    fn transform(&self, data: &ArrayView2<'_, f64>) -> Result<Array2<f64>>;

    fn fit_transform(&mut self, data: &ArrayView2<'_, f64>) -> Result<Array2<f64>> {
        self.fit(data)?;
        self.transform(data)
    }

    fn components(&self) -> Option<ArrayView2<'_, f64>>;

    fn explained_variance(&self) -> Option<ArrayView1<'_, f64>> {
        None
    }

    fn mean(&self) -> Option<ArrayView1<'_, f64>> {
        None
    }
}

/// Decomposition output in the engine's canonical orientation.
#[derive(Debug)]
pub struct DecompositionOutput {
    /// (features x k).
    pub factors: Array2<f64>,
    /// (samples x k).
    pub loadings: Array2<f64>,
    pub explained_variance: Option<Array1<f64>>,
    pub mean: Option<Array1<f64>>,
}

/// Fits `estimator` on `data` and normalizes its outputs: loadings from
/// `fit_transform`, factors from the transposed components.
pub fn run_estimator(
    estimator: &mut dyn Estimator,
    data: &ArrayView2<'_, f64>,
) -> Result<DecompositionOutput> {
    let loadings = estimator.fit_transform(data)?;
    let components = estimator.components().ok_or_else(|| {
        MvaError::Validation("fitted estimator exposes no components".into())
    })?;
    let factors = components.t().to_owned();
    let explained_variance = estimator.explained_variance().map(|v| v.to_owned());
    let mean = estimator.mean().map(|v| v.to_owned());
    Ok(DecompositionOutput {
        factors,
        loadings,
        explained_variance,
        mean,
    })
}
