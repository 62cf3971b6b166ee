//! SVD decomposition kernel.

use ndarray::{Array1, Array2, ArrayView2, Axis};
use ndarray_linalg::SVD;
use serde::{Deserialize, Serialize};

use crate::error::{factor_missing, MvaError, Result};

/// Which axis the data is centred along before the SVD runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Centre {
    /// Subtract the per-feature mean (computed over the navigation axis).
    /// The mean is recorded so reprojection and reconstruction can re-apply it.
    Navigation,
    /// Subtract the per-sample mean (computed over the signal axis).
    Signal,
    /// Centring performed by a user-supplied estimator.
    Samples,
}

/// Output of the SVD kernel: factors (features x k), loadings (samples x k),
/// explained variance per component and the recorded mean, if any.
pub struct SvdOutput {
    pub factors: Array2<f64>,
    pub loadings: Array2<f64>,
    pub explained_variance: Array1<f64>,
    pub mean: Option<Array1<f64>>,
}

/// Thin SVD of `data` (samples x features) with optional centring and
/// truncation to `output_dimension` components.
///
/// `factors = V`, `loadings = U . diag(S)`, `explained_variance = S^2 / n`.
pub fn svd_pca(
    data: &ArrayView2<'_, f64>,
    output_dimension: Option<usize>,
    centre: Option<Centre>,
) -> Result<SvdOutput> {
    let n_samples = data.nrows();
    let mut x = data.to_owned();
    let mut mean = None;
    match centre {
        Some(Centre::Navigation) => {
            if let Some(m) = x.mean_axis(Axis(0)) {
                x -= &m;
                mean = Some(m);
            }
        }
        Some(Centre::Signal) => {
            if let Some(m) = x.mean_axis(Axis(1)) {
                x -= &m.insert_axis(Axis(1));
            }
        }
        Some(Centre::Samples) => {
            return Err(MvaError::Validation(
                "centre=samples is reserved for estimator-driven decompositions".into(),
            ));
        }
        None => {}
    }

    let (u, s, vt) = x.svd(true, true)?;
    let u = u.ok_or_else(factor_missing)?;
    let vt = vt.ok_or_else(factor_missing)?;
    let rank = s.len();
    let k = output_dimension.map_or(rank, |d| d.min(rank));

    let mut loadings = u.slice_axis(Axis(1), (0..k).into()).to_owned();
    for (mut col, sv) in loadings.axis_iter_mut(Axis(1)).zip(s.iter()) {
        col.mapv_inplace(|v| v * sv);
    }
    let factors = vt.slice_axis(Axis(0), (0..k).into()).t().to_owned();
    let explained_variance = s
        .slice_axis(Axis(0), (0..k).into())
        .mapv(|v| v * v / n_samples as f64);

    Ok(SvdOutput {
        factors,
        loadings,
        explained_variance,
        mean,
    })
}
