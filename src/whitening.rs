//! PCA and ZCA whitening of the component matrix ahead of demixing.

use ndarray::{Array2, ArrayView2, Axis};
use ndarray_linalg::{Eigh, UPLO};
use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WhitenMethod {
    /// Project onto the principal axes and rescale (decorrelating rotation).
    Pca,
    /// Symmetric whitening that stays as close to the input as possible.
    Zca,
}

/// Whitens the columns of `data` (observations x components).
///
/// Returns the whitened matrix together with the k x k whitening matrix `W`
/// such that `whitened = data_centred . W^T`; demixing engines compose `W`
/// into their unmixing matrix so it applies to the raw components.
pub fn whiten_data(
    data: &ArrayView2<'_, f64>,
    centre: bool,
    method: WhitenMethod,
) -> Result<(Array2<f64>, Array2<f64>)> {
    let mut x = data.to_owned();
    if centre {
        if let Some(mean) = x.mean_axis(Axis(0)) {
            x -= &mean;
        }
    }
    let n = x.nrows().max(1) as f64;
    let covariance = x.t().dot(&x) / n;
    let (eigenvalues, eigenvectors) = covariance.eigh(UPLO::Upper)?;

    // Floor tiny/negative eigenvalues so the inverse square root stays finite.
    let inv_sqrt = eigenvalues.mapv(|v| 1.0 / v.max(1e-12).sqrt());

    let mut scaled_vt = eigenvectors.t().to_owned();
    for (mut row, s) in scaled_vt.axis_iter_mut(Axis(0)).zip(inv_sqrt.iter()) {
        row.mapv_inplace(|v| v * s);
    }
    let w = match method {
        WhitenMethod::Pca => scaled_vt,
        WhitenMethod::Zca => eigenvectors.dot(&scaled_vt),
    };
    let whitened = x.dot(&w.t());
    Ok((whitened, w))
}
