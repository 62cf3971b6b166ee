//! Maximum likelihood PCA: alternating inverse-variance-weighted regression.

use log::debug;
use ndarray::{Array1, Array2, ArrayView2, Axis};
use ndarray_linalg::{Solve, SVD};

use crate::error::{MvaError, Result};

const VARIANCE_FLOOR: f64 = 1e-12;

/// Weighted low-rank fit of `data` under per-element variances.
///
/// Returns `(u, s, v)` with `u` (samples x k) orthonormal, `s` the singular
/// values of the fit and `v` (features x k) orthonormal, so the maximum
/// likelihood estimate of the data is `u . diag(s) . v^T`. Variances of zero
/// are floored; for Poisson data pass the data itself as `variance`.
pub fn mlpca(
    data: &ArrayView2<'_, f64>,
    variance: &ArrayView2<'_, f64>,
    output_dimension: usize,
    max_iter: usize,
    tolerance: f64,
) -> Result<(Array2<f64>, Array1<f64>, Array2<f64>)> {
    let (n, m) = (data.nrows(), data.ncols());
    if variance.shape() != data.shape() {
        return Err(MvaError::ShapeMismatch {
            name: "var_array",
            expected: format!("{:?}", data.shape()),
            actual: format!("{:?}", variance.shape()),
        });
    }
    let k = output_dimension;
    if k == 0 || k > n.min(m) {
        return Err(MvaError::Validation(format!(
            "output_dimension {k} out of range for a {n}x{m} matrix"
        )));
    }
    let weights = variance.mapv(|v| 1.0 / v.max(VARIANCE_FLOOR));

    // Unweighted SVD seeds the basis.
    let (_, _, vt) = data.svd(false, true)?;
    let vt = vt.ok_or_else(|| MvaError::Validation("SVD did not return V^T".into()))?;
    let mut basis = vt.slice_axis(Axis(0), (0..k).into()).t().to_owned(); // m x k
    let mut scores = Array2::zeros((n, k));
    let mut previous_objective = f64::INFINITY;

    for iteration in 0..max_iter {
        // Row pass: scores given the basis.
        for i in 0..n {
            let w = weights.row(i);
            let mut gram = Array2::zeros((k, k));
            let mut rhs = Array1::zeros(k);
            for j in 0..m {
                let wj = w[j];
                let b = basis.row(j);
                for a in 0..k {
                    rhs[a] += wj * b[a] * data[[i, j]];
                    for c in 0..k {
                        gram[[a, c]] += wj * b[a] * b[c];
                    }
                }
            }
            let solution = gram.solve(&rhs)?;
            scores.row_mut(i).assign(&solution);
        }

        // Column pass: basis given the scores.
        for j in 0..m {
            let mut gram = Array2::zeros((k, k));
            let mut rhs = Array1::zeros(k);
            for i in 0..n {
                let wi = weights[[i, j]];
                let t = scores.row(i);
                for a in 0..k {
                    rhs[a] += wi * t[a] * data[[i, j]];
                    for c in 0..k {
                        gram[[a, c]] += wi * t[a] * t[c];
                    }
                }
            }
            let solution = gram.solve(&rhs)?;
            basis.row_mut(j).assign(&solution);
        }

        let model = scores.dot(&basis.t());
        let objective: f64 = data
            .iter()
            .zip(model.iter())
            .zip(weights.iter())
            .map(|((&d, &f), &w)| w * (d - f) * (d - f))
            .sum();
        let relative = (previous_objective - objective).abs() / objective.max(f64::MIN_POSITIVE);
        debug!("mlpca iteration {iteration}: weighted residual {objective:.6e}");
        if relative < tolerance {
            break;
        }
        previous_objective = objective;
    }

    orthogonalize(scores, basis)
}

/// Re-expresses `scores . basis^T` in SVD form without forming the full
/// model matrix: SVD the small k x k core of the QR-compressed pair.
fn orthogonalize(
    scores: Array2<f64>,
    basis: Array2<f64>,
) -> Result<(Array2<f64>, Array1<f64>, Array2<f64>)> {
    use ndarray_linalg::QR;

    let (q_scores, r_scores) = scores.qr()?;
    let (q_basis, r_basis) = basis.qr()?;
    let core = r_scores.dot(&r_basis.t());
    let (u, s, vt) = core.svd(true, true)?;
    let u = u.ok_or_else(|| MvaError::Validation("SVD did not return U".into()))?;
    let vt = vt.ok_or_else(|| MvaError::Validation("SVD did not return V^T".into()))?;
    Ok((q_scores.dot(&u), s, q_basis.dot(&vt.t())))
}
