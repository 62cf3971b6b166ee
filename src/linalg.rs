//! Small dense linear-algebra helpers shared by the engines.

use log::warn;
use ndarray::{Array1, Array2, ArrayView2, Axis};
use ndarray_linalg::{Inverse, SVD};

use crate::error::{factor_missing, Result};

/// Outcome of inverting a (possibly singular) square matrix.
///
/// `Pseudo` marks the Moore-Penrose fallback taken when the exact inverse
/// does not exist; callers can surface that in their logs or results.
#[derive(Debug, Clone)]
pub enum Inversion {
    Exact(Array2<f64>),
    Pseudo(Array2<f64>),
}

impl Inversion {
    pub fn into_matrix(self) -> Array2<f64> {
        match self {
            Inversion::Exact(m) | Inversion::Pseudo(m) => m,
        }
    }

    pub fn is_pseudo(&self) -> bool {
        matches!(self, Inversion::Pseudo(_))
    }
}

/// Inverts `matrix`, falling back to the pseudo-inverse when LAPACK reports
/// a singular factorization. The fallback is logged once per call site hit.
pub fn invert_with_fallback(matrix: &ArrayView2<'_, f64>) -> Result<Inversion> {
    if matrix.nrows() == matrix.ncols() {
        if let Ok(inv) = matrix.inv() {
            return Ok(Inversion::Exact(inv));
        }
        warn!("matrix is singular; using its pseudo-inverse instead");
    }
    Ok(Inversion::Pseudo(pinv(matrix)?))
}

/// Moore-Penrose pseudo-inverse via thin SVD, with the conventional
/// `max(m, n) * eps * s_max` cutoff for small singular values.
pub fn pinv(matrix: &ArrayView2<'_, f64>) -> Result<Array2<f64>> {
    let (u, s, vt) = matrix.svd(true, true)?;
    let u = u.ok_or_else(factor_missing)?;
    let vt = vt.ok_or_else(factor_missing)?;
    let rank = s.len();
    let cutoff = s
        .first()
        .copied()
        .unwrap_or(0.0)
        .max(0.0)
        * matrix.nrows().max(matrix.ncols()) as f64
        * f64::EPSILON;
    let s_inv: Array1<f64> = s.mapv(|v| if v > cutoff { 1.0 / v } else { 0.0 });

    // V * S^+ * U^T, built without materializing the diagonal.
    let mut v_scaled = vt.slice_axis(Axis(0), (0..rank).into()).t().to_owned();
    for (mut col, inv) in v_scaled.axis_iter_mut(Axis(1)).zip(s_inv.iter()) {
        col.mapv_inplace(|v| v * inv);
    }
    Ok(v_scaled.dot(&u.slice_axis(Axis(1), (0..rank).into()).t()))
}
