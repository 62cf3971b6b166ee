//! Orthomax component rotation (varimax for gamma = 1).

use ndarray::{Array2, ArrayView2, Axis};
use ndarray_linalg::SVD;

use crate::error::{factor_missing, MvaError, Result};

/// Rotates the columns of `a` (observations x components) towards a simple
/// structure and returns `(rotated, rotation)` with `rotated = a . rotation`.
///
/// The SVD iteration of Kaiser's scheme; `gamma` interpolates the orthomax
/// family (1.0 = varimax, 0.0 = quartimax).
pub fn orthomax(
    a: &ArrayView2<'_, f64>,
    gamma: f64,
    tolerance: f64,
    max_iter: usize,
) -> Result<(Array2<f64>, Array2<f64>)> {
    let (p, k) = (a.nrows(), a.ncols());
    if k < 2 {
        return Err(MvaError::Validation(
            "orthomax rotation needs at least two components".into(),
        ));
    }
    let mut rotation = Array2::eye(k);
    let mut objective = 0.0;
    for _ in 0..max_iter {
        let lambda = a.dot(&rotation);
        let cubed = lambda.mapv(|v| v.powi(3));
        let col_means = lambda.mapv(|v| v * v).sum_axis(Axis(0)) * (gamma / p as f64);
        let centered = &cubed - &(&lambda * &col_means);
        let gradient = a.t().dot(&centered);

        let (u, s, vt) = gradient.svd(true, true)?;
        let u = u.ok_or_else(factor_missing)?;
        let vt = vt.ok_or_else(factor_missing)?;
        rotation = u
            .slice_axis(Axis(1), (0..k).into())
            .dot(&vt.slice_axis(Axis(0), (0..k).into()));

        let new_objective: f64 = s.sum();
        if new_objective < objective * (1.0 + tolerance) {
            break;
        }
        objective = new_objective;
    }
    Ok((a.dot(&rotation), rotation))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn rotation_is_orthogonal() {
        let a = array![
            [0.8, 0.2],
            [0.7, 0.3],
            [0.1, 0.9],
            [0.2, 0.8],
            [0.75, 0.25],
            [0.15, 0.85]
        ];
        let (_, r) = orthomax(&a.view(), 1.0, 1e-6, 256).unwrap();
        let identity = r.t().dot(&r);
        assert_abs_diff_eq!(identity[[0, 0]], 1.0, epsilon = 1e-9);
        assert_abs_diff_eq!(identity[[0, 1]], 0.0, epsilon = 1e-9);
        assert_abs_diff_eq!(identity[[1, 1]], 1.0, epsilon = 1e-9);
    }

    #[test]
    fn varimax_concentrates_loadings() {
        // A 45-degree mixture of two sparse structures; varimax should
        // rotate back towards one large and one small entry per row.
        let sparse = array![
            [1.0, 0.0],
            [1.0, 0.1],
            [0.9, 0.0],
            [0.0, 1.0],
            [0.1, 1.0],
            [0.0, 0.9]
        ];
        let angle = std::f64::consts::FRAC_PI_4;
        let mix = array![
            [angle.cos(), -angle.sin()],
            [angle.sin(), angle.cos()]
        ];
        let mixed = sparse.dot(&mix);
        let (rotated, _) = orthomax(&mixed.view(), 1.0, 1e-6, 256).unwrap();
        let simplicity = |m: &Array2<f64>| -> f64 {
            m.rows()
                .into_iter()
                .map(|r| {
                    let abs: Vec<f64> = r.iter().map(|v| v.abs()).collect();
                    let max = abs.iter().cloned().fold(0.0, f64::max);
                    let sum: f64 = abs.iter().sum();
                    if sum > 0.0 {
                        max / sum
                    } else {
                        0.0
                    }
                })
                .sum()
        };
        assert!(simplicity(&rotated) > simplicity(&mixed));
    }

    #[test]
    fn single_component_is_rejected() {
        let a = array![[1.0], [2.0]];
        assert!(orthomax(&a.view(), 1.0, 1e-6, 16).is_err());
    }
}
