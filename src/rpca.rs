//! Robust PCA via GoDec (low rank + sparse split) and its online variant.

use log::debug;
use ndarray::{Array1, Array2, ArrayView2, Axis};
use ndarray_linalg::{Solve, SVD};
use ndarray_rand::RandomExt;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::Normal;

use crate::error::{factor_missing, MvaError, Result};

/// Low-rank factorization of `data` that is robust to sparse outliers.
pub struct RpcaOutput {
    /// Left singular vectors of the low-rank part (samples x rank).
    pub u: Array2<f64>,
    /// Singular values of the low-rank part.
    pub s: Array1<f64>,
    /// Right singular vectors (features x rank).
    pub v: Array2<f64>,
    /// The sparse outlier matrix.
    pub sparse: Array2<f64>,
}

/// GoDec iteration: alternate a truncated SVD of `data - sparse` with a
/// soft-threshold of the residual. `lambda` defaults to
/// `1 / sqrt(max(samples, features))`.
pub fn rpca_godec(
    data: &ArrayView2<'_, f64>,
    rank: usize,
    lambda: Option<f64>,
    max_iter: usize,
    tolerance: f64,
) -> Result<RpcaOutput> {
    let (n, m) = (data.nrows(), data.ncols());
    if rank == 0 || rank > n.min(m) {
        return Err(MvaError::Validation(format!(
            "rank {rank} out of range for a {n}x{m} matrix"
        )));
    }
    let lambda = lambda.unwrap_or(1.0 / (n.max(m) as f64).sqrt());
    let data_norm = frobenius(data);

    let mut sparse = Array2::zeros((n, m));
    let mut truncated = (Array2::zeros((n, rank)), Array1::zeros(rank), Array2::zeros((m, rank)));
    for iteration in 0..max_iter {
        let residual_input = data - &sparse;
        let (u, s, vt) = residual_input.svd(true, true)?;
        let u = u.ok_or_else(factor_missing)?;
        let vt = vt.ok_or_else(factor_missing)?;
        let u_r = u.slice_axis(Axis(1), (0..rank).into()).to_owned();
        let s_r = s.slice_axis(Axis(0), (0..rank).into()).to_owned();
        let v_r = vt.slice_axis(Axis(0), (0..rank).into()).t().to_owned();

        let mut low_rank = u_r.clone();
        for (mut col, sv) in low_rank.axis_iter_mut(Axis(1)).zip(s_r.iter()) {
            col.mapv_inplace(|x| x * sv);
        }
        let low_rank = low_rank.dot(&v_r.t());

        sparse = (data - &low_rank).mapv(|v| soft_threshold(v, lambda));
        truncated = (u_r, s_r, v_r);

        let residual = (data - &low_rank) - &sparse;
        let gap = frobenius(&residual.view()) / data_norm.max(f64::MIN_POSITIVE);
        debug!("rpca_godec iteration {iteration}: relative residual {gap:.3e}");
        if gap < tolerance {
            break;
        }
    }
    let (u, s, v) = truncated;
    Ok(RpcaOutput { u, s, v, sparse })
}

/// Online robust PCA: one pass over the sample rows, updating an
/// L2-regularized basis from running second-moment accumulators, then a
/// second pass projecting every sample onto the final basis.
///
/// Returns `(loadings, factors)` with loadings (samples x rank) and
/// factors (features x rank).
pub fn orpca(
    data: &ArrayView2<'_, f64>,
    rank: usize,
    lambda: f64,
    seed: Option<u64>,
) -> Result<(Array2<f64>, Array2<f64>)> {
    let (n, m) = (data.nrows(), data.ncols());
    if rank == 0 || rank > n.min(m) {
        return Err(MvaError::Validation(format!(
            "rank {rank} out of range for a {n}x{m} matrix"
        )));
    }
    let mut rng = seeded(seed);
    let mut basis = Array2::random_using((m, rank), Normal::new(0.0, 1.0).unwrap(), &mut rng);

    let mut gram_acc: Array2<f64> = Array2::eye(rank) * lambda;
    let mut cross_acc: Array2<f64> = Array2::zeros((m, rank));
    for i in 0..n {
        let x = data.row(i);
        let coeff = ridge_project(&basis, &x.to_owned(), lambda)?;
        for a in 0..rank {
            for b in 0..rank {
                gram_acc[[a, b]] += coeff[a] * coeff[b];
            }
        }
        for j in 0..m {
            for a in 0..rank {
                cross_acc[[j, a]] += x[j] * coeff[a];
            }
        }
        // basis = cross_acc . gram_acc^{-1}, solved column-block-wise.
        basis = solve_right(&gram_acc, &cross_acc)?;
    }

    let mut loadings = Array2::zeros((n, rank));
    for i in 0..n {
        let coeff = ridge_project(&basis, &data.row(i).to_owned(), lambda)?;
        loadings.row_mut(i).assign(&coeff);
    }
    Ok((loadings, basis))
}

/// Solves `x . gram = rhs` for x, i.e. `x = rhs . gram^{-1}`.
fn solve_right(gram: &Array2<f64>, rhs: &Array2<f64>) -> Result<Array2<f64>> {
    let mut out = Array2::zeros(rhs.raw_dim());
    for (j, row) in rhs.axis_iter(Axis(0)).enumerate() {
        // gram is symmetric, so solving gram^T y = row^T gives the row of x.
        let solution = gram.solve(&row.to_owned())?;
        out.row_mut(j).assign(&solution);
    }
    Ok(out)
}

/// Least-squares coefficients of `x` against `basis` with an L2 penalty.
pub(crate) fn ridge_project(
    basis: &Array2<f64>,
    x: &Array1<f64>,
    lambda: f64,
) -> Result<Array1<f64>> {
    let k = basis.ncols();
    let mut gram = basis.t().dot(basis);
    for a in 0..k {
        gram[[a, a]] += lambda;
    }
    let rhs = basis.t().dot(x);
    Ok(gram.solve(&rhs)?)
}

fn soft_threshold(value: f64, lambda: f64) -> f64 {
    value.signum() * (value.abs() - lambda).max(0.0)
}

fn frobenius(m: &ArrayView2<'_, f64>) -> f64 {
    m.iter().map(|v| v * v).sum::<f64>().sqrt()
}

pub(crate) fn seeded(seed: Option<u64>) -> ChaCha8Rng {
    match seed {
        Some(s) => ChaCha8Rng::seed_from_u64(s),
        None => ChaCha8Rng::from_rng(rand::thread_rng()).unwrap_or_else(|_| {
            // Fall back to a fixed stream if the OS entropy source fails.
            ChaCha8Rng::seed_from_u64(0)
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::Array2;

    fn low_rank_with_outliers(seed: u64) -> (Array2<f64>, Array2<f64>) {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let left = Array2::random_using((30, 2), Normal::new(0.0, 1.0).unwrap(), &mut rng);
        let right = Array2::random_using((2, 10), Normal::new(0.0, 1.0).unwrap(), &mut rng);
        let clean = left.dot(&right);
        let mut corrupted = clean.clone();
        corrupted[[3, 4]] += 25.0;
        corrupted[[17, 8]] -= 30.0;
        (clean, corrupted)
    }

    #[test]
    fn godec_separates_sparse_outliers() {
        let (clean, corrupted) = low_rank_with_outliers(21);
        let out = rpca_godec(&corrupted.view(), 2, None, 100, 1e-8).unwrap();
        let mut low_rank = out.u.clone();
        for (mut col, sv) in low_rank.axis_iter_mut(Axis(1)).zip(out.s.iter()) {
            col.mapv_inplace(|x| x * sv);
        }
        let low_rank = low_rank.dot(&out.v.t());
        let err = frobenius(&(&low_rank - &clean).view()) / frobenius(&clean.view());
        assert!(err < 0.15, "relative error {err}");
        assert!(out.sparse[[3, 4]].abs() > 10.0);
        assert!(out.sparse[[17, 8]].abs() > 10.0);
    }

    #[test]
    fn godec_validates_rank() {
        let data = Array2::<f64>::zeros((5, 4));
        assert!(rpca_godec(&data.view(), 0, None, 10, 1e-8).is_err());
        assert!(rpca_godec(&data.view(), 5, None, 10, 1e-8).is_err());
    }

    #[test]
    fn orpca_reconstructs_low_rank_data() {
        let (clean, _) = low_rank_with_outliers(22);
        let (loadings, factors) = orpca(&clean.view(), 2, 1e-3, Some(5)).unwrap();
        assert_eq!(loadings.shape(), &[30, 2]);
        assert_eq!(factors.shape(), &[10, 2]);
        let model = loadings.dot(&factors.t());
        let err = frobenius(&(&model - &clean).view()) / frobenius(&clean.view());
        assert!(err < 0.1, "relative error {err}");
    }

    #[test]
    fn soft_threshold_shrinks_towards_zero() {
        assert_abs_diff_eq!(soft_threshold(3.0, 1.0), 2.0);
        assert_abs_diff_eq!(soft_threshold(-3.0, 1.0), -2.0);
        assert_abs_diff_eq!(soft_threshold(0.5, 1.0), 0.0);
    }
}
