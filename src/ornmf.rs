//! Online non-negative matrix factorization.

use ndarray::{Array2, ArrayView2};
use ndarray_rand::RandomExt;
use rand_distr::Normal;

use crate::error::{MvaError, Result};
use crate::rpca::{ridge_project, seeded};

/// One-pass online NMF with a ridge-regularized coefficient solve followed
/// by projection onto the non-negative orthant.
///
/// Returns `(coefficients, basis)`: coefficients (samples x rank) and basis
/// (features x rank), both non-negative, with
/// `data ~= coefficients . basis^T`.
pub fn ornmf(
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
    let mut basis =
        Array2::random_using((m, rank), Normal::new(0.0, 1.0).unwrap(), &mut rng).mapv(f64::abs);

    let mut gram_acc: Array2<f64> = Array2::eye(rank) * lambda;
    let mut cross_acc: Array2<f64> = Array2::zeros((m, rank));
    for i in 0..n {
        let x = data.row(i).to_owned();
        let mut coeff = ridge_project(&basis, &x, lambda)?;
        coeff.mapv_inplace(|v| v.max(0.0));
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
        for j in 0..m {
            let rhs = cross_acc.row(j).to_owned();
            let solution = {
                use ndarray_linalg::Solve;
                gram_acc.solve(&rhs)?
            };
            for a in 0..rank {
                basis[[j, a]] = solution[a].max(0.0);
            }
        }
    }

    let mut coefficients = Array2::zeros((n, rank));
    for i in 0..n {
        let mut coeff = ridge_project(&basis, &data.row(i).to_owned(), lambda)?;
        coeff.mapv_inplace(|v| v.max(0.0));
        coefficients.row_mut(i).assign(&coeff);
    }
    Ok((coefficients, basis))
}
