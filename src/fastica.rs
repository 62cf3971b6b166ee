//! Symmetric FastICA over pre-whitened data.

use log::warn;
use ndarray::{Array2, ArrayView2, Axis};
use ndarray_linalg::{Eigh, UPLO};
use ndarray_rand::RandomExt;
use rand_distr::Normal;

use crate::error::{MvaError, Result};
use crate::estimator::Estimator;
use crate::rpca::seeded;

/// FastICA with the tanh contrast function and symmetric decorrelation.
///
/// Expects its input to already be whitened; the demixing engine whitens
/// upstream and composes the two matrices, so this implementation never
/// whitens on its own.
pub struct FastIca {
    n_components: Option<usize>,
    max_iter: usize,
    tolerance: f64,
    seed: Option<u64>,
    components: Option<Array2<f64>>,
}

impl FastIca {
    pub fn new() -> Self {
        FastIca {
            n_components: None,
            max_iter: 200,
            tolerance: 1e-10,
            seed: None,
            components: None,
        }
    }

    pub fn with_n_components(mut self, n: usize) -> Self {
        self.n_components = Some(n);
        self
    }

    pub fn with_max_iter(mut self, max_iter: usize) -> Self {
        self.max_iter = max_iter;
        self
    }

    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}

impl Default for FastIca {
    fn default() -> Self {
        Self::new()
    }
}

/// Replaces `w` with `(w w^T)^{-1/2} w`, making its rows orthonormal.
fn symmetric_decorrelation(w: &Array2<f64>) -> Result<Array2<f64>> {
    let gram = w.dot(&w.t());
    let (eigenvalues, eigenvectors) = gram.eigh(UPLO::Upper)?;
    let inv_sqrt = eigenvalues.mapv(|v| 1.0 / v.max(1e-12).sqrt());
    let mut scaled_vt = eigenvectors.t().to_owned();
    for (mut row, s) in scaled_vt.axis_iter_mut(Axis(0)).zip(inv_sqrt.iter()) {
        row.mapv_inplace(|v| v * s);
    }
    Ok(eigenvectors.dot(&scaled_vt).dot(w))
}

impl Estimator for FastIca {
    fn fit(&mut self, data: &ArrayView2<'_, f64>) -> Result<()> {
        let n = data.nrows();
        let n_in = data.ncols();
        if n_in < 2 {
            return Err(MvaError::Validation(
                "FastICA needs at least two input components".into(),
            ));
        }
        let n_out = self.n_components.unwrap_or(n_in);
        if n_out == 0 || n_out > n_in {
            return Err(MvaError::Validation(format!(
                "n_components {n_out} out of range for {n_in} inputs"
            )));
        }

        let mut rng = seeded(self.seed);
        let mut w = Array2::random_using(
            (n_out, n_in),
            Normal::new(0.0, 1.0).unwrap(),
            &mut rng,
        );
        w = symmetric_decorrelation(&w)?;

        let mut converged = false;
        for _ in 0..self.max_iter {
            let projected = data.dot(&w.t()); // n x n_out
            let g = projected.mapv(f64::tanh);
            let g_prime_mean = g
                .mapv(|v| 1.0 - v * v)
                .mean_axis(Axis(0))
                .ok_or_else(|| MvaError::Validation("empty input to FastICA".into()))?;

            let mut w_new = g.t().dot(data) / n as f64;
            for (mut row, (gp, w_row)) in w_new
                .axis_iter_mut(Axis(0))
                .zip(g_prime_mean.iter().zip(w.axis_iter(Axis(0))))
            {
                row.zip_mut_with(&w_row, |target, &old| *target -= gp * old);
            }
            let w_new = symmetric_decorrelation(&w_new)?;

            let overlap = w_new.dot(&w.t());
            let shift = overlap
                .diag()
                .iter()
                .map(|v| (v.abs() - 1.0).abs())
                .fold(0.0, f64::max);
            w = w_new;
            if shift < self.tolerance {
                converged = true;
                break;
            }
        }
        if !converged {
            warn!(
                "FastICA did not converge within {} iterations; consider \
                 raising max_iter or the tolerance",
                self.max_iter
            );
        }
        self.components = Some(w);
        Ok(())
    }

    fn transform(&self, data: &ArrayView2<'_, f64>) -> Result<Array2<f64>> {
        let w = self
            .components
            .as_ref()
            .ok_or_else(|| MvaError::Validation("FastICA has not been fitted".into()))?;
        Ok(data.dot(&w.t()))
    }

    fn components(&self) -> Option<ArrayView2<'_, f64>> {
        self.components.as_ref().map(|c| c.view())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::Array2;
    use rand::Rng;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    /// Two independent non-Gaussian sources, mixed then whitened.
    fn whitened_mixture(seed: u64) -> (Array2<f64>, Array2<f64>) {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let n = 2000;
        let mut sources = Array2::zeros((n, 2));
        for i in 0..n {
            sources[[i, 0]] = if rng.gen::<f64>() < 0.5 { 1.0 } else { -1.0 };
            sources[[i, 1]] = rng.gen::<f64>() * 2.0 - 1.0;
        }
        let mixing = ndarray::array![[1.0, 0.6], [0.4, 1.0]];
        let mixed = sources.dot(&mixing);
        let (white, _) =
            crate::whitening::whiten_data(&mixed.view(), true, crate::whitening::WhitenMethod::Pca)
                .unwrap();
        (sources, white)
    }

    #[test]
    fn unmixing_rows_are_orthonormal_on_whitened_data() {
        let (_, white) = whitened_mixture(41);
        let mut ica = FastIca::new().with_seed(7);
        ica.fit(&white.view()).unwrap();
        let w = ica.components().unwrap().to_owned();
        let gram = w.dot(&w.t());
        assert_abs_diff_eq!(gram[[0, 0]], 1.0, epsilon = 1e-8);
        assert_abs_diff_eq!(gram[[0, 1]], 0.0, epsilon = 1e-8);
        assert_abs_diff_eq!(gram[[1, 1]], 1.0, epsilon = 1e-8);
    }

    #[test]
    fn recovered_sources_correlate_with_the_truth() {
        let (sources, white) = whitened_mixture(42);
        let mut ica = FastIca::new().with_seed(3);
        let recovered = ica.fit_transform(&white.view()).unwrap();

        // Each true source should align with exactly one recovered component
        // up to sign and permutation.
        let n = sources.nrows() as f64;
        for true_col in 0..2 {
            let mut best = 0.0f64;
            for rec_col in 0..2 {
                let corr: f64 = sources
                    .column(true_col)
                    .iter()
                    .zip(recovered.column(rec_col).iter())
                    .map(|(a, b)| a * b)
                    .sum::<f64>()
                    / n;
                let s_std = (sources.column(true_col).mapv(|v| v * v).sum() / n).sqrt();
                let r_std = (recovered.column(rec_col).mapv(|v| v * v).sum() / n).sqrt();
                best = best.max((corr / (s_std * r_std)).abs());
            }
            assert!(best > 0.9, "source {true_col} alignment {best}");
        }
    }

    #[test]
    fn transform_before_fit_fails() {
        let ica = FastIca::new();
        let data = Array2::<f64>::zeros((4, 2));
        assert!(ica.transform(&data.view()).is_err());
    }
}
