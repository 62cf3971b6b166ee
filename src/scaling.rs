//! Pre-clustering feature scaling.

use ndarray::{Array2, ArrayView2, Axis};

/// A stateless scaler applied to the cluster source matrix.
///
/// Implement this to plug a custom preprocessing step into
/// [`ClusterOptions`](crate::clustering::ClusterOptions).
pub trait Scaler: Send + Sync {
    fn scale(&self, data: &ArrayView2<'_, f64>) -> Array2<f64>;
}

/// Scaling applied before a clustering kernel runs.
pub enum Scaling {
    /// Use the data as-is.
    None,
    /// Per-feature zero mean, unit variance. Constant features stay centred.
    Standard,
    /// Per-sample unit Euclidean norm. Zero rows stay zero.
    Norm,
    /// Per-feature rescale to [0, 1]. Constant features map to zero.
    MinMax,
    Custom(Box<dyn Scaler>),
}

impl Default for Scaling {
    fn default() -> Self {
        Scaling::MinMax
    }
}

impl std::fmt::Debug for Scaling {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Scaling::None => "None",
            Scaling::Standard => "Standard",
            Scaling::Norm => "Norm",
            Scaling::MinMax => "MinMax",
            Scaling::Custom(_) => "Custom",
        })
    }
}

impl Scaling {
    pub fn apply(&self, data: &ArrayView2<'_, f64>) -> Array2<f64> {
        match self {
            Scaling::None => data.to_owned(),
            Scaling::Standard => standard_scale(data),
            Scaling::Norm => norm_scale(data),
            Scaling::MinMax => min_max_scale(data),
            Scaling::Custom(scaler) => scaler.scale(data),
        }
    }
}

fn standard_scale(data: &ArrayView2<'_, f64>) -> Array2<f64> {
    let n = data.nrows() as f64;
    let mean = data.mean_axis(Axis(0)).unwrap_or_default();
    let mut out = data.to_owned();
    out -= &mean;
    let mut std = out.mapv(|v| v * v).sum_axis(Axis(0)).mapv(|v| (v / n).sqrt());
    std.mapv_inplace(|v| if v > 0.0 { v } else { 1.0 });
    out /= &std;
    out
}

fn norm_scale(data: &ArrayView2<'_, f64>) -> Array2<f64> {
    let mut out = data.to_owned();
    for mut row in out.axis_iter_mut(Axis(0)) {
        let norm = row.iter().map(|v| v * v).sum::<f64>().sqrt();
        if norm > 0.0 {
            row.mapv_inplace(|v| v / norm);
        }
    }
    out
}

fn min_max_scale(data: &ArrayView2<'_, f64>) -> Array2<f64> {
    let mut out = data.to_owned();
    for mut col in out.axis_iter_mut(Axis(1)) {
        let min = col.iter().copied().fold(f64::INFINITY, f64::min);
        let max = col.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let range = max - min;
        if range > 0.0 {
            col.mapv_inplace(|v| (v - min) / range);
        } else {
            col.fill(0.0);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn standard_scaling_centres_and_normalizes_columns() {
        let data = array![[1.0, 10.0], [3.0, 10.0]];
        let scaled = Scaling::Standard.apply(&data.view());
        assert_abs_diff_eq!(scaled.column(0).sum(), 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(scaled[[0, 0]], -1.0, epsilon = 1e-12);
        // Constant column stays centred at zero without dividing by zero.
        assert_abs_diff_eq!(scaled[[0, 1]], 0.0, epsilon = 1e-12);
    }

    #[test]
    fn norm_scaling_gives_unit_rows() {
        let data = array![[3.0, 4.0], [0.0, 0.0]];
        let scaled = Scaling::Norm.apply(&data.view());
        assert_abs_diff_eq!(scaled[[0, 0]], 0.6, epsilon = 1e-12);
        assert_abs_diff_eq!(scaled[[0, 1]], 0.8, epsilon = 1e-12);
        assert_abs_diff_eq!(scaled[[1, 0]], 0.0, epsilon = 1e-12);
    }

    #[test]
    fn min_max_scaling_maps_each_column_to_unit_interval() {
        let data = array![[0.0, 5.0], [2.0, 5.0], [4.0, 5.0]];
        let scaled = Scaling::MinMax.apply(&data.view());
        assert_abs_diff_eq!(scaled[[0, 0]], 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(scaled[[1, 0]], 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(scaled[[2, 0]], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(scaled[[1, 1]], 0.0, epsilon = 1e-12);
    }

    #[test]
    fn custom_scaler_is_dispatched() {
        struct Doubler;
        impl Scaler for Doubler {
            fn scale(&self, data: &ArrayView2<'_, f64>) -> Array2<f64> {
                data.mapv(|v| 2.0 * v)
            }
        }
        let data = array![[1.0], [2.0]];
        let scaled = Scaling::Custom(Box::new(Doubler)).apply(&data.view());
        assert_abs_diff_eq!(scaled[[1, 0]], 4.0, epsilon = 1e-12);
    }
}
