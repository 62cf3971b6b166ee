//! Knee detection on a monotonically decreasing curve.
//!
//! Used to pick the number of significant components from the explained
//! variance ratio and the cluster count from an inertia sweep. The position
//! maximizing the perpendicular distance to the chord between the first and
//! the `max_points`-th value is taken as the knee (Satopää et al., 2011).

use ndarray::ArrayView1;

/// Returns the index of the knee of `curve`.
///
/// At most `min(max_points, len - 1)` leading values take part; values are
/// floored at 1e-30 to keep the log transform finite. With `log_space`, both
/// the curve and the chord endpoints live in natural-log space.
pub fn estimate_elbow_position(
    curve: &ArrayView1<'_, f64>,
    log_space: bool,
    max_points: usize,
) -> usize {
    if curve.len() < 2 {
        return 0;
    }
    let limit = max_points.min(curve.len() - 1);
    let adj: Vec<f64> = curve
        .iter()
        .take(limit + 1)
        .map(|&v| {
            let v = v.max(1e-30);
            if log_space {
                v.ln()
            } else {
                v
            }
        })
        .collect();

    let x1 = 0.0;
    let y1 = adj[0];
    let x2 = limit as f64;
    let y2 = adj[limit];
    let denom = ((y2 - y1).powi(2) + (x2 - x1).powi(2)).sqrt();

    let mut best = 0;
    let mut best_distance = f64::NEG_INFINITY;
    for (i, &y0) in adj.iter().enumerate() {
        let x0 = i as f64;
        let numer = ((y2 - y1) * x0 - (x2 - x1) * y0 + x2 * y1 - y2 * x1).abs();
        let mut distance = numer / denom;
        if !distance.is_finite() {
            distance = 0.0;
        }
        if distance > best_distance {
            best_distance = distance;
            best = i;
        }
    }
    best
}
