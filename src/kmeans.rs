//! K-means clustering with k-means++ seeding and restart selection.

use log::debug;
use ndarray::{Array2, ArrayView2, Axis};
use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::error::{MvaError, Result};

pub struct KMeans {
    n_clusters: usize,
    max_iter: usize,
    tolerance: f64,
    n_init: usize,
    seed: Option<u64>,
    centroids: Option<Array2<f64>>,
    labels: Option<Vec<usize>>,
    inertia: f64,
}

impl KMeans {
    pub fn new(n_clusters: usize) -> Self {
        KMeans {
            n_clusters,
            max_iter: 300,
            tolerance: 1e-4,
            n_init: 10,
            seed: None,
            centroids: None,
            labels: None,
            inertia: f64::INFINITY,
        }
    }

    pub fn with_max_iter(mut self, max_iter: usize) -> Self {
        self.max_iter = max_iter;
        self
    }

    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn with_n_init(mut self, n_init: usize) -> Self {
        self.n_init = n_init.max(1);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Runs `n_init` restarts and keeps the assignment with the lowest
    /// inertia (sum of squared distances to the nearest centroid).
    pub fn fit(&mut self, data: &ArrayView2<'_, f64>) -> Result<()> {
        let n = data.nrows();
        if self.n_clusters == 0 || self.n_clusters > n {
            return Err(MvaError::Validation(format!(
                "cannot form {} clusters from {} samples",
                self.n_clusters, n
            )));
        }

        let base_seed = self.seed.unwrap_or_else(rand::random);
        for run in 0..self.n_init {
            let mut rng = ChaCha8Rng::seed_from_u64(base_seed.wrapping_add(run as u64));
            let (centroids, labels, inertia) = self.single_run(data, &mut rng)?;
            debug!("k-means restart {run}: inertia {inertia:.6e}");
            if inertia < self.inertia {
                self.inertia = inertia;
                self.centroids = Some(centroids);
                self.labels = Some(labels);
            }
        }
        Ok(())
    }

    fn single_run(
        &self,
        data: &ArrayView2<'_, f64>,
        rng: &mut ChaCha8Rng,
    ) -> Result<(Array2<f64>, Vec<usize>, f64)> {
        let n = data.nrows();
        let k = self.n_clusters;
        let mut centroids = self.plus_plus_init(data, rng)?;
        let mut labels = vec![0usize; n];

        for _ in 0..self.max_iter {
            for (i, row) in data.axis_iter(Axis(0)).enumerate() {
                let mut best = 0;
                let mut best_dist = f64::INFINITY;
                for (c, centroid) in centroids.axis_iter(Axis(0)).enumerate() {
                    let d = sq_dist(&row, &centroid);
                    if d < best_dist {
                        best_dist = d;
                        best = c;
                    }
                }
                labels[i] = best;
            }

            let mut sums = Array2::<f64>::zeros(centroids.raw_dim());
            let mut counts = vec![0usize; k];
            for (i, row) in data.axis_iter(Axis(0)).enumerate() {
                let mut target = sums.row_mut(labels[i]);
                target += &row;
                counts[labels[i]] += 1;
            }
            let mut shift = 0.0f64;
            for c in 0..k {
                if counts[c] == 0 {
                    // Reseed an emptied cluster at the sample farthest from
                    // its assigned centroid.
                    let far = farthest_sample(data, &centroids, &labels);
                    sums.row_mut(c).assign(&data.row(far));
                    counts[c] = 1;
                }
                let new_centroid = sums.row(c).mapv(|v| v / counts[c] as f64);
                shift = shift.max(sq_dist(&new_centroid.view(), &centroids.row(c)));
                centroids.row_mut(c).assign(&new_centroid);
            }
            if shift.sqrt() < self.tolerance {
                break;
            }
        }

        let mut inertia = 0.0;
        for (i, row) in data.axis_iter(Axis(0)).enumerate() {
            inertia += sq_dist(&row, &centroids.row(labels[i]));
        }
        Ok((centroids, labels, inertia))
    }

    /// k-means++: each next centre is drawn with probability proportional to
    /// its squared distance from the closest centre chosen so far.
    fn plus_plus_init(
        &self,
        data: &ArrayView2<'_, f64>,
        rng: &mut ChaCha8Rng,
    ) -> Result<Array2<f64>> {
        let n = data.nrows();
        let k = self.n_clusters;
        let mut centroids = Array2::zeros((k, data.ncols()));
        let first = rng.gen_range(0..n);
        centroids.row_mut(0).assign(&data.row(first));

        let mut min_sq = vec![f64::INFINITY; n];
        for c in 1..k {
            let last = centroids.row(c - 1);
            for (i, row) in data.axis_iter(Axis(0)).enumerate() {
                min_sq[i] = min_sq[i].min(sq_dist(&row, &last));
            }
            let total: f64 = min_sq.iter().sum();
            let next = if total > 0.0 {
                let weighted = WeightedIndex::new(&min_sq).map_err(|e| {
                    MvaError::Validation(format!("k-means++ weighting failed: {e}"))
                })?;
                weighted.sample(rng)
            } else {
                rng.gen_range(0..n)
            };
            centroids.row_mut(c).assign(&data.row(next));
        }
        Ok(centroids)
    }

    pub fn labels(&self) -> Option<&[usize]> {
        self.labels.as_deref()
    }

    pub fn centroids(&self) -> Option<&Array2<f64>> {
        self.centroids.as_ref()
    }

    pub fn inertia(&self) -> f64 {
        self.inertia
    }
}

fn sq_dist(a: &ndarray::ArrayView1<'_, f64>, b: &ndarray::ArrayView1<'_, f64>) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum()
}

fn farthest_sample(
    data: &ArrayView2<'_, f64>,
    centroids: &Array2<f64>,
    labels: &[usize],
) -> usize {
    let mut best = 0;
    let mut best_dist = f64::NEG_INFINITY;
    for (i, row) in data.axis_iter(Axis(0)).enumerate() {
        let d = sq_dist(&row, &centroids.row(labels[i]));
        if d > best_dist {
            best_dist = d;
            best = i;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;
    use ndarray_rand::RandomExt;
    use rand_distr::Normal;

    fn two_blobs(seed: u64) -> (Array2<f64>, Vec<usize>) {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let a = Array2::random_using((40, 2), Normal::new(0.0, 0.3).unwrap(), &mut rng);
        let b = Array2::random_using((40, 2), Normal::new(8.0, 0.3).unwrap(), &mut rng);
        let mut data = Array2::zeros((80, 2));
        data.slice_mut(ndarray::s![..40, ..]).assign(&a);
        data.slice_mut(ndarray::s![40.., ..]).assign(&b);
        let truth = (0..80).map(|i| usize::from(i >= 40)).collect();
        (data, truth)
    }

    #[test]
    fn recovers_two_separated_blobs() {
        let (data, truth) = two_blobs(51);
        let mut km = KMeans::new(2).with_seed(9);
        km.fit(&data.view()).unwrap();
        let labels = km.labels().unwrap();
        // Same partition up to label permutation.
        let flips = labels
            .iter()
            .zip(truth.iter())
            .filter(|(a, b)| a != b)
            .count();
        assert!(flips == 0 || flips == 80, "mixed partition: {flips} flips");
        assert!(km.inertia().is_finite());
    }

    #[test]
    fn same_seed_is_deterministic() {
        let (data, _) = two_blobs(52);
        let mut a = KMeans::new(3).with_seed(4);
        let mut b = KMeans::new(3).with_seed(4);
        a.fit(&data.view()).unwrap();
        b.fit(&data.view()).unwrap();
        assert_eq!(a.labels().unwrap(), b.labels().unwrap());
    }

    #[test]
    fn too_many_clusters_is_rejected() {
        let data = Array2::<f64>::zeros((3, 2));
        let mut km = KMeans::new(5);
        assert!(km.fit(&data.view()).is_err());
        assert!(KMeans::new(0).fit(&data.view()).is_err());
    }

    #[test]
    fn singleton_clusters_are_allowed() {
        let data = ndarray::array![[0.0, 0.0], [10.0, 10.0], [20.0, 0.0]];
        let mut km = KMeans::new(3).with_seed(1);
        km.fit(&data.view()).unwrap();
        let labels = km.labels().unwrap();
        let mut sorted = labels.to_vec();
        sorted.sort_unstable();
        assert_eq!(sorted, vec![0, 1, 2]);
    }
}
