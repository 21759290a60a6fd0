//! Expectation-maximization fitter for 2-D Gaussian mixtures.

use ndarray::{Array1, Array2, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use raptgen_core::{Error, Result};
use raptgen_store::{LatentPoint, MixtureParams};

use crate::sweep::{MixtureFit, MixtureFitter};

const DIM: usize = 2;

/// Full-covariance EM. The first mean is drawn at random and the rest are
/// picked farthest-point, so repeated trials explore different starts.
#[derive(Debug, Clone)]
pub struct EmFitter {
    pub max_iter: usize,
    /// Convergence threshold on the change of mean log-likelihood.
    pub tol: f64,
    /// Added to covariance diagonals.
    pub reg_covar: f64,
    seed: Option<u64>,
}

impl Default for EmFitter {
    fn default() -> Self {
        Self {
            max_iter: 100,
            tol: 1e-3,
            reg_covar: 1e-6,
            seed: None,
        }
    }
}

impl EmFitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reproducible fits: the seed is mixed with component count and trial.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            seed: Some(seed),
            ..Self::default()
        }
    }

    fn rng(&self, n_components: u32, trial: u32) -> StdRng {
        match self.seed {
            Some(seed) => {
                StdRng::seed_from_u64(seed ^ ((n_components as u64) << 32 | trial as u64))
            }
            None => StdRng::from_entropy(),
        }
    }
}

/// Free parameters of a `k`-component full-covariance mixture in `d` dimensions.
pub fn parameter_count(k: usize, d: usize) -> usize {
    k * d + k * d * (d + 1) / 2 + k - 1
}

type Cov = [[f64; DIM]; DIM];

struct Mixture {
    weights: Array1<f64>,
    means: Array2<f64>,
    covariances: Vec<Cov>,
}

impl Mixture {
    fn init(x: &Array2<f64>, k: usize, rng: &mut StdRng, reg: f64) -> Self {
        let n = x.nrows();
        let mut centers = vec![rng.gen_range(0..n)];
        let mut nearest: Vec<f64> = (0..n).map(|i| sq_dist(x, i, centers[0])).collect();
        while centers.len() < k {
            let next = (0..n)
                .filter(|i| !centers.contains(i))
                .max_by(|a, b| nearest[*a].total_cmp(&nearest[*b]))
                .unwrap_or(0);
            centers.push(next);
            for (i, d) in nearest.iter_mut().enumerate() {
                *d = d.min(sq_dist(x, i, next));
            }
        }

        let mut means = Array2::zeros((k, DIM));
        for (j, &c) in centers.iter().enumerate() {
            means.row_mut(j).assign(&x.row(c));
        }

        let mean = x.mean_axis(Axis(0)).unwrap_or_else(|| Array1::zeros(DIM));
        let mut cov = [[0.0; DIM]; DIM];
        for row in x.rows() {
            for a in 0..DIM {
                for b in 0..DIM {
                    cov[a][b] += (row[a] - mean[a]) * (row[b] - mean[b]) / n as f64;
                }
            }
        }
        for (a, row) in cov.iter_mut().enumerate() {
            row[a] += reg;
        }

        Self {
            weights: Array1::from_elem(k, 1.0 / k as f64),
            means,
            covariances: vec![cov; k],
        }
    }

    /// Responsibilities and mean log-likelihood.
    fn expectation(&self, x: &Array2<f64>) -> Result<(Array2<f64>, f64)> {
        let (n, k) = (x.nrows(), self.weights.len());
        let mut log_resp = Array2::zeros((n, k));
        for j in 0..k {
            let (inv, log_det) = invert(&self.covariances[j])?;
            let log_weight = self.weights[j].ln();
            for i in 0..n {
                let dx = [x[[i, 0]] - self.means[[j, 0]], x[[i, 1]] - self.means[[j, 1]]];
                let maha = dx[0] * (inv[0][0] * dx[0] + inv[0][1] * dx[1])
                    + dx[1] * (inv[1][0] * dx[0] + inv[1][1] * dx[1]);
                log_resp[[i, j]] = log_weight
                    - 0.5 * (DIM as f64 * (2.0 * std::f64::consts::PI).ln() + log_det + maha);
            }
        }

        let mut total = 0.0;
        for mut row in log_resp.rows_mut() {
            let max = row.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            let lse = max + row.iter().map(|v| (v - max).exp()).sum::<f64>().ln();
            if !lse.is_finite() {
                return Err(Error::Compute("log-likelihood is not finite".into()));
            }
            total += lse;
            row.mapv_inplace(|v| (v - lse).exp());
        }
        Ok((log_resp, total / n as f64))
    }

    fn maximize(x: &Array2<f64>, resp: &Array2<f64>, reg: f64) -> Self {
        let n = x.nrows();
        let nk = resp.sum_axis(Axis(0)) + 10.0 * f64::EPSILON;
        let mut means = resp.t().dot(x);
        for (j, mut row) in means.rows_mut().into_iter().enumerate() {
            row /= nk[j];
        }

        let covariances = (0..resp.ncols())
            .map(|j| {
                let mut cov = [[0.0; DIM]; DIM];
                for i in 0..n {
                    let dx = [x[[i, 0]] - means[[j, 0]], x[[i, 1]] - means[[j, 1]]];
                    for a in 0..DIM {
                        for b in 0..DIM {
                            cov[a][b] += resp[[i, j]] * dx[a] * dx[b];
                        }
                    }
                }
                for (a, row) in cov.iter_mut().enumerate() {
                    for v in row.iter_mut() {
                        *v /= nk[j];
                    }
                    row[a] += reg;
                }
                cov
            })
            .collect();

        Self {
            weights: &nk / n as f64,
            means,
            covariances,
        }
    }

    fn into_params(self) -> MixtureParams {
        MixtureParams {
            weights: self.weights.to_vec(),
            means: self.means.rows().into_iter().map(|r| r.to_vec()).collect(),
            covariances: self
                .covariances
                .iter()
                .map(|c| c.iter().map(|r| r.to_vec()).collect())
                .collect(),
        }
    }
}

fn sq_dist(x: &Array2<f64>, a: usize, b: usize) -> f64 {
    (0..DIM).map(|d| (x[[a, d]] - x[[b, d]]).powi(2)).sum()
}

/// Inverse and log-determinant of a 2x2 covariance.
fn invert(c: &Cov) -> Result<(Cov, f64)> {
    let det = c[0][0] * c[1][1] - c[0][1] * c[1][0];
    if !(det > 0.0) || !det.is_finite() {
        return Err(Error::Compute(format!("degenerate covariance (det={})", det)));
    }
    let inv = [
        [c[1][1] / det, -c[0][1] / det],
        [-c[1][0] / det, c[0][0] / det],
    ];
    Ok((inv, det.ln()))
}

impl MixtureFitter for EmFitter {
    fn fit(&self, points: &[LatentPoint], n_components: u32, trial: u32) -> Result<MixtureFit> {
        let (n, k) = (points.len(), n_components as usize);
        if k == 0 || n < k {
            return Err(Error::Compute(format!(
                "cannot fit {} components to {} points",
                k, n
            )));
        }

        let x = Array2::from_shape_fn((n, DIM), |(i, d)| {
            if d == 0 {
                points[i].coord_x
            } else {
                points[i].coord_y
            }
        });

        let mut rng = self.rng(n_components, trial);
        let mut model = Mixture::init(&x, k, &mut rng, self.reg_covar);
        let mut previous = f64::NEG_INFINITY;
        for _ in 0..self.max_iter {
            let (resp, mean_ll) = model.expectation(&x)?;
            model = Mixture::maximize(&x, &resp, self.reg_covar);
            if (mean_ll - previous).abs() < self.tol {
                break;
            }
            previous = mean_ll;
        }

        let (_, mean_ll) = model.expectation(&x)?;
        let log_likelihood = mean_ll * n as f64;
        let bic = -2.0 * log_likelihood + parameter_count(k, DIM) as f64 * (n as f64).ln();

        Ok(MixtureFit {
            params: model.into_params(),
            bic,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_clusters() -> Vec<LatentPoint> {
        let offsets = [(-0.3, 0.1), (0.2, -0.2), (0.1, 0.3), (-0.1, -0.1), (0.25, 0.05)];
        let mut points = Vec::new();
        for (cx, cy) in [(0.0, 0.0), (8.0, 8.0)] {
            for (i, (dx, dy)) in offsets.iter().enumerate() {
                for scale in [1.0, 2.0] {
                    points.push(LatentPoint {
                        seq_id: points.len() as u32,
                        coord_x: cx + dx * scale + i as f64 * 0.01,
                        coord_y: cy + dy * scale,
                    });
                }
            }
        }
        points
    }

    #[test]
    fn test_parameter_count() {
        assert_eq!(parameter_count(1, 2), 5);
        assert_eq!(parameter_count(3, 2), 17);
    }

    #[test]
    fn test_two_clusters_prefer_two_components() {
        let fitter = EmFitter::with_seed(7);
        let points = two_clusters();
        let one = fitter.fit(&points, 1, 0).unwrap();
        let two = fitter.fit(&points, 2, 0).unwrap();
        assert!(two.bic < one.bic, "k=2 {} vs k=1 {}", two.bic, one.bic);

        let weights: f64 = two.params.weights.iter().sum();
        assert!((weights - 1.0).abs() < 1e-9);
        assert!(two.params.weights.iter().all(|w| (w - 0.5).abs() < 1e-6));

        let mut xs: Vec<f64> = two.params.means.iter().map(|m| m[0]).collect();
        xs.sort_by(f64::total_cmp);
        assert!(xs[0].abs() < 0.5);
        assert!((xs[1] - 8.0).abs() < 0.5);
    }

    #[test]
    fn test_single_component_is_sample_moments() {
        let points = two_clusters();
        let fit = EmFitter::with_seed(1).fit(&points, 1, 0).unwrap();
        let mean_x = points.iter().map(|p| p.coord_x).sum::<f64>() / points.len() as f64;
        assert!((fit.params.means[0][0] - mean_x).abs() < 1e-9);
        assert_eq!(fit.params.covariances[0].len(), 2);
        assert!(fit.bic.is_finite());
    }

    #[test]
    fn test_seeded_fits_are_reproducible() {
        let points = two_clusters();
        let a = EmFitter::with_seed(3).fit(&points, 3, 1).unwrap();
        let b = EmFitter::with_seed(3).fit(&points, 3, 1).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_too_few_points() {
        let points = &two_clusters()[..2];
        assert!(matches!(
            EmFitter::new().fit(points, 3, 0),
            Err(Error::Compute(_))
        ));
    }
}
