//! Sigma points of the unscented transformation.
//!
//! Every step perturbs the observations and pseudo-observations by multiples of
//! their standard deviations. The network is solved once per step and the
//! solutions are folded into a weighted mean and an empirical covariance that
//! replaces the linearized cofactor matrix.

use nalgebra::{DMatrix, DVector};

use crate::config::{EstimationType, UnscentedConfig};
use crate::error::{AdjustError, AdjustResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scheme {
    Modified,
    SphericalSimplex,
}

#[derive(Debug, Clone)]
pub struct UnscentedTransformation {
    scheme: Scheme,
    /// Number of perturbed quantities.
    n: usize,
    alpha: f64,
    beta: f64,
    weight_zero: f64,
    solutions: Vec<Option<DVector<f64>>>,
}

impl UnscentedTransformation {
    pub fn new(kind: EstimationType, config: &UnscentedConfig, n: usize) -> AdjustResult<Self> {
        let scheme = match kind {
            EstimationType::ModifiedUnscentedTransformation => Scheme::Modified,
            EstimationType::SphericalSimplexUnscentedTransformation => Scheme::SphericalSimplex,
            other => {
                return Err(AdjustError::InvalidArgument(format!(
                    "{other:?} is not an unscented transformation"
                )))
            }
        };
        if !(0.0..1.0).contains(&config.weight_zero) {
            return Err(AdjustError::InvalidArgument(format!(
                "weight of the central sigma point must lie in [0, 1), got {}",
                config.weight_zero
            )));
        }
        if !(config.alpha > 0.0) {
            return Err(AdjustError::InvalidArgument(format!(
                "scaling parameter alpha must be positive, got {}",
                config.alpha
            )));
        }
        let steps = match scheme {
            Scheme::Modified => 2 * n + 1,
            Scheme::SphericalSimplex => n + 2,
        };
        Ok(Self {
            scheme,
            n,
            alpha: config.alpha,
            beta: config.beta,
            weight_zero: config.weight_zero,
            solutions: vec![None; steps],
        })
    }

    /// Number of sigma points; the last one is the central point.
    pub fn steps(&self) -> usize {
        self.solutions.len()
    }

    pub fn is_central(&self, step: usize) -> bool {
        step + 1 == self.steps()
    }

    /// Mean weight of a non-central sigma point.
    fn weight(&self) -> f64 {
        (1.0 - self.weight_zero) / (self.steps() - 1).max(1) as f64 / (self.alpha * self.alpha)
    }

    /// Mean weight of the central sigma point.
    fn weight_central(&self) -> f64 {
        let a2 = self.alpha * self.alpha;
        self.weight_zero / a2 + 1.0 - 1.0 / a2
    }

    fn mean_weight(&self, step: usize) -> f64 {
        if self.is_central(step) {
            self.weight_central()
        } else {
            self.weight()
        }
    }

    fn covariance_weight(&self, step: usize) -> f64 {
        if self.is_central(step) {
            self.weight_central() + 1.0 - self.alpha * self.alpha + self.beta
        } else {
            self.weight()
        }
    }

    /// Perturbation of step `step` in units of the standard deviations.
    pub fn perturbation(&self, step: usize) -> DVector<f64> {
        let n = self.n;
        let mut delta = DVector::zeros(n);
        if self.is_central(step) {
            return delta;
        }
        match self.scheme {
            Scheme::Modified => {
                let scale = self.alpha * (n as f64 / (1.0 - self.weight_zero)).sqrt();
                if step < n {
                    delta[step] = scale;
                } else {
                    delta[step - n] = -scale;
                }
            }
            Scheme::SphericalSimplex => {
                let w = self.weight();
                for j in 0..n {
                    let k = (1 + j) as f64;
                    let norm = (k * (k + 1.0) * w).sqrt();
                    delta[j] = if j + 1 == step {
                        k / norm
                    } else if j >= step {
                        -1.0 / norm
                    } else {
                        0.0
                    };
                }
            }
        }
        delta
    }

    pub fn add_solution(&mut self, step: usize, x: DVector<f64>) {
        if let Some(slot) = self.solutions.get_mut(step) {
            *slot = Some(x);
        }
    }

    /// Weighted mean and empirical covariance of the collected solutions.
    /// `None` until every step has been solved.
    pub fn finish(&self) -> Option<(DVector<f64>, DMatrix<f64>)> {
        let solutions: Vec<&DVector<f64>> = self.solutions.iter().map(Option::as_ref).collect::<Option<_>>()?;
        let size = solutions.first()?.len();
        let mut mean = DVector::zeros(size);
        for (step, x) in solutions.iter().enumerate() {
            mean += *x * self.mean_weight(step);
        }
        let mut covariance = DMatrix::zeros(size, size);
        for (step, x) in solutions.iter().enumerate() {
            let d = *x - &mean;
            covariance += &d * d.transpose() * self.covariance_weight(step);
        }
        Some((mean, covariance))
    }
}
