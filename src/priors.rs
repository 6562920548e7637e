//! Log-priors over the coordinate subset governed by one update.

use crate::distributions::Normalized;
use crate::error::{McmcError, Result};

/// A (possibly improper) log-prior over a parameter sub-vector.
pub trait Prior {
    /// Returns the log-prior of `theta`. `-inf` marks an infeasible point.
    fn log_prior(&self, theta: &[f64]) -> f64;

    /// Number of coordinates the prior is defined on, `None` if it accepts any length.
    fn dim(&self) -> Option<usize> {
        None
    }
}

/// The flat improper prior.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImproperPrior;

impl Prior for ImproperPrior {
    fn log_prior(&self, _theta: &[f64]) -> f64 {
        0.0
    }
}

/// The improper prior `1/θ` on every coordinate, for strictly positive parameters.
///
/// Positivity is a hard constraint: any `θᵢ <= 0` gives `-inf`, so the update resamples.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImproperPosPrior;

impl Prior for ImproperPosPrior {
    fn log_prior(&self, theta: &[f64]) -> f64 {
        theta
            .iter()
            .map(|&x| if x > 0.0 { -x.ln() } else { f64::NEG_INFINITY })
            .sum()
    }
}

/// Any normalized density used as a prior.
#[derive(Debug, Clone)]
pub struct DistributionPrior<D> {
    pub dist: D,
}

impl<D: Normalized> DistributionPrior<D> {
    pub fn new(dist: D) -> Self {
        Self { dist }
    }
}

impl<D: Normalized> Prior for DistributionPrior<D> {
    fn log_prior(&self, theta: &[f64]) -> f64 {
        self.dist.log_prob(theta)
    }

    fn dim(&self) -> Option<usize> {
        self.dist.dim()
    }
}

/**
A product of independent priors over disjoint groups of positions.

Positions refer to the sub-vector the update governs, not to global coordinates.

# Examples

```rust
use mcmc_updates::distributions::Exponential;
use mcmc_updates::priors::{DistributionPrior, ImproperPrior, Prior, ProductPrior};

let prior = ProductPrior::new(
    3,
    vec![
        (vec![0, 2], Box::new(ImproperPrior) as Box<dyn Prior>),
        (vec![1], Box::new(DistributionPrior::new(Exponential::new(1.0).unwrap()))),
    ],
)
.unwrap();
assert_eq!(prior.log_prior(&[5.0, 0.0, -3.0]), 0.0);
assert_eq!(prior.log_prior(&[5.0, -1.0, -3.0]), f64::NEG_INFINITY);
```
*/
pub struct ProductPrior {
    dim: usize,
    blocks: Vec<(Vec<usize>, Box<dyn Prior>)>,
    buffer_len: usize,
}

impl ProductPrior {
    /// Builds the product over `dim` positions. The groups must partition `0..dim`.
    pub fn new(dim: usize, blocks: Vec<(Vec<usize>, Box<dyn Prior>)>) -> Result<Self> {
        let mut seen = vec![false; dim];
        for (idx, prior) in &blocks {
            if let Some(d) = prior.dim().filter(|&d| d != idx.len()) {
                return Err(McmcError::InvalidPrior(format!(
                    "a prior over {d} coordinates is assigned {} positions",
                    idx.len()
                )));
            }
            for &i in idx {
                if i >= dim {
                    return Err(McmcError::InvalidPrior(format!(
                        "position {i} is out of range for a prior over {dim} coordinates"
                    )));
                }
                if seen[i] {
                    return Err(McmcError::InvalidPrior(format!(
                        "position {i} appears in more than one prior block"
                    )));
                }
                seen[i] = true;
            }
        }
        if let Some(i) = seen.iter().position(|s| !s) {
            return Err(McmcError::InvalidPrior(format!(
                "position {i} is not covered by any prior block"
            )));
        }
        let buffer_len = blocks.iter().map(|(idx, _)| idx.len()).max().unwrap_or(0);
        Ok(Self {
            dim,
            blocks,
            buffer_len,
        })
    }
}

impl Prior for ProductPrior {
    fn log_prior(&self, theta: &[f64]) -> f64 {
        let mut sub = Vec::with_capacity(self.buffer_len);
        let mut total = 0.0;
        for (idx, prior) in &self.blocks {
            sub.clear();
            sub.extend(idx.iter().map(|&i| theta[i]));
            total += prior.log_prior(&sub);
            if total == f64::NEG_INFINITY {
                break;
            }
        }
        total
    }

    fn dim(&self) -> Option<usize> {
        Some(self.dim)
    }
}

impl Prior for Box<dyn Prior> {
    fn log_prior(&self, theta: &[f64]) -> f64 {
        (**self).log_prior(theta)
    }

    fn dim(&self) -> Option<usize> {
        (**self).dim()
    }
}
