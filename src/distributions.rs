/*!
Densities, target laws and the data bundle handed to a run.

Two kinds of things live here:

- normalized densities ([`Normalized`]) used as building blocks for priors, such as the
  multivariate [`Gaussian`] and the iid univariate [`Normal`], [`LogNormal`], [`Exponential`]
  and [`UniformInterval`];
- the [`TargetLaw`] contract through which the sampler pushes parameters into a likelihood
  model and evaluates it against observations, together with a ready-made [`GaussianLaw`].

# Examples

```rust
use mcmc_updates::distributions::{Data, GaussianLaw, Normalized, Normal, TargetLaw};
use nalgebra::DMatrix;

let normal = Normal::new(0.0, 1.0).unwrap();
let lp = normal.log_prob(&[0.5, -0.5]);
assert!(lp < 0.0);

let cov = DMatrix::from_row_slice(2, 2, &[1.0, 0.5, 0.5, 1.0]);
let mut law = GaussianLaw::new(vec![0.0, 0.0], cov).unwrap();
law.set_parameters(&[1], &[2.0]);
let data = Data::new(law, vec![vec![0.1, 1.9], vec![-0.2, 2.3]]);
let ll = data.law.log_likelihood(&data.observations).unwrap();
assert!(ll.is_finite());
```
*/

use nalgebra as na;
use rand::Rng;
use rand_distr::StandardNormal;
use std::f64::consts::PI;

use crate::error::{McmcError, Result};

/// A distribution with a fully normalized log-density, evaluated on a whole parameter slice.
pub trait Normalized {
    /// Returns the normalized log-density of `theta`, `-inf` outside the support.
    fn log_prob(&self, theta: &[f64]) -> f64;

    /// Fixed dimension of the density, `None` for coordinate-wise densities of any length.
    fn dim(&self) -> Option<usize> {
        None
    }
}

/// The model whose parameters the chain explores.
///
/// A run keeps two instances of the law: one mirrors the accepted state, the other receives
/// proposals. Implementations should only touch their own parameters in `set_parameters`.
pub trait TargetLaw: Clone {
    type Observations;

    /// Overwrites the parameters at the global coordinates `coords` with `values`.
    fn set_parameters(&mut self, coords: &[usize], values: &[f64]);

    /// Log-likelihood of `observations` under the current parameters.
    fn log_likelihood(&self, observations: &Self::Observations) -> Result<f64>;

    /// Number of independent likelihood blocks. Factorized models return more than one.
    fn num_blocks(&self) -> usize {
        1
    }

    /// Per-block log-likelihoods. Single-block laws get this for free.
    fn log_likelihood_blocks(&self, observations: &Self::Observations) -> Result<Vec<f64>> {
        if self.num_blocks() == 1 {
            Ok(vec![self.log_likelihood(observations)?])
        } else {
            Err(McmcError::NotImplemented("TargetLaw::log_likelihood_blocks"))
        }
    }
}

/// Observations together with the law that explains them.
#[derive(Debug, Clone)]
pub struct Data<L: TargetLaw> {
    pub law: L,
    pub observations: L::Observations,
}

impl<L: TargetLaw> Data<L> {
    pub fn new(law: L, observations: L::Observations) -> Self {
        Self { law, observations }
    }
}

/// Cholesky factor of a covariance matrix together with its log-normalizing constant.
#[derive(Debug, Clone)]
pub(crate) struct CovFactor {
    pub(crate) cov: na::DMatrix<f64>,
    l: na::DMatrix<f64>,
    log_norm: f64,
}

impl CovFactor {
    /// Returns `None` unless `cov` is square and positive definite.
    pub(crate) fn new(cov: na::DMatrix<f64>) -> Option<Self> {
        if !cov.is_square() || cov.nrows() == 0 {
            return None;
        }
        let l = na::Cholesky::new(cov.clone())?.l();
        let d = cov.nrows() as f64;
        let log_det = 2.0 * l.diagonal().iter().map(|x| x.ln()).sum::<f64>();
        let log_norm = -0.5 * (d * (2.0 * PI).ln() + log_det);
        Some(Self { cov, l, log_norm })
    }

    pub(crate) fn dim(&self) -> usize {
        self.cov.nrows()
    }

    /// Normalized log-density of a zero-mean normal at `diff`.
    pub(crate) fn log_density(&self, diff: &[f64]) -> f64 {
        let v = na::DVector::from_column_slice(diff);
        match self.l.solve_lower_triangular(&v) {
            Some(z) => self.log_norm - 0.5 * z.norm_squared(),
            None => f64::NEG_INFINITY,
        }
    }

    /// Draws zero-mean correlated noise into `out`.
    pub(crate) fn draw<R: Rng + ?Sized>(&self, rng: &mut R, out: &mut [f64]) {
        let z: na::DVector<f64> =
            na::DVector::from_iterator(self.dim(), (0..self.dim()).map(|_| rng.sample(StandardNormal)));
        let noise = &self.l * z;
        out.copy_from_slice(noise.as_slice());
    }
}

/**
A multivariate Gaussian with full covariance.

# Examples

```rust
use mcmc_updates::distributions::{Gaussian, Normalized};
use nalgebra::DMatrix;

let gauss = Gaussian::new(vec![0.0, 0.0], DMatrix::identity(2, 2)).unwrap();
let lp = gauss.log_prob(&[0.0, 0.0]);
assert!((lp + (2.0 * std::f64::consts::PI).ln()).abs() < 1e-12);
```
*/
#[derive(Debug, Clone)]
pub struct Gaussian {
    pub mean: Vec<f64>,
    factor: CovFactor,
}

impl Gaussian {
    pub fn new(mean: Vec<f64>, cov: na::DMatrix<f64>) -> Result<Self> {
        let factor = CovFactor::new(cov).ok_or_else(|| {
            McmcError::InvalidPrior("Gaussian covariance must be square and positive definite".into())
        })?;
        if factor.dim() != mean.len() {
            return Err(McmcError::InvalidPrior(format!(
                "Gaussian mean has length {} but covariance is {}x{}",
                mean.len(),
                factor.dim(),
                factor.dim()
            )));
        }
        Ok(Self { mean, factor })
    }

    pub fn cov(&self) -> &na::DMatrix<f64> {
        &self.factor.cov
    }
}

impl Normalized for Gaussian {
    fn log_prob(&self, theta: &[f64]) -> f64 {
        let diff: Vec<f64> = theta.iter().zip(&self.mean).map(|(x, m)| x - m).collect();
        self.factor.log_density(&diff)
    }

    fn dim(&self) -> Option<usize> {
        Some(self.mean.len())
    }
}

/// Independent normals with a shared mean and standard deviation, one per coordinate.
#[derive(Debug, Clone, Copy)]
pub struct Normal {
    pub mean: f64,
    pub std: f64,
}

impl Normal {
    pub fn new(mean: f64, std: f64) -> Result<Self> {
        if !(std > 0.0) {
            return Err(McmcError::InvalidPrior(format!(
                "Normal std must be positive, got {std}"
            )));
        }
        Ok(Self { mean, std })
    }
}

impl Normalized for Normal {
    fn log_prob(&self, theta: &[f64]) -> f64 {
        let log_norm = -0.5 * (2.0 * PI).ln() - self.std.ln();
        theta
            .iter()
            .map(|x| {
                let z = (x - self.mean) / self.std;
                log_norm - 0.5 * z * z
            })
            .sum()
    }
}

/// Independent log-normals, handy for scale parameters.
#[derive(Debug, Clone, Copy)]
pub struct LogNormal {
    pub mu: f64,
    pub sigma: f64,
}

impl LogNormal {
    pub fn new(mu: f64, sigma: f64) -> Result<Self> {
        if !(sigma > 0.0) {
            return Err(McmcError::InvalidPrior(format!(
                "LogNormal sigma must be positive, got {sigma}"
            )));
        }
        Ok(Self { mu, sigma })
    }
}

impl Normalized for LogNormal {
    fn log_prob(&self, theta: &[f64]) -> f64 {
        let log_norm = -0.5 * (2.0 * PI).ln() - self.sigma.ln();
        theta
            .iter()
            .map(|&x| {
                if x <= 0.0 {
                    return f64::NEG_INFINITY;
                }
                let z = (x.ln() - self.mu) / self.sigma;
                log_norm - x.ln() - 0.5 * z * z
            })
            .sum()
    }
}

/// Independent exponentials with rate `rate`.
#[derive(Debug, Clone, Copy)]
pub struct Exponential {
    pub rate: f64,
}

impl Exponential {
    pub fn new(rate: f64) -> Result<Self> {
        if !(rate > 0.0) {
            return Err(McmcError::InvalidPrior(format!(
                "Exponential rate must be positive, got {rate}"
            )));
        }
        Ok(Self { rate })
    }
}

impl Normalized for Exponential {
    fn log_prob(&self, theta: &[f64]) -> f64 {
        theta
            .iter()
            .map(|&x| {
                if x < 0.0 {
                    f64::NEG_INFINITY
                } else {
                    self.rate.ln() - self.rate * x
                }
            })
            .sum()
    }
}

/// Independent uniforms on `[low, high]`.
#[derive(Debug, Clone, Copy)]
pub struct UniformInterval {
    pub low: f64,
    pub high: f64,
}

impl UniformInterval {
    pub fn new(low: f64, high: f64) -> Result<Self> {
        if !(low < high) {
            return Err(McmcError::InvalidPrior(format!(
                "UniformInterval needs low < high, got [{low}, {high}]"
            )));
        }
        Ok(Self { low, high })
    }
}

impl Normalized for UniformInterval {
    fn log_prob(&self, theta: &[f64]) -> f64 {
        let log_p = -(self.high - self.low).ln();
        theta
            .iter()
            .map(|x| {
                if (self.low..=self.high).contains(x) {
                    log_p
                } else {
                    f64::NEG_INFINITY
                }
            })
            .sum()
    }
}

/**
Multivariate normal observations with unknown mean and known covariance.

The parameter vector is the mean. Each observation is one draw of the full vector, so the
log-likelihood is the sum of the Gaussian log-densities of all observations.
*/
#[derive(Debug, Clone)]
pub struct GaussianLaw {
    pub mean: Vec<f64>,
    factor: CovFactor,
}

impl GaussianLaw {
    pub fn new(mean: Vec<f64>, cov: na::DMatrix<f64>) -> Result<Self> {
        let factor = CovFactor::new(cov).ok_or_else(|| {
            McmcError::Law("GaussianLaw covariance must be square and positive definite".into())
        })?;
        if factor.dim() != mean.len() {
            return Err(McmcError::Law(format!(
                "GaussianLaw mean has length {} but covariance is {}x{}",
                mean.len(),
                factor.dim(),
                factor.dim()
            )));
        }
        Ok(Self { mean, factor })
    }

    /// Draws `n` observations from the law at its current mean.
    pub fn simulate<R: Rng + ?Sized>(&self, rng: &mut R, n: usize) -> Vec<Vec<f64>> {
        let mut noise = vec![0.0; self.mean.len()];
        (0..n)
            .map(|_| {
                self.factor.draw(rng, &mut noise);
                noise.iter().zip(&self.mean).map(|(e, m)| e + m).collect()
            })
            .collect()
    }
}

impl TargetLaw for GaussianLaw {
    type Observations = Vec<Vec<f64>>;

    fn set_parameters(&mut self, coords: &[usize], values: &[f64]) {
        for (&c, &v) in coords.iter().zip(values) {
            self.mean[c] = v;
        }
    }

    fn log_likelihood(&self, observations: &Self::Observations) -> Result<f64> {
        let mut diff = vec![0.0; self.mean.len()];
        let mut ll = 0.0;
        for y in observations {
            if y.len() != self.mean.len() {
                return Err(McmcError::Law(format!(
                    "observation has length {} but the law has dimension {}",
                    y.len(),
                    self.mean.len()
                )));
            }
            diff.iter_mut()
                .zip(y.iter().zip(&self.mean))
                .for_each(|(d, (y, m))| *d = y - m);
            ll += self.factor.log_density(&diff);
        }
        Ok(ll)
    }
}

#[cfg(test)]
mod distributions_tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn gaussian_log_prob_matches_closed_form_2d() {
        let cov = na::DMatrix::from_row_slice(2, 2, &[4.0, 2.0, 2.0, 3.0]);
        let gauss = Gaussian::new(vec![0.0, 1.0], cov).unwrap();
        // det = 8, inverse = [[3, -2], [-2, 4]] / 8
        let (x, y) = (0.5, -0.5);
        let (dx, dy) = (x - 0.0, y - 1.0);
        let quad = (3.0 * dx * dx - 4.0 * dx * dy + 4.0 * dy * dy) / 8.0;
        let expected = -(2.0 * PI).ln() - 0.5 * 8.0_f64.ln() - 0.5 * quad;
        assert_abs_diff_eq!(gauss.log_prob(&[x, y]), expected, epsilon = 1e-12);
    }

    #[test]
    fn gaussian_rejects_non_square_covariance() {
        let cov = na::DMatrix::from_row_slice(1, 2, &[1.0, 0.0]);
        assert!(Gaussian::new(vec![0.0], cov).is_err());
    }

    #[test]
    fn normal_standard_density() {
        let normal = Normal::new(0.0, 1.0).unwrap();
        let p = normal.log_prob(&[1.0]).exp();
        assert_abs_diff_eq!(p, 0.24197072451914337, epsilon = 1e-12);
    }

    #[test]
    fn lognormal_and_exponential_outside_support() {
        let ln = LogNormal::new(0.0, 1.0).unwrap();
        assert_eq!(ln.log_prob(&[-1.0]), f64::NEG_INFINITY);
        let exp = Exponential::new(2.0).unwrap();
        assert_eq!(exp.log_prob(&[-0.1]), f64::NEG_INFINITY);
        assert_abs_diff_eq!(exp.log_prob(&[0.5]), 2.0_f64.ln() - 1.0, epsilon = 1e-12);
    }

    #[test]
    fn uniform_interval_density() {
        let u = UniformInterval::new(-1.0, 3.0).unwrap();
        assert_abs_diff_eq!(u.log_prob(&[0.0, 2.0]), -2.0 * 4.0_f64.ln(), epsilon = 1e-12);
        assert_eq!(u.log_prob(&[3.5]), f64::NEG_INFINITY);
        assert!(UniformInterval::new(1.0, 1.0).is_err());
    }

    #[test]
    fn gaussian_law_likelihood_peaks_at_sample_mean() {
        let cov = na::DMatrix::identity(2, 2);
        let obs = vec![vec![1.0, 2.0], vec![3.0, 0.0]];
        let mut law = GaussianLaw::new(vec![2.0, 1.0], cov).unwrap();
        let at_mean = law.log_likelihood(&obs).unwrap();
        law.set_parameters(&[0], &[2.5]);
        let off_mean = law.log_likelihood(&obs).unwrap();
        assert!(at_mean > off_mean);
        assert_eq!(law.mean, vec![2.5, 1.0]);
    }

    #[test]
    fn gaussian_law_rejects_wrong_observation_length() {
        let law = GaussianLaw::new(vec![0.0, 0.0], na::DMatrix::identity(2, 2)).unwrap();
        let res = law.log_likelihood(&vec![vec![1.0]]);
        assert!(matches!(res, Err(McmcError::Law(_))));
    }

    #[derive(Clone)]
    struct TwoBlocks;

    impl TargetLaw for TwoBlocks {
        type Observations = ();
        fn set_parameters(&mut self, _coords: &[usize], _values: &[f64]) {}
        fn log_likelihood(&self, _observations: &()) -> Result<f64> {
            Ok(0.0)
        }
        fn num_blocks(&self) -> usize {
            2
        }
    }

    #[test]
    fn factorized_law_without_blocks_is_not_implemented() {
        let res = TwoBlocks.log_likelihood_blocks(&());
        assert!(matches!(res, Err(McmcError::NotImplemented(_))));
    }
}
