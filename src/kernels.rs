/*!
Random-walk transition kernels.

Every kernel can restrict some coordinates to the positive half-line. Restricted coordinates
move additively on the log scale, so a proposal started from a positive value is positive
again, and the transition density picks up the Jacobian of the exponential map.

# Examples

```rust
use mcmc_updates::kernels::{TransitionKernel, UniformRandomWalk};
use rand::rngs::SmallRng;
use rand::SeedableRng;

let kernel = UniformRandomWalk::new(vec![0.5, 0.1], vec![false, true]).unwrap();
let mut rng = SmallRng::seed_from_u64(42);
let proposal = kernel.sample(&mut rng, &[0.0, 2.0]);
assert!((proposal[0]).abs() <= 0.5);
assert!(proposal[1] > 0.0);
```
*/

use nalgebra as na;
use rand::Rng;

use crate::distributions::CovFactor;
use crate::error::{McmcError, Result};

/// A proposal mechanism for Metropolis–Hastings updates.
pub trait TransitionKernel {
    /// Number of coordinates the kernel moves.
    fn dim(&self) -> usize;

    /// Per-coordinate positivity restrictions.
    fn positive(&self) -> &[bool];

    /// Writes a proposal drawn from `q(· | theta)` into `out`.
    fn sample_into<R: Rng + ?Sized>(&self, rng: &mut R, theta: &[f64], out: &mut [f64]);

    /// Draws a fresh proposal from `q(· | theta)`.
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R, theta: &[f64]) -> Vec<f64> {
        let mut out = vec![0.0; theta.len()];
        self.sample_into(rng, theta, &mut out);
        out
    }

    /// Evaluates `log q(to | from)`.
    fn log_transition_density(&self, from: &[f64], to: &[f64]) -> f64;
}

fn log_jacobian(positive: &[bool], to: &[f64]) -> f64 {
    positive
        .iter()
        .zip(to)
        .filter(|(p, _)| **p)
        .map(|(_, x)| -x.ln())
        .sum()
}

/// Uniform steps of half-range `eps`, multiplicative on restricted coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct UniformRandomWalk {
    eps: Vec<f64>,
    positive: Vec<bool>,
}

impl UniformRandomWalk {
    pub fn new(eps: Vec<f64>, positive: Vec<bool>) -> Result<Self> {
        if eps.len() != positive.len() {
            return Err(McmcError::InvalidKernel(format!(
                "got {} half-ranges but {} positivity flags",
                eps.len(),
                positive.len()
            )));
        }
        if eps.is_empty() {
            return Err(McmcError::InvalidKernel(
                "a random walk needs at least one coordinate".into(),
            ));
        }
        check_half_ranges(&eps)?;
        Ok(Self { eps, positive })
    }

    /// The same unrestricted half-range on `dim` coordinates.
    pub fn isotropic(eps: f64, dim: usize) -> Result<Self> {
        Self::new(vec![eps; dim], vec![false; dim])
    }

    pub fn eps(&self) -> &[f64] {
        &self.eps
    }

    pub fn set_eps(&mut self, eps: Vec<f64>) -> Result<()> {
        if eps.len() != self.eps.len() {
            return Err(McmcError::InvalidKernel(format!(
                "expected {} half-ranges, got {}",
                self.eps.len(),
                eps.len()
            )));
        }
        check_half_ranges(&eps)?;
        self.eps = eps;
        Ok(())
    }
}

fn check_half_ranges(eps: &[f64]) -> Result<()> {
    match eps.iter().find(|e| !(**e > 0.0 && e.is_finite())) {
        Some(e) => Err(McmcError::InvalidKernel(format!(
            "half-ranges must be positive and finite, got {e}"
        ))),
        None => Ok(()),
    }
}

impl TransitionKernel for UniformRandomWalk {
    fn dim(&self) -> usize {
        self.eps.len()
    }

    fn positive(&self) -> &[bool] {
        &self.positive
    }

    fn sample_into<R: Rng + ?Sized>(&self, rng: &mut R, theta: &[f64], out: &mut [f64]) {
        for (i, o) in out.iter_mut().enumerate() {
            let u = rng.gen_range(-self.eps[i]..self.eps[i]);
            *o = if self.positive[i] {
                theta[i] * u.exp()
            } else {
                theta[i] + u
            };
        }
    }

    fn log_transition_density(&self, _from: &[f64], to: &[f64]) -> f64 {
        self.positive
            .iter()
            .zip(&self.eps)
            .zip(to)
            .filter(|((p, _), _)| **p)
            .map(|((_, e), x)| -(2.0 * e).ln() - x.ln())
            .sum()
    }
}

/// Correlated Gaussian steps, taken on the log scale for restricted coordinates.
#[derive(Debug, Clone)]
pub struct GaussianRandomWalk {
    factor: CovFactor,
    positive: Vec<bool>,
}

impl GaussianRandomWalk {
    pub fn new(cov: na::DMatrix<f64>, positive: Vec<bool>) -> Result<Self> {
        if !cov.is_square() {
            return Err(McmcError::InvalidKernel(format!(
                "covariance must be square, got {}x{}",
                cov.nrows(),
                cov.ncols()
            )));
        }
        if cov.nrows() != positive.len() {
            return Err(McmcError::InvalidKernel(format!(
                "covariance is {0}x{0} but {1} positivity flags were given",
                cov.nrows(),
                positive.len()
            )));
        }
        let factor = CovFactor::new(cov).ok_or_else(|| {
            McmcError::InvalidKernel("covariance must be positive definite".into())
        })?;
        Ok(Self { factor, positive })
    }

    /// Diagonal covariance `std² I` on `dim` unrestricted coordinates.
    pub fn isotropic(std: f64, dim: usize) -> Result<Self> {
        Self::new(na::DMatrix::identity(dim, dim) * (std * std), vec![false; dim])
    }

    pub fn cov(&self) -> &na::DMatrix<f64> {
        &self.factor.cov
    }

    /// Replaces the covariance, leaving the kernel untouched if the new one is unusable.
    pub fn set_cov(&mut self, cov: na::DMatrix<f64>) -> Result<()> {
        if cov.shape() != self.factor.cov.shape() {
            return Err(McmcError::InvalidKernel(format!(
                "covariance shape {:?} does not match kernel shape {:?}",
                cov.shape(),
                self.factor.cov.shape()
            )));
        }
        self.factor = CovFactor::new(cov).ok_or_else(|| {
            McmcError::InvalidKernel("covariance must be positive definite".into())
        })?;
        Ok(())
    }

    fn to_unconstrained(&self, theta: &[f64], out: &mut [f64]) {
        for ((o, &x), &p) in out.iter_mut().zip(theta).zip(&self.positive) {
            *o = if p { x.ln() } else { x };
        }
    }
}

impl TransitionKernel for GaussianRandomWalk {
    fn dim(&self) -> usize {
        self.factor.dim()
    }

    fn positive(&self) -> &[bool] {
        &self.positive
    }

    fn sample_into<R: Rng + ?Sized>(&self, rng: &mut R, theta: &[f64], out: &mut [f64]) {
        self.factor.draw(rng, out);
        for ((o, &x), &p) in out.iter_mut().zip(theta).zip(&self.positive) {
            *o = if p { (x.ln() + *o).exp() } else { x + *o };
        }
    }

    fn log_transition_density(&self, from: &[f64], to: &[f64]) -> f64 {
        let mut diff = vec![0.0; from.len()];
        let mut from_t = vec![0.0; from.len()];
        self.to_unconstrained(to, &mut diff);
        self.to_unconstrained(from, &mut from_t);
        diff.iter_mut().zip(&from_t).for_each(|(d, f)| *d -= f);
        self.factor.log_density(&diff) + log_jacobian(&self.positive, to)
    }
}

/**
A two-component mixture of Gaussian random walks.

Each draw picks kernel `b` with probability `weight`, otherwise `a`. The transition density is
the density of the mixture, not of the component that happened to be drawn.
*/
#[derive(Debug, Clone)]
pub struct GaussianRandomWalkMix {
    a: GaussianRandomWalk,
    b: GaussianRandomWalk,
    weight: f64,
}

impl GaussianRandomWalkMix {
    pub fn new(a: GaussianRandomWalk, b: GaussianRandomWalk, weight: f64) -> Result<Self> {
        if a.dim() != b.dim() {
            return Err(McmcError::InvalidKernel(format!(
                "mixture components have dimensions {} and {}",
                a.dim(),
                b.dim()
            )));
        }
        if a.positive != b.positive {
            return Err(McmcError::InvalidKernel(
                "mixture components must restrict the same coordinates".into(),
            ));
        }
        check_weight(weight)?;
        Ok(Self { a, b, weight })
    }

    pub fn a(&self) -> &GaussianRandomWalk {
        &self.a
    }

    pub fn b(&self) -> &GaussianRandomWalk {
        &self.b
    }

    pub fn b_mut(&mut self) -> &mut GaussianRandomWalk {
        &mut self.b
    }

    pub fn weight(&self) -> f64 {
        self.weight
    }

    pub fn set_weight(&mut self, weight: f64) -> Result<()> {
        check_weight(weight)?;
        self.weight = weight;
        Ok(())
    }
}

fn check_weight(weight: f64) -> Result<()> {
    if (0.0..=1.0).contains(&weight) {
        Ok(())
    } else {
        Err(McmcError::InvalidKernel(format!(
            "mixture weight must lie in [0, 1], got {weight}"
        )))
    }
}

/// `ln((1 - w) e^a + w e^b)` without overflow.
fn log_mix(a: f64, b: f64, weight: f64) -> f64 {
    let la = if weight < 1.0 { (1.0 - weight).ln() + a } else { f64::NEG_INFINITY };
    let lb = if weight > 0.0 { weight.ln() + b } else { f64::NEG_INFINITY };
    let m = la.max(lb);
    if m == f64::NEG_INFINITY {
        return m;
    }
    m + ((la - m).exp() + (lb - m).exp()).ln()
}

impl TransitionKernel for GaussianRandomWalkMix {
    fn dim(&self) -> usize {
        self.a.dim()
    }

    fn positive(&self) -> &[bool] {
        &self.a.positive
    }

    fn sample_into<R: Rng + ?Sized>(&self, rng: &mut R, theta: &[f64], out: &mut [f64]) {
        if rng.gen_bool(self.weight) {
            self.b.sample_into(rng, theta, out)
        } else {
            self.a.sample_into(rng, theta, out)
        }
    }

    fn log_transition_density(&self, from: &[f64], to: &[f64]) -> f64 {
        log_mix(
            self.a.log_transition_density(from, to),
            self.b.log_transition_density(from, to),
            self.weight,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    const SEED: u64 = 42;

    #[test]
    fn uniform_rejects_bad_half_ranges() {
        assert!(UniformRandomWalk::new(vec![0.0], vec![false]).is_err());
        assert!(UniformRandomWalk::new(vec![-1.0], vec![false]).is_err());
        assert!(UniformRandomWalk::new(vec![1.0, 1.0], vec![false]).is_err());
        assert!(UniformRandomWalk::isotropic(f64::NAN, 2).is_err());
    }

    #[test]
    fn uniform_unrestricted_is_symmetric() {
        let kernel = UniformRandomWalk::isotropic(0.7, 3).unwrap();
        let mut rng = SmallRng::seed_from_u64(SEED);
        let mut theta = vec![0.0, 10.0, -3.0];
        for _ in 0..100 {
            let proposal = kernel.sample(&mut rng, &theta);
            for (p, t) in proposal.iter().zip(&theta) {
                assert!((p - t).abs() <= 0.7 + 1e-12);
            }
            assert_eq!(kernel.log_transition_density(&theta, &proposal), 0.0);
            assert_eq!(kernel.log_transition_density(&proposal, &theta), 0.0);
            theta = proposal;
        }
    }

    #[test]
    fn restricted_coordinates_stay_positive() {
        let mut rng = SmallRng::seed_from_u64(SEED);
        let uniform = UniformRandomWalk::new(vec![5.0, 5.0], vec![true, false]).unwrap();
        let cov = na::DMatrix::from_row_slice(2, 2, &[4.0, 1.0, 1.0, 4.0]);
        let gauss = GaussianRandomWalk::new(cov, vec![true, false]).unwrap();

        let mut theta_u = vec![1e-3, 0.0];
        let mut theta_g = vec![1e-3, 0.0];
        for _ in 0..2_000 {
            theta_u = uniform.sample(&mut rng, &theta_u);
            theta_g = gauss.sample(&mut rng, &theta_g);
            assert!(theta_u[0] > 0.0, "uniform walk left the positive half-line");
            assert!(theta_g[0] > 0.0, "gaussian walk left the positive half-line");
        }
    }

    #[test]
    fn uniform_restricted_density_has_jacobian() {
        let kernel = UniformRandomWalk::new(vec![0.5, 0.5], vec![true, false]).unwrap();
        let lq = kernel.log_transition_density(&[1.0, 0.0], &[1.2, 0.3]);
        assert_abs_diff_eq!(lq, -(1.0_f64).ln() - 1.2_f64.ln(), epsilon = 1e-12);
    }

    #[test]
    fn gaussian_density_matches_closed_form() {
        let kernel = GaussianRandomWalk::isotropic(2.0, 1).unwrap();
        let lq = kernel.log_transition_density(&[1.0], &[2.0]);
        let expected = -0.5 * (2.0 * std::f64::consts::PI * 4.0).ln() - 0.5 * 0.25;
        assert_abs_diff_eq!(lq, expected, epsilon = 1e-12);

        let restricted = GaussianRandomWalk::new(na::DMatrix::identity(1, 1), vec![true]).unwrap();
        let lq = restricted.log_transition_density(&[1.0], &[std::f64::consts::E]);
        let expected = -0.5 * (2.0 * std::f64::consts::PI).ln() - 0.5 - 1.0;
        assert_abs_diff_eq!(lq, expected, epsilon = 1e-12);
    }

    #[test]
    fn gaussian_rejects_invalid_covariance() {
        let non_square = na::DMatrix::from_row_slice(1, 2, &[1.0, 0.0]);
        assert!(GaussianRandomWalk::new(non_square, vec![false]).is_err());
        let indefinite = na::DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 2.0, 1.0]);
        assert!(GaussianRandomWalk::new(indefinite, vec![false, false]).is_err());

        let mut kernel = GaussianRandomWalk::isotropic(1.0, 2).unwrap();
        assert!(kernel.set_cov(na::DMatrix::zeros(2, 2)).is_err());
        assert_eq!(kernel.cov(), &na::DMatrix::identity(2, 2));
    }

    #[test]
    fn mixture_density_is_the_blended_density() {
        let cov_b = na::DMatrix::from_row_slice(2, 2, &[2.0, 0.3, 0.3, 1.0]);
        let a = GaussianRandomWalk::new(na::DMatrix::identity(2, 2) * 0.01, vec![false, true])
            .unwrap();
        let b = GaussianRandomWalk::new(cov_b, vec![false, true]).unwrap();
        let mix = GaussianRandomWalkMix::new(a.clone(), b.clone(), 0.3).unwrap();

        let pairs = [
            ([0.0, 1.0], [0.05, 1.1]),
            ([1.0, 2.0], [-1.5, 0.4]),
            ([0.3, 0.7], [0.3, 0.7]),
        ];
        for (from, to) in pairs {
            let la = a.log_transition_density(&from, &to);
            let lb = b.log_transition_density(&from, &to);
            let expected = (0.7 * la.exp() + 0.3 * lb.exp()).ln();
            assert_abs_diff_eq!(mix.log_transition_density(&from, &to), expected, epsilon = 1e-10);
        }
    }

    #[test]
    fn mixture_picks_the_second_component_with_its_weight() {
        const N: usize = 20_000;
        let a = GaussianRandomWalk::isotropic(1e-3, 1).unwrap();
        let b = GaussianRandomWalk::isotropic(10.0, 1).unwrap();
        let kernel = GaussianRandomWalkMix::new(a, b, 0.3).unwrap();
        let mut rng = SmallRng::seed_from_u64(SEED);

        let large = (0..N)
            .filter(|_| kernel.sample(&mut rng, &[0.0])[0].abs() > 0.05)
            .count();
        // a never gets this far; b lands within 0.05 of the start 0.4% of the time
        assert_abs_diff_eq!(large as f64 / N as f64, 0.3 * 0.996, epsilon = 0.015);
    }

    #[test]
    fn mixture_with_degenerate_weights_uses_one_component() {
        let a = GaussianRandomWalk::isotropic(0.1, 1).unwrap();
        let b = GaussianRandomWalk::isotropic(3.0, 1).unwrap();
        let only_a = GaussianRandomWalkMix::new(a.clone(), b.clone(), 0.0).unwrap();
        let only_b = GaussianRandomWalkMix::new(a.clone(), b.clone(), 1.0).unwrap();
        let (from, to) = ([0.0], [2.0]);
        assert_abs_diff_eq!(
            only_a.log_transition_density(&from, &to),
            a.log_transition_density(&from, &to),
            epsilon = 1e-12
        );
        assert_abs_diff_eq!(
            only_b.log_transition_density(&from, &to),
            b.log_transition_density(&from, &to),
            epsilon = 1e-12
        );
    }

    #[test]
    fn mixture_rejects_mismatched_components() {
        let a = GaussianRandomWalk::isotropic(1.0, 1).unwrap();
        let b = GaussianRandomWalk::isotropic(1.0, 2).unwrap();
        assert!(GaussianRandomWalkMix::new(a.clone(), b, 0.5).is_err());
        let c = GaussianRandomWalk::new(na::DMatrix::identity(1, 1), vec![true]).unwrap();
        assert!(GaussianRandomWalkMix::new(a.clone(), c, 0.5).is_err());
        assert!(GaussianRandomWalkMix::new(a.clone(), a, 1.5).is_err());
    }
}
