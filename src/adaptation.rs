/*!
Adaptive tuning of random-walk kernels.

An [`Adaptation`] observes the outcome of every Metropolis–Hastings step of its update and,
once enough observations have accumulated, rewrites the hyperparameters of the kernel it is
paired with. The pairing is expressed in the type system: [`AdaptationUnifRW`] only tunes a
[`UniformRandomWalk`], [`HaarioTypeAdaptation`] only tunes a [`GaussianRandomWalkMix`], and
[`NoAdaptation`] goes with anything.
*/

use nalgebra as na;

use crate::error::{McmcError, Result};
use crate::kernels::{GaussianRandomWalkMix, TransitionKernel, UniformRandomWalk};
use crate::stats::RunningMoments;

/// Optimal scaling constant for random-walk proposals in high dimension.
const HAARIO_SCALE: f64 = 2.38;

/// Tuning schedule for the hyperparameters of a kernel of type `K`.
pub trait Adaptation<K> {
    /// Records the outcome of one step and the sub-state after it.
    fn register(&mut self, accepted: bool, theta: &[f64]);

    /// Whether enough observations have accumulated for [`Adaptation::readjust`].
    fn time_to_update(&self) -> bool;

    /// Rewrites the kernel's hyperparameters. `mcmc_iter` is the 1-based iteration number.
    fn readjust(&mut self, kernel: &mut K, mcmc_iter: usize) -> Result<()>;

    /// Whether the adaptation also observes steps executed by other updates.
    fn registers_every_step(&self) -> bool {
        false
    }
}

/// Leaves the kernel untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAdaptation;

impl<K> Adaptation<K> for NoAdaptation {
    fn register(&mut self, _accepted: bool, _theta: &[f64]) {}

    fn time_to_update(&self) -> bool {
        false
    }

    fn readjust(&mut self, _kernel: &mut K, _mcmc_iter: usize) -> Result<()> {
        Ok(())
    }
}

/// A tuning parameter shared by all coordinates or given per coordinate.
#[derive(Debug, Clone, PartialEq)]
pub enum PerCoord {
    Scalar(f64),
    Vector(Vec<f64>),
}

impl PerCoord {
    /// Broadcasts to `dim` values, checking the length of per-coordinate vectors.
    pub fn resolve(&self, dim: usize, name: &str) -> Result<Vec<f64>> {
        match self {
            PerCoord::Scalar(x) => Ok(vec![*x; dim]),
            PerCoord::Vector(v) if v.len() == dim => Ok(v.clone()),
            PerCoord::Vector(v) => Err(McmcError::InvalidAdaptation(format!(
                "`{name}` has {} entries but the kernel moves {dim} coordinates",
                v.len()
            ))),
        }
    }
}

impl From<f64> for PerCoord {
    fn from(x: f64) -> Self {
        PerCoord::Scalar(x)
    }
}

impl From<Vec<f64>> for PerCoord {
    fn from(v: Vec<f64>) -> Self {
        PerCoord::Vector(v)
    }
}

/// Settings for [`AdaptationUnifRW`].
#[derive(Debug, Clone, PartialEq)]
pub struct UnifRwAdaptationConfig {
    pub adapt_every_k_steps: usize,
    pub target_accpt_rate: PerCoord,
    pub scale: PerCoord,
    pub min: PerCoord,
    pub max: PerCoord,
    pub offset: PerCoord,
}

impl Default for UnifRwAdaptationConfig {
    fn default() -> Self {
        Self {
            adapt_every_k_steps: 100,
            target_accpt_rate: PerCoord::Scalar(0.234),
            scale: PerCoord::Scalar(0.1),
            min: PerCoord::Scalar(1e-12),
            max: PerCoord::Scalar(1e7),
            offset: PerCoord::Scalar(0.0),
        }
    }
}

/**
Steers the half-ranges of a [`UniformRandomWalk`] towards a target acceptance rate.

Every `adapt_every_k_steps` proposals the empirical acceptance rate is compared with the
target. Each half-range moves up by `δ` if the walk accepted too often and down otherwise,
with `δ = scale / sqrt(max(1, iter / k - offset))` shrinking over the run, and is clamped to
`[min, max]`.

# Examples

```rust
use mcmc_updates::adaptation::{Adaptation, AdaptationUnifRW, UnifRwAdaptationConfig};
use mcmc_updates::kernels::UniformRandomWalk;

let mut kernel = UniformRandomWalk::isotropic(1.0, 1).unwrap();
let config = UnifRwAdaptationConfig { adapt_every_k_steps: 10, ..Default::default() };
let mut adpt = AdaptationUnifRW::new(&kernel, config).unwrap();
for _ in 0..10 {
    adpt.register(true, &[0.0]);
}
assert!(adpt.time_to_update());
adpt.readjust(&mut kernel, 10).unwrap();
assert!((kernel.eps()[0] - 1.1).abs() < 1e-12);
```
*/
#[derive(Debug, Clone, PartialEq)]
pub struct AdaptationUnifRW {
    proposed: usize,
    accepted: usize,
    adapt_every_k_steps: usize,
    target_accpt_rate: Vec<f64>,
    scale: Vec<f64>,
    min: Vec<f64>,
    max: Vec<f64>,
    offset: Vec<f64>,
}

impl AdaptationUnifRW {
    pub fn new(kernel: &UniformRandomWalk, config: UnifRwAdaptationConfig) -> Result<Self> {
        let dim = kernel.dim();
        if config.adapt_every_k_steps == 0 {
            return Err(McmcError::InvalidAdaptation(
                "`adapt_every_k_steps` must be at least 1".into(),
            ));
        }
        let adpt = Self {
            proposed: 0,
            accepted: 0,
            adapt_every_k_steps: config.adapt_every_k_steps,
            target_accpt_rate: config.target_accpt_rate.resolve(dim, "target_accpt_rate")?,
            scale: config.scale.resolve(dim, "scale")?,
            min: config.min.resolve(dim, "min")?,
            max: config.max.resolve(dim, "max")?,
            offset: config.offset.resolve(dim, "offset")?,
        };
        if adpt.target_accpt_rate.iter().any(|r| !(*r > 0.0 && *r < 1.0)) {
            return Err(McmcError::InvalidAdaptation(
                "target acceptance rates must lie in (0, 1)".into(),
            ));
        }
        if adpt.scale.iter().any(|s| !(*s > 0.0)) {
            return Err(McmcError::InvalidAdaptation("`scale` must be positive".into()));
        }
        if adpt
            .min
            .iter()
            .zip(&adpt.max)
            .any(|(lo, hi)| !(*lo > 0.0 && lo <= hi))
        {
            return Err(McmcError::InvalidAdaptation(
                "need 0 < min <= max for every coordinate".into(),
            ));
        }
        Ok(adpt)
    }

    pub fn adapt_every_k_steps(&self) -> usize {
        self.adapt_every_k_steps
    }
}

impl Adaptation<UniformRandomWalk> for AdaptationUnifRW {
    fn register(&mut self, accepted: bool, _theta: &[f64]) {
        self.proposed += 1;
        self.accepted += accepted as usize;
    }

    fn time_to_update(&self) -> bool {
        self.proposed >= self.adapt_every_k_steps
    }

    fn readjust(&mut self, kernel: &mut UniformRandomWalk, mcmc_iter: usize) -> Result<()> {
        let accpt_rate = self.accepted as f64 / self.proposed.max(1) as f64;
        self.proposed = 0;
        self.accepted = 0;

        let epochs = mcmc_iter as f64 / self.adapt_every_k_steps as f64;
        let eps: Vec<f64> = kernel
            .eps()
            .iter()
            .enumerate()
            .map(|(i, &eps)| {
                let delta = self.scale[i] / (epochs - self.offset[i]).max(1.0).sqrt();
                let direction = if accpt_rate > self.target_accpt_rate[i] { 1.0 } else { -1.0 };
                (eps + direction * delta).clamp(self.min[i], self.max[i])
            })
            .collect();
        log::debug!(
            "iteration {mcmc_iter}: acceptance rate {accpt_rate:.3}, half-ranges {:?} -> {:?}",
            kernel.eps(),
            eps
        );
        kernel.set_eps(eps)
    }
}

/// Update rule for the mixture weight: `(weight, observations, mcmc_iter) -> new weight`.
pub type WeightUpdate = Box<dyn Fn(f64, u64, usize) -> f64>;

/// Settings for [`HaarioTypeAdaptation`].
pub struct HaarioConfig {
    pub adapt_every_k_steps: usize,
    /// Added to the diagonal of the learned covariance.
    pub regularization: f64,
    pub weight_update: WeightUpdate,
    /// Observe the steps of every update, not only the owner's.
    pub register_every_step: bool,
}

impl Default for HaarioConfig {
    fn default() -> Self {
        Self {
            adapt_every_k_steps: 100,
            regularization: 1e-10,
            weight_update: Box::new(|weight, _, _| weight),
            register_every_step: false,
        }
    }
}

/// Raises the mixture weight linearly towards `target`, reaching it after `n_obs`
/// observations. The weight only moves upward: a weight already at or above `target` is kept.
pub fn ramp_weight(target: f64, n_obs: u64) -> WeightUpdate {
    Box::new(move |weight, n, _| {
        let progress = (n as f64 / n_obs.max(1) as f64).min(1.0);
        weight.max(progress * target).min(target.max(weight))
    })
}

/**
Learns the covariance of the adaptive component of a [`GaussianRandomWalkMix`].

Every registered sub-state (accepted or not) feeds running moments on the kernel's
unconstrained scale. Every `adapt_every_k_steps` registrations the covariance of component
`b` becomes `2.38² / d · cov + regularization · I` and the mixture weight is passed through
the configured update rule.
*/
pub struct HaarioTypeAdaptation {
    positive: Vec<bool>,
    moments: RunningMoments,
    since_update: usize,
    adapt_every_k_steps: usize,
    regularization: f64,
    weight_update: WeightUpdate,
    register_every_step: bool,
    scratch: Vec<f64>,
}

impl HaarioTypeAdaptation {
    /// Starts the moments at `theta0`, the initial values of the governed coordinates.
    pub fn new(
        kernel: &GaussianRandomWalkMix,
        theta0: &[f64],
        config: HaarioConfig,
    ) -> Result<Self> {
        if theta0.len() != kernel.dim() {
            return Err(McmcError::InvalidAdaptation(format!(
                "initial sub-state has {} entries but the kernel moves {} coordinates",
                theta0.len(),
                kernel.dim()
            )));
        }
        if config.adapt_every_k_steps == 0 {
            return Err(McmcError::InvalidAdaptation(
                "`adapt_every_k_steps` must be at least 1".into(),
            ));
        }
        if !(config.regularization >= 0.0) {
            return Err(McmcError::InvalidAdaptation(
                "`regularization` must be non-negative".into(),
            ));
        }
        let positive = kernel.positive().to_vec();
        let mut scratch = vec![0.0; theta0.len()];
        to_unconstrained(&positive, theta0, &mut scratch);
        Ok(Self {
            moments: RunningMoments::new(&scratch),
            positive,
            since_update: 0,
            adapt_every_k_steps: config.adapt_every_k_steps,
            regularization: config.regularization,
            weight_update: config.weight_update,
            register_every_step: config.register_every_step,
            scratch,
        })
    }

    pub fn moments(&self) -> &RunningMoments {
        &self.moments
    }
}

fn to_unconstrained(positive: &[bool], theta: &[f64], out: &mut [f64]) {
    for ((o, &x), &p) in out.iter_mut().zip(theta).zip(positive) {
        *o = if p { x.ln() } else { x };
    }
}

impl Adaptation<GaussianRandomWalkMix> for HaarioTypeAdaptation {
    fn register(&mut self, _accepted: bool, theta: &[f64]) {
        to_unconstrained(&self.positive, theta, &mut self.scratch);
        self.moments.push(&self.scratch);
        self.since_update += 1;
    }

    fn time_to_update(&self) -> bool {
        self.since_update >= self.adapt_every_k_steps
    }

    fn readjust(&mut self, kernel: &mut GaussianRandomWalkMix, mcmc_iter: usize) -> Result<()> {
        self.since_update = 0;
        let d = self.positive.len();
        let cov = self.moments.cov();
        let factor = HAARIO_SCALE * HAARIO_SCALE / d as f64;
        let adapted = na::DMatrix::from_fn(d, d, |i, j| {
            factor * cov[[i, j]] + if i == j { self.regularization } else { 0.0 }
        });
        if let Err(e) = kernel.b_mut().set_cov(adapted) {
            log::warn!("iteration {mcmc_iter}: keeping previous proposal covariance ({e})");
        }

        let weight = (self.weight_update)(kernel.weight(), self.moments.n(), mcmc_iter);
        kernel.set_weight(weight.clamp(0.0, 1.0))?;
        log::debug!(
            "iteration {mcmc_iter}: adapted covariance from {} observations, weight {:.3}",
            self.moments.n(),
            kernel.weight()
        );
        Ok(())
    }

    fn registers_every_step(&self) -> bool {
        self.register_every_step
    }
}
