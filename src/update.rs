/*!
# Metropolis–Hastings updates

An update owns one block of coordinates of the global parameter vector. On its turn it
proposes new values for that block with a [`TransitionKernel`], evaluates the proposal
against the target law held in the [`GlobalWorkspace`], and accepts or rejects it with the
Metropolis–Hastings criterion. Its [`Adaptation`] then gets the chance to retune the kernel.

## Example Usage

```rust
use mcmc_updates::adaptation::NoAdaptation;
use mcmc_updates::kernels::UniformRandomWalk;
use mcmc_updates::priors::ImproperPrior;
use mcmc_updates::update::RandomWalkUpdate;

let kernel = UniformRandomWalk::isotropic(1.0, 2).unwrap();
let update = RandomWalkUpdate::new(kernel, NoAdaptation, ImproperPrior, vec![3, 1]).unwrap();
assert_eq!(update.position(1), Some(1));
assert_eq!(update.position(0), None);
```
*/

use rand::rngs::SmallRng;
use rand::Rng;
use rand_distr::Exp1;
use std::collections::HashMap;

use crate::adaptation::Adaptation;
use crate::distributions::TargetLaw;
use crate::error::{McmcError, Result};
use crate::kernels::TransitionKernel;
use crate::priors::Prior;
use crate::schedule::{McmcSchedule, McmcStep};
use crate::workspace::{GlobalWorkspace, LocalWorkspace};

/// Default bound on the number of draws spent looking for a proposal inside the prior's
/// support.
pub const DEFAULT_MAX_PROPOSAL_ATTEMPTS: usize = 1000;

/// One kind of step the run loop can schedule.
pub trait McmcUpdate<L: TargetLaw> {
    /// Global coordinates the update governs, in local order.
    fn coords(&self) -> &[usize];

    /// Executes the update at `step` and reports whether its proposal was accepted.
    fn step(
        &mut self,
        rng: &mut SmallRng,
        global: &mut GlobalWorkspace<L>,
        local: &mut LocalWorkspace,
        step: McmcStep,
    ) -> Result<bool>;

    /// Checks that the update can start from the global state `theta`.
    fn check_state(&self, _theta: &[f64]) -> Result<()> {
        Ok(())
    }

    /// Whether the update wants to observe steps executed by other updates.
    fn registers_every_step(&self) -> bool {
        false
    }

    /// Shows the update a step another update just executed.
    fn observe(&mut self, _global: &GlobalWorkspace<L>, _step: McmcStep, _accepted: bool) -> Result<()> {
        Ok(())
    }

    /// Lets the update reshape the remaining schedule after its own turn.
    fn reschedule(&mut self, _step: McmcStep, _accepted: bool, _schedule: &mut McmcSchedule) {}
}

/// Draws the Metropolis–Hastings decision for a log acceptance ratio.
///
/// With `E ~ Exp(1)`, `P(E > -llr) = min(1, e^llr)`.
pub(crate) fn metropolis_accept<R: Rng + ?Sized>(rng: &mut R, llr: f64) -> bool {
    let e: f64 = rng.sample(Exp1);
    e > -llr
}

/**
A random-walk Metropolis–Hastings update.

# Type Parameters
- `K`: the proposal kernel. Must implement [`TransitionKernel`].
- `A`: the tuning schedule of `K`. Must implement [`Adaptation<K>`].
- `P`: the prior over the governed coordinates. Must implement [`Prior`].
*/
#[derive(Debug, Clone)]
pub struct RandomWalkUpdate<K, A, P> {
    kernel: K,
    adaptation: A,
    prior: P,
    coords: Vec<usize>,
    positions: HashMap<usize, usize>,
    max_proposal_attempts: usize,
}

impl<K, A, P> RandomWalkUpdate<K, A, P>
where
    K: TransitionKernel,
    A: Adaptation<K>,
    P: Prior,
{
    /// Pairs `kernel` with the global coordinates `coords` it moves, in that order.
    pub fn new(kernel: K, adaptation: A, prior: P, coords: Vec<usize>) -> Result<Self> {
        if coords.is_empty() {
            return Err(McmcError::InvalidConfig(
                "an update must govern at least one coordinate".into(),
            ));
        }
        if coords.len() != kernel.dim() {
            return Err(McmcError::InvalidKernel(format!(
                "kernel moves {} coordinates but the update governs {}",
                kernel.dim(),
                coords.len()
            )));
        }
        if let Some(d) = prior.dim().filter(|&d| d != coords.len()) {
            return Err(McmcError::InvalidPrior(format!(
                "prior is defined on {d} coordinates but the update governs {}",
                coords.len()
            )));
        }
        let mut positions = HashMap::with_capacity(coords.len());
        for (i, &c) in coords.iter().enumerate() {
            if positions.insert(c, i).is_some() {
                return Err(McmcError::InvalidConfig(format!(
                    "coordinate {c} is listed twice"
                )));
            }
        }
        Ok(Self {
            kernel,
            adaptation,
            prior,
            coords,
            positions,
            max_proposal_attempts: DEFAULT_MAX_PROPOSAL_ATTEMPTS,
        })
    }

    /// Caps the number of draws per step spent on proposals outside the prior's support.
    pub fn set_max_proposal_attempts(mut self, attempts: usize) -> Self {
        self.max_proposal_attempts = attempts.max(1);
        self
    }

    pub fn kernel(&self) -> &K {
        &self.kernel
    }

    pub fn adaptation(&self) -> &A {
        &self.adaptation
    }

    pub fn prior(&self) -> &P {
        &self.prior
    }

    /// Local position of the global coordinate `coord`, if the update governs it.
    pub fn position(&self, coord: usize) -> Option<usize> {
        self.positions.get(&coord).copied()
    }

    /// Draws into `local.state_proposal` until the prior is finite there.
    fn propose(&self, rng: &mut SmallRng, local: &mut LocalWorkspace, slot: usize) -> Result<()> {
        for _ in 0..self.max_proposal_attempts {
            self.kernel
                .sample_into(rng, &local.state, &mut local.state_proposal);
            if self.prior.log_prior(&local.state_proposal) > f64::NEG_INFINITY {
                return Ok(());
            }
        }
        Err(McmcError::InfeasibleProposal {
            slot,
            attempts: self.max_proposal_attempts,
        })
    }

    /**
    Log acceptance ratio of the pending proposal:

    \[
    \log \alpha = \left[\ell(\theta^\circ) + \log q(\theta \mid \theta^\circ) + \log \pi(\theta^\circ)\right]
                  - \left[\ell(\theta) + \log q(\theta^\circ \mid \theta) + \log \pi(\theta)\right]
    \]
    */
    fn log_accept_ratio(&self, local: &LocalWorkspace) -> f64 {
        let (current, proposed) = (&local.state, &local.state_proposal);
        let log_q_forward = self.kernel.log_transition_density(current, proposed);
        let log_q_backward = self.kernel.log_transition_density(proposed, current);
        (local.total_ll_proposal() + log_q_backward + self.prior.log_prior(proposed))
            - (local.total_ll() + log_q_forward + self.prior.log_prior(current))
    }

    fn adapt(&mut self, accepted: bool, theta: &[f64], step: McmcStep) -> Result<()> {
        self.adaptation.register(accepted, theta);
        if self.adaptation.time_to_update() {
            self.adaptation.readjust(&mut self.kernel, step.iter + 1)?;
        }
        Ok(())
    }
}

impl<L, K, A, P> McmcUpdate<L> for RandomWalkUpdate<K, A, P>
where
    L: TargetLaw,
    K: TransitionKernel,
    A: Adaptation<K>,
    P: Prior,
{
    fn coords(&self) -> &[usize] {
        &self.coords
    }

    fn step(
        &mut self,
        rng: &mut SmallRng,
        global: &mut GlobalWorkspace<L>,
        local: &mut LocalWorkspace,
        step: McmcStep,
    ) -> Result<bool> {
        self.propose(rng, local, step.slot)?;
        global.set_proposal(&self.coords, &local.state_proposal);

        let ll_proposal = global.proposal_log_likelihood_blocks()?;
        if ll_proposal.len() != local.ll.len() {
            return Err(McmcError::Law(format!(
                "the law returned {} likelihood blocks, expected {}",
                ll_proposal.len(),
                local.ll.len()
            )));
        }
        local.ll_proposal = ll_proposal;

        let accepted = metropolis_accept(rng, self.log_accept_ratio(local));
        local.register(step.iter, accepted);
        global.register(step, local, accepted);

        self.adapt(accepted, &local.state, step)?;
        Ok(accepted)
    }

    fn check_state(&self, theta: &[f64]) -> Result<()> {
        let restricted = self
            .coords
            .iter()
            .zip(self.kernel.positive())
            .filter(|(_, p)| **p);
        for (&c, _) in restricted {
            match theta.get(c) {
                Some(&x) if x > 0.0 && x.is_finite() => {}
                Some(&x) => {
                    return Err(McmcError::InvalidConfig(format!(
                        "coordinate {c} is restricted to positive values but starts at {x}"
                    )))
                }
                None => {
                    return Err(McmcError::InvalidConfig(format!(
                        "coordinate {c} is out of range for a state of length {}",
                        theta.len()
                    )))
                }
            }
        }
        Ok(())
    }

    fn registers_every_step(&self) -> bool {
        self.adaptation.registers_every_step()
    }

    fn observe(&mut self, global: &GlobalWorkspace<L>, step: McmcStep, accepted: bool) -> Result<()> {
        let theta: Vec<f64> = self.coords.iter().map(|&c| global.state[c]).collect();
        self.adapt(accepted, &theta, step)
    }
}
