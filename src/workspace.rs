/*!
Chain state shared by all updates ([`GlobalWorkspace`]) and the scratch state each update
keeps for itself ([`LocalWorkspace`]).

Histories are pre-sized for the whole run. Entries of steps that never ran (excluded slots)
hold `NaN`.
*/

use ndarray::prelude::*;

use crate::distributions::{Data, TargetLaw};
use crate::error::{McmcError, Result};
use crate::schedule::McmcStep;
use crate::stats::ChainStats;

/// Everything the run loop owns for the duration of a run.
#[derive(Debug, Clone)]
pub struct GlobalWorkspace<L: TargetLaw> {
    /// The current accepted parameter vector.
    pub state: Vec<f64>,
    /// `[iteration, slot, coordinate]` snapshots of `state` after each step.
    pub state_history: Array3<f64>,
    /// `[iteration, slot, coordinate]` full proposed vectors.
    pub state_proposal_history: Array3<f64>,
    pub observations: L::Observations,
    /// Mirrors `state`.
    pub law: L,
    /// Receives proposals; agrees with `state` between steps.
    pub law_proposal: L,
    pub stats: ChainStats,
    proposal: Vec<f64>,
}

impl<L: TargetLaw> GlobalWorkspace<L> {
    pub fn new(
        data: Data<L>,
        theta_init: Vec<f64>,
        num_mcmc_steps: usize,
        num_slots: usize,
        acceptance_window: usize,
    ) -> Result<Self> {
        if theta_init.is_empty() {
            return Err(McmcError::InvalidConfig(
                "the initial parameter vector is empty".into(),
            ));
        }
        let dim = theta_init.len();
        let all: Vec<usize> = (0..dim).collect();
        let mut law = data.law;
        law.set_parameters(&all, &theta_init);
        let history = Array3::from_elem((num_mcmc_steps, num_slots, dim), f64::NAN);
        Ok(Self {
            stats: ChainStats::new(&theta_init, num_slots, acceptance_window),
            proposal: theta_init.clone(),
            state: theta_init,
            state_history: history.clone(),
            state_proposal_history: history,
            observations: data.observations,
            law_proposal: law.clone(),
            law,
        })
    }

    pub fn dim(&self) -> usize {
        self.state.len()
    }

    pub fn num_slots(&self) -> usize {
        self.state_history.shape()[1]
    }

    /// Per-block log-likelihood of the accepted state.
    pub fn log_likelihood_blocks(&self) -> Result<Vec<f64>> {
        self.law.log_likelihood_blocks(&self.observations)
    }

    /// Copies `state` into the proposal buffer, overwrites `coords` with `values` and pushes
    /// them into the proposal law.
    pub fn set_proposal(&mut self, coords: &[usize], values: &[f64]) {
        self.proposal.copy_from_slice(&self.state);
        for (&c, &v) in coords.iter().zip(values) {
            self.proposal[c] = v;
        }
        self.law_proposal.set_parameters(coords, values);
    }

    /// Per-block log-likelihood of the pending proposal.
    pub fn proposal_log_likelihood_blocks(&self) -> Result<Vec<f64>> {
        self.law_proposal.log_likelihood_blocks(&self.observations)
    }

    /// Commits or discards the pending proposal of `local` and records the step.
    pub fn register(&mut self, step: McmcStep, local: &LocalWorkspace, accepted: bool) {
        if accepted {
            for (&c, &v) in local.coords.iter().zip(&local.state_proposal) {
                self.state[c] = v;
            }
            self.law.set_parameters(&local.coords, &local.state_proposal);
        } else {
            self.law_proposal.set_parameters(&local.coords, &local.state);
        }
        self.state_history
            .slice_mut(s![step.iter, step.slot, ..])
            .assign(&ArrayView1::from(&self.state));
        self.state_proposal_history
            .slice_mut(s![step.iter, step.slot, ..])
            .assign(&ArrayView1::from(&self.proposal));
    }

    /// Folds the outcome of `step` into the chain statistics.
    pub fn update_stats(&mut self, local: &LocalWorkspace, step: McmcStep) {
        let accepted = local.acceptance_history[step.iter];
        self.stats.update(&self.state, step.slot, accepted);
    }
}

/// The per-update view of the chain, reused across iterations.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalWorkspace {
    /// Global coordinates governed by the update.
    pub coords: Vec<usize>,
    pub state: Vec<f64>,
    pub state_proposal: Vec<f64>,
    pub ll: Vec<f64>,
    pub ll_proposal: Vec<f64>,
    /// `[iteration, block]` accepted log-likelihoods.
    pub ll_history: Array2<f64>,
    /// `[iteration, block]` proposed log-likelihoods.
    pub ll_proposal_history: Array2<f64>,
    pub acceptance_history: Vec<bool>,
}

impl LocalWorkspace {
    /// Starts from the global state at `coords` and the log-likelihood `ll` of that state.
    pub fn new<L: TargetLaw>(
        global: &GlobalWorkspace<L>,
        coords: &[usize],
        ll: Vec<f64>,
        num_mcmc_steps: usize,
    ) -> Result<Self> {
        if let Some(&c) = coords.iter().find(|&&c| c >= global.dim()) {
            return Err(McmcError::InvalidConfig(format!(
                "coordinate {c} is out of range for a {}-dimensional state",
                global.dim()
            )));
        }
        let state: Vec<f64> = coords.iter().map(|&c| global.state[c]).collect();
        let blocks = ll.len();
        Ok(Self {
            coords: coords.to_vec(),
            state_proposal: state.clone(),
            state,
            ll_proposal: ll.clone(),
            ll,
            ll_history: Array2::from_elem((num_mcmc_steps, blocks), f64::NAN),
            ll_proposal_history: Array2::from_elem((num_mcmc_steps, blocks), f64::NAN),
            acceptance_history: vec![false; num_mcmc_steps],
        })
    }

    /// Pulls the governed coordinates from the global state and, when given, the
    /// log-likelihood of that state as last computed by another update.
    pub fn transfer<L: TargetLaw>(&mut self, global: &GlobalWorkspace<L>, previous_ll: Option<&[f64]>) {
        for (s, &c) in self.state.iter_mut().zip(&self.coords) {
            *s = global.state[c];
        }
        if let Some(ll) = previous_ll.filter(|ll| ll.len() == self.ll.len()) {
            self.ll.copy_from_slice(ll);
        }
    }

    /// Records the outcome of iteration `iter`, adopting the proposal when accepted.
    pub fn register(&mut self, iter: usize, accepted: bool) {
        if accepted {
            self.state.copy_from_slice(&self.state_proposal);
            self.ll.copy_from_slice(&self.ll_proposal);
        }
        self.ll_history
            .row_mut(iter)
            .assign(&ArrayView1::from(&self.ll));
        self.ll_proposal_history
            .row_mut(iter)
            .assign(&ArrayView1::from(&self.ll_proposal));
        self.acceptance_history[iter] = accepted;
    }

    pub fn total_ll(&self) -> f64 {
        self.ll.iter().sum()
    }

    pub fn total_ll_proposal(&self) -> f64 {
        self.ll_proposal.iter().sum()
    }
}
