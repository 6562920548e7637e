/*!
Hooks the run loop calls around every step.

A [`Callback`] is initialized once before the first step, asked before and after every step
whether it wants to run, and cleaned up once after the schedule is exhausted. Callbacks only
read the workspaces.

Two callbacks ship with the crate: [`ProgressCallback`] draws a progress bar, and
`SavingCallback` (behind the `csv` feature) appends the chain to a CSV file.
*/

use indicatif::{ProgressBar, ProgressStyle};
use std::time::{Duration, Instant};

use crate::distributions::TargetLaw;
use crate::error::{McmcError, Result};
use crate::schedule::McmcStep;
use crate::workspace::{GlobalWorkspace, LocalWorkspace};

#[cfg(feature = "csv")]
pub use crate::io::csv::SavingCallback;

/// When a callback is offered a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    PreStep,
    PostStep,
}

/// A side-effecting observer of the run.
pub trait Callback<L: TargetLaw> {
    /// One-time setup before the first step.
    fn init(&mut self, _global: &GlobalWorkspace<L>) -> Result<()> {
        Ok(())
    }

    fn should_execute(&self, step: McmcStep, phase: Phase) -> bool;

    fn execute(
        &mut self,
        global: &GlobalWorkspace<L>,
        locals: &[LocalWorkspace],
        step: McmcStep,
        phase: Phase,
    ) -> Result<()>;

    /// One-time teardown. `final_step` is `None` when no step ran.
    fn cleanup(
        &mut self,
        _global: &GlobalWorkspace<L>,
        _locals: &[LocalWorkspace],
        _final_step: Option<McmcStep>,
    ) -> Result<()> {
        Ok(())
    }
}

/// Shows iterations done and the overall acceptance rate of every slot.
#[derive(Debug, Clone)]
pub struct ProgressCallback {
    pb: ProgressBar,
    last_update: Instant,
}

impl ProgressCallback {
    const UPDATE_INTERVAL: Duration = Duration::from_millis(500);

    pub fn new() -> Result<Self> {
        let style = ProgressStyle::default_bar()
            .template("{prefix} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
            .map_err(|e| McmcError::InvalidConfig(format!("progress bar template: {e}")))?
            .progress_chars("##-");
        let pb = ProgressBar::new(0);
        pb.set_style(style);
        pb.set_prefix("MCMC");
        Ok(Self::with_bar(pb))
    }

    /// Reports to an existing bar, e.g. one owned by a `MultiProgress` or a hidden one.
    pub fn with_bar(pb: ProgressBar) -> Self {
        Self {
            pb,
            last_update: Instant::now(),
        }
    }

    pub fn bar(&self) -> &ProgressBar {
        &self.pb
    }

    fn report<L: TargetLaw>(&mut self, global: &GlobalWorkspace<L>, step: McmcStep) {
        let rates: Vec<String> = (0..global.num_slots())
            .map(|slot| match global.stats.acceptance_rate(slot) {
                Some(rate) => format!("{rate:.3}"),
                None => "-".to_string(),
            })
            .collect();
        self.pb.set_position(step.iter as u64 + 1);
        self.pb
            .set_message(format!("AcceptRate=[{}]", rates.join(", ")));
        self.last_update = Instant::now();
    }
}

impl<L: TargetLaw> Callback<L> for ProgressCallback {
    fn init(&mut self, global: &GlobalWorkspace<L>) -> Result<()> {
        self.pb.set_length(global.state_history.shape()[0] as u64);
        self.last_update = Instant::now();
        Ok(())
    }

    fn should_execute(&self, _step: McmcStep, phase: Phase) -> bool {
        phase == Phase::PostStep
    }

    fn execute(
        &mut self,
        global: &GlobalWorkspace<L>,
        _locals: &[LocalWorkspace],
        step: McmcStep,
        _phase: Phase,
    ) -> Result<()> {
        if self.last_update.elapsed() >= Self::UPDATE_INTERVAL {
            self.report(global, step);
        }
        Ok(())
    }

    fn cleanup(
        &mut self,
        global: &GlobalWorkspace<L>,
        _locals: &[LocalWorkspace],
        final_step: Option<McmcStep>,
    ) -> Result<()> {
        if let Some(step) = final_step {
            self.report(global, step);
        }
        self.pb.finish_with_message("Done!");
        Ok(())
    }
}
