/*!
# The run loop

[`Mcmc`] collects the data, the initial parameter vector and an ordered list of
[`SamplerEntry`] values, then drives the schedule: for every `(iteration, slot)` it hands
the global state to the slot's update, runs the update, lets the callbacks look at the
result and folds the step into the chain statistics.

## Example Usage

```rust
use mcmc_updates::adaptation::NoAdaptation;
use mcmc_updates::distributions::{Data, GaussianLaw};
use mcmc_updates::kernels::UniformRandomWalk;
use mcmc_updates::priors::ImproperPrior;
use mcmc_updates::sampler::Mcmc;
use mcmc_updates::update::RandomWalkUpdate;
use nalgebra::DMatrix;

let law = GaussianLaw::new(vec![0.0, 0.0], DMatrix::identity(2, 2)).unwrap();
let data = Data::new(law, vec![vec![1.0, 2.0], vec![0.8, 2.2]]);
let walk = |coord| {
    let kernel = UniformRandomWalk::isotropic(1.0, 1).unwrap();
    RandomWalkUpdate::new(kernel, NoAdaptation, ImproperPrior, vec![coord]).unwrap()
};

let output = Mcmc::new(data, vec![0.0, 0.0], 100)
    .add_update(walk(0))
    .add_update(walk(1))
    .set_seed(42)
    .run()
    .unwrap();
assert_eq!(output.global.state_history.shape(), &[100, 2, 2]);
```
*/

use rand::prelude::*;
use std::ops::Range;

use crate::callbacks::{Callback, Phase};
use crate::distributions::{Data, TargetLaw};
use crate::error::{McmcError, Result};
use crate::schedule::{McmcSchedule, McmcStep};
use crate::stats::DEFAULT_ACCEPTANCE_WINDOW;
use crate::update::McmcUpdate;
use crate::workspace::{GlobalWorkspace, LocalWorkspace};

/// One element of the configured list: a real update that occupies a slot, or a decorator
/// that only observes.
pub enum SamplerEntry<L: TargetLaw> {
    Update(Box<dyn McmcUpdate<L>>),
    Decorator(Box<dyn Callback<L>>),
}

/// Workspaces as they stand after the last step.
pub struct McmcOutput<L: TargetLaw> {
    pub global: GlobalWorkspace<L>,
    /// One per slot, in slot order.
    pub locals: Vec<LocalWorkspace>,
}

/// A configured chain, ready to [`run`](Mcmc::run).
pub struct Mcmc<L: TargetLaw> {
    data: Data<L>,
    theta_init: Vec<f64>,
    num_mcmc_steps: usize,
    entries: Vec<SamplerEntry<L>>,
    exclusions: Vec<(Vec<usize>, Range<usize>)>,
    initial_slots: Option<usize>,
    acceptance_window: usize,
    /// The seed of the chain's random number generator.
    pub seed: u64,
    rng: SmallRng,
}

impl<L: TargetLaw> Mcmc<L> {
    pub fn new(data: Data<L>, theta_init: Vec<f64>, num_mcmc_steps: usize) -> Self {
        let seed = thread_rng().gen::<u64>();
        Self {
            data,
            theta_init,
            num_mcmc_steps,
            entries: Vec::new(),
            exclusions: Vec::new(),
            initial_slots: None,
            acceptance_window: DEFAULT_ACCEPTANCE_WINDOW,
            seed,
            rng: SmallRng::seed_from_u64(seed),
        }
    }

    pub fn add_entry(mut self, entry: SamplerEntry<L>) -> Self {
        self.entries.push(entry);
        self
    }

    /// Appends an update. Updates take slots in the order they are added.
    pub fn add_update(self, update: impl McmcUpdate<L> + 'static) -> Self {
        self.add_entry(SamplerEntry::Update(Box::new(update)))
    }

    pub fn add_callback(self, callback: impl Callback<L> + 'static) -> Self {
        self.add_entry(SamplerEntry::Decorator(Box::new(callback)))
    }

    /// Skips `slots` during the iterations `iters`.
    pub fn exclude(mut self, slots: impl IntoIterator<Item = usize>, iters: Range<usize>) -> Self {
        self.exclusions.push((slots.into_iter().collect(), iters));
        self
    }

    /// Schedules only the first `n` updates at the start. Updates can bring the remaining
    /// ones in with [`Reschedule::AddSlots`](crate::schedule::Reschedule::AddSlots).
    pub fn set_initial_slots(mut self, n: usize) -> Self {
        self.initial_slots = Some(n);
        self
    }

    pub fn set_acceptance_window(mut self, window: usize) -> Self {
        self.acceptance_window = window;
        self
    }

    pub fn set_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self.rng = SmallRng::seed_from_u64(seed);
        self
    }

    /// Runs the whole schedule and hands back the workspaces.
    pub fn run(self) -> Result<McmcOutput<L>> {
        let Mcmc {
            data,
            theta_init,
            num_mcmc_steps,
            entries,
            exclusions,
            initial_slots,
            acceptance_window,
            seed,
            mut rng,
        } = self;

        let mut updates: Vec<Box<dyn McmcUpdate<L>>> = Vec::new();
        let mut callbacks: Vec<Box<dyn Callback<L>>> = Vec::new();
        for entry in entries {
            match entry {
                SamplerEntry::Update(u) => updates.push(u),
                SamplerEntry::Decorator(c) => callbacks.push(c),
            }
        }
        let num_slots = updates.len();
        if num_slots == 0 {
            return Err(McmcError::InvalidConfig("no updates configured".into()));
        }
        if acceptance_window == 0 {
            return Err(McmcError::InvalidConfig(
                "the acceptance window must be at least 1".into(),
            ));
        }

        let mut global = GlobalWorkspace::new(
            data,
            theta_init,
            num_mcmc_steps,
            num_slots,
            acceptance_window,
        )?;
        let ll = global.log_likelihood_blocks()?;
        let mut locals = updates
            .iter()
            .map(|u| LocalWorkspace::new(&global, u.coords(), ll.clone(), num_mcmc_steps))
            .collect::<Result<Vec<_>>>()?;
        for update in &updates {
            update.check_state(&global.state)?;
        }

        let mut schedule =
            McmcSchedule::new(num_mcmc_steps, initial_slots.unwrap_or(num_slots).min(num_slots));
        for (slots, iters) in exclusions {
            for slot in slots {
                if slot >= num_slots {
                    return Err(McmcError::InvalidConfig(format!(
                        "cannot exclude slot {slot}: only {num_slots} updates are configured"
                    )));
                }
                schedule.exclude(slot, iters.clone());
            }
        }

        for callback in callbacks.iter_mut() {
            callback.init(&global)?;
        }
        log::info!(
            "running {num_mcmc_steps} iterations of {num_slots} updates over {} parameters (seed {seed})",
            global.dim()
        );

        let mut previous: Option<usize> = None;
        let mut last_step = None;
        while let Some(step) = schedule.next() {
            let slot = step.slot;
            if slot >= num_slots {
                return Err(McmcError::InvalidConfig(format!(
                    "slot {slot} was scheduled but only {num_slots} updates are configured"
                )));
            }
            let previous_ll = previous
                .filter(|&p| p != slot)
                .map(|p| locals[p].ll.clone());
            locals[slot].transfer(&global, previous_ll.as_deref());

            run_callbacks(&mut callbacks, &global, &locals, step, Phase::PreStep)?;

            let accepted = updates[slot].step(&mut rng, &mut global, &mut locals[slot], step)?;
            updates[slot].reschedule(step, accepted, &mut schedule);
            for (other, update) in updates.iter_mut().enumerate() {
                if other != slot && update.registers_every_step() {
                    update.observe(&global, step, accepted)?;
                }
            }

            run_callbacks(&mut callbacks, &global, &locals, step, Phase::PostStep)?;

            global.update_stats(&locals[slot], step);
            previous = Some(slot);
            last_step = Some(step);
        }

        for callback in callbacks.iter_mut() {
            callback.cleanup(&global, &locals, last_step)?;
        }
        for slot in 0..num_slots {
            if let Some(rate) = global.stats.acceptance_rate(slot) {
                log::info!("slot {slot}: acceptance rate {rate:.3}");
            }
        }
        Ok(McmcOutput { global, locals })
    }
}

fn run_callbacks<L: TargetLaw>(
    callbacks: &mut [Box<dyn Callback<L>>],
    global: &GlobalWorkspace<L>,
    locals: &[LocalWorkspace],
    step: McmcStep,
    phase: Phase,
) -> Result<()> {
    for callback in callbacks.iter_mut() {
        if callback.should_execute(step, phase) {
            callback.execute(global, locals, step, phase)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adaptation::NoAdaptation;
    use crate::distributions::GaussianLaw;
    use crate::kernels::{GaussianRandomWalk, UniformRandomWalk};
    use crate::priors::ImproperPrior;
    use crate::schedule::Reschedule;
    use crate::update::RandomWalkUpdate;
    use approx::assert_abs_diff_eq;
    use nalgebra as na;
    use ndarray::s;
    use std::cell::RefCell;
    use std::rc::Rc;

    const SEED: u64 = 42;

    type Walk = RandomWalkUpdate<UniformRandomWalk, NoAdaptation, ImproperPrior>;

    fn walk(coord: usize) -> Walk {
        let kernel = UniformRandomWalk::isotropic(1.0, 1).unwrap();
        RandomWalkUpdate::new(kernel, NoAdaptation, ImproperPrior, vec![coord]).unwrap()
    }

    fn data() -> Data<GaussianLaw> {
        let cov = na::DMatrix::from_row_slice(2, 2, &[1.0, 0.5, 0.5, 1.0]);
        let law = GaussianLaw::new(vec![0.0, 0.0], cov).unwrap();
        let obs = vec![vec![1.2, 2.1], vec![0.7, 1.6], vec![1.1, 2.4], vec![0.9, 1.8]];
        Data::new(law, obs)
    }

    #[derive(Default)]
    struct Log {
        init: usize,
        pre: Vec<McmcStep>,
        post: Vec<McmcStep>,
        cleanup: Option<Option<McmcStep>>,
    }

    struct Recorder(Rc<RefCell<Log>>);

    impl Callback<GaussianLaw> for Recorder {
        fn init(&mut self, _global: &GlobalWorkspace<GaussianLaw>) -> Result<()> {
            self.0.borrow_mut().init += 1;
            Ok(())
        }

        fn should_execute(&self, _step: McmcStep, _phase: Phase) -> bool {
            true
        }

        fn execute(
            &mut self,
            _global: &GlobalWorkspace<GaussianLaw>,
            _locals: &[LocalWorkspace],
            step: McmcStep,
            phase: Phase,
        ) -> Result<()> {
            let mut log = self.0.borrow_mut();
            match phase {
                Phase::PreStep => log.pre.push(step),
                Phase::PostStep => log.post.push(step),
            }
            Ok(())
        }

        fn cleanup(
            &mut self,
            _global: &GlobalWorkspace<GaussianLaw>,
            _locals: &[LocalWorkspace],
            final_step: Option<McmcStep>,
        ) -> Result<()> {
            self.0.borrow_mut().cleanup = Some(final_step);
            Ok(())
        }
    }

    /// Wraps a walk, watches every other slot and drops out of the schedule after `stop_after`.
    struct Watcher {
        inner: Walk,
        stop_after: usize,
        seen: Rc<RefCell<Vec<McmcStep>>>,
    }

    impl McmcUpdate<GaussianLaw> for Watcher {
        fn coords(&self) -> &[usize] {
            McmcUpdate::<GaussianLaw>::coords(&self.inner)
        }

        fn step(
            &mut self,
            rng: &mut SmallRng,
            global: &mut GlobalWorkspace<GaussianLaw>,
            local: &mut LocalWorkspace,
            step: McmcStep,
        ) -> Result<bool> {
            self.inner.step(rng, global, local, step)
        }

        fn registers_every_step(&self) -> bool {
            true
        }

        fn observe(
            &mut self,
            _global: &GlobalWorkspace<GaussianLaw>,
            step: McmcStep,
            _accepted: bool,
        ) -> Result<()> {
            self.seen.borrow_mut().push(step);
            Ok(())
        }

        fn reschedule(&mut self, step: McmcStep, _accepted: bool, schedule: &mut McmcSchedule) {
            if step.iter == self.stop_after {
                schedule.reschedule(Reschedule::Remove(step.slot));
            }
        }
    }

    #[test]
    fn callbacks_see_every_step_in_order() {
        let log = Rc::new(RefCell::new(Log::default()));
        let output = Mcmc::new(data(), vec![0.0, 0.0], 3)
            .add_callback(Recorder(log.clone()))
            .add_update(walk(0))
            .add_update(walk(1))
            .set_seed(SEED)
            .run()
            .unwrap();

        let log = log.borrow();
        let expected: Vec<McmcStep> = (0..3)
            .flat_map(|iter| (0..2).map(move |slot| McmcStep { iter, slot }))
            .collect();
        assert_eq!(log.init, 1);
        assert_eq!(log.pre, expected);
        assert_eq!(log.post, expected);
        assert_eq!(log.cleanup, Some(Some(McmcStep { iter: 2, slot: 1 })));
        // decorators do not take a slot
        assert_eq!(output.locals.len(), 2);
    }

    #[test]
    fn likelihood_histories_match_state_histories() {
        const N: usize = 300;
        let output = Mcmc::new(data(), vec![0.0, 0.0], N)
            .add_update(walk(0))
            .add_update(walk(1))
            .set_seed(SEED)
            .run()
            .unwrap();
        let McmcOutput { global, locals } = output;

        let mut law = global.law.clone();
        for iter in 0..N {
            for (slot, local) in locals.iter().enumerate() {
                let state = global.state_history.slice(s![iter, slot, ..]).to_vec();
                law.set_parameters(&[0, 1], &state);
                let ll = law.log_likelihood(&global.observations).unwrap();
                assert_abs_diff_eq!(local.ll_history[[iter, 0]], ll, epsilon = 1e-9);
            }
        }
        assert_eq!(global.law.mean, global.state);
        assert_eq!(global.law_proposal.mean, global.state);
        assert_eq!(global.stats.n(), 1 + 2 * N as u64);
    }

    #[test]
    fn excluded_slots_leave_nan_rows() {
        let output = Mcmc::new(data(), vec![0.0, 0.0], 10)
            .add_update(walk(0))
            .add_update(walk(1))
            .exclude([1], 0..4)
            .set_seed(SEED)
            .run()
            .unwrap();
        let McmcOutput { global, locals } = output;

        for iter in 0..10 {
            let skipped = iter < 4;
            assert_eq!(locals[1].ll_history[[iter, 0]].is_nan(), skipped);
            assert_eq!(global.state_history[[iter, 1, 0]].is_nan(), skipped);
            assert!(!global.state_history[[iter, 0, 0]].is_nan());
            if skipped {
                assert_eq!(global.state_history[[iter, 0, 1]], 0.0);
            }
        }
    }

    #[test]
    fn updates_can_leave_the_schedule_and_observe_others() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let watcher = Watcher {
            inner: walk(1),
            stop_after: 2,
            seen: seen.clone(),
        };
        let output = Mcmc::new(data(), vec![0.0, 0.0], 6)
            .add_update(walk(0))
            .add_update(watcher)
            .set_seed(SEED)
            .run()
            .unwrap();

        let ran: Vec<bool> = (0..6)
            .map(|iter| !output.locals[1].ll_history[[iter, 0]].is_nan())
            .collect();
        assert_eq!(ran, vec![true, true, true, false, false, false]);
        let expected: Vec<McmcStep> = (0..6).map(|iter| McmcStep { iter, slot: 0 }).collect();
        assert_eq!(*seen.borrow(), expected);
    }

    #[test]
    fn added_slots_join_later_iterations() {
        struct Opener(Walk);

        impl McmcUpdate<GaussianLaw> for Opener {
            fn coords(&self) -> &[usize] {
                McmcUpdate::<GaussianLaw>::coords(&self.0)
            }

            fn step(
                &mut self,
                rng: &mut SmallRng,
                global: &mut GlobalWorkspace<GaussianLaw>,
                local: &mut LocalWorkspace,
                step: McmcStep,
            ) -> Result<bool> {
                self.0.step(rng, global, local, step)
            }

            fn reschedule(&mut self, step: McmcStep, _accepted: bool, schedule: &mut McmcSchedule) {
                if step.iter == 1 {
                    schedule.reschedule(Reschedule::AddSlots(1));
                }
            }
        }

        let output = Mcmc::new(data(), vec![0.0, 0.0], 4)
            .add_update(Opener(walk(0)))
            .add_update(walk(1))
            .set_initial_slots(1)
            .set_seed(SEED)
            .run()
            .unwrap();
        let ran: Vec<bool> = (0..4)
            .map(|iter| !output.locals[1].ll_history[[iter, 0]].is_nan())
            .collect();
        assert_eq!(ran, vec![false, true, true, true]);
    }

    #[test]
    fn same_seed_same_chain() {
        let run = || {
            Mcmc::new(data(), vec![0.0, 0.0], 50)
                .add_update(walk(0))
                .add_update(walk(1))
                .set_seed(SEED)
                .run()
                .unwrap()
        };
        assert_eq!(run().global.state_history, run().global.state_history);
    }

    #[test]
    fn misconfiguration_is_reported() {
        let none = Mcmc::new(data(), vec![0.0, 0.0], 5).run();
        assert!(matches!(none, Err(McmcError::InvalidConfig(_))));

        let out_of_range = Mcmc::new(data(), vec![0.0, 0.0], 5)
            .add_update(walk(2))
            .run();
        assert!(matches!(out_of_range, Err(McmcError::InvalidConfig(_))));

        let bad_exclusion = Mcmc::new(data(), vec![0.0, 0.0], 5)
            .add_update(walk(0))
            .exclude([3], 0..2)
            .run();
        assert!(matches!(bad_exclusion, Err(McmcError::InvalidConfig(_))));

        let empty_state = Mcmc::new(data(), vec![], 5).add_update(walk(0)).run();
        assert!(matches!(empty_state, Err(McmcError::InvalidConfig(_))));
    }

    #[test]
    fn restricted_walks_need_a_positive_start() {
        let gaussian = GaussianRandomWalk::new(na::DMatrix::identity(1, 1), vec![true]).unwrap();
        let uniform = UniformRandomWalk::new(vec![1.0], vec![true]).unwrap();
        let on_scale = |theta_init: Vec<f64>, restricted: Box<dyn McmcUpdate<GaussianLaw>>| {
            Mcmc::new(data(), theta_init, 200)
                .add_update(walk(0))
                .add_entry(SamplerEntry::Update(restricted))
                .set_seed(SEED)
                .run()
        };

        let update = RandomWalkUpdate::new(gaussian.clone(), NoAdaptation, ImproperPrior, vec![1]);
        let res = on_scale(vec![0.0, 0.0], Box::new(update.unwrap()));
        assert!(matches!(res, Err(McmcError::InvalidConfig(_))));

        let update = RandomWalkUpdate::new(uniform, NoAdaptation, ImproperPrior, vec![1]);
        let res = on_scale(vec![0.0, -1.0], Box::new(update.unwrap()));
        assert!(matches!(res, Err(McmcError::InvalidConfig(_))));

        let update = RandomWalkUpdate::new(gaussian, NoAdaptation, ImproperPrior, vec![1]);
        let output = on_scale(vec![0.0, 0.5], Box::new(update.unwrap())).unwrap();
        assert!(output.global.stats.acceptance_rate(1).unwrap() > 0.0);
        assert!(output.global.state_history.slice(s![.., 1, 1]).iter().all(|&x| x > 0.0));
    }
}
