/*!
The order in which update slots run.

A schedule walks the `(iteration, slot)` grid in row-major order, skipping every slot whose
exclusion window covers the iteration. It can be reshaped while it is being consumed: a
[`Reschedule`] applied inside a step only affects the steps that come after it.

# Examples

```rust
use mcmc_updates::schedule::{McmcSchedule, McmcStep};

let mut schedule = McmcSchedule::new(2, 2);
schedule.exclude(1, 0..1);
let steps: Vec<McmcStep> = schedule.collect();
assert_eq!(
    steps,
    vec![
        McmcStep { iter: 0, slot: 0 },
        McmcStep { iter: 1, slot: 0 },
        McmcStep { iter: 1, slot: 1 },
    ]
);
```
*/

use std::collections::HashMap;
use std::ops::Range;

/// One scheduled step. Both indices are 0-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct McmcStep {
    pub iter: usize,
    pub slot: usize,
}

/// A change to the schedule requested while it runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reschedule {
    /// Appends `n` slots to every following iteration.
    AddSlots(usize),
    /// Skips the slot for the rest of the run.
    Remove(usize),
    /// Skips the slot during `iters`, replacing any earlier window for it.
    Exclude { slot: usize, iters: Range<usize> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct McmcSchedule {
    num_mcmc_steps: usize,
    num_updates: usize,
    exclusions: HashMap<usize, Range<usize>>,
    cursor: Option<McmcStep>,
}

impl McmcSchedule {
    pub fn new(num_mcmc_steps: usize, num_updates: usize) -> Self {
        Self {
            num_mcmc_steps,
            num_updates,
            exclusions: HashMap::new(),
            cursor: None,
        }
    }

    pub fn num_mcmc_steps(&self) -> usize {
        self.num_mcmc_steps
    }

    pub fn num_updates(&self) -> usize {
        self.num_updates
    }

    /// The step most recently yielded.
    pub fn current(&self) -> Option<McmcStep> {
        self.cursor
    }

    pub fn is_excluded(&self, step: McmcStep) -> bool {
        self.exclusions
            .get(&step.slot)
            .is_some_and(|r| r.contains(&step.iter))
    }

    pub fn exclude(&mut self, slot: usize, iters: Range<usize>) {
        self.exclusions.insert(slot, iters);
    }

    pub fn reschedule(&mut self, change: Reschedule) {
        match change {
            Reschedule::AddSlots(n) => self.num_updates += n,
            Reschedule::Remove(slot) => {
                let from = self.cursor.map_or(0, |s| s.iter);
                self.exclusions.insert(slot, from..usize::MAX);
            }
            Reschedule::Exclude { slot, iters } => self.exclude(slot, iters),
        }
    }

    fn advance(&self, step: McmcStep) -> McmcStep {
        if step.slot + 1 >= self.num_updates {
            McmcStep {
                iter: step.iter + 1,
                slot: 0,
            }
        } else {
            McmcStep {
                iter: step.iter,
                slot: step.slot + 1,
            }
        }
    }
}

impl Iterator for McmcSchedule {
    type Item = McmcStep;

    fn next(&mut self) -> Option<McmcStep> {
        if self.num_updates == 0 {
            return None;
        }
        let mut step = match self.cursor {
            None => McmcStep { iter: 0, slot: 0 },
            Some(s) if s.iter >= self.num_mcmc_steps => return None,
            Some(s) => self.advance(s),
        };
        while step.iter < self.num_mcmc_steps && self.is_excluded(step) {
            step = self.advance(step);
        }
        self.cursor = Some(step);
        (step.iter < self.num_mcmc_steps).then_some(step)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(steps: &[McmcStep]) -> Vec<(usize, usize)> {
        steps.iter().map(|s| (s.iter, s.slot)).collect()
    }

    #[test]
    fn enumerates_row_major() {
        let steps: Vec<_> = McmcSchedule::new(3, 2).collect();
        assert_eq!(
            pairs(&steps),
            vec![(0, 0), (0, 1), (1, 0), (1, 1), (2, 0), (2, 1)]
        );
    }

    #[test]
    fn skips_exactly_the_excluded_ranges() {
        let mut schedule = McmcSchedule::new(5, 3);
        schedule.exclude(0, 0..2);
        schedule.exclude(2, 3..10);
        let steps: Vec<_> = schedule.clone().collect();

        let expected: Vec<McmcStep> = (0..5)
            .flat_map(|iter| (0..3).map(move |slot| McmcStep { iter, slot }))
            .filter(|s| !(s.slot == 0 && s.iter < 2) && !(s.slot == 2 && s.iter >= 3))
            .collect();
        assert_eq!(steps, expected);
        assert!(steps.iter().all(|&s| !schedule.is_excluded(s)));
    }

    #[test]
    fn empty_schedules_yield_nothing() {
        assert_eq!(McmcSchedule::new(0, 3).count(), 0);
        assert_eq!(McmcSchedule::new(3, 0).count(), 0);
        let mut all_out = McmcSchedule::new(4, 1);
        all_out.exclude(0, 0..4);
        assert_eq!(all_out.count(), 0);
    }

    #[test]
    fn exhausted_schedule_stays_exhausted() {
        let mut schedule = McmcSchedule::new(1, 1);
        assert!(schedule.next().is_some());
        assert!(schedule.next().is_none());
        assert!(schedule.next().is_none());
    }

    #[test]
    fn rescheduling_mid_iteration_only_changes_later_steps() {
        let mut schedule = McmcSchedule::new(3, 2);
        let mut seen = Vec::new();
        while let Some(step) = schedule.next() {
            seen.push(step);
            if step == (McmcStep { iter: 1, slot: 0 }) {
                schedule.reschedule(Reschedule::AddSlots(1));
                schedule.reschedule(Reschedule::Remove(0));
            }
        }
        assert_eq!(
            pairs(&seen),
            vec![(0, 0), (0, 1), (1, 0), (1, 1), (1, 2), (2, 1), (2, 2)]
        );
    }

    #[test]
    fn exclusion_window_is_overwritten() {
        let mut schedule = McmcSchedule::new(4, 1);
        schedule.exclude(0, 0..2);
        schedule.reschedule(Reschedule::Exclude {
            slot: 0,
            iters: 3..4,
        });
        assert_eq!(pairs(&schedule.collect::<Vec<_>>()), vec![(0, 0), (1, 0), (2, 0)]);
    }
}
