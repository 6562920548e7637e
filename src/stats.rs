//! Online statistics tracked while a chain runs: running moments of the state and rolling
//! acceptance rates per update slot.

use ndarray::prelude::*;
use std::collections::VecDeque;

/// Default width of the rolling acceptance window.
pub const DEFAULT_ACCEPTANCE_WINDOW: usize = 100;

fn outer(a: ArrayView1<f64>) -> Array2<f64> {
    let col = a.insert_axis(Axis(1));
    let row = a.insert_axis(Axis(0));
    col.dot(&row)
}

/**
Running mean and covariance of a stream of vectors.

The tracker starts from one observation (`n = 1`), so the recurrence never divides by zero.
The covariance is normalized by `n - 1`.

# Examples

```rust
use mcmc_updates::stats::RunningMoments;

let mut moments = RunningMoments::new(&[1.0, 0.0]);
moments.push(&[3.0, 2.0]);
assert_eq!(moments.n(), 2);
assert_eq!(moments.mean().to_vec(), vec![2.0, 1.0]);
assert_eq!(moments.cov()[[0, 1]], 2.0);
```
*/
#[derive(Debug, Clone, PartialEq)]
pub struct RunningMoments {
    n: u64,
    mean: Array1<f64>,
    cov: Array2<f64>,
}

impl RunningMoments {
    pub fn new(initial: &[f64]) -> Self {
        let d = initial.len();
        Self {
            n: 1,
            mean: Array1::from(initial.to_vec()),
            cov: Array2::zeros((d, d)),
        }
    }

    pub fn push(&mut self, x: &[f64]) {
        let n = self.n as f64;
        let x = ArrayView1::from(x);
        let old_sum_sq = &self.cov * ((n - 1.0) / n) + outer(self.mean.view());
        self.mean = &self.mean * (n / (n + 1.0)) + &x / (n + 1.0);
        let new_sum_sq = old_sum_sq + outer(x) / n;
        self.cov = new_sum_sq - outer(self.mean.view()) * ((n + 1.0) / n);
        self.n += 1;
    }

    pub fn n(&self) -> u64 {
        self.n
    }

    pub fn mean(&self) -> ArrayView1<f64> {
        self.mean.view()
    }

    pub fn cov(&self) -> ArrayView2<f64> {
        self.cov.view()
    }
}

/// Acceptance rate over the last `window` outcomes of one slot, updated in O(1).
///
/// Until the window has filled up, missing outcomes count as rejections.
#[derive(Debug, Clone, PartialEq)]
pub struct RollingAcceptance {
    window: usize,
    recent: VecDeque<bool>,
    rate: f64,
    history: Vec<f64>,
}

impl RollingAcceptance {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            recent: VecDeque::with_capacity(window.max(1)),
            rate: 0.0,
            history: Vec::new(),
        }
    }

    pub fn push(&mut self, accepted: bool) {
        let dropped = if self.recent.len() == self.window {
            self.recent.pop_front().unwrap_or(false)
        } else {
            false
        };
        self.recent.push_back(accepted);
        self.rate += (accepted as i32 - dropped as i32) as f64 / self.window as f64;
        self.history.push(self.rate);
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Rate after every outcome pushed so far.
    pub fn history(&self) -> &[f64] {
        &self.history
    }
}

/// Statistics owned by the global workspace and refreshed after every executed step.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainStats {
    moments: RunningMoments,
    window: usize,
    rolling: Vec<RollingAcceptance>,
    proposed: Vec<u64>,
    accepted: Vec<u64>,
}

impl ChainStats {
    pub fn new(initial_state: &[f64], n_slots: usize, window: usize) -> Self {
        Self {
            moments: RunningMoments::new(initial_state),
            window,
            rolling: vec![RollingAcceptance::new(window); n_slots],
            proposed: vec![0; n_slots],
            accepted: vec![0; n_slots],
        }
    }

    /// Folds the post-step `state` of `slot` into the statistics.
    pub fn update(&mut self, state: &[f64], slot: usize, accepted: bool) {
        if slot >= self.rolling.len() {
            let window = self.window;
            self.rolling.resize_with(slot + 1, || RollingAcceptance::new(window));
            self.proposed.resize(slot + 1, 0);
            self.accepted.resize(slot + 1, 0);
        }
        self.moments.push(state);
        self.rolling[slot].push(accepted);
        self.proposed[slot] += 1;
        self.accepted[slot] += accepted as u64;
    }

    pub fn n(&self) -> u64 {
        self.moments.n()
    }

    pub fn mean(&self) -> ArrayView1<f64> {
        self.moments.mean()
    }

    pub fn cov(&self) -> ArrayView2<f64> {
        self.moments.cov()
    }

    pub fn rolling_acceptance(&self, slot: usize) -> Option<&RollingAcceptance> {
        self.rolling.get(slot)
    }

    /// Acceptance rate of `slot` over the whole run so far.
    pub fn acceptance_rate(&self, slot: usize) -> Option<f64> {
        match (self.proposed.get(slot), self.accepted.get(slot)) {
            (Some(&p), Some(&a)) if p > 0 => Some(a as f64 / p as f64),
            _ => None,
        }
    }
}
