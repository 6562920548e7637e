//! A scheduled, multi-update Metropolis–Hastings engine.
//!
//! A run cycles through an ordered list of updates. Each update moves its own block of the
//! global parameter vector with a random-walk kernel and accepts or rejects the move against
//! a user-supplied [`TargetLaw`](distributions::TargetLaw). Kernels can tune themselves
//! along the way, and callbacks can watch the chain or save it.

pub mod adaptation;
pub mod callbacks;
pub mod distributions;
pub mod error;
pub mod io;
pub mod kernels;
pub mod priors;
pub mod sampler;
pub mod schedule;
pub mod stats;
pub mod update;
pub mod workspace;

pub use error::{McmcError, Result};
