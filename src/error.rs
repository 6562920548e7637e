//! Error type shared by every stage of a run, from construction to the final save.

use thiserror::Error;

/// Everything that can go wrong while configuring or running a chain.
///
/// Configuration variants are raised by constructors, so a misconfigured kernel or adaptation
/// never reaches the run loop. The remaining variants surface the first time the failing
/// collaborator is used.
#[derive(Debug, Error)]
pub enum McmcError {
    #[error("Invalid transition kernel: {0}")]
    InvalidKernel(String),

    #[error("Invalid adaptation settings: {0}")]
    InvalidAdaptation(String),

    #[error("Invalid prior: {0}")]
    InvalidPrior(String),

    #[error("Invalid sampler configuration: {0}")]
    InvalidConfig(String),

    #[error("{0} is not implemented for this type")]
    NotImplemented(&'static str),

    #[error("Update in slot {slot} found no proposal with finite prior after {attempts} attempts")]
    InfeasibleProposal { slot: usize, attempts: usize },

    #[error("Target law failed: {0}")]
    Law(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[cfg(feature = "csv")]
    #[error(transparent)]
    Csv(#[from] csv::Error),
}

pub type Result<T> = std::result::Result<T, McmcError>;
