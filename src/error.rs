//! Error taxonomy shared by every fallible operation in the engine.
//!
//! Recoverable numerical conditions ([`PhyloError::NumericalUnderflow`],
//! [`PhyloError::ModelSingularity`]) are distinguished from fatal structural ones
//! ([`PhyloError::InvariantViolation`], [`PhyloError::EmptyInput`]) so callers can apply the
//! propagation policy from the spec without re-deriving it at every call site.

use thiserror::Error;

/// Engine-wide result alias.
pub type Result<T> = std::result::Result<T, PhyloError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PhyloError {
    /// A merge or likelihood computation produced total probability mass below the
    /// numerical floor (~1e-300). Recovered locally: the caller treats the candidate
    /// placement as unattainable and continues search.
    #[error("numerical underflow during merge: total mass {mass:e} below floor")]
    NumericalUnderflow { mass: f64 },

    /// A region list failed coverage (every region list must span `[0, L)`) or an `O`
    /// region was missing its likelihood vector. Fatal.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// The re-estimated rate matrix had a zero row or a non-finite entry. Recovered by
    /// falling back to the last good matrix.
    #[error("model singularity: re-estimated rate matrix is degenerate ({0})")]
    ModelSingularity(String),

    /// No samples were supplied, or the reference sequence has zero length. Fatal at
    /// startup.
    #[error("empty input: {0}")]
    EmptyInput(String),
}

impl PhyloError {
    /// Whether this error kind is fatal to the current run (`true`) or silently
    /// recovered by the caller (`false`). See the propagation policy in the spec's
    /// error-handling section.
    pub fn is_fatal(&self) -> bool {
        match self {
            PhyloError::NumericalUnderflow { .. } | PhyloError::ModelSingularity(_) => false,
            PhyloError::InvariantViolation(_) | PhyloError::EmptyInput(_) => true,
        }
    }
}

/// Usage error raised by [`crate::config::ConfigBuilder::build`]. Kept distinct from
/// [`PhyloError`] because it is a construction-time mistake, not a runtime engine
/// condition.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("inconsistent configuration: {0}")]
pub struct ConfigError(pub &'static str);
