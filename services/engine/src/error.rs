//! Engine error types.

use fleet_registry::RegistryError;
use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that can occur during scheduling.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// The leader lease lapsed; no further writes may be issued.
    #[error("engine leadership lost")]
    LeadershipLost,
}

impl EngineError {
    /// Returns true if this engine must stop scheduling.
    pub fn is_leadership_lost(&self) -> bool {
        matches!(self, Self::LeadershipLost)
    }

    /// Returns true if the pass failed on an unreachable store.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Registry(e) if e.is_unavailable())
    }
}
