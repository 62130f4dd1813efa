//! Agent error types.

use fleet_id::UnitName;
use fleet_registry::RegistryError;
use thiserror::Error;

/// Result type for agent operations.
pub type AgentResult<T> = Result<T, AgentError>;

/// Errors raised while converging local units.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// The local runtime refused an operation.
    #[error("runtime error for {unit}: {reason}")]
    Runtime { unit: UnitName, reason: String },

    /// A unit could not be converged after bounded retries.
    #[error("reconciliation of {unit} failed: {reason}")]
    Reconciliation { unit: UnitName, reason: String },
}

impl AgentError {
    pub fn runtime(unit: &UnitName, err: impl std::fmt::Display) -> Self {
        Self::Runtime {
            unit: unit.clone(),
            reason: err.to_string(),
        }
    }

    /// Returns true if the failure came from an unreachable store.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Registry(e) if e.is_unavailable())
    }

    pub fn is_reconciliation(&self) -> bool {
        matches!(self, Self::Reconciliation { .. })
    }
}
