//! Coordination store error types.

use std::time::Duration;

use thiserror::Error;

use crate::store::LeaseId;

/// Result type for coordination store operations.
pub type CoordResult<T> = Result<T, CoordError>;

/// Coordination store errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoordError {
    /// The store could not be reached.
    #[error("coordination store unavailable: {0}")]
    Unavailable(String),

    /// A bounded operation did not complete in time.
    #[error("coordination operation timed out after {0:?}")]
    Timeout(Duration),

    /// The compare-and-swap precondition did not hold.
    #[error("compare-and-swap failed on {key}")]
    CasFailed {
        key: String,
        current: Option<String>,
    },

    /// The lease is unknown, expired or revoked.
    #[error("lease {0} expired or revoked")]
    LeaseExpired(LeaseId),
}

impl CoordError {
    /// Returns true for failures that callers should retry with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout(_))
    }

    /// Returns true if this is a failed compare-and-swap.
    pub fn is_cas_failure(&self) -> bool {
        matches!(self, Self::CasFailed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(CoordError::Unavailable("down".into()).is_transient());
        assert!(CoordError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(!CoordError::LeaseExpired(LeaseId::new(7)).is_transient());

        let cas = CoordError::CasFailed {
            key: "/k".into(),
            current: None,
        };
        assert!(!cas.is_transient());
        assert!(cas.is_cas_failure());
    }
}
