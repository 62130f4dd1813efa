//! Registry error types.

use fleet_coord::CoordError;
use fleet_id::{IdError, MachineId, UnitName};
use thiserror::Error;

/// Result type for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Registry errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The named record does not exist.
    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    /// A unit with this name already exists.
    #[error("unit already exists: {0}")]
    AlreadyExists(UnitName),

    /// The unit is placed on a live machine.
    #[error("unit {unit} already scheduled to {machine}")]
    AlreadyScheduled { unit: UnitName, machine: MachineId },

    /// The store stayed unreachable after bounded retries.
    #[error("coordination store unavailable: {0}")]
    Unavailable(#[source] CoordError),

    /// The unit signature is missing or does not verify.
    #[error("signature invalid for unit {0}")]
    SignatureInvalid(UnitName),

    #[error(transparent)]
    InvalidName(#[from] IdError),

    /// A stored record could not be decoded.
    #[error("corrupt record at {key}: {reason}")]
    Corrupt { key: String, reason: String },

    /// Non-transient store failure.
    #[error("coordination error: {0}")]
    Coordination(#[source] CoordError),
}

impl RegistryError {
    pub(crate) fn unit_not_found(name: &UnitName) -> Self {
        Self::NotFound {
            kind: "unit",
            name: name.to_string(),
        }
    }

    pub(crate) fn machine_not_found(id: &MachineId) -> Self {
        Self::NotFound {
            kind: "machine",
            name: id.to_string(),
        }
    }

    /// Returns true if this is a not found error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns true if the store could not be reached.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }

    /// Returns true if a placement claim lost to another holder.
    pub fn is_already_scheduled(&self) -> bool {
        matches!(self, Self::AlreadyScheduled { .. })
    }
}

impl From<CoordError> for RegistryError {
    fn from(err: CoordError) -> Self {
        if err.is_transient() {
            Self::Unavailable(err)
        } else {
            Self::Coordination(err)
        }
    }
}
