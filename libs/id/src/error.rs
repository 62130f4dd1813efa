//! Error types for name and ID parsing.

use thiserror::Error;

/// Errors that can occur when parsing or validating identifiers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The identifier string is empty.
    #[error("identifier cannot be empty")]
    Empty,

    /// The identifier exceeds the maximum length.
    #[error("identifier too long: {len} bytes (max {max})")]
    TooLong { len: usize, max: usize },

    /// The identifier contains a character that cannot appear in a store key.
    #[error("invalid character {found:?} in {kind} '{value}'")]
    InvalidCharacter {
        kind: &'static str,
        value: String,
        found: char,
    },

    /// The ID has an invalid prefix.
    #[error("invalid ID prefix: expected '{expected}', got '{actual}'")]
    InvalidPrefix {
        expected: &'static str,
        actual: String,
    },

    /// The ID is missing the underscore separator.
    #[error("ID missing underscore separator")]
    MissingSeparator,

    /// The ULID portion of the ID is invalid.
    #[error("invalid ULID: {0}")]
    InvalidUlid(String),
}

impl IdError {
    /// Returns true if this error indicates the input was empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, IdError::Empty)
    }

    /// Returns true if this error indicates a disallowed character.
    pub fn is_character_error(&self) -> bool {
        matches!(self, IdError::InvalidCharacter { .. })
    }
}
