//! Error types for name and ID parsing.

use thiserror::Error;

/// Errors that can occur when parsing or validating names and IDs.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The input string is empty.
    #[error("{kind} cannot be empty")]
    Empty { kind: &'static str },

    /// The input is longer than the type allows.
    #[error("{kind} is {len} characters, maximum is {max}")]
    TooLong {
        kind: &'static str,
        len: usize,
        max: usize,
    },

    /// The input contains a character outside `[A-Za-z0-9-]`.
    #[error("{kind} contains invalid character {found:?}")]
    InvalidCharacter { kind: &'static str, found: char },

    /// The ID is missing the required prefix.
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
        matches!(self, IdError::Empty { .. })
    }
}
