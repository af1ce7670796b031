//! Errors for identifier parsing.

use thiserror::Error;

/// Errors that can occur when parsing an identifier.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The input was empty.
    #[error("ID cannot be empty")]
    Empty,

    /// The input has no `_` between prefix and ULID.
    #[error("ID missing underscore separator")]
    MissingSeparator,

    /// The prefix names a different resource type.
    #[error("invalid ID prefix: expected '{expected}', got '{actual}'")]
    InvalidPrefix {
        expected: &'static str,
        actual: String,
    },

    /// The ULID portion did not parse.
    #[error("invalid ULID: {0}")]
    InvalidUlid(String),
}

impl IdError {
    /// Returns true if the prefix did not match the expected resource type.
    pub fn is_prefix_error(&self) -> bool {
        matches!(self, IdError::InvalidPrefix { .. })
    }
}
