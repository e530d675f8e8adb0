//! Error types for key parsing.

use thiserror::Error;

/// Errors that can occur when parsing keys.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeyError {
    /// The key string is empty.
    #[error("key cannot be empty")]
    Empty,

    /// A key segment has the wrong prefix.
    #[error("invalid key prefix: expected '{expected}', got '{actual}'")]
    InvalidPrefix {
        expected: &'static str,
        actual: String,
    },

    /// A key segment is missing the underscore separator.
    #[error("key segment missing underscore separator: {0}")]
    MissingSeparator(String),

    /// The digest portion is not a hex SHA-256 digest.
    #[error("invalid digest: {0}")]
    InvalidDigest(String),

    /// The key has the wrong number of path segments.
    #[error("invalid key depth: expected {expected} segments, got {actual}")]
    InvalidDepth { expected: usize, actual: usize },

    /// An identifying field is empty or contains a reserved character.
    #[error("invalid key field '{field}': {value:?}")]
    InvalidField { field: &'static str, value: String },
}

impl KeyError {
    /// Returns true if this error indicates the input was empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, KeyError::Empty)
    }

    /// Returns true if this error indicates a prefix mismatch.
    pub fn is_prefix_error(&self) -> bool {
        matches!(
            self,
            KeyError::InvalidPrefix { .. } | KeyError::MissingSeparator(_)
        )
    }
}
