//! Controller error types.

use std::path::PathBuf;

use gcefleet_compute::ProviderError;
use gcefleet_keys::KeyError;
use thiserror::Error;

use crate::fleet::ValidationError;
use crate::store::StoreError;

/// Result type for controller operations.
pub type ControllerResult<T> = Result<T, ControllerError>;

/// Errors raised while reconciling the hierarchy.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// A provider call failed. The attempt is abandoned and retried on a
    /// later scheduler pass.
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    /// The local record store failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Fleet configuration is malformed or inconsistent.
    #[error("invalid fleet configuration: {0}")]
    Validation(#[from] ValidationError),

    /// The fleet configuration file could not be read.
    #[error("failed to read fleet configuration {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A record an operation targets does not exist locally.
    #[error("{kind} does not exist: {key}")]
    NotFoundLocal { kind: &'static str, key: String },

    /// An operation was attempted against a record in the wrong state.
    #[error("{kind} {key}: {reason}")]
    InvariantViolation {
        kind: &'static str,
        key: String,
        reason: String,
    },

    /// A task parameter or persisted key could not be parsed.
    #[error("invalid key: {0}")]
    Key(#[from] KeyError),

    /// A dispatched task could not be routed to a handler.
    #[error("invalid task: {0}")]
    InvalidTask(String),
}

impl ControllerError {
    /// Shorthand for a missing local record.
    pub fn not_found(kind: &'static str, key: impl ToString) -> Self {
        Self::NotFoundLocal {
            kind,
            key: key.to_string(),
        }
    }

    /// Shorthand for an invariant violation.
    pub fn invariant(kind: &'static str, key: impl ToString, reason: impl Into<String>) -> Self {
        Self::InvariantViolation {
            kind,
            key: key.to_string(),
            reason: reason.into(),
        }
    }

    /// Errors that only mean "nothing to do right now": a later pass sees a
    /// consistent picture again without operator involvement.
    pub fn is_benign(&self) -> bool {
        matches!(
            self,
            Self::NotFoundLocal { .. } | Self::InvariantViolation { .. }
        )
    }
}

/// Whether an operation changed any state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// State was written.
    Applied,

    /// Nothing to do; state was left as it was.
    Unchanged,
}

impl Transition {
    /// Returns true if state was written.
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_benign_errors() {
        assert!(ControllerError::not_found("Instance", "inst_x").is_benign());
        assert!(ControllerError::invariant("Instance", "inst_x", "not drained").is_benign());
        assert!(!ControllerError::Provider(ProviderError::status(500, "boom")).is_benign());
    }

    #[test]
    fn test_not_found_message() {
        let err = ControllerError::not_found("InstanceGroupManager", "tmpl_a/rev_b/zone_c");
        assert_eq!(
            err.to_string(),
            "InstanceGroupManager does not exist: tmpl_a/rev_b/zone_c"
        );
    }
}
