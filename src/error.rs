//! Error types for Rewind

use std::io;
use thiserror::Error;
use tracing::error;

use crate::checkpoint::CheckpointId;
use crate::child::ChildId;

/// Result type for Rewind operations
pub type Result<T> = std::result::Result<T, RewindError>;

/// Errors that can occur in the control plane
#[derive(Debug, Error)]
pub enum RewindError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Manifest or response could not be encoded/decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// No child with this id was ever created
    #[error("Unknown child: {0}")]
    UnknownChild(ChildId),

    /// Checkpoint id outside the registry
    #[error("Unknown checkpoint: {0}")]
    UnknownCheckpoint(CheckpointId),

    /// A request needing a paused active child arrived while none was bound
    #[error("Not paused")]
    NotPaused,

    /// The engine transport rejected an operation
    #[error("Engine error: {0}")]
    Engine(String),

    /// Coordinator bug: an internal invariant did not hold
    #[error("Invariant violated: {0}")]
    Invariant(String),

    /// The frontier child crashed; its unflushed execution cannot be rebuilt
    #[error("Frontier child {0} crashed")]
    FrontierCrashed(ChildId),

    /// The active child crashed while servicing a request at the pause point
    #[error("Child {0} crashed while servicing a debugger request")]
    RequestCrashed(ChildId),

    /// Too many crashes were recovered this session
    #[error("Crash budget exceeded: {crashes} crashes, limit {limit}")]
    CrashBudgetExceeded {
        /// Crashes observed so far
        crashes: usize,
        /// Configured limit
        limit: usize,
    },
}

impl RewindError {
    /// Build an invariant violation, logging it with context
    pub fn invariant(context: impl Into<String>) -> Self {
        let context = context.into();
        error!("Invariant violated: {}", context);
        Self::Invariant(context)
    }

    /// Whether the session cannot continue after this error
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Invariant(_)
                | Self::FrontierCrashed(_)
                | Self::RequestCrashed(_)
                | Self::CrashBudgetExceeded { .. }
        )
    }
}

/// Fail with an invariant violation unless `condition` holds
///
/// # Errors
///
/// Returns [`RewindError::Invariant`] when the condition is false
pub(crate) fn ensure(condition: bool, context: impl FnOnce() -> String) -> Result<()> {
    if condition {
        Ok(())
    } else {
        Err(RewindError::invariant(context()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(RewindError::invariant("bad").is_fatal());
        assert!(RewindError::FrontierCrashed(0).is_fatal());
        assert!(RewindError::CrashBudgetExceeded {
            crashes: 9,
            limit: 8
        }
        .is_fatal());
        assert!(!RewindError::NotPaused.is_fatal());
        assert!(!RewindError::UnknownChild(3).is_fatal());
    }

    #[test]
    fn test_ensure() {
        assert!(ensure(true, || "unused".to_string()).is_ok());
        let err = ensure(false, || "child 2 not paused".to_string()).unwrap_err();
        assert_eq!(err.to_string(), "Invariant violated: child 2 not paused");
    }
}
