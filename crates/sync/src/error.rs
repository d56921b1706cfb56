//! Error types for `unrelated-sync`.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for sync primitives.
pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Error, Debug)]
pub enum SyncError {
    /// The acquire timeout elapsed while the waiter was still queued.
    #[error("timed out after {waited:?} waiting to acquire '{mutex}'")]
    AcquireTimeout { mutex: String, waited: Duration },

    /// The caller's cancel signal fired before the lock was granted.
    #[error("acquisition of '{mutex}' was cancelled")]
    Aborted { mutex: String },

    /// Granting the lock to this waiter would close a cycle in the waiter
    /// graph.
    #[error("deadlock detected: '{owner}' waiting on '{mutex}' closes a cycle")]
    Deadlock { mutex: String, owner: String },

    /// The mutex was force-released while this waiter was queued.
    #[error("'{mutex}' was force-released while waiting")]
    ForceReleased { mutex: String },

    /// The acquisition failed for a reason other than the above.
    #[error("failed to acquire '{mutex}': {reason}")]
    AcquireFailed { mutex: String, reason: String },

    /// The closure passed to `try_run_exclusive` returned an error.
    #[error("exclusive section failed")]
    ExecutionFailed {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Cache keys must be non-empty strings.
    #[error("cache key must be a non-empty string")]
    InvalidKey,

    /// Cache TTLs must be greater than zero.
    #[error("cache TTL must be greater than zero")]
    InvalidTtl,
}

impl SyncError {
    /// Short machine-readable code for this error.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            SyncError::AcquireTimeout { .. } => "ACQUIRE_TIMEOUT",
            SyncError::Aborted { .. } => "ABORTED",
            SyncError::Deadlock { .. } => "DEADLOCK",
            SyncError::ForceReleased { .. } => "FORCE_RELEASE",
            SyncError::AcquireFailed { .. } => "ACQUIRE_FAILED",
            SyncError::ExecutionFailed { .. } => "EXECUTION_FAILED",
            SyncError::InvalidKey => "INVALID_KEY",
            SyncError::InvalidTtl => "INVALID_TTL",
        }
    }
}
