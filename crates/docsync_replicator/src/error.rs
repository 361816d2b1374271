//! Error types for the replication layer.

use docsync_core::{CoreError, ErrorDomain, ErrorInfo};
use thiserror::Error;

/// Result type for replicator operations.
pub type ReplicatorResult<T> = Result<T, ReplicatorError>;

/// Errors returned synchronously by the replication layer.
///
/// Failures that happen while a replication is running never surface here; they are
/// attached to the replicator status or to per-document results as an [`ErrorInfo`].
#[derive(Error, Debug)]
pub enum ReplicatorError {
    /// The replicator configuration is invalid.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// The operation is not allowed in the current state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Storage error.
    #[error("database error: {0}")]
    Core(#[from] CoreError),
}

impl ReplicatorError {
    /// Creates a configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    /// Creates a state error.
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState(message.into())
    }

    /// Returns true for optimistic-concurrency conflicts.
    pub fn is_conflict(&self) -> bool {
        matches!(self, ReplicatorError::Core(err) if err.is_conflict())
    }

    /// Converts to the code + domain pair used in statuses.
    pub fn to_info(&self) -> ErrorInfo {
        match self {
            ReplicatorError::Core(err) => err.to_info(),
            ReplicatorError::InvalidConfig(_) | ReplicatorError::InvalidState(_) => {
                ErrorInfo::new(ErrorDomain::Core, ErrorInfo::INVALID_PARAMETER, self.to_string())
            }
        }
    }
}
