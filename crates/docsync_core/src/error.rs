//! Error types for docsync core.

use std::fmt;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in the engine-facing layer.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Optimistic-concurrency failure: the document changed since it was read.
    #[error("document update conflict on '{doc_id}'")]
    Conflict {
        /// The document that conflicted.
        doc_id: String,
    },

    /// Document or revision not found.
    #[error("not found: {what}")]
    NotFound {
        /// What was looked up.
        what: String,
    },

    /// A parameter was invalid.
    #[error("invalid parameter: {message}")]
    InvalidParameter {
        /// Description of the problem.
        message: String,
    },

    /// The database is closing or closed.
    #[error("database is closed")]
    DatabaseClosed,

    /// The resource is busy.
    #[error("busy: {message}")]
    Busy {
        /// Description of the contention.
        message: String,
    },

    /// Something went wrong that callers cannot recover from.
    #[error("unexpected error: {message}")]
    Unexpected {
        /// Description of the failure.
        message: String,
    },

    /// JSON encoding or decoding failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CoreError {
    /// Creates a conflict error.
    pub fn conflict(doc_id: impl Into<String>) -> Self {
        Self::Conflict {
            doc_id: doc_id.into(),
        }
    }

    /// Creates a not-found error.
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Creates an invalid parameter error.
    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        Self::InvalidParameter {
            message: message.into(),
        }
    }

    /// Creates a busy error.
    pub fn busy(message: impl Into<String>) -> Self {
        Self::Busy {
            message: message.into(),
        }
    }

    /// Creates an unexpected error.
    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected {
            message: message.into(),
        }
    }

    /// Returns true for optimistic-concurrency conflicts.
    pub fn is_conflict(&self) -> bool {
        matches!(self, CoreError::Conflict { .. })
    }

    /// Converts to the code + domain pair reported in statuses and results.
    pub fn to_info(&self) -> ErrorInfo {
        let code = match self {
            CoreError::Conflict { .. } => ErrorInfo::CONFLICT,
            CoreError::NotFound { .. } => ErrorInfo::NOT_FOUND,
            CoreError::InvalidParameter { .. } => ErrorInfo::INVALID_PARAMETER,
            CoreError::DatabaseClosed => ErrorInfo::NOT_OPEN,
            CoreError::Busy { .. } => ErrorInfo::BUSY,
            CoreError::Unexpected { .. } => ErrorInfo::UNEXPECTED_ERROR,
            CoreError::Json(_) => ErrorInfo::CORRUPT_DATA,
        };
        ErrorInfo::new(ErrorDomain::Core, code, self.to_string())
    }
}

/// Domain an error code belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorDomain {
    /// Storage and document errors.
    Core,
    /// OS-level errors.
    Posix,
    /// Network and DNS errors.
    Network,
    /// WebSocket close codes and HTTP statuses.
    WebSocket,
}

/// An error code + domain pair.
///
/// This is how failures travel across callback boundaries: attached to a replicator
/// status or to a per-document result, never thrown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    /// Error domain.
    pub domain: ErrorDomain,
    /// Domain-specific code.
    pub code: i32,
    /// Human-readable description.
    pub message: String,
}

impl ErrorInfo {
    /// Database is not open.
    pub const NOT_OPEN: i32 = 6;
    /// Document or revision not found.
    pub const NOT_FOUND: i32 = 7;
    /// Document update conflict.
    pub const CONFLICT: i32 = 8;
    /// Invalid parameter.
    pub const INVALID_PARAMETER: i32 = 9;
    /// Internal error.
    pub const UNEXPECTED_ERROR: i32 = 10;
    /// Data could not be decoded.
    pub const CORRUPT_DATA: i32 = 15;
    /// Resource busy.
    pub const BUSY: i32 = 16;

    /// Creates a new error info.
    pub fn new(domain: ErrorDomain, code: i32, message: impl Into<String>) -> Self {
        Self {
            domain,
            code,
            message: message.into(),
        }
    }

    /// Creates a core-domain conflict error.
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorDomain::Core, Self::CONFLICT, message)
    }

    /// Creates a core-domain unexpected error.
    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::new(ErrorDomain::Core, Self::UNEXPECTED_ERROR, message)
    }

    /// Returns true if this is the core-domain conflict sentinel.
    pub fn is_conflict(&self) -> bool {
        self.domain == ErrorDomain::Core && self.code == Self::CONFLICT
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}/{}: {}", self.domain, self.code, self.message)
    }
}

impl From<&CoreError> for ErrorInfo {
    fn from(err: &CoreError) -> Self {
        err.to_info()
    }
}
