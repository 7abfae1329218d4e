//! Error types for Fossorial

use serde::Serialize;
use thiserror::Error;

/// Result type alias using Fossorial Error
pub type Result<T> = std::result::Result<T, Error>;

/// Machine-readable error kind reported to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    PermissionDenied,
    RateLimited,
    Upstream,
    Conflict,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation => write!(f, "validation"),
            Self::NotFound => write!(f, "not_found"),
            Self::PermissionDenied => write!(f, "permission_denied"),
            Self::RateLimited => write!(f, "rate_limited"),
            Self::Upstream => write!(f, "upstream"),
            Self::Conflict => write!(f, "conflict"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

/// Fossorial error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("{kind} with ID {id} not found")]
    NotFound { kind: String, id: String },

    #[error("{kind} with ID {id} already exists")]
    AlreadyExists { kind: String, id: String },

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Upstream error from {target}: {message}")]
    Upstream { target: String, message: String },

    #[error("Request rejected by {target}: {message}")]
    Rejected { target: String, message: String },

    #[error("Operation timeout after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn not_found(kind: impl Into<String>, id: impl ToString) -> Self {
        Error::NotFound {
            kind: kind.into(),
            id: id.to_string(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub fn upstream(target: impl Into<String>, message: impl ToString) -> Self {
        Error::Upstream {
            target: target.into(),
            message: message.to_string(),
        }
    }

    pub fn rejected(target: impl Into<String>, message: impl ToString) -> Self {
        Error::Rejected {
            target: target.into(),
            message: message.to_string(),
        }
    }

    /// Kind reported to API callers
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_) | Error::InvalidConfig(_) => ErrorKind::Validation,
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::AlreadyExists { .. } => ErrorKind::Conflict,
            Error::PermissionDenied(_) => ErrorKind::PermissionDenied,
            Error::RateLimited(_) => ErrorKind::RateLimited,
            Error::Upstream { .. } | Error::Rejected { .. } | Error::Timeout { .. } => {
                ErrorKind::Upstream
            }
            Error::Io(_)
            | Error::Database(_)
            | Error::Serialization(_)
            | Error::Crypto(_)
            | Error::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether retrying the same call could succeed.
    ///
    /// A rejection is reported as upstream but never retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Upstream { .. } | Error::Timeout { .. })
    }
}
