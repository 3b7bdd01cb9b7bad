//! Error types for the multi-cloud orchestrator
//!
//! Every provider-native failure is mapped into this taxonomy before it
//! leaves an adapter, so callers of the orchestrator never see vendor
//! error types.

use crate::controlplane::composite::CompositeReport;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unified error type for the control plane
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Resource Errors
    // =========================================================================
    #[error("Resource not found: {kind}/{name}")]
    NotFound { kind: String, name: String },

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // =========================================================================
    // Remote Call Errors
    // =========================================================================
    #[error("Unavailable: {0}")]
    Unavailable(String),

    /// The remote side effect may or may not have happened
    #[error("Unknown outcome: {0}")]
    Unknown(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Composite Operations
    // =========================================================================
    #[error("Composite operation failed: {0}")]
    Composite(Box<CompositeReport>),

    // =========================================================================
    // Parse / IO Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// The eight error kinds exposed at the orchestrator boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    PermissionDenied,
    QuotaExceeded,
    Conflict,
    InvalidArgument,
    Unavailable,
    Unknown,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::NotFound => write!(f, "not_found"),
            ErrorKind::PermissionDenied => write!(f, "permission_denied"),
            ErrorKind::QuotaExceeded => write!(f, "quota_exceeded"),
            ErrorKind::Conflict => write!(f, "conflict"),
            ErrorKind::InvalidArgument => write!(f, "invalid_argument"),
            ErrorKind::Unavailable => write!(f, "unavailable"),
            ErrorKind::Unknown => write!(f, "unknown"),
            ErrorKind::Internal => write!(f, "internal"),
        }
    }
}

impl Error {
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Error::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    /// Project this error onto the public taxonomy
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::PermissionDenied(_) => ErrorKind::PermissionDenied,
            Error::QuotaExceeded(_) => ErrorKind::QuotaExceeded,
            Error::Conflict(_) => ErrorKind::Conflict,
            Error::InvalidArgument(_) | Error::Configuration(_) => ErrorKind::InvalidArgument,
            Error::Unavailable(_) => ErrorKind::Unavailable,
            Error::Unknown(_) => ErrorKind::Unknown,
            Error::Composite(report) => report.failure_kind().unwrap_or(ErrorKind::Internal),
            Error::Internal(_) | Error::JsonParse(_) | Error::YamlParse(_) | Error::Io(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Unavailable | ErrorKind::QuotaExceeded)
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Unavailable(_))
    }
}

/// Result type alias for the control plane
pub type Result<T> = std::result::Result<T, Error>;
