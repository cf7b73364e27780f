use std::path::{Path, PathBuf};

use thiserror::Error;

/// A3S Bundle error types
#[derive(Error, Debug)]
pub enum BundleError {
    /// Source path or remote reference does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Filesystem object cannot be read or written
    #[error("Permission denied: {}: {source}", path.display())]
    PermissionDenied {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Malformed configuration (bad platform string, zero quota, ...)
    #[error("Invalid option: {0}")]
    InvalidOption(String),

    /// Quota exceeded or path traversal detected. Never retried.
    #[error("Security violation: {0}")]
    SecurityViolation(String),

    /// Network or 5xx-class registry failure, eligible for retry
    #[error("Transient transport error: {operation} - {message}")]
    TransientTransport { operation: String, message: String },

    /// Authentication, 4xx-class or malformed-manifest failure
    #[error("Transport error: {operation} - {message}")]
    NonTransientTransport { operation: String, message: String },

    /// Caller-initiated cancellation or deadline expiry
    #[error("Canceled: {0}")]
    Canceled(String),

    /// I/O error on a specific path
    #[error("I/O error: {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Downloaded content does not hash to the expected digest
    #[error("Digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Terminal failure of a transfer unit after one or more attempts
    #[error("{operation} failed after {attempts} attempt(s): {source}")]
    TransferFailed {
        operation: String,
        attempts: u32,
        source: Box<BundleError>,
    },
}

/// Taxonomy class of a [`BundleError`], resolved through transfer wrappers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    PermissionDenied,
    InvalidOption,
    SecurityViolation,
    TransientTransport,
    NonTransientTransport,
    Canceled,
    Io,
    DigestMismatch,
    Serialization,
}

impl BundleError {
    /// Wrap an I/O error with the path it occurred on.
    ///
    /// `NotFound` and `PermissionDenied` I/O errors are promoted to their
    /// dedicated variants so callers can match on them.
    pub fn io(path: impl AsRef<Path>, err: std::io::Error) -> Self {
        let path = path.as_ref().to_path_buf();
        match err.kind() {
            std::io::ErrorKind::NotFound => {
                BundleError::NotFound(format!("{}: {}", path.display(), err))
            }
            std::io::ErrorKind::PermissionDenied => {
                BundleError::PermissionDenied { path, source: err }
            }
            _ => BundleError::Io { path, source: err },
        }
    }

    /// Taxonomy class of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            Self::InvalidOption(_) => ErrorKind::InvalidOption,
            Self::SecurityViolation(_) => ErrorKind::SecurityViolation,
            Self::TransientTransport { .. } => ErrorKind::TransientTransport,
            Self::NonTransientTransport { .. } => ErrorKind::NonTransientTransport,
            Self::Canceled(_) => ErrorKind::Canceled,
            Self::Io { .. } => ErrorKind::Io,
            Self::DigestMismatch { .. } => ErrorKind::DigestMismatch,
            Self::SerializationError(_) => ErrorKind::Serialization,
            Self::TransferFailed { source, .. } => source.kind(),
        }
    }

    /// Whether the Transfer Engine may retry after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransientTransport { .. } | Self::DigestMismatch { .. }
        )
    }

    /// Number of attempts recorded on a terminal transfer failure.
    pub fn attempts(&self) -> Option<u32> {
        match self {
            Self::TransferFailed { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for BundleError {
    fn from(err: serde_json::Error) -> Self {
        BundleError::SerializationError(err.to_string())
    }
}

/// Result type alias for A3S Bundle operations
pub type Result<T> = std::result::Result<T, BundleError>;
