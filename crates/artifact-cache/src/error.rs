//! Error types for the artifact cache.

use std::path::PathBuf;
use thiserror::Error;

/// Result type for cache operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in cache operations.
#[derive(Debug, Error)]
pub enum Error {
    /// A filesystem operation failed. Transient from the executor's point of
    /// view: the claim is aborted and the unit retried once.
    #[error("cache I/O error during {operation} on {path}: {source}")]
    Io {
        /// What was being attempted.
        operation: &'static str,
        /// The path involved.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// An artifact filename didn't match `KEY.KIND.NAME`.
    #[error("malformed artifact filename '{filename}'")]
    MalformedFilename {
        /// The offending filename.
        filename: String,
    },

    /// A remote cache request failed.
    #[error("remote cache error: {reason}")]
    Remote {
        /// Description of the failure.
        reason: String,
    },

    /// The remote cache does not have the requested artifact.
    #[error("artifact not found in remote cache: {filename}")]
    NotFound {
        /// The requested filename.
        filename: String,
    },
}

impl Error {
    pub(crate) fn io(operation: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            operation,
            path: path.into(),
            source,
        }
    }

    pub(crate) fn remote(reason: impl Into<String>) -> Self {
        Self::Remote {
            reason: reason.into(),
        }
    }
}
