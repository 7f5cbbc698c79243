//! Error types for the distributed build layer.

use thiserror::Error;

/// Result type for distbuild operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the distributed build layer.
#[derive(Debug, Error)]
pub enum Error {
    /// A connection carried a malformed frame or an unexpected message.
    /// The offending connection is closed; its in-flight units revert to
    /// ready.
    #[error("protocol error: {reason}")]
    Protocol {
        /// Description of the violation.
        reason: String,
    },

    /// A worker connection was lost. Not reported to the initiator unless
    /// no worker remains.
    #[error("worker disconnected: {name}")]
    WorkerDisconnected {
        /// The worker's registered name.
        name: String,
    },

    /// Socket I/O failed.
    #[error("connection I/O error: {source}")]
    Io {
        /// The underlying error.
        #[from]
        source: std::io::Error,
    },

    /// The remote cache failed.
    #[error(transparent)]
    Cache(#[from] morph_artifact_cache::Error),
}

impl Error {
    /// Build a protocol error.
    #[must_use]
    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::Protocol {
            reason: reason.into(),
        }
    }
}
