//! Error types for the builder.

use morph_morphology::Phase;
use thiserror::Error;

/// Result type for builder operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while building a unit.
#[derive(Debug, Error)]
pub enum Error {
    /// A build command exited non-zero. Fatal to the unit; the build log
    /// is preserved.
    #[error("build command failed: unit '{unit}', phase {phase}, exit code {exit_code}")]
    BuildCommandFailed {
        /// The failing unit's artifact name.
        unit: String,
        /// The phase the command belonged to.
        phase: Phase,
        /// The command's exit code (negative signal number if killed).
        exit_code: i32,
    },

    /// Staging or capture I/O failed. Transient: retried once by the
    /// executor.
    #[error("staging I/O error during {operation}: {source}")]
    StagingIo {
        /// What was being attempted.
        operation: String,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The source for the unit could not be materialised.
    #[error(transparent)]
    Source(#[from] morph_source::Error),

    /// The artifact cache failed.
    #[error(transparent)]
    Cache(#[from] morph_artifact_cache::Error),
}

impl Error {
    pub(crate) fn staging(operation: impl Into<String>, source: std::io::Error) -> Self {
        Self::StagingIo {
            operation: operation.into(),
            source,
        }
    }
}
