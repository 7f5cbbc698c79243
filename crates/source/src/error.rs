//! Error types for source resolution.

use thiserror::Error;

/// Result type for source operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while resolving sources.
#[derive(Debug, Error)]
pub enum Error {
    /// A fetch failed or a ref could not be found.
    #[error("source unavailable: {repo}#{ref_name}: {reason}")]
    SourceUnavailable {
        /// Repository URL.
        repo: String,
        /// The ref (or SHA-1) that was requested.
        ref_name: String,
        /// Underlying failure description.
        reason: String,
    },
}

impl Error {
    /// Build a `SourceUnavailable` error.
    #[must_use]
    pub fn unavailable(
        repo: impl Into<String>,
        ref_name: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::SourceUnavailable {
            repo: repo.into(),
            ref_name: ref_name.into(),
            reason: reason.into(),
        }
    }
}
