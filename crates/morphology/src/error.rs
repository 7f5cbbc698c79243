//! Error types for morphology parsing and validation.

use thiserror::Error;

/// Result type for morphology operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while loading a morphology.
#[derive(Debug, Error)]
pub enum Error {
    /// The morphology text failed to parse or validate.
    #[error("invalid morphology '{path}': {reason}")]
    InvalidMorphology {
        /// Path (or name) of the offending document.
        path: String,
        /// Human-readable description of what is wrong.
        reason: String,
    },
}

impl Error {
    /// Build an `InvalidMorphology` error for the given document.
    #[must_use]
    pub fn invalid(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidMorphology {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
