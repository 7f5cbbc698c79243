//! Error types for graph construction.

use thiserror::Error;

/// Result type for graph operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors detected while building the artifact graph.
///
/// All of these are definitions errors, fatal to the whole request and
/// detected before any unit is dispatched.
#[derive(Debug, Error)]
pub enum Error {
    /// The dependency graph contains a cycle.
    #[error("dependency cycle: {path}")]
    DependencyCycle {
        /// Human-readable description of the cycle.
        path: String,
    },

    /// Something references an artifact or stratum that does not exist.
    #[error("unsatisfied dependency: {name}")]
    UnsatisfiedDependency {
        /// The missing name.
        name: String,
    },

    /// A morphology failed to load.
    #[error(transparent)]
    Morphology(#[from] morph_morphology::Error),

    /// A source could not be resolved.
    #[error(transparent)]
    Source(#[from] morph_source::Error),
}
