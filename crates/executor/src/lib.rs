//! The local build-plan executor.
//!
//! Owns a [`BuildGraph`] for the duration of one build request and drives
//! every unit to a terminal state: schedule ready units onto a bounded
//! worker budget, skip cache hits, cascade cancellation over the dependents
//! of failures, and honour external cancellation. The executor task is the
//! sole mutator of the plan state; builds run in spawned tasks and report
//! back through a join set.

mod plan;

pub use plan::{ExecutionReport, ExecutorConfig, PlanExecutor, ProgressEvent, UnitState};

use thiserror::Error;

/// Result type for executor operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while executing a plan.
#[derive(Debug, Error)]
pub enum Error {
    /// A build task panicked or was lost.
    #[error("build task failed: {reason}")]
    TaskLost {
        /// Description of the loss.
        reason: String,
    },
}
