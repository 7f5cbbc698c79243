//! The artifact build graph.
//!
//! Expands a system morphology into a DAG of *build units*, one per artifact,
//! and computes a stable cache key for each. The DAG is the unit of
//! scheduling: edges are happens-before constraints, keys are the only
//! identity artifacts have.

mod builder;
mod error;
mod key;
mod unit;

pub use builder::{BuildGraph, GraphBuilder};
pub use error::{Error, Result};
pub use key::{CacheKey, KeyHasher};
pub use unit::{BuildPlan, BuildUnit, PlannedUnit, TargetPolicy, UnitKind, UnitSource};

/// Index of a unit within a [`BuildGraph`].
pub use petgraph::graph::NodeIndex;
