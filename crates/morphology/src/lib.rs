//! Morphology definitions for morph.
//!
//! A morphology is a declarative YAML document describing one of four kinds
//! of buildable entity: a *chunk* (one source project), a *stratum* (a layer
//! of chunks with build ordering), a *system* (an assembly of strata into a
//! root filesystem), or a *cluster* (deployment targets, not built here).
//!
//! This crate parses morphology text into typed records, validates them,
//! fills defaults, and produces the canonical serialised form that feeds
//! cache-key computation.

mod build_system;
mod error;
mod loader;
mod schema;

pub use build_system::{BuildSystem, build_system, is_known_build_system};
pub use error::{Error, Result};
pub use loader::load_morphology;
pub use schema::{
    BuildMode, ChunkMorphology, ChunkSpec, ClusterMorphology, Kind, Morphology, Phase,
    SplitRule, StratumInclude, StratumMorphology, StratumRef, SystemMorphology,
};
