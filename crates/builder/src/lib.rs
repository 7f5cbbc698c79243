//! The staging assembler and builder.
//!
//! Takes one build unit whose dependencies are satisfied in the cache and
//! produces its artifact: assembles a staging root from dependency tarballs,
//! checks out the pinned source, runs the build phases under a scrubbed
//! environment, and captures the install tree into split artifacts. Stratum
//! and system units are assembled by aggregation rather than built.

mod assemble;
mod capture;
mod chunk;
mod env;
mod error;
mod phases;
mod staging;

pub use assemble::assemble_aggregate;
pub use chunk::{BuildOutcome, ChunkBuilder};
pub use env::{ENV_WHITELIST, build_environment};
pub use error::{Error, Result};
pub use staging::StagingArea;

use morph_graph::TargetPolicy;
use std::path::PathBuf;

/// Builder configuration, threaded explicitly from startup.
#[derive(Debug, Clone)]
pub struct BuilderConfig {
    /// Target policy: arch, CFLAGS, toolchain, tooling prefix.
    pub policy: TargetPolicy,
    /// Keep the host `PATH` instead of the scrubbed default.
    pub keep_path: bool,
    /// Directory of ccache wrappers to prepend to `PATH`, if any.
    pub ccache_dir: Option<PathBuf>,
    /// Default `-jN` parallelism for `MAKEFLAGS`.
    pub jobs: u32,
    /// Echo build log lines to stdout while building.
    pub echo_log: bool,
    /// Where staging areas are created.
    pub staging_root: PathBuf,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            policy: TargetPolicy::default(),
            keep_path: false,
            ccache_dir: None,
            jobs: default_jobs(),
            echo_log: false,
            staging_root: std::env::temp_dir().join("morph-staging"),
        }
    }
}

/// One job per available core, at least one.
#[must_use]
pub fn default_jobs() -> u32 {
    std::thread::available_parallelism()
        .map(|n| u32::try_from(n.get()).unwrap_or(1))
        .unwrap_or(1)
}
