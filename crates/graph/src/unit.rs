//! Build units: the atomic scheduling entities.

use crate::CacheKey;
use morph_morphology::{BuildMode, Phase, SplitRule};
use morph_source::Submodule;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Kind of artifact a build unit produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitKind {
    /// A chunk artifact: the tar of one install tree split.
    Chunk,
    /// A stratum artifact: the union of its chunk artifacts.
    Stratum,
    /// A system artifact: the assembled root filesystem.
    System,
}

impl UnitKind {
    /// The kind name as used in cache filenames.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Chunk => "chunk",
            Self::Stratum => "stratum",
            Self::System => "system",
        }
    }

    /// Scheduling priority: chunks before strata before systems.
    #[must_use]
    pub const fn priority(self) -> u8 {
        match self {
            Self::Chunk => 0,
            Self::Stratum => 1,
            Self::System => 2,
        }
    }
}

impl fmt::Display for UnitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a unit's source lives.
#[derive(Debug, Clone)]
pub struct UnitSource {
    /// Repository URL.
    pub repo: String,
    /// The ref as written in the defining morphology.
    pub ref_name: String,
    /// Pinned commit SHA-1.
    pub sha: String,
    /// Submodule pins of the commit.
    pub submodules: Vec<Submodule>,
}

/// Target policy: the environment facts that participate in every cache key.
#[derive(Debug, Clone)]
pub struct TargetPolicy {
    /// Target architecture, matched against the system's `arch`.
    pub arch: String,
    /// `CFLAGS` handed to every build.
    pub cflags: String,
    /// `TOOLCHAIN_TARGET` handed to every build.
    pub toolchain_target: String,
    /// Prefix bootstrap-mode artifacts install under.
    pub tooling_prefix: String,
}

impl Default for TargetPolicy {
    fn default() -> Self {
        Self {
            arch: std::env::consts::ARCH.to_string(),
            cflags: String::new(),
            toolchain_target: String::new(),
            tooling_prefix: "/tools".to_string(),
        }
    }
}

/// One artifact to produce: the atomic scheduling entity.
#[derive(Debug, Clone)]
pub struct BuildUnit {
    /// What kind of artifact this unit produces.
    pub kind: UnitKind,
    /// The artifact's name.
    pub artifact_name: String,
    /// Name of the defining morphology.
    pub morph_name: String,
    /// The stratum this unit belongs to (chunks and strata).
    pub stratum_name: Option<String>,
    /// Source the unit is built from. For strata and systems this is the
    /// definitions repository; for chunks, the chunk repository.
    pub source: UnitSource,
    /// Canonical form of the defining morphology.
    pub canonical_morph: String,
    /// Build mode; meaningful for chunks, `Normal` otherwise.
    pub build_mode: BuildMode,
    /// Installation prefix; meaningful for chunks.
    pub prefix: String,
    /// Cap on build parallelism, from the chunk morphology.
    pub max_jobs: Option<u32>,
    /// Effective commands per phase; populated for chunks, empty otherwise.
    pub phase_commands: BTreeMap<Phase, Vec<String>>,
    /// Split rules applied when capturing this unit's build output.
    pub split_rules: Vec<SplitRule>,
    /// All artifacts the same chunk build produces, with their keys,
    /// in split-rule order with the catch-all last. Singleton for
    /// strata and systems.
    pub chunk_artifacts: Vec<(String, CacheKey)>,
    /// This unit's cache key.
    pub cache_key: CacheKey,
}

impl BuildUnit {
    /// Identity of the underlying build: units of one chunk build share it,
    /// so at most one of them runs at a time.
    #[must_use]
    pub fn build_id(&self) -> String {
        format!(
            "{}:{}:{}:{}:{}",
            self.kind,
            self.stratum_name.as_deref().unwrap_or(""),
            self.morph_name,
            self.source.sha,
            self.build_mode
        )
    }

    /// Display label, e.g. `chunk hello (core)`.
    #[must_use]
    pub fn label(&self) -> String {
        match &self.stratum_name {
            Some(stratum) if self.kind == UnitKind::Chunk => {
                format!("{} {} ({stratum})", self.kind, self.artifact_name)
            }
            _ => format!("{} {}", self.kind, self.artifact_name),
        }
    }
}

/// Serialisable description of one planned unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedUnit {
    /// The unit's cache key.
    pub cache_key: CacheKey,
    /// Artifact kind.
    pub kind: UnitKind,
    /// Artifact name.
    pub artifact_name: String,
    /// Cache keys of the unit's direct dependencies.
    pub dependencies: Vec<CacheKey>,
}

/// Serialisable description of a whole build graph, in topological order.
///
/// This is what `morph calculate-build-graph` emits and what the distbuild
/// controller schedules from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildPlan {
    /// Cache key of the target (system) unit.
    pub target: CacheKey,
    /// Every unit, dependencies before dependents.
    pub units: Vec<PlannedUnit>,
}
