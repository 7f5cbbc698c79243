//! Typed morphology records.
//!
//! Records in this module are fully validated and defaulted: every field
//! holds its effective value, so serialising one yields the canonical form
//! used for cache-key computation.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// The four morphology kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    /// One source project, built by running its declared phases.
    Chunk,
    /// A named collection of chunks with build ordering among them.
    Stratum,
    /// An assembly of strata into a bootable root filesystem.
    System,
    /// Named deployment targets; parsed but never built.
    Cluster,
}

impl Kind {
    /// The kind name as it appears in morphology text and cache filenames.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Chunk => "chunk",
            Self::Stratum => "stratum",
            Self::System => "system",
            Self::Cluster => "cluster",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Kind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "chunk" => Ok(Self::Chunk),
            "stratum" => Ok(Self::Stratum),
            "system" => Ok(Self::System),
            "cluster" => Ok(Self::Cluster),
            other => Err(format!("unknown morphology kind '{other}'")),
        }
    }
}

/// Build phases in canonical execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    /// Runs before `configure`.
    PreConfigure,
    /// Prepares the source tree for building.
    Configure,
    /// Runs after `configure`.
    PostConfigure,
    /// Runs before `build`.
    PreBuild,
    /// Compiles the source tree.
    Build,
    /// Runs after `build`.
    PostBuild,
    /// Runs before `install`.
    PreInstall,
    /// Installs into `$DESTDIR`.
    Install,
    /// Runs after `install`.
    PostInstall,
}

impl Phase {
    /// All phases, in execution order.
    pub const ALL: [Self; 9] = [
        Self::PreConfigure,
        Self::Configure,
        Self::PostConfigure,
        Self::PreBuild,
        Self::Build,
        Self::PostBuild,
        Self::PreInstall,
        Self::Install,
        Self::PostInstall,
    ];

    /// The phase name, e.g. `pre-configure`.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PreConfigure => "pre-configure",
            Self::Configure => "configure",
            Self::PostConfigure => "post-configure",
            Self::PreBuild => "pre-build",
            Self::Build => "build",
            Self::PostBuild => "post-build",
            Self::PreInstall => "pre-install",
            Self::Install => "install",
            Self::PostInstall => "post-install",
        }
    }

    /// The YAML key holding this phase's commands, e.g. `pre-configure-commands`.
    #[must_use]
    pub fn yaml_key(self) -> String {
        format!("{}-commands", self.as_str())
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Build mode of a chunk within a stratum.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildMode {
    /// Installs only into the final output.
    #[default]
    Normal,
    /// Installs into later staging areas and the final output.
    Test,
    /// Installs into the tooling prefix, available only during bootstrap.
    Bootstrap,
}

impl BuildMode {
    /// The mode name as written in morphology text.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Test => "test",
            Self::Bootstrap => "bootstrap",
        }
    }
}

impl fmt::Display for BuildMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One artifact split rule: files matching any `include` pattern go into
/// the named artifact. Rules apply in declaration order, first match wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitRule {
    /// Name of the artifact the rule feeds.
    pub artifact: String,
    /// Anchored regular expressions over paths relative to the install root.
    pub include: Vec<String>,
}

impl SplitRule {
    /// Compile the include patterns, validating them.
    pub fn compile(&self) -> Result<Vec<regex::Regex>> {
        self.include
            .iter()
            .map(|p| {
                regex::Regex::new(p).map_err(|e| {
                    Error::invalid(self.artifact.as_str(), format!("bad include pattern '{p}': {e}"))
                })
            })
            .collect()
    }
}

/// A chunk morphology: one source project and how to build it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ChunkMorphology {
    /// Chunk name.
    pub name: String,
    /// Free-form description; never part of the cache key inputs that matter,
    /// but carried through the canonical form like any other field.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Declared build system, validated against the registry.
    pub build_system: String,
    /// Effective commands per phase. Defaults from the build system are
    /// inlined here, so the canonical form is total over all nine phases.
    pub phases: BTreeMap<Phase, Vec<String>>,
    /// Artifact split rules, applied in order.
    pub products: Vec<SplitRule>,
    /// Upper bound on `make -j` parallelism for this chunk.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_jobs: Option<u32>,
}

impl ChunkMorphology {
    /// Effective commands for a phase (possibly empty).
    #[must_use]
    pub fn commands(&self, phase: Phase) -> &[String] {
        self.phases.get(&phase).map_or(&[], Vec::as_slice)
    }
}

/// Reference to a stratum a stratum build-depends on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StratumRef {
    /// Morphology path within the repository.
    pub morph: String,
    /// Repository URL.
    pub repo: String,
    /// Git ref (branch, tag, or SHA-1).
    #[serde(rename = "ref")]
    pub ref_name: String,
}

/// One chunk within a stratum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ChunkSpec {
    /// Chunk name.
    pub name: String,
    /// Repository URL.
    pub repo: String,
    /// Git ref (branch, tag, or SHA-1).
    #[serde(rename = "ref")]
    pub ref_name: String,
    /// Morphology path within the chunk repository.
    pub morph: String,
    /// Names of chunks within this stratum that must be built first.
    pub build_depends: Vec<String>,
    /// How the chunk's artifacts participate in staging and output.
    pub build_mode: BuildMode,
    /// Installation prefix.
    pub prefix: String,
}

/// A stratum morphology: a layer of chunks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct StratumMorphology {
    /// Stratum name.
    pub name: String,
    /// Free-form description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Strata whose chunks must be built before any chunk here.
    pub build_depends: Vec<StratumRef>,
    /// The chunks of this stratum, in declaration order.
    pub chunks: Vec<ChunkSpec>,
    /// Stratum split rules mapping chunk-artifact names to stratum artifacts.
    pub products: Vec<SplitRule>,
}

/// Inclusion of a stratum in a system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StratumInclude {
    /// Morphology path within the repository.
    pub morph: String,
    /// Repository URL.
    pub repo: String,
    /// Git ref (branch, tag, or SHA-1).
    #[serde(rename = "ref")]
    pub ref_name: String,
    /// Subset of the stratum's artifacts to include; `None` means all.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifacts: Option<Vec<String>>,
}

/// A system morphology: strata assembled into a root filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct SystemMorphology {
    /// System name.
    pub name: String,
    /// Free-form description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Target architecture, e.g. `x86_64`.
    pub arch: String,
    /// The strata of this system.
    pub strata: Vec<StratumInclude>,
    /// Configuration extensions run at deployment time; their identities
    /// participate in the system cache key.
    pub configuration_extensions: Vec<String>,
}

/// A cluster morphology: deployment targets. Validated, never built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ClusterMorphology {
    /// Cluster name.
    pub name: String,
    /// Free-form description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Systems to deploy, by morphology path.
    pub systems: Vec<ClusterSystem>,
}

/// One system within a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ClusterSystem {
    /// Morphology path of the system.
    pub morph: String,
    /// Named deployment targets and their settings.
    pub deploy: BTreeMap<String, BTreeMap<String, String>>,
}

/// A validated morphology of any kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Morphology {
    /// A chunk definition.
    Chunk(ChunkMorphology),
    /// A stratum definition.
    Stratum(StratumMorphology),
    /// A system definition.
    System(SystemMorphology),
    /// A cluster definition.
    Cluster(ClusterMorphology),
}

impl Morphology {
    /// The kind of this morphology.
    #[must_use]
    pub const fn kind(&self) -> Kind {
        match self {
            Self::Chunk(_) => Kind::Chunk,
            Self::Stratum(_) => Kind::Stratum,
            Self::System(_) => Kind::System,
            Self::Cluster(_) => Kind::Cluster,
        }
    }

    /// The morphology's name.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Chunk(c) => &c.name,
            Self::Stratum(s) => &s.name,
            Self::System(s) => &s.name,
            Self::Cluster(c) => &c.name,
        }
    }

    /// Serialise to the canonical form: keys sorted, defaults inlined.
    ///
    /// Equivalent inputs produce byte-identical canonical forms, which is
    /// what makes cache keys stable across hosts and runs.
    #[must_use]
    pub fn canonical_form(&self) -> String {
        // serde_json's map type keeps keys sorted, so converting through
        // Value normalises field order regardless of struct declaration.
        let value = serde_json::to_value(self).unwrap_or(serde_json::Value::Null);
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_order_is_canonical() {
        let names: Vec<&str> = Phase::ALL.iter().map(|p| p.as_str()).collect();
        assert_eq!(
            names,
            [
                "pre-configure",
                "configure",
                "post-configure",
                "pre-build",
                "build",
                "post-build",
                "pre-install",
                "install",
                "post-install"
            ]
        );
    }

    #[test]
    fn kind_round_trips() {
        for kind in [Kind::Chunk, Kind::Stratum, Kind::System, Kind::Cluster] {
            assert_eq!(kind.as_str().parse::<Kind>().unwrap(), kind);
        }
        assert!("strata".parse::<Kind>().is_err());
    }

    #[test]
    fn canonical_form_sorts_keys() {
        let chunk = Morphology::Chunk(ChunkMorphology {
            name: "hello".into(),
            description: None,
            build_system: "manual".into(),
            phases: BTreeMap::new(),
            products: vec![],
            max_jobs: None,
        });
        let canonical = chunk.canonical_form();
        let build_system = canonical.find("build-system").unwrap();
        let name = canonical.find("\"name\"").unwrap();
        assert!(build_system < name, "keys must be sorted: {canonical}");
    }

    #[test]
    fn split_rule_rejects_bad_pattern() {
        let rule = SplitRule {
            artifact: "x-devel".into(),
            include: vec!["[".into()],
        };
        assert!(rule.compile().is_err());
    }
}
