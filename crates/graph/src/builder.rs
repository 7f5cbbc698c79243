//! Graph construction: morphology tree → DAG of build units with cache keys.

use crate::key::{CacheKey, KeyHasher};
use crate::unit::{BuildPlan, BuildUnit, PlannedUnit, TargetPolicy, UnitKind, UnitSource};
use crate::{Error, Result};
use async_recursion::async_recursion;
use morph_morphology::{
    BuildMode, ChunkMorphology, Kind, Morphology, SplitRule, StratumMorphology, load_morphology,
};
use morph_source::SourceResolver;
use petgraph::Direction;
use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::HashMap;
use std::collections::HashSet;
use tracing::{debug, info};

/// The finished DAG of build units, acyclic, with keys computed.
#[derive(Debug)]
pub struct BuildGraph {
    graph: DiGraph<BuildUnit, ()>,
    target: NodeIndex,
}

impl BuildGraph {
    /// The unit at `index`.
    #[must_use]
    pub fn unit(&self, index: NodeIndex) -> &BuildUnit {
        &self.graph[index]
    }

    /// The target (system) unit's index.
    #[must_use]
    pub const fn target(&self) -> NodeIndex {
        self.target
    }

    /// Number of units.
    #[must_use]
    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    /// Whether the graph is empty (it never is after a successful build).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Iterate over all unit indices.
    pub fn indices(&self) -> impl Iterator<Item = NodeIndex> + '_ {
        self.graph.node_indices()
    }

    /// Direct dependencies of a unit.
    #[must_use]
    pub fn dependencies(&self, index: NodeIndex) -> Vec<NodeIndex> {
        self.graph
            .neighbors_directed(index, Direction::Incoming)
            .collect()
    }

    /// Direct dependents of a unit.
    #[must_use]
    pub fn dependents(&self, index: NodeIndex) -> Vec<NodeIndex> {
        self.graph
            .neighbors_directed(index, Direction::Outgoing)
            .collect()
    }

    /// Indices in topological order, dependencies first.
    #[must_use]
    pub fn topo_order(&self) -> Vec<NodeIndex> {
        // The graph was checked for cycles at construction time.
        toposort(&self.graph, None).unwrap_or_default()
    }

    /// Find a unit by its cache key.
    #[must_use]
    pub fn find_by_key(&self, key: &CacheKey) -> Option<NodeIndex> {
        self.graph
            .node_indices()
            .find(|&i| &self.graph[i].cache_key == key)
    }

    /// Serialisable plan, dependencies before dependents.
    #[must_use]
    pub fn plan(&self) -> BuildPlan {
        let units = self
            .topo_order()
            .into_iter()
            .map(|i| {
                let unit = &self.graph[i];
                let mut dependencies: Vec<CacheKey> = self
                    .dependencies(i)
                    .into_iter()
                    .map(|d| self.graph[d].cache_key.clone())
                    .collect();
                dependencies.sort();
                PlannedUnit {
                    cache_key: unit.cache_key.clone(),
                    kind: unit.kind,
                    artifact_name: unit.artifact_name.clone(),
                    dependencies,
                }
            })
            .collect();
        BuildPlan {
            target: self.graph[self.target].cache_key.clone(),
            units,
        }
    }
}

struct LoadedStratum {
    chunk_units: Vec<NodeIndex>,
    exposed: Vec<NodeIndex>,
    stratum_units: Vec<NodeIndex>,
    artifact_names: Vec<String>,
}

/// Builds a [`BuildGraph`] from a system morphology reference.
pub struct GraphBuilder<'a> {
    resolver: &'a SourceResolver,
    policy: &'a TargetPolicy,
    graph: DiGraph<BuildUnit, ()>,
    strata: HashMap<String, LoadedStratum>,
    visiting: HashSet<String>,
}

fn morph_file_path(stem: &str) -> String {
    if stem.ends_with(".morph") {
        stem.to_string()
    } else {
        format!("{stem}.morph")
    }
}

fn is_devel(artifact: &str) -> bool {
    artifact.ends_with("-devel")
}

impl<'a> GraphBuilder<'a> {
    /// Create a builder over a resolver and target policy.
    #[must_use]
    pub fn new(resolver: &'a SourceResolver, policy: &'a TargetPolicy) -> Self {
        Self {
            resolver,
            policy,
            graph: DiGraph::new(),
            strata: HashMap::new(),
            visiting: HashSet::new(),
        }
    }

    /// Expand the system at `(repo, ref, morph)` into a keyed build graph.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DependencyCycle`] or [`Error::UnsatisfiedDependency`]
    /// on definitions errors, or the underlying morphology/source error.
    pub async fn build(
        mut self,
        repo: &str,
        ref_name: &str,
        morph: &str,
    ) -> Result<BuildGraph> {
        let morph_path = morph_file_path(morph);
        let resolved = self.resolver.resolve(repo, ref_name, &morph_path).await?;
        let morphology = load_morphology(&resolved.text, Kind::System, &morph_path)?;
        let Morphology::System(system) = morphology else {
            unreachable!("loader validated the kind");
        };
        info!(system = %system.name, arch = %system.arch, "Expanding system");

        let mut system_deps = Vec::new();
        for include in &system.strata {
            let stratum_id = self
                .load_stratum(&include.repo, &include.ref_name, &include.morph)
                .await?;
            let loaded = &self.strata[&stratum_id];
            match &include.artifacts {
                None => system_deps.extend(loaded.stratum_units.iter().copied()),
                Some(wanted) => {
                    for name in wanted {
                        let position = loaded
                            .artifact_names
                            .iter()
                            .position(|n| n == name)
                            .ok_or_else(|| Error::UnsatisfiedDependency { name: name.clone() })?;
                        system_deps.push(loaded.stratum_units[position]);
                    }
                }
            }
        }

        let canonical = Morphology::System(system.clone()).canonical_form();
        let system_node = self.graph.add_node(BuildUnit {
            kind: UnitKind::System,
            artifact_name: system.name.clone(),
            morph_name: system.name.clone(),
            stratum_name: None,
            source: UnitSource {
                repo: repo.to_string(),
                ref_name: ref_name.to_string(),
                sha: resolved.sha,
                submodules: Vec::new(),
            },
            canonical_morph: canonical,
            build_mode: BuildMode::Normal,
            prefix: "/usr".to_string(),
            max_jobs: None,
            phase_commands: std::collections::BTreeMap::new(),
            split_rules: Vec::new(),
            chunk_artifacts: Vec::new(),
            cache_key: placeholder_key(),
        });
        for dep in system_deps {
            self.graph.update_edge(dep, system_node, ());
        }

        self.check_acyclic()?;
        self.compute_keys(&system.arch);
        self.fill_chunk_artifacts();
        info!(units = self.graph.node_count(), "Build graph complete");
        Ok(BuildGraph {
            graph: self.graph,
            target: system_node,
        })
    }

    /// Load one stratum (and, recursively, the strata it build-depends on),
    /// creating its chunk and stratum units.
    #[async_recursion]
    async fn load_stratum(
        &mut self,
        repo: &str,
        ref_name: &str,
        morph: &str,
    ) -> Result<String> {
        let morph_path = morph_file_path(morph);
        let sha = self.resolver.pin(repo, ref_name).await?;
        let stratum_id = format!("{repo}#{sha}#{morph_path}");
        if self.strata.contains_key(&stratum_id) {
            return Ok(stratum_id);
        }
        if !self.visiting.insert(stratum_id.clone()) {
            return Err(Error::DependencyCycle {
                path: format!("stratum '{morph}' transitively build-depends on itself"),
            });
        }

        let text = self.resolver.morph_text(repo, &sha, &morph_path).await?;
        let morphology = load_morphology(&text, Kind::Stratum, &morph_path)?;
        let Morphology::Stratum(stratum) = morphology else {
            unreachable!("loader validated the kind");
        };
        debug!(stratum = %stratum.name, chunks = stratum.chunks.len(), "Loading stratum");

        let mut dep_strata = Vec::new();
        for dep in &stratum.build_depends {
            let id = self
                .load_stratum(&dep.repo, &dep.ref_name, &dep.morph)
                .await?;
            dep_strata.push(id);
        }

        let loaded = self
            .expand_stratum(&stratum, repo, ref_name, &sha, &dep_strata)
            .await?;
        self.visiting.remove(&stratum_id);
        self.strata.insert(stratum_id.clone(), loaded);
        Ok(stratum_id)
    }

    /// Create the chunk and stratum units of one stratum and wire its edges.
    async fn expand_stratum(
        &mut self,
        stratum: &StratumMorphology,
        repo: &str,
        ref_name: &str,
        sha: &str,
        dep_strata: &[String],
    ) -> Result<LoadedStratum> {
        // Chunk units, in declaration order.
        let mut units_by_chunk: HashMap<String, Vec<NodeIndex>> = HashMap::new();
        let mut chunk_units = Vec::new();
        for spec in &stratum.chunks {
            let chunk_morph_path = morph_file_path(&spec.morph);
            let resolved = self
                .resolver
                .resolve(&spec.repo, &spec.ref_name, &chunk_morph_path)
                .await?;
            let morphology = load_morphology(&resolved.text, Kind::Chunk, &chunk_morph_path)?;
            let Morphology::Chunk(chunk) = morphology else {
                unreachable!("loader validated the kind");
            };
            let canonical = Morphology::Chunk(chunk.clone()).canonical_form();

            for artifact in chunk_artifact_names(&chunk) {
                let node = self.graph.add_node(BuildUnit {
                    kind: UnitKind::Chunk,
                    artifact_name: artifact,
                    morph_name: chunk.name.clone(),
                    stratum_name: Some(stratum.name.clone()),
                    source: UnitSource {
                        repo: spec.repo.clone(),
                        ref_name: spec.ref_name.clone(),
                        sha: resolved.sha.clone(),
                        submodules: resolved.submodules.clone(),
                    },
                    canonical_morph: canonical.clone(),
                    build_mode: spec.build_mode,
                    prefix: spec.prefix.clone(),
                    max_jobs: chunk.max_jobs,
                    phase_commands: chunk.phases.clone(),
                    split_rules: chunk.products.clone(),
                    chunk_artifacts: Vec::new(),
                    cache_key: placeholder_key(),
                });
                units_by_chunk
                    .entry(spec.name.clone())
                    .or_default()
                    .push(node);
                chunk_units.push(node);
            }
        }

        // Within-stratum edges: runtime artifacts depend on the dependency's
        // runtime artifacts, devel artifacts on devel and runtime both.
        for spec in &stratum.chunks {
            let own_units = units_by_chunk[&spec.name].clone();
            for dep_name in &spec.build_depends {
                let dep_units = units_by_chunk
                    .get(dep_name)
                    .ok_or_else(|| Error::UnsatisfiedDependency {
                        name: dep_name.clone(),
                    })?
                    .clone();
                for &unit in &own_units {
                    let devel = is_devel(&self.graph[unit].artifact_name);
                    for &dep_unit in &dep_units {
                        if devel || !is_devel(&self.graph[dep_unit].artifact_name) {
                            self.graph.update_edge(dep_unit, unit, ());
                        }
                    }
                }
            }
        }

        // Cross-stratum edges: every chunk here depends on what the
        // build-depends strata expose.
        for dep_id in dep_strata {
            let exposed = self.strata[dep_id].exposed.clone();
            for &unit in &chunk_units {
                for &dep_unit in &exposed {
                    self.graph.update_edge(dep_unit, unit, ());
                }
            }
        }

        // Stratum artifacts aggregate non-bootstrap chunk artifacts; a
        // bootstrap chunk exists only to stage later builds.
        let includable: Vec<NodeIndex> = chunk_units
            .iter()
            .copied()
            .filter(|&u| self.graph[u].build_mode != BuildMode::Bootstrap)
            .collect();

        let rules: Vec<SplitRule> = if stratum.products.is_empty() {
            vec![SplitRule {
                artifact: stratum.name.clone(),
                include: vec![".*".to_string()],
            }]
        } else {
            stratum.products.clone()
        };

        let mut members_per_rule: Vec<Vec<NodeIndex>> = vec![Vec::new(); rules.len()];
        for &unit in &includable {
            let artifact = self.graph[unit].artifact_name.clone();
            for (i, rule) in rules.iter().enumerate() {
                // Rules were validated at load time; first match wins.
                let matched = rule
                    .compile()
                    .map(|patterns| patterns.iter().any(|p| p.is_match(&artifact)))
                    .unwrap_or(false);
                if matched {
                    members_per_rule[i].push(unit);
                    break;
                }
            }
        }

        let canonical = Morphology::Stratum(stratum.clone()).canonical_form();
        let mut stratum_units = Vec::new();
        let mut artifact_names = Vec::new();
        let mut exposed = Vec::new();
        for (rule, members) in rules.iter().zip(&members_per_rule) {
            let node = self.graph.add_node(BuildUnit {
                kind: UnitKind::Stratum,
                artifact_name: rule.artifact.clone(),
                morph_name: stratum.name.clone(),
                stratum_name: Some(stratum.name.clone()),
                source: UnitSource {
                    repo: repo.to_string(),
                    ref_name: ref_name.to_string(),
                    sha: sha.to_string(),
                    submodules: Vec::new(),
                },
                canonical_morph: canonical.clone(),
                build_mode: BuildMode::Normal,
                prefix: "/usr".to_string(),
                max_jobs: None,
                phase_commands: std::collections::BTreeMap::new(),
                split_rules: stratum.products.clone(),
                chunk_artifacts: Vec::new(),
                cache_key: placeholder_key(),
            });
            for &member in members {
                self.graph.update_edge(member, node, ());
            }
            exposed.extend(members.iter().copied());
            stratum_units.push(node);
            artifact_names.push(rule.artifact.clone());
        }

        Ok(LoadedStratum {
            chunk_units,
            exposed,
            stratum_units,
            artifact_names,
        })
    }

    /// Reject cycles, naming the participants. SCC-based, never recursive.
    fn check_acyclic(&self) -> Result<()> {
        for component in tarjan_scc(&self.graph) {
            if component.len() > 1 {
                let mut labels: Vec<String> = component
                    .iter()
                    .map(|&i| self.graph[i].label())
                    .collect();
                labels.sort();
                return Err(Error::DependencyCycle {
                    path: labels.join(" -> "),
                });
            }
            if let [single] = component[..] {
                if self.graph.contains_edge(single, single) {
                    return Err(Error::DependencyCycle {
                        path: self.graph[single].label(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Compute cache keys bottom-up over the (acyclic) graph.
    fn compute_keys(&mut self, arch: &str) {
        let order = toposort(&self.graph, None).unwrap_or_default();
        for index in order {
            let mut dep_keys: Vec<String> = self
                .graph
                .neighbors_directed(index, Direction::Incoming)
                .map(|d| self.graph[d].cache_key.as_hex().to_string())
                .collect();
            dep_keys.sort();

            let unit = &self.graph[index];
            let mut hasher = KeyHasher::new(unit.kind.as_str());
            hasher.field("artifact", &unit.artifact_name);
            hasher.field("source", &unit.source.sha);
            hasher.field("morph", &unit.canonical_morph);
            hasher.field("arch", arch);
            if unit.kind == UnitKind::Chunk {
                hasher.field("mode", unit.build_mode.as_str());
                hasher.field("prefix", &unit.prefix);
                hasher.field("cflags", &self.policy.cflags);
                hasher.field("toolchain", &self.policy.toolchain_target);
                hasher.field("tooling-prefix", &self.policy.tooling_prefix);
                let mut pins: Vec<String> = unit
                    .source
                    .submodules
                    .iter()
                    .map(|s| format!("{} {}", s.path, s.sha))
                    .collect();
                pins.sort();
                hasher.field_list("submodule", &pins);
            }
            let rules = serde_json::to_string(&unit.split_rules).unwrap_or_default();
            hasher.field("splits", &rules);
            hasher.field_list("dep", &dep_keys);

            self.graph[index].cache_key = hasher.finish();
        }
    }

    /// Record, on every chunk unit, the full artifact set its build commits.
    fn fill_chunk_artifacts(&mut self) {
        let mut groups: HashMap<String, Vec<NodeIndex>> = HashMap::new();
        for index in self.graph.node_indices() {
            let unit = &self.graph[index];
            if unit.kind == UnitKind::Chunk {
                groups.entry(unit.build_id()).or_default().push(index);
            }
        }
        for siblings in groups.into_values() {
            let artifacts: Vec<(String, CacheKey)> = siblings
                .iter()
                .map(|&i| {
                    let u = &self.graph[i];
                    (u.artifact_name.clone(), u.cache_key.clone())
                })
                .collect();
            for index in siblings {
                self.graph[index].chunk_artifacts = artifacts.clone();
            }
        }
        for index in self.graph.node_indices() {
            let unit = &mut self.graph[index];
            if unit.kind != UnitKind::Chunk {
                unit.chunk_artifacts =
                    vec![(unit.artifact_name.clone(), unit.cache_key.clone())];
            }
        }
    }
}

/// The artifact names one chunk build commits: declared products in order,
/// then the catch-all for files no rule claims.
fn chunk_artifact_names(chunk: &ChunkMorphology) -> Vec<String> {
    if chunk.products.is_empty() {
        return vec![chunk.name.clone()];
    }
    let mut names: Vec<String> = chunk.products.iter().map(|r| r.artifact.clone()).collect();
    let catch_all = format!("{}-misc", chunk.name);
    if !names.contains(&catch_all) {
        names.push(catch_all);
    }
    names
}

fn placeholder_key() -> CacheKey {
    CacheKey::from_hex("0".repeat(64)).unwrap_or_else(|_| unreachable!())
}
