//! Morphology loading: YAML parsing, validation, and defaulting.

use crate::build_system::{build_system, is_known_build_system};
use crate::schema::{
    BuildMode, ChunkMorphology, ChunkSpec, ClusterMorphology, ClusterSystem, Kind, Morphology,
    Phase, SplitRule, StratumInclude, StratumMorphology, StratumRef, SystemMorphology,
};
use crate::{Error, Result};
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

const CHUNK_KEYS: &[&str] = &[
    "kind",
    "name",
    "description",
    "build-system",
    "max-jobs",
    "products",
    "pre-configure-commands",
    "configure-commands",
    "post-configure-commands",
    "pre-build-commands",
    "build-commands",
    "post-build-commands",
    "pre-install-commands",
    "install-commands",
    "post-install-commands",
];

const STRATUM_KEYS: &[&str] = &[
    "kind",
    "name",
    "description",
    "build-depends",
    "chunks",
    "products",
];

const SYSTEM_KEYS: &[&str] = &[
    "kind",
    "name",
    "description",
    "arch",
    "strata",
    "configuration-extensions",
];

const CLUSTER_KEYS: &[&str] = &["kind", "name", "description", "systems"];

/// Load and validate a morphology document.
///
/// `path` names the document for error reporting and supplies the default
/// `name` (the filename stem). The `kind` field in the text must match
/// `kind_hint`.
///
/// # Errors
///
/// Returns [`Error::InvalidMorphology`] on parse or validation failure.
pub fn load_morphology(text: &str, kind_hint: Kind, path: &str) -> Result<Morphology> {
    let value: Value = serde_yaml::from_str(text)
        .map_err(|e| Error::invalid(path, format!("not a YAML mapping: {e}")))?;
    let Value::Mapping(mapping) = value else {
        return Err(Error::invalid(path, "top-level document must be a mapping"));
    };

    let kind_str = get_str(&mapping, "kind", path)?
        .ok_or_else(|| Error::invalid(path, "missing required field 'kind'"))?;
    let kind: Kind = kind_str
        .parse()
        .map_err(|e: String| Error::invalid(path, e))?;
    if kind != kind_hint {
        return Err(Error::invalid(
            path,
            format!("expected kind '{kind_hint}', found '{kind}'"),
        ));
    }

    let allowed = match kind {
        Kind::Chunk => CHUNK_KEYS,
        Kind::Stratum => STRATUM_KEYS,
        Kind::System => SYSTEM_KEYS,
        Kind::Cluster => CLUSTER_KEYS,
    };
    reject_unknown_keys(&mapping, allowed, path)?;

    let morphology = match kind {
        Kind::Chunk => Morphology::Chunk(load_chunk(&mapping, path)?),
        Kind::Stratum => Morphology::Stratum(load_stratum(&mapping, path)?),
        Kind::System => Morphology::System(load_system(&mapping, path)?),
        Kind::Cluster => Morphology::Cluster(load_cluster(&mapping, path)?),
    };
    debug!(path, kind = %kind, name = morphology.name(), "Loaded morphology");
    Ok(morphology)
}

fn load_chunk(mapping: &Mapping, path: &str) -> Result<ChunkMorphology> {
    let name = name_or_stem(mapping, path)?;
    let build_system_name =
        get_str(mapping, "build-system", path)?.unwrap_or_else(|| "manual".to_string());
    if !is_known_build_system(&build_system_name) {
        return Err(Error::invalid(
            path,
            format!("unknown build-system '{build_system_name}'"),
        ));
    }
    let defaults = build_system(&build_system_name)
        .ok_or_else(|| Error::invalid(path, "build-system registry inconsistency"))?;

    let mut phases = BTreeMap::new();
    for phase in Phase::ALL {
        let commands = match get_string_list(mapping, &phase.yaml_key(), path)? {
            Some(explicit) => explicit,
            None => defaults
                .default_commands(phase)
                .iter()
                .map(ToString::to_string)
                .collect(),
        };
        phases.insert(phase, commands);
    }

    let products = load_split_rules(mapping, "products", path)?;
    let max_jobs = match mapping.get("max-jobs") {
        None => None,
        Some(v) => Some(
            v.as_u64()
                .and_then(|n| u32::try_from(n).ok())
                .ok_or_else(|| Error::invalid(path, "max-jobs must be a positive integer"))?,
        ),
    };

    Ok(ChunkMorphology {
        name,
        description: get_str(mapping, "description", path)?,
        build_system: build_system_name,
        phases,
        products,
        max_jobs,
    })
}

fn load_stratum(mapping: &Mapping, path: &str) -> Result<StratumMorphology> {
    let name = name_or_stem(mapping, path)?;

    let mut build_depends = Vec::new();
    for item in get_mapping_list(mapping, "build-depends", path)? {
        build_depends.push(StratumRef {
            morph: require_str(&item, "morph", path)?,
            repo: require_str(&item, "repo", path)?,
            ref_name: require_str(&item, "ref", path)?,
        });
    }

    let mut chunks = Vec::new();
    for item in get_mapping_list(mapping, "chunks", path)? {
        reject_unknown_keys(
            &item,
            &[
                "name",
                "repo",
                "ref",
                "morph",
                "build-depends",
                "build-mode",
                "prefix",
            ],
            path,
        )?;
        let chunk_name = require_str(&item, "name", path)?;
        let build_mode = match get_str(&item, "build-mode", path)? {
            None => BuildMode::Normal,
            Some(s) => match s.as_str() {
                "normal" => BuildMode::Normal,
                "test" => BuildMode::Test,
                "bootstrap" => BuildMode::Bootstrap,
                other => {
                    return Err(Error::invalid(
                        path,
                        format!("chunk '{chunk_name}': unknown build-mode '{other}'"),
                    ));
                }
            },
        };
        // Bootstrap chunks default into the tooling prefix.
        let default_prefix = match build_mode {
            BuildMode::Bootstrap => "/tools",
            BuildMode::Normal | BuildMode::Test => "/usr",
        };
        chunks.push(ChunkSpec {
            morph: get_str(&item, "morph", path)?.unwrap_or_else(|| chunk_name.clone()),
            repo: require_str(&item, "repo", path)?,
            ref_name: require_str(&item, "ref", path)?,
            build_depends: get_string_list(&item, "build-depends", path)?.unwrap_or_default(),
            build_mode,
            prefix: get_str(&item, "prefix", path)?.unwrap_or_else(|| default_prefix.to_string()),
            name: chunk_name,
        });
    }
    if chunks.is_empty() {
        return Err(Error::invalid(path, "stratum must list at least one chunk"));
    }

    // Within-stratum build-depends must name sibling chunks.
    for chunk in &chunks {
        for dep in &chunk.build_depends {
            if !chunks.iter().any(|c| &c.name == dep) {
                return Err(Error::invalid(
                    path,
                    format!("chunk '{}' build-depends on unknown chunk '{dep}'", chunk.name),
                ));
            }
        }
    }

    Ok(StratumMorphology {
        name,
        description: get_str(mapping, "description", path)?,
        build_depends,
        chunks,
        products: load_split_rules(mapping, "products", path)?,
    })
}

fn load_system(mapping: &Mapping, path: &str) -> Result<SystemMorphology> {
    let name = name_or_stem(mapping, path)?;
    let arch = require_str(mapping, "arch", path)?;

    let mut strata = Vec::new();
    for item in get_mapping_list(mapping, "strata", path)? {
        reject_unknown_keys(&item, &["morph", "repo", "ref", "artifacts"], path)?;
        strata.push(StratumInclude {
            morph: require_str(&item, "morph", path)?,
            repo: require_str(&item, "repo", path)?,
            ref_name: require_str(&item, "ref", path)?,
            artifacts: get_string_list(&item, "artifacts", path)?,
        });
    }
    if strata.is_empty() {
        return Err(Error::invalid(path, "system must list at least one stratum"));
    }

    Ok(SystemMorphology {
        name,
        description: get_str(mapping, "description", path)?,
        arch,
        strata,
        configuration_extensions: get_string_list(mapping, "configuration-extensions", path)?
            .unwrap_or_default(),
    })
}

fn load_cluster(mapping: &Mapping, path: &str) -> Result<ClusterMorphology> {
    let name = name_or_stem(mapping, path)?;
    let mut systems = Vec::new();
    for item in get_mapping_list(mapping, "systems", path)? {
        let morph = require_str(&item, "morph", path)?;
        let mut deploy = BTreeMap::new();
        if let Some(Value::Mapping(targets)) = item.get("deploy") {
            for (target, settings) in targets {
                let target = as_str(target, path, "deploy target name")?;
                let mut map = BTreeMap::new();
                if let Value::Mapping(settings) = settings {
                    for (k, v) in settings {
                        map.insert(
                            as_str(k, path, "deploy setting name")?,
                            as_str(v, path, "deploy setting value")?,
                        );
                    }
                }
                deploy.insert(target, map);
            }
        }
        systems.push(ClusterSystem { morph, deploy });
    }
    Ok(ClusterMorphology {
        name,
        description: get_str(mapping, "description", path)?,
        systems,
    })
}

fn load_split_rules(mapping: &Mapping, key: &str, path: &str) -> Result<Vec<SplitRule>> {
    let mut rules = Vec::new();
    for item in get_mapping_list(mapping, key, path)? {
        reject_unknown_keys(&item, &["artifact", "include"], path)?;
        let rule = SplitRule {
            artifact: require_str(&item, "artifact", path)?,
            include: get_string_list(&item, "include", path)?.unwrap_or_default(),
        };
        if !is_valid_artifact_name(&rule.artifact) {
            return Err(Error::invalid(
                path,
                format!("artifact name '{}' contains invalid characters", rule.artifact),
            ));
        }
        rule.compile()?;
        rules.push(rule);
    }
    Ok(rules)
}

/// Artifact names are restricted to what the cache layout can carry.
#[must_use]
pub(crate) fn is_valid_artifact_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '+' | '-'))
}

fn name_or_stem(mapping: &Mapping, path: &str) -> Result<String> {
    if let Some(name) = get_str(mapping, "name", path)? {
        if name.is_empty() {
            return Err(Error::invalid(path, "name must not be empty"));
        }
        return Ok(name);
    }
    Path::new(path)
        .file_stem()
        .and_then(|s| s.to_str())
        .map(ToString::to_string)
        .ok_or_else(|| Error::invalid(path, "missing 'name' and no usable filename stem"))
}

fn reject_unknown_keys(mapping: &Mapping, allowed: &[&str], path: &str) -> Result<()> {
    for key in mapping.keys() {
        let key = as_str(key, path, "mapping key")?;
        if !allowed.contains(&key.as_str()) {
            return Err(Error::invalid(path, format!("unknown field '{key}'")));
        }
    }
    Ok(())
}

fn as_str(value: &Value, path: &str, what: &str) -> Result<String> {
    value
        .as_str()
        .map(ToString::to_string)
        .ok_or_else(|| Error::invalid(path, format!("{what} must be a string")))
}

fn get_str(mapping: &Mapping, key: &str, path: &str) -> Result<Option<String>> {
    match mapping.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => Ok(Some(as_str(v, path, key)?)),
    }
}

fn require_str(mapping: &Mapping, key: &str, path: &str) -> Result<String> {
    get_str(mapping, key, path)?
        .ok_or_else(|| Error::invalid(path, format!("missing required field '{key}'")))
}

fn get_string_list(mapping: &Mapping, key: &str, path: &str) -> Result<Option<Vec<String>>> {
    match mapping.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Sequence(seq)) => seq
            .iter()
            .map(|v| as_str(v, path, key))
            .collect::<Result<Vec<_>>>()
            .map(Some),
        Some(_) => Err(Error::invalid(path, format!("'{key}' must be a list"))),
    }
}

fn get_mapping_list(mapping: &Mapping, key: &str, path: &str) -> Result<Vec<Mapping>> {
    match mapping.get(key) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Sequence(seq)) => seq
            .iter()
            .map(|v| match v {
                Value::Mapping(m) => Ok(m.clone()),
                _ => Err(Error::invalid(path, format!("'{key}' entries must be mappings"))),
            })
            .collect(),
        Some(_) => Err(Error::invalid(path, format!("'{key}' must be a list"))),
    }
}
