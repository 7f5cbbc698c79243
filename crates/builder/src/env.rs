//! The scrubbed build environment.
//!
//! Build commands see a whitelisted environment only: a handful of host
//! variables that distcc/fakeroot-style tooling needs, plus the variables
//! the builder always sets. Everything else from the host is dropped.

use crate::BuilderConfig;
use morph_graph::BuildUnit;
use morph_morphology::BuildMode;
use std::collections::BTreeMap;
use std::path::Path;

/// Host variables retained when present.
pub const ENV_WHITELIST: &[&str] = &[
    "DISTCC_HOSTS",
    "TMPDIR",
    "LD_PRELOAD",
    "LD_LIBRARY_PATH",
    "FAKEROOTKEY",
    "FAKED_MODE",
    "FAKEROOT_FD_BASE",
];

/// Fallback `PATH` when the host's is not kept.
const SCRUBBED_PATH: &str = "/usr/bin:/bin:/usr/sbin:/sbin";

/// Compose the environment for one chunk build.
///
/// `staging_root` is the assembled staging area, `destdir` the install
/// capture directory.
#[must_use]
pub fn build_environment(
    config: &BuilderConfig,
    unit: &BuildUnit,
    staging_root: &Path,
    destdir: &Path,
) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();

    for name in ENV_WHITELIST {
        if let Ok(value) = std::env::var(name) {
            env.insert((*name).to_string(), value);
        }
    }

    let base_path = if config.keep_path {
        std::env::var("PATH").unwrap_or_else(|_| SCRUBBED_PATH.to_string())
    } else {
        SCRUBBED_PATH.to_string()
    };
    let tooling_bin = staging_root
        .join(config.policy.tooling_prefix.trim_start_matches('/'))
        .join("bin");
    let mut path_entries = Vec::new();
    if let Some(ccache) = &config.ccache_dir {
        path_entries.push(ccache.display().to_string());
    }
    path_entries.push(tooling_bin.display().to_string());
    // The chunk's own prefix, as staged by its dependencies.
    let prefix_bin = staging_root
        .join(unit.prefix.trim_start_matches('/'))
        .join("bin");
    path_entries.push(prefix_bin.display().to_string());
    path_entries.push(base_path);
    env.insert("PATH".to_string(), path_entries.join(":"));

    let jobs = unit.max_jobs.map_or(config.jobs, |m| m.min(config.jobs)).max(1);
    env.insert(
        "TOOLCHAIN_TARGET".to_string(),
        config.policy.toolchain_target.clone(),
    );
    env.insert("CFLAGS".to_string(), config.policy.cflags.clone());
    env.insert("PREFIX".to_string(), unit.prefix.clone());
    env.insert(
        "BOOTSTRAP".to_string(),
        if unit.build_mode == BuildMode::Bootstrap {
            "true".to_string()
        } else {
            "false".to_string()
        },
    );
    env.insert("DESTDIR".to_string(), destdir.display().to_string());
    env.insert("MAKEFLAGS".to_string(), format!("-j{jobs}"));

    env
}

#[cfg(test)]
mod tests {
    use super::*;
    use morph_graph::{CacheKey, UnitKind, UnitSource};
    use std::collections::BTreeMap as Map;

    fn unit(prefix: &str, mode: BuildMode, max_jobs: Option<u32>) -> BuildUnit {
        BuildUnit {
            kind: UnitKind::Chunk,
            artifact_name: "hello".into(),
            morph_name: "hello".into(),
            stratum_name: Some("core".into()),
            source: UnitSource {
                repo: "git://example.com/hello".into(),
                ref_name: "master".into(),
                sha: "a".repeat(40),
                submodules: vec![],
            },
            canonical_morph: "{}".into(),
            build_mode: mode,
            prefix: prefix.into(),
            max_jobs,
            phase_commands: Map::new(),
            split_rules: vec![],
            chunk_artifacts: vec![],
            cache_key: CacheKey::from_hex("a".repeat(64)).unwrap(),
        }
    }

    #[test]
    fn sets_required_variables() {
        let config = BuilderConfig {
            jobs: 4,
            ..BuilderConfig::default()
        };
        let env = build_environment(
            &config,
            &unit("/plover", BuildMode::Normal, None),
            Path::new("/staging"),
            Path::new("/staging/hello.inst"),
        );
        assert_eq!(env["PREFIX"], "/plover");
        assert_eq!(env["BOOTSTRAP"], "false");
        assert_eq!(env["MAKEFLAGS"], "-j4");
        assert_eq!(env["DESTDIR"], "/staging/hello.inst");
        assert!(env["PATH"].contains("/staging/plover/bin"));
        assert!(env["PATH"].contains("/staging/tools/bin"));
    }

    #[test]
    fn bootstrap_flag_follows_mode() {
        let config = BuilderConfig::default();
        let env = build_environment(
            &config,
            &unit("/tools", BuildMode::Bootstrap, None),
            Path::new("/staging"),
            Path::new("/staging/x.inst"),
        );
        assert_eq!(env["BOOTSTRAP"], "true");
    }

    #[test]
    fn max_jobs_caps_parallelism() {
        let config = BuilderConfig {
            jobs: 16,
            ..BuilderConfig::default()
        };
        let env = build_environment(
            &config,
            &unit("/usr", BuildMode::Normal, Some(2)),
            Path::new("/s"),
            Path::new("/s/d"),
        );
        assert_eq!(env["MAKEFLAGS"], "-j2");
    }

    #[test]
    fn host_noise_is_scrubbed() {
        // The test process environment surely has HOME set.
        let config = BuilderConfig::default();
        let env = build_environment(
            &config,
            &unit("/usr", BuildMode::Normal, None),
            Path::new("/s"),
            Path::new("/s/d"),
        );
        assert!(!env.contains_key("HOME"));
    }

    #[test]
    fn ccache_dir_leads_path() {
        let config = BuilderConfig {
            ccache_dir: Some("/opt/ccache-wrappers".into()),
            ..BuilderConfig::default()
        };
        let env = build_environment(
            &config,
            &unit("/usr", BuildMode::Normal, None),
            Path::new("/s"),
            Path::new("/s/d"),
        );
        assert!(env["PATH"].starts_with("/opt/ccache-wrappers:"));
    }
}
