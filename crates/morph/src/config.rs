//! Runtime configuration, created once at startup and threaded down.

use crate::cli::Cli;
use morph_builder::{BuilderConfig, default_jobs};
use morph_graph::TargetPolicy;
use std::path::PathBuf;

/// Everything the build core needs to know about this invocation.
#[derive(Debug, Clone)]
pub struct Config {
    /// Cache directory: `artifacts/` and `gits/` live here.
    pub cachedir: PathBuf,
    /// Target policy folded into every cache key.
    pub policy: TargetPolicy,
    /// Builder settings.
    pub builder: BuilderConfig,
}

impl Config {
    /// Derive the configuration from parsed CLI flags.
    #[must_use]
    pub fn from_cli(cli: &Cli) -> Self {
        let cachedir = cli.cachedir.clone().unwrap_or_else(default_cachedir);
        let policy = TargetPolicy {
            arch: cli
                .arch
                .clone()
                .unwrap_or_else(|| std::env::consts::ARCH.to_string()),
            cflags: cli.target_cflags.clone(),
            toolchain_target: cli.toolchain_target.clone(),
            tooling_prefix: "/tools".to_string(),
        };
        let builder = BuilderConfig {
            policy: policy.clone(),
            keep_path: cli.keep_path,
            ccache_dir: cli.ccache_dir.clone(),
            jobs: cli.jobs.unwrap_or_else(default_jobs),
            echo_log: true,
            staging_root: cachedir.join("staging"),
        };
        Self {
            cachedir,
            policy,
            builder,
        }
    }

    /// Where bare git mirrors live.
    #[must_use]
    pub fn gits_dir(&self) -> PathBuf {
        self.cachedir.join("gits")
    }
}

fn default_cachedir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("morph")
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn flags_flow_into_config() {
        let cli = Cli::try_parse_from([
            "morph",
            "--cachedir",
            "/var/cache/morph",
            "--jobs",
            "3",
            "--keep-path",
            "--arch",
            "armv7lhf",
            "--target-cflags",
            "-O2",
            "build",
            "base",
            "--repo",
            "r",
            "--ref",
            "m",
        ])
        .unwrap();
        let config = Config::from_cli(&cli);
        assert_eq!(config.cachedir, PathBuf::from("/var/cache/morph"));
        assert_eq!(config.policy.arch, "armv7lhf");
        assert_eq!(config.policy.cflags, "-O2");
        assert_eq!(config.builder.jobs, 3);
        assert!(config.builder.keep_path);
        assert_eq!(config.gits_dir(), PathBuf::from("/var/cache/morph/gits"));
    }
}
