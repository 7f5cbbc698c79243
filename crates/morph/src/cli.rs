//! Command-line definition and error-to-exit-code mapping.

use clap::{Parser, Subcommand};
use miette::Diagnostic;
use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;

/// Success.
pub const EXIT_OK: i32 = 0;
/// A build failed.
pub const EXIT_BUILD_FAILURE: i32 = 1;
/// Bad usage or definitions.
pub const EXIT_USAGE: i32 = 2;
/// Internal error.
pub const EXIT_INTERNAL: i32 = 127;

/// CLI errors with exit-code mapping.
#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    /// Bad invocation or bad definitions (exit 2).
    #[error("{message}")]
    #[diagnostic(code(morph::usage))]
    Usage {
        /// What is wrong.
        message: String,
        /// How to fix it.
        #[help]
        help: Option<String>,
    },
    /// A build failed (exit 1).
    #[error("{message}")]
    #[diagnostic(code(morph::build))]
    Build {
        /// What failed.
        message: String,
    },
    /// Everything else (exit 127).
    #[error("{message}")]
    #[diagnostic(code(morph::internal))]
    Internal {
        /// What happened.
        message: String,
    },
}

impl CliError {
    /// A usage error.
    #[must_use]
    pub fn usage(message: impl Into<String>) -> Self {
        Self::Usage {
            message: message.into(),
            help: None,
        }
    }

    /// A usage error with a remediation hint.
    #[must_use]
    pub fn usage_with_help(message: impl Into<String>, help: impl Into<String>) -> Self {
        Self::Usage {
            message: message.into(),
            help: Some(help.into()),
        }
    }

    /// A build failure.
    #[must_use]
    pub fn build(message: impl Into<String>) -> Self {
        Self::Build {
            message: message.into(),
        }
    }

    /// An internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

/// Map an error to the process exit code.
#[must_use]
pub fn exit_code_for(error: &CliError) -> i32 {
    match error {
        CliError::Usage { .. } => EXIT_USAGE,
        CliError::Build { .. } => EXIT_BUILD_FAILURE,
        CliError::Internal { .. } => EXIT_INTERNAL,
    }
}

/// Render an error through miette.
pub fn render_error(error: &CliError) {
    let report = miette::Report::new(CliError::clone_for_report(error));
    eprintln!("{report:?}");
}

impl CliError {
    // miette::Report takes ownership; errors are cheap to re-shape.
    fn clone_for_report(error: &Self) -> Self {
        match error {
            Self::Usage { message, help } => Self::Usage {
                message: message.clone(),
                help: help.clone(),
            },
            Self::Build { message } => Self::Build {
                message: message.clone(),
            },
            Self::Internal { message } => Self::Internal {
                message: message.clone(),
            },
        }
    }
}

/// morph builds Linux system images from declarative morphology definitions.
#[derive(Debug, Parser)]
#[command(name = "morph", version, about)]
pub struct Cli {
    /// Cache directory (artifacts and git mirrors).
    #[arg(long, global = true, env = "MORPH_CACHEDIR")]
    pub cachedir: Option<PathBuf>,

    /// Build parallelism for MAKEFLAGS (default: CPU count).
    #[arg(long, global = true)]
    pub jobs: Option<u32>,

    /// Keep the host PATH in build environments.
    #[arg(long, global = true)]
    pub keep_path: bool,

    /// Directory of ccache wrappers to prepend to build PATH.
    #[arg(long, global = true)]
    pub ccache_dir: Option<PathBuf>,

    /// Target architecture override.
    #[arg(long, global = true)]
    pub arch: Option<String>,

    /// CFLAGS handed to every build.
    #[arg(long, global = true, default_value = "", allow_hyphen_values = true)]
    pub target_cflags: String,

    /// TOOLCHAIN_TARGET handed to every build.
    #[arg(long, global = true, default_value = "")]
    pub toolchain_target: String,

    /// Log output format.
    #[arg(long, global = true, value_parser = ["text", "json"], default_value = "text")]
    pub log_format: String,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    /// Install the tracing subscriber. RUST_LOG selects levels.
    pub fn init_tracing(&self) {
        use tracing_subscriber::EnvFilter;
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("warn"));
        if self.log_format == "json" {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .json()
                .with_writer(std::io::stderr)
                .init();
        } else {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

/// morph subcommands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Build a system locally.
    Build {
        /// System morphology name (e.g. `base`).
        morphology: String,
        /// Definitions repository URL.
        #[arg(long)]
        repo: String,
        /// Git ref of the definitions.
        #[arg(long = "ref")]
        ref_name: String,
    },
    /// Compute the build graph and print it as JSON.
    CalculateBuildGraph {
        /// System morphology name.
        morphology: String,
        /// Definitions repository URL.
        #[arg(long)]
        repo: String,
        /// Git ref of the definitions.
        #[arg(long = "ref")]
        ref_name: String,
    },
    /// Build a single artifact, identified by its cache key.
    BuildArtifact {
        /// The 64-hex cache key of the unit to build.
        cache_key: String,
        /// Definitions repository URL.
        #[arg(long)]
        repo: String,
        /// Git ref of the definitions.
        #[arg(long = "ref")]
        ref_name: String,
        /// System morphology name.
        #[arg(long)]
        morph: String,
        /// Shared cache URL: missing dependencies are fetched from here
        /// and results are uploaded back.
        #[arg(long)]
        shared_cache: Option<String>,
    },
    /// Run the distbuild controller daemon.
    ControllerDaemon {
        /// Address for initiator connections.
        #[arg(long, default_value = "0.0.0.0:7878")]
        listen_initiators: SocketAddr,
        /// Address for worker connections.
        #[arg(long, default_value = "0.0.0.0:7879")]
        listen_workers: SocketAddr,
        /// Shared (write-enabled) artifact cache URL.
        #[arg(long)]
        shared_cache: String,
    },
    /// Run a distbuild worker daemon.
    WorkerDaemon {
        /// Controller address (`host:port`).
        #[arg(long)]
        controller: String,
        /// Worker name, unique per controller.
        #[arg(long)]
        name: String,
        /// Base URL of this worker's local cache server.
        #[arg(long, default_value = "http://localhost:8080")]
        cache_url: String,
        /// Builds to run at a time on this worker.
        #[arg(long, default_value_t = 1)]
        parallel_builds: usize,
    },
    /// Build a system on a distbuild network.
    Distbuild {
        /// System morphology name.
        morphology: String,
        /// Definitions repository URL.
        #[arg(long)]
        repo: String,
        /// Git ref of the definitions.
        #[arg(long = "ref")]
        ref_name: String,
        /// Controller address (`host:port`).
        #[arg(long)]
        controller: String,
    },
    /// Serve the local artifact cache over HTTP.
    ServeCache {
        /// Listen address.
        #[arg(long, default_value = "0.0.0.0:8080")]
        listen: SocketAddr,
        /// Accept artifact uploads.
        #[arg(long)]
        enable_writes: bool,
    },
    /// Garbage-collect the local artifact cache.
    Gc {
        /// Reclaim at least this many bytes.
        #[arg(long)]
        target_free_bytes: u64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_build_command() {
        let cli = Cli::try_parse_from([
            "morph",
            "build",
            "base",
            "--repo",
            "git://example.com/defs",
            "--ref",
            "master",
        ])
        .unwrap();
        let Command::Build { morphology, repo, ref_name } = cli.command else {
            panic!("wrong subcommand")
        };
        assert_eq!(morphology, "base");
        assert_eq!(repo, "git://example.com/defs");
        assert_eq!(ref_name, "master");
    }

    #[test]
    fn build_artifact_takes_key_and_context() {
        let key = "ab".repeat(32);
        let cli = Cli::try_parse_from([
            "morph",
            "build-artifact",
            &key,
            "--repo",
            "r",
            "--ref",
            "m",
            "--morph",
            "base",
            "--shared-cache",
            "http://cache:8080",
        ])
        .unwrap();
        let Command::BuildArtifact { cache_key, shared_cache, .. } = cli.command else {
            panic!("wrong subcommand")
        };
        assert_eq!(cache_key, key);
        assert_eq!(shared_cache.as_deref(), Some("http://cache:8080"));
    }

    #[test]
    fn missing_required_flags_are_usage_errors() {
        assert!(Cli::try_parse_from(["morph", "build", "base"]).is_err());
    }

    #[test]
    fn exit_codes_map_by_error_class() {
        assert_eq!(exit_code_for(&CliError::usage("x")), EXIT_USAGE);
        assert_eq!(exit_code_for(&CliError::build("x")), EXIT_BUILD_FAILURE);
        assert_eq!(exit_code_for(&CliError::internal("x")), EXIT_INTERNAL);
    }
}
