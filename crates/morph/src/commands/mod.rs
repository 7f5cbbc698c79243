//! Subcommand implementations.

mod build;
mod cache;
mod daemons;

use crate::cli::{Cli, CliError, Command};
use crate::config::Config;

/// Run the selected subcommand.
pub async fn dispatch(cli: Cli) -> Result<(), CliError> {
    let config = Config::from_cli(&cli);
    match cli.command {
        Command::Build {
            morphology,
            repo,
            ref_name,
        } => build::build(&config, &repo, &ref_name, &morphology).await,
        Command::CalculateBuildGraph {
            morphology,
            repo,
            ref_name,
        } => build::calculate_build_graph(&config, &repo, &ref_name, &morphology).await,
        Command::BuildArtifact {
            cache_key,
            repo,
            ref_name,
            morph,
            shared_cache,
        } => {
            build::build_artifact(
                &config,
                &repo,
                &ref_name,
                &morph,
                &cache_key,
                shared_cache.as_deref(),
            )
            .await
        }
        Command::ControllerDaemon {
            listen_initiators,
            listen_workers,
            shared_cache,
        } => daemons::controller(listen_initiators, listen_workers, shared_cache).await,
        Command::WorkerDaemon {
            controller,
            name,
            cache_url,
            parallel_builds,
        } => daemons::worker(controller, name, cache_url, parallel_builds).await,
        Command::Distbuild {
            morphology,
            repo,
            ref_name,
            controller,
        } => daemons::distbuild(&controller, &repo, &ref_name, &morphology).await,
        Command::ServeCache {
            listen,
            enable_writes,
        } => cache::serve(&config, listen, enable_writes).await,
        Command::Gc { target_free_bytes } => cache::gc(&config, target_free_bytes),
    }
}
