//! `serve-cache` and `gc`.

use crate::cli::CliError;
use crate::config::Config;
use morph_artifact_cache::{LocalArtifactStore, RemoteCacheServer, ServerConfig};
use std::net::SocketAddr;

/// `morph serve-cache`: expose the local store over HTTP.
pub async fn serve(
    config: &Config,
    listen: SocketAddr,
    enable_writes: bool,
) -> Result<(), CliError> {
    let store = LocalArtifactStore::open(&config.cachedir)
        .map_err(|e| CliError::internal(e.to_string()))?;
    RemoteCacheServer::new(
        store,
        ServerConfig {
            addr: listen,
            enable_writes,
        },
    )
    .serve()
    .await
    .map_err(|e| CliError::internal(e.to_string()))
}

/// `morph gc`: reclaim space from the local store, oldest keys first.
pub fn gc(config: &Config, target_free_bytes: u64) -> Result<(), CliError> {
    let store = LocalArtifactStore::open(&config.cachedir)
        .map_err(|e| CliError::internal(e.to_string()))?;
    let outcome = store
        .gc(target_free_bytes)
        .map_err(|e| CliError::internal(e.to_string()))?;
    println!(
        "removed {} key groups, freed {} bytes",
        outcome.groups_removed, outcome.bytes_freed
    );
    Ok(())
}
