//! `build`, `calculate-build-graph`, and `build-artifact`.

use crate::cli::CliError;
use crate::config::Config;
use morph_artifact_cache::{LocalArtifactStore, RemoteCacheClient, artifact_filename};
use morph_builder::{BuildOutcome, ChunkBuilder, assemble_aggregate};
use morph_executor::{ExecutorConfig, PlanExecutor, ProgressEvent};
use morph_graph::{BuildGraph, CacheKey, GraphBuilder, NodeIndex, UnitKind};
use morph_source::{GitCliRepoCache, GitRepoCache, SourceResolver};
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

fn map_graph_error(e: &morph_graph::Error) -> CliError {
    match e {
        morph_graph::Error::Source(_) => CliError::build(e.to_string()),
        _ => CliError::usage(e.to_string()),
    }
}

async fn resolve_graph(
    config: &Config,
    repo: &str,
    ref_name: &str,
    morphology: &str,
) -> Result<(BuildGraph, Arc<dyn GitRepoCache>), CliError> {
    let repos: Arc<dyn GitRepoCache> = Arc::new(GitCliRepoCache::new(config.gits_dir()));
    let resolver = SourceResolver::new(Arc::clone(&repos));
    let graph = GraphBuilder::new(&resolver, &config.policy)
        .build(repo, ref_name, morphology)
        .await
        .map_err(|e| map_graph_error(&e))?;
    Ok((graph, repos))
}

/// `morph build`: resolve, then drive the whole plan locally.
pub async fn build(
    config: &Config,
    repo: &str,
    ref_name: &str,
    morphology: &str,
) -> Result<(), CliError> {
    let (graph, repos) = resolve_graph(config, repo, ref_name, morphology).await?;
    let store = LocalArtifactStore::open(&config.cachedir)
        .map_err(|e| CliError::internal(e.to_string()))?;
    let builder = Arc::new(ChunkBuilder::new(store, repos, config.builder.clone()));
    let executor = PlanExecutor::new(
        builder,
        ExecutorConfig { max_parallel: 0 },
        config.builder.staging_root.clone(),
    );

    let (progress_tx, mut progress_rx) = tokio::sync::mpsc::unbounded_channel();
    let printer = tokio::spawn(async move {
        while let Some(event) = progress_rx.recv().await {
            match event {
                ProgressEvent::Started {
                    label,
                    finished,
                    total,
                } => println!("[{finished}/{total}] building {label}"),
                ProgressEvent::Finished { label, state } => {
                    println!("{label}: {state:?}");
                }
            }
        }
    });

    let cancel = CancellationToken::new();
    let report = executor
        .execute(&graph, &cancel, Some(progress_tx))
        .await
        .map_err(|e| CliError::internal(e.to_string()))?;
    let _ = printer.await;

    let target = graph.unit(graph.target());
    if report.success() {
        println!(
            "built {} ({} built, {} cached)",
            artifact_filename(&target.cache_key, target.kind, &target.artifact_name),
            report.built,
            report.cached
        );
        Ok(())
    } else {
        Err(CliError::build(format!(
            "build failed: {}",
            report.failed.join(", ")
        )))
    }
}

/// `morph calculate-build-graph`: print the plan as JSON on stdout.
pub async fn calculate_build_graph(
    config: &Config,
    repo: &str,
    ref_name: &str,
    morphology: &str,
) -> Result<(), CliError> {
    let (graph, _) = resolve_graph(config, repo, ref_name, morphology).await?;
    let plan = graph.plan();
    let json =
        serde_json::to_string(&plan).map_err(|e| CliError::internal(e.to_string()))?;
    println!("{json}");
    Ok(())
}

/// `morph build-artifact`: build exactly one unit of the graph, fetching
/// missing dependencies from (and uploading results to) the shared cache.
pub async fn build_artifact(
    config: &Config,
    repo: &str,
    ref_name: &str,
    morphology: &str,
    cache_key: &str,
    shared_cache: Option<&str>,
) -> Result<(), CliError> {
    let key = CacheKey::from_hex(cache_key).map_err(|bad| {
        CliError::usage_with_help(
            format!("'{bad}' is not a cache key"),
            "cache keys are 64 lowercase hex characters",
        )
    })?;
    let (graph, repos) = resolve_graph(config, repo, ref_name, morphology).await?;
    let index = graph.find_by_key(&key).ok_or_else(|| {
        CliError::usage(format!(
            "cache key {key} does not occur in the build graph of '{morphology}'"
        ))
    })?;
    let store = LocalArtifactStore::open(&config.cachedir)
        .map_err(|e| CliError::internal(e.to_string()))?;
    let client = shared_cache.map(RemoteCacheClient::new);

    let unit = graph.unit(index).clone();
    let dep_indices = match unit.kind {
        UnitKind::Chunk => transitive_dependencies(&graph, index),
        UnitKind::Stratum | UnitKind::System => graph.dependencies(index),
    };
    let deps: Vec<_> = dep_indices.iter().map(|&i| graph.unit(i).clone()).collect();

    // Satisfy dependencies locally, pulling from the shared cache if needed.
    for dep in &deps {
        if store.has(&dep.cache_key, dep.kind, &dep.artifact_name) {
            continue;
        }
        let Some(client) = &client else {
            return Err(CliError::build(format!(
                "dependency {} is not in the local cache and no shared cache was given",
                dep.artifact_name
            )));
        };
        // Companions first, so a visible artifact always has them.
        for filename in [
            format!("{}.meta", dep.cache_key),
            format!("{}.build-log", dep.cache_key),
            artifact_filename(&dep.cache_key, dep.kind, &dep.artifact_name),
        ] {
            let dest = store.artifacts_dir().join(&filename);
            client
                .fetch_to(&filename, &dest)
                .await
                .map_err(|e| CliError::build(format!("fetching {filename}: {e}")))?;
        }
        info!(artifact = %dep.artifact_name, "Fetched dependency from shared cache");
    }

    let outcome = match unit.kind {
        UnitKind::Chunk => {
            let builder = ChunkBuilder::new(store.clone(), repos, config.builder.clone());
            builder
                .build(&unit, deps)
                .await
                .map_err(|e| CliError::build(e.to_string()))?
        }
        UnitKind::Stratum | UnitKind::System => {
            assemble_aggregate(&store, &config.builder.staging_root, &unit, deps)
                .await
                .map_err(|e| CliError::build(e.to_string()))?
        }
    };
    if outcome == BuildOutcome::Busy {
        return Err(CliError::internal(format!(
            "cache key {key} is claimed by another builder on this host"
        )));
    }

    // Upload everything this build committed.
    if let Some(client) = &client {
        let mut files = Vec::new();
        for (name, artifact_key) in &unit.chunk_artifacts {
            let filename = artifact_filename(artifact_key, unit.kind, name);
            let path = store.artifacts_dir().join(&filename);
            if !path.exists() {
                continue;
            }
            files.push((format!("{artifact_key}.meta"), store.meta_path(artifact_key)));
            files.push((
                format!("{artifact_key}.build-log"),
                store.build_log_path(artifact_key),
            ));
            files.push((filename, path));
        }
        client
            .upload(&files)
            .await
            .map_err(|e| CliError::build(format!("uploading artifacts: {e}")))?;
        info!(count = files.len(), "Uploaded build results to shared cache");
    }

    println!(
        "{}",
        artifact_filename(&unit.cache_key, unit.kind, &unit.artifact_name)
    );
    Ok(())
}

fn transitive_dependencies(graph: &BuildGraph, index: NodeIndex) -> Vec<NodeIndex> {
    let mut seen = HashSet::new();
    let mut stack = graph.dependencies(index);
    let mut result = Vec::new();
    while let Some(dep) = stack.pop() {
        if seen.insert(dep) {
            result.push(dep);
            stack.extend(graph.dependencies(dep));
        }
    }
    result
}
