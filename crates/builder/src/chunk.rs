//! Chunk building: the full claim → stage → build → capture → commit
//! sequence for one chunk build unit.

use crate::capture::{split_install_tree, write_artifact_tar};
use crate::env::build_environment;
use crate::phases::run_phases;
use crate::staging::{StagingArea, staging_order};
use crate::{BuilderConfig, Error, Result};
use chrono::Utc;
use morph_artifact_cache::{ArtifactMeta, Claim, ClaimOutcome, LocalArtifactStore};
use morph_graph::{BuildUnit, CacheKey, UnitKind};
use morph_source::GitRepoCache;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Outcome of attempting to build one unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildOutcome {
    /// The artifact was built and committed.
    Built,
    /// The artifact was already in the cache.
    AlreadyCached,
    /// Another builder holds the claim for this key.
    Busy,
}

/// Builds chunk artifacts into a local store.
pub struct ChunkBuilder {
    store: LocalArtifactStore,
    repos: Arc<dyn GitRepoCache>,
    config: BuilderConfig,
}

impl ChunkBuilder {
    /// Create a builder over a store and repository cache.
    #[must_use]
    pub fn new(
        store: LocalArtifactStore,
        repos: Arc<dyn GitRepoCache>,
        config: BuilderConfig,
    ) -> Self {
        Self {
            store,
            repos,
            config,
        }
    }

    /// The store this builder commits into.
    #[must_use]
    pub fn store(&self) -> &LocalArtifactStore {
        &self.store
    }

    /// Build one chunk unit. `deps` are the unit's direct and staged
    /// dependencies, already satisfied in the store.
    ///
    /// One chunk build produces every sibling artifact of the unit; all of
    /// them are committed under their own keys, so sibling units become
    /// cache hits.
    #[instrument(name = "build_chunk", skip_all, fields(artifact = %unit.artifact_name, key = %unit.cache_key))]
    pub async fn build(&self, unit: &BuildUnit, deps: Vec<BuildUnit>) -> Result<BuildOutcome> {
        let mut own_claim = match self.store.claim(&unit.cache_key)? {
            ClaimOutcome::Done => return Ok(BuildOutcome::AlreadyCached),
            ClaimOutcome::Busy => return Ok(BuildOutcome::Busy),
            ClaimOutcome::Claimed(claim) => claim,
        };

        // Claim the sibling artifacts this build will also commit. A sibling
        // that is Done or Busy is simply not written here.
        let mut sibling_claims: Vec<(String, Claim)> = Vec::new();
        for (name, key) in &unit.chunk_artifacts {
            if key == &unit.cache_key {
                continue;
            }
            match self.store.claim(key)? {
                ClaimOutcome::Claimed(claim) => sibling_claims.push((name.clone(), claim)),
                ClaimOutcome::Done | ClaimOutcome::Busy => {
                    debug!(artifact = %name, "Sibling artifact already handled elsewhere");
                }
            }
        }

        let started_at = Utc::now();
        let staging = StagingArea::create(&self.config.staging_root, unit)?;
        info!(staging = %staging.root().display(), "Building chunk");

        let result = self
            .run_build(unit, deps, &staging, &mut own_claim, &mut sibling_claims, started_at)
            .await;

        match result {
            Ok(()) => {
                own_claim.commit()?;
                for (_, claim) in sibling_claims {
                    claim.commit()?;
                }
                Ok(BuildOutcome::Built)
            }
            Err(e) => {
                // The log survives the abort; invariant: every terminal
                // state leaves a build log behind.
                if let Ok(log) = std::fs::read(staging.log_path()) {
                    let _ = own_claim.save_log(&log);
                }
                own_claim.abort();
                for (_, claim) in sibling_claims {
                    claim.abort();
                }
                Err(e)
            }
        }
    }

    async fn run_build(
        &self,
        unit: &BuildUnit,
        deps: Vec<BuildUnit>,
        staging: &StagingArea,
        own_claim: &mut Claim,
        sibling_claims: &mut [(String, Claim)],
        started_at: chrono::DateTime<Utc>,
    ) -> Result<()> {
        let dep_keys: Vec<CacheKey> = {
            let mut keys: Vec<CacheKey> = deps.iter().map(|d| d.cache_key.clone()).collect();
            keys.sort();
            keys
        };

        staging
            .unpack_dependencies(&self.store, &staging_order(deps))
            .await?;
        staging.checkout_source(&self.repos, unit).await?;

        let env = build_environment(&self.config, unit, staging.root(), staging.destdir());
        run_phases(
            unit,
            &env,
            staging.source_dir(),
            &staging.log_path(),
            self.config.echo_log,
        )
        .await?;

        // Capture: split the install tree, one tar per sibling artifact.
        let catch_all = if unit.split_rules.is_empty() {
            unit.morph_name.clone()
        } else {
            format!("{}-misc", unit.morph_name)
        };
        let splits = split_install_tree(staging.destdir(), &unit.split_rules, &catch_all)?;
        let finished_at = Utc::now();
        let log = std::fs::read(staging.log_path())
            .map_err(|e| Error::staging("read build log", e))?;
        let artifact_names: Vec<String> =
            unit.chunk_artifacts.iter().map(|(n, _)| n.clone()).collect();

        let mut write_one = |name: &str, key: &CacheKey, claim: &mut Claim| -> Result<()> {
            let files = splits.get(name).cloned().unwrap_or_default();
            let partial = claim.artifact_partial(UnitKind::Chunk, name);
            write_artifact_tar(staging.destdir(), &files, &partial)?;
            claim.stage_meta(&ArtifactMeta {
                cache_key: key.clone(),
                kind: UnitKind::Chunk.as_str().to_string(),
                artifacts: artifact_names.clone(),
                source_sha: unit.source.sha.clone(),
                dependencies: dep_keys.clone(),
                started_at,
                finished_at,
                last_access: finished_at,
            })?;
            claim.save_log(&log)?;
            Ok(())
        };

        write_one(&unit.artifact_name, &unit.cache_key, own_claim)?;
        for (name, claim) in sibling_claims.iter_mut() {
            let key = unit
                .chunk_artifacts
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, k)| k.clone())
                .unwrap_or_else(|| unreachable!("claimed siblings come from chunk_artifacts"));
            write_one(name, &key, claim)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use morph_graph::UnitSource;
    use morph_morphology::{BuildMode, Phase, SplitRule};
    use morph_source::testing::InMemoryRepoCache;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    const SHA: &str = "2222222222222222222222222222222222222222";
    const REPO: &str = "git://example.com/hello";

    fn hello_unit(install_commands: &[&str]) -> BuildUnit {
        let mut phase_commands = BTreeMap::new();
        phase_commands.insert(
            Phase::Install,
            install_commands.iter().map(ToString::to_string).collect(),
        );
        let key = CacheKey::from_hex("c".repeat(64)).unwrap();
        BuildUnit {
            kind: UnitKind::Chunk,
            artifact_name: "hello".into(),
            morph_name: "hello".into(),
            stratum_name: Some("core".into()),
            source: UnitSource {
                repo: REPO.into(),
                ref_name: "master".into(),
                sha: SHA.into(),
                submodules: vec![],
            },
            canonical_morph: "{}".into(),
            build_mode: BuildMode::Normal,
            prefix: "/usr".into(),
            max_jobs: None,
            phase_commands,
            split_rules: vec![],
            chunk_artifacts: vec![("hello".into(), key.clone())],
            cache_key: key,
        }
    }

    fn fixture(tmp: &TempDir) -> (ChunkBuilder, BuildUnit) {
        let cache = InMemoryRepoCache::new();
        cache.add_ref(REPO, "master", SHA);
        cache.add_file(REPO, SHA, "hello.sh", b"#!/bin/sh\necho hello\n");
        let store = LocalArtifactStore::open(tmp.path().join("cache")).unwrap();
        let config = BuilderConfig {
            staging_root: tmp.path().join("staging"),
            ..BuilderConfig::default()
        };
        let builder = ChunkBuilder::new(store, Arc::new(cache), config);
        let unit = hello_unit(&[
            "mkdir -p \"$DESTDIR$PREFIX/bin\"",
            "install -m 755 hello.sh \"$DESTDIR$PREFIX/bin/hello\"",
        ]);
        (builder, unit)
    }

    #[tokio::test]
    async fn builds_and_commits_single_artifact() {
        let tmp = TempDir::new().unwrap();
        let (builder, unit) = fixture(&tmp);

        let outcome = builder.build(&unit, vec![]).await.unwrap();
        assert_eq!(outcome, BuildOutcome::Built);
        assert!(builder.store().has(&unit.cache_key, UnitKind::Chunk, "hello"));
        let log_path = builder.store().build_log_path(&unit.cache_key);
        assert!(log_path.exists());
        let log = std::fs::read_to_string(log_path).unwrap();
        assert!(log.contains("install"), "log should carry the transcript: {log}");

        // A second build is a cache hit.
        let outcome = builder.build(&unit, vec![]).await.unwrap();
        assert_eq!(outcome, BuildOutcome::AlreadyCached);
    }

    #[tokio::test]
    async fn failed_build_preserves_log_and_no_artifact() {
        let tmp = TempDir::new().unwrap();
        let (builder, _) = fixture(&tmp);
        let mut unit = hello_unit(&[]);
        unit.phase_commands
            .insert(Phase::Build, vec!["echo X".into(), "false".into()]);

        let err = builder.build(&unit, vec![]).await.unwrap_err();
        assert!(matches!(err, Error::BuildCommandFailed { .. }), "{err}");
        assert!(!builder.store().has(&unit.cache_key, UnitKind::Chunk, "hello"));
        let log = std::fs::read_to_string(builder.store().build_log_path(&unit.cache_key)).unwrap();
        assert!(log.contains('X'));
    }

    #[tokio::test]
    async fn split_products_commit_sibling_artifacts() {
        let tmp = TempDir::new().unwrap();
        let (builder, _) = fixture(&tmp);
        let mut unit = hello_unit(&[
            "mkdir -p \"$DESTDIR$PREFIX/bin\" \"$DESTDIR$PREFIX/include\"",
            "cp hello.sh \"$DESTDIR$PREFIX/bin/hello\"",
            "touch \"$DESTDIR$PREFIX/include/hello.h\"",
        ]);
        unit.split_rules = vec![SplitRule {
            artifact: "hello-devel".into(),
            include: vec!["usr/include/.*".into()],
        }];
        let devel_key = CacheKey::from_hex("d".repeat(64)).unwrap();
        unit.artifact_name = "hello-devel".into();
        let misc_key = CacheKey::from_hex("e".repeat(64)).unwrap();
        unit.cache_key = devel_key.clone();
        unit.chunk_artifacts = vec![
            ("hello-devel".into(), devel_key.clone()),
            ("hello-misc".into(), misc_key.clone()),
        ];

        let outcome = builder.build(&unit, vec![]).await.unwrap();
        assert_eq!(outcome, BuildOutcome::Built);
        assert!(builder.store().has(&devel_key, UnitKind::Chunk, "hello-devel"));
        assert!(builder.store().has(&misc_key, UnitKind::Chunk, "hello-misc"));
        assert!(builder.store().build_log_path(&misc_key).exists());
    }

    #[tokio::test]
    async fn pinned_submodules_are_checked_out() {
        let tmp = TempDir::new().unwrap();
        let (builder, _) = fixture(&tmp);

        let sub_repo = "git://example.com/gnulib";
        let sub_sha = "9999999999999999999999999999999999999999";
        let cache = InMemoryRepoCache::new();
        cache.add_ref(REPO, "master", SHA);
        cache.add_file(REPO, SHA, "hello.sh", b"#!/bin/sh\necho hello\n");
        cache.add_ref(sub_repo, sub_sha, sub_sha);
        cache.add_file(sub_repo, sub_sha, "README", b"gnulib\n");
        let store = builder.store().clone();
        let config = BuilderConfig {
            staging_root: tmp.path().join("staging2"),
            ..BuilderConfig::default()
        };
        let builder = ChunkBuilder::new(store, Arc::new(cache), config);

        let mut unit = hello_unit(&[
            "test -f gnulib/README",
            "mkdir -p \"$DESTDIR$PREFIX/share\"",
            "cp gnulib/README \"$DESTDIR$PREFIX/share/README\"",
        ]);
        unit.source.submodules = vec![morph_source::Submodule {
            path: "gnulib".into(),
            url: sub_repo.into(),
            sha: sub_sha.into(),
        }];

        let outcome = builder.build(&unit, vec![]).await.unwrap();
        assert_eq!(outcome, BuildOutcome::Built);
    }

    #[tokio::test]
    async fn dependency_artifacts_are_staged() {
        let tmp = TempDir::new().unwrap();
        let (builder, dep_unit) = fixture(&tmp);

        // Build the dependency first.
        builder.build(&dep_unit, vec![]).await.unwrap();

        // A second chunk that runs the dependency's staged binary: the
        // staging prefix bin directory is on PATH.
        let mut unit = hello_unit(&["hello > \"$DESTDIR/out.txt\""]);
        unit.morph_name = "uses-hello".into();
        unit.artifact_name = "uses-hello".into();
        unit.cache_key = CacheKey::from_hex("f".repeat(64)).unwrap();
        unit.chunk_artifacts = vec![("uses-hello".into(), unit.cache_key.clone())];

        let outcome = builder.build(&unit, vec![dep_unit]).await.unwrap();
        assert_eq!(outcome, BuildOutcome::Built);
    }
}
