//! Stratum and system assembly: aggregation of member artifacts into one
//! tarball.

use crate::capture::{split_install_tree, write_artifact_tar};
use crate::staging::staging_order;
use crate::{BuildOutcome, Error, Result};
use chrono::Utc;
use morph_artifact_cache::{ArtifactMeta, ClaimOutcome, LocalArtifactStore};
use morph_graph::{BuildUnit, CacheKey};
use tracing::{info, instrument};

/// Assemble a stratum or system artifact from its member artifacts.
///
/// Members are unpacked into a fresh tree in deterministic order and the
/// union is tarred up. The build log records which artifacts went in.
#[instrument(name = "assemble", skip_all, fields(artifact = %unit.artifact_name, key = %unit.cache_key))]
pub async fn assemble_aggregate(
    store: &LocalArtifactStore,
    staging_root: &std::path::Path,
    unit: &BuildUnit,
    members: Vec<BuildUnit>,
) -> Result<BuildOutcome> {
    let mut claim = match store.claim(&unit.cache_key)? {
        ClaimOutcome::Done => return Ok(BuildOutcome::AlreadyCached),
        ClaimOutcome::Busy => return Ok(BuildOutcome::Busy),
        ClaimOutcome::Claimed(claim) => claim,
    };

    let started_at = Utc::now();
    std::fs::create_dir_all(staging_root)
        .map_err(|e| Error::staging("create staging parent", e))?;
    let tree = tempfile::Builder::new()
        .prefix(&format!("{}.", unit.artifact_name))
        .tempdir_in(staging_root)
        .map_err(|e| Error::staging("create assembly dir", e))?;

    let mut log = String::new();
    let mut dep_keys: Vec<CacheKey> = members.iter().map(|m| m.cache_key.clone()).collect();
    dep_keys.sort();

    let members = staging_order(members);
    info!(members = members.len(), "Assembling aggregate artifact");
    for member in &members {
        let path = store.artifact_path(&member.cache_key, member.kind, &member.artifact_name);
        log.push_str(&format!(
            "including {}.{}.{}\n",
            member.cache_key, member.kind, member.artifact_name
        ));
        let file = std::fs::File::open(&path)
            .map_err(|e| Error::staging("open member artifact", e))?;
        tar::Archive::new(file)
            .unpack(tree.path())
            .map_err(|e| Error::staging("unpack member artifact", e))?;
    }

    let result = (|| -> Result<()> {
        let splits = split_install_tree(tree.path(), &[], &unit.artifact_name)?;
        let files = splits
            .get(&unit.artifact_name)
            .cloned()
            .unwrap_or_default();
        let partial = claim.artifact_partial(unit.kind, &unit.artifact_name);
        write_artifact_tar(tree.path(), &files, &partial)?;
        let finished_at = Utc::now();
        claim.stage_meta(&ArtifactMeta {
            cache_key: unit.cache_key.clone(),
            kind: unit.kind.as_str().to_string(),
            artifacts: vec![unit.artifact_name.clone()],
            source_sha: unit.source.sha.clone(),
            dependencies: dep_keys.clone(),
            started_at,
            finished_at,
            last_access: finished_at,
        })?;
        claim.save_log(log.as_bytes())?;
        Ok(())
    })();

    match result {
        Ok(()) => {
            claim.commit()?;
            Ok(BuildOutcome::Built)
        }
        Err(e) => {
            let _ = claim.save_log(log.as_bytes());
            claim.abort();
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use morph_graph::{UnitKind, UnitSource};
    use morph_morphology::BuildMode;
    use morph_artifact_cache::ClaimOutcome as Outcome;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn unit(name: &str, kind: UnitKind, key_byte: char) -> BuildUnit {
        BuildUnit {
            kind,
            artifact_name: name.into(),
            morph_name: name.into(),
            stratum_name: None,
            source: UnitSource {
                repo: "git://example.com/defs".into(),
                ref_name: "master".into(),
                sha: "1".repeat(40),
                submodules: vec![],
            },
            canonical_morph: "{}".into(),
            build_mode: BuildMode::Normal,
            prefix: "/usr".into(),
            max_jobs: None,
            phase_commands: BTreeMap::new(),
            split_rules: vec![],
            chunk_artifacts: vec![],
            cache_key: morph_graph::CacheKey::from_hex(key_byte.to_string().repeat(64)).unwrap(),
        }
    }

    fn commit_chunk(store: &LocalArtifactStore, chunk: &BuildUnit, rel_path: &str) {
        let tree = TempDir::new().unwrap();
        let file = tree.path().join(rel_path);
        std::fs::create_dir_all(file.parent().unwrap()).unwrap();
        std::fs::write(&file, chunk.artifact_name.as_bytes()).unwrap();

        let Outcome::Claimed(mut claim) = store.claim(&chunk.cache_key).unwrap() else {
            panic!("expected claim")
        };
        let partial = claim.artifact_partial(chunk.kind, &chunk.artifact_name);
        let splits = split_install_tree(tree.path(), &[], &chunk.artifact_name).unwrap();
        write_artifact_tar(tree.path(), &splits[&chunk.artifact_name], &partial).unwrap();
        claim.save_log(b"built\n").unwrap();
        claim.commit().unwrap();
    }

    #[tokio::test]
    async fn stratum_tar_is_union_of_members() {
        let tmp = TempDir::new().unwrap();
        let store = LocalArtifactStore::open(tmp.path().join("cache")).unwrap();

        let a = unit("a", UnitKind::Chunk, 'a');
        let b = unit("b", UnitKind::Chunk, 'b');
        commit_chunk(&store, &a, "usr/bin/a");
        commit_chunk(&store, &b, "usr/lib/libb.so");

        let stratum = unit("core", UnitKind::Stratum, 'c');
        let outcome = assemble_aggregate(
            &store,
            &tmp.path().join("staging"),
            &stratum,
            vec![a, b],
        )
        .await
        .unwrap();
        assert_eq!(outcome, BuildOutcome::Built);

        // Unpack and verify the union.
        let out = TempDir::new().unwrap();
        let tar_path = store.artifact_path(&stratum.cache_key, UnitKind::Stratum, "core");
        tar::Archive::new(std::fs::File::open(tar_path).unwrap())
            .unpack(out.path())
            .unwrap();
        assert!(out.path().join("usr/bin/a").exists());
        assert!(out.path().join("usr/lib/libb.so").exists());

        let log =
            std::fs::read_to_string(store.build_log_path(&stratum.cache_key)).unwrap();
        assert!(log.contains("including"), "{log}");
    }

    #[tokio::test]
    async fn cached_aggregate_is_skipped() {
        let tmp = TempDir::new().unwrap();
        let store = LocalArtifactStore::open(tmp.path().join("cache")).unwrap();
        let a = unit("a", UnitKind::Chunk, 'a');
        commit_chunk(&store, &a, "usr/bin/a");
        let stratum = unit("core", UnitKind::Stratum, 'd');

        let first = assemble_aggregate(&store, &tmp.path().join("s"), &stratum, vec![a.clone()])
            .await
            .unwrap();
        assert_eq!(first, BuildOutcome::Built);
        let second = assemble_aggregate(&store, &tmp.path().join("s"), &stratum, vec![a])
            .await
            .unwrap();
        assert_eq!(second, BuildOutcome::AlreadyCached);
    }
}
