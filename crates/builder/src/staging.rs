//! Staging-area assembly.
//!
//! A staging area is a fresh directory holding the unpacked artifacts of a
//! unit's dependencies, the checked-out source tree, and the install capture
//! directory. Dependency artifacts are rooted at `/` (their tar paths are
//! DESTDIR-relative), so bootstrap artifacts land under the tooling prefix
//! they were built with.

use crate::{Error, Result};
use morph_artifact_cache::LocalArtifactStore;
use morph_graph::BuildUnit;
use morph_source::GitRepoCache;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// One build's staging area.
pub struct StagingArea {
    root: tempfile::TempDir,
    source_dir: PathBuf,
    destdir: PathBuf,
}

impl StagingArea {
    /// Create an empty staging area for `unit` under `parent`.
    pub fn create(parent: &Path, unit: &BuildUnit) -> Result<Self> {
        std::fs::create_dir_all(parent)
            .map_err(|e| Error::staging("create staging parent", e))?;
        let root = tempfile::Builder::new()
            .prefix(&format!("{}.", unit.morph_name))
            .tempdir_in(parent)
            .map_err(|e| Error::staging("create staging dir", e))?;
        let source_dir = root.path().join(format!("{}.build", unit.morph_name));
        let destdir = root.path().join(format!("{}.inst", unit.morph_name));
        std::fs::create_dir_all(&source_dir)
            .map_err(|e| Error::staging("create source dir", e))?;
        std::fs::create_dir_all(&destdir)
            .map_err(|e| Error::staging("create install dir", e))?;
        Ok(Self {
            root,
            source_dir,
            destdir,
        })
    }

    /// The staging root.
    #[must_use]
    pub fn root(&self) -> &Path {
        self.root.path()
    }

    /// Where the source is checked out.
    #[must_use]
    pub fn source_dir(&self) -> &Path {
        &self.source_dir
    }

    /// The install capture directory (`$DESTDIR`).
    #[must_use]
    pub fn destdir(&self) -> &Path {
        &self.destdir
    }

    /// Path of the build log inside the staging area.
    #[must_use]
    pub fn log_path(&self) -> PathBuf {
        self.root.path().join("build.log")
    }

    /// Unpack dependency artifacts into the staging root.
    ///
    /// `deps` must arrive in a deterministic order (topological, ties broken
    /// by cache key); unpacking is sequential so later artifacts win file
    /// conflicts deterministically.
    pub async fn unpack_dependencies(
        &self,
        store: &LocalArtifactStore,
        deps: &[BuildUnit],
    ) -> Result<()> {
        for dep in deps {
            let path = store.artifact_path(&dep.cache_key, dep.kind, &dep.artifact_name);
            let root = self.root.path().to_path_buf();
            debug!(artifact = %dep.artifact_name, "Unpacking dependency into staging");
            let unpack_path = path.clone();
            tokio::task::spawn_blocking(move || -> Result<()> {
                let file = std::fs::File::open(&unpack_path)
                    .map_err(|e| Error::staging("open dependency artifact", e))?;
                tar::Archive::new(file)
                    .unpack(&root)
                    .map_err(|e| Error::staging("unpack dependency artifact", e))?;
                Ok(())
            })
            .await
            .map_err(|e| Error::staging("join unpack task", std::io::Error::other(e)))??;
            // Reading a dependency refreshes its LRU position.
            let _ = store.open_for_read(&dep.cache_key, dep.kind, &dep.artifact_name);
        }
        Ok(())
    }

    /// Check out the unit's pinned source, including pinned submodules.
    pub async fn checkout_source(
        &self,
        repos: &Arc<dyn GitRepoCache>,
        unit: &BuildUnit,
    ) -> Result<()> {
        repos
            .checkout(&unit.source.repo, &unit.source.sha, &self.source_dir)
            .await?;
        for submodule in &unit.source.submodules {
            repos.ensure_fetched(&submodule.url, &submodule.sha).await?;
            let dest = self.source_dir.join(&submodule.path);
            repos.checkout(&submodule.url, &submodule.sha, &dest).await?;
            debug!(path = %submodule.path, sha = %submodule.sha, "Checked out submodule");
        }
        Ok(())
    }

    /// Keep the staging directory on disk and return its path, for
    /// post-mortem inspection.
    #[must_use]
    pub fn keep(self) -> PathBuf {
        self.root.keep()
    }
}

/// Sort dependency units into staging order: chunks before strata, then by
/// cache key. Bit-deterministic where the filesystem permits.
#[must_use]
pub fn staging_order(mut deps: Vec<BuildUnit>) -> Vec<BuildUnit> {
    deps.sort_by(|a, b| {
        (a.kind.priority(), &a.cache_key).cmp(&(b.kind.priority(), &b.cache_key))
    });
    deps
}

#[cfg(test)]
mod tests {
    use super::*;
    use morph_graph::{CacheKey, UnitKind};
    use morph_morphology::BuildMode;

    // Constructing BuildUnits inline is verbose; tests use a tiny helper.
    fn unit_with_key(name: &str, kind: UnitKind, key_byte: char) -> BuildUnit {
        BuildUnit {
            kind,
            artifact_name: name.into(),
            morph_name: name.into(),
            stratum_name: None,
            source: morph_graph::UnitSource {
                repo: String::new(),
                ref_name: String::new(),
                sha: "a".repeat(40),
                submodules: vec![],
            },
            canonical_morph: String::new(),
            build_mode: BuildMode::Normal,
            prefix: "/usr".into(),
            max_jobs: None,
            phase_commands: Default::default(),
            split_rules: vec![],
            chunk_artifacts: vec![],
            cache_key: CacheKey::from_hex(key_byte.to_string().repeat(64)).unwrap(),
        }
    }

    #[test]
    fn staging_order_is_kind_then_key() {
        let ordered = staging_order(vec![
            unit_with_key("s", UnitKind::Stratum, '1'),
            unit_with_key("b", UnitKind::Chunk, 'b'),
            unit_with_key("a", UnitKind::Chunk, 'a'),
        ]);
        let names: Vec<&str> = ordered.iter().map(|u| u.artifact_name.as_str()).collect();
        assert_eq!(names, ["a", "b", "s"]);
    }
}
