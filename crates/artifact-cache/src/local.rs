//! The local artifact store.
//!
//! A flat directory of `<key>.<kind>.<name>` tarballs with their
//! `<key>.build-log` and `<key>.meta` companions. Writes go through an
//! exclusive claim per key: partial files are staged as `*.partial` and
//! atomically renamed on commit, so a final filename always names a complete
//! artifact. The lock file is advisory and released on drop; after a crash
//! or reboot, the presence of final files is what matters, never the lock.

use crate::meta::ArtifactMeta;
use crate::naming::artifact_filename;
use crate::{Error, Result};
use chrono::Utc;
use morph_graph::{CacheKey, UnitKind};
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Outcome of a claim attempt.
#[derive(Debug)]
pub enum ClaimOutcome {
    /// Exclusive write rights granted.
    Claimed(Claim),
    /// Another holder is active for this key.
    Busy,
    /// The artifact already exists; nothing to build.
    Done,
}

/// Result of a garbage collection sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcOutcome {
    /// Whole key groups removed.
    pub groups_removed: usize,
    /// Bytes reclaimed.
    pub bytes_freed: u64,
}

/// The local content-addressed artifact store.
#[derive(Debug, Clone)]
pub struct LocalArtifactStore {
    artifacts_dir: PathBuf,
}

impl LocalArtifactStore {
    /// Open (creating if needed) the store under `<cache_dir>/artifacts`.
    pub fn open(cache_dir: impl Into<PathBuf>) -> Result<Self> {
        let artifacts_dir = cache_dir.into().join("artifacts");
        fs::create_dir_all(&artifacts_dir)
            .map_err(|e| Error::io("create_dir_all", &artifacts_dir, e))?;
        Ok(Self { artifacts_dir })
    }

    /// The directory holding artifacts.
    #[must_use]
    pub fn artifacts_dir(&self) -> &Path {
        &self.artifacts_dir
    }

    /// Path of the final artifact file for `(key, kind, name)`.
    #[must_use]
    pub fn artifact_path(&self, key: &CacheKey, kind: UnitKind, name: &str) -> PathBuf {
        self.artifacts_dir.join(artifact_filename(key, kind, name))
    }

    /// Path of the build log for `key`.
    #[must_use]
    pub fn build_log_path(&self, key: &CacheKey) -> PathBuf {
        self.artifacts_dir.join(format!("{key}.build-log"))
    }

    /// Path of the metadata file for `key`.
    #[must_use]
    pub fn meta_path(&self, key: &CacheKey) -> PathBuf {
        self.artifacts_dir.join(format!("{key}.meta"))
    }

    /// O(1) existence check for one artifact.
    #[must_use]
    pub fn has(&self, key: &CacheKey, kind: UnitKind, name: &str) -> bool {
        self.artifact_path(key, kind, name).exists()
    }

    /// Whether any final artifact exists for `key`.
    #[must_use]
    pub fn has_any(&self, key: &CacheKey) -> bool {
        self.final_artifacts(key).next().is_some()
    }

    fn final_artifacts(&self, key: &CacheKey) -> impl Iterator<Item = PathBuf> {
        let prefix = format!("{key}.");
        let dir = self.artifacts_dir.clone();
        fs::read_dir(&dir)
            .into_iter()
            .flatten()
            .flatten()
            .map(|entry| entry.path())
            .filter(move |path| {
                let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                    return false;
                };
                name.starts_with(&prefix)
                    && !name.ends_with(".partial")
                    && !name.ends_with(".lock")
                    && !name.ends_with(".build-log")
                    && !name.ends_with(".meta")
            })
    }

    /// Open an artifact for reading, touching its LRU timestamp.
    pub fn open_for_read(
        &self,
        key: &CacheKey,
        kind: UnitKind,
        name: &str,
    ) -> Result<fs::File> {
        let path = self.artifact_path(key, kind, name);
        let file = fs::File::open(&path).map_err(|e| Error::io("open", &path, e))?;
        self.touch(key);
        Ok(file)
    }

    /// Read the metadata for `key`, if present.
    pub fn read_meta(&self, key: &CacheKey) -> Result<Option<ArtifactMeta>> {
        let path = self.meta_path(key);
        match fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text)
                .map(Some)
                .map_err(|e| Error::io("parse", &path, io::Error::other(e))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::io("read", &path, e)),
        }
    }

    /// Best-effort update of `meta.last_access`.
    fn touch(&self, key: &CacheKey) {
        if let Ok(Some(mut meta)) = self.read_meta(key) {
            meta.last_access = Utc::now();
            if let Ok(json) = serde_json::to_string_pretty(&meta) {
                let _ = fs::write(self.meta_path(key), json);
            }
        }
    }

    /// Attempt to acquire exclusive write rights for `key`.
    ///
    /// Returns [`ClaimOutcome::Done`] if a final artifact already exists,
    /// [`ClaimOutcome::Busy`] if another holder is active.
    pub fn claim(&self, key: &CacheKey) -> Result<ClaimOutcome> {
        if self.has_any(key) {
            return Ok(ClaimOutcome::Done);
        }
        let lock_path = self.artifacts_dir.join(format!("{key}.lock"));
        match OpenOptions::new().write(true).create_new(true).open(&lock_path) {
            Ok(_) => {
                debug!(%key, "Claimed cache key");
                Ok(ClaimOutcome::Claimed(Claim {
                    key: key.clone(),
                    dir: self.artifacts_dir.clone(),
                    lock_path,
                    partials: Vec::new(),
                    committed: false,
                }))
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(ClaimOutcome::Busy),
            Err(e) => Err(Error::io("lock", &lock_path, e)),
        }
    }

    /// Delete least-recently-used key groups until at least
    /// `target_free_bytes` have been reclaimed. Whole groups only; groups
    /// with an active claim are skipped.
    pub fn gc(&self, target_free_bytes: u64) -> Result<GcOutcome> {
        struct Group {
            last_access: chrono::DateTime<Utc>,
            files: Vec<(PathBuf, u64)>,
        }

        let mut groups: HashMap<String, Group> = HashMap::new();
        let dir = fs::read_dir(&self.artifacts_dir)
            .map_err(|e| Error::io("read_dir", &self.artifacts_dir, e))?;
        for entry in dir.flatten() {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(key_part) = name.split('.').next() else {
                continue;
            };
            let Ok(key) = CacheKey::from_hex(key_part) else {
                continue;
            };
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            let group = groups.entry(key.as_hex().to_string()).or_insert_with(|| Group {
                last_access: self
                    .read_meta(&key)
                    .ok()
                    .flatten()
                    .map_or_else(|| chrono::DateTime::<Utc>::MIN_UTC, |m| m.last_access),
                files: Vec::new(),
            });
            group.files.push((path, size));
        }

        let mut ordered: Vec<(String, Group)> = groups.into_iter().collect();
        ordered.sort_by(|a, b| a.1.last_access.cmp(&b.1.last_access));

        let mut outcome = GcOutcome::default();
        for (key, group) in ordered {
            if outcome.bytes_freed >= target_free_bytes {
                break;
            }
            if group
                .files
                .iter()
                .any(|(p, _)| p.extension().is_some_and(|e| e == "lock"))
            {
                debug!(key, "Skipping in-flight key group during GC");
                continue;
            }
            for (path, size) in &group.files {
                match fs::remove_file(path) {
                    Ok(()) => outcome.bytes_freed += size,
                    Err(e) => warn!(path = %path.display(), error = %e, "GC failed to remove file"),
                }
            }
            outcome.groups_removed += 1;
            debug!(key, "GC removed key group");
        }
        Ok(outcome)
    }
}

/// Exclusive write rights for one cache key.
///
/// Stage partial files, then [`commit`](Claim::commit) to atomically publish
/// them, or [`abort`](Claim::abort) to discard. Dropping an uncommitted claim
/// aborts. The build log is saved outside the partial set so it survives an
/// abort: a failed build keeps its log.
#[derive(Debug)]
pub struct Claim {
    key: CacheKey,
    dir: PathBuf,
    lock_path: PathBuf,
    partials: Vec<(PathBuf, PathBuf)>,
    committed: bool,
}

impl Claim {
    /// The claimed key.
    #[must_use]
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Register and return the partial path for an artifact tarball.
    /// The caller writes the tarball there before committing.
    pub fn artifact_partial(&mut self, kind: UnitKind, name: &str) -> PathBuf {
        let final_path = self.dir.join(artifact_filename(&self.key, kind, name));
        let partial = self.dir.join(format!(
            "{}.partial",
            artifact_filename(&self.key, kind, name)
        ));
        self.partials.push((partial.clone(), final_path));
        partial
    }

    /// Stage the metadata file.
    pub fn stage_meta(&mut self, meta: &ArtifactMeta) -> Result<()> {
        let final_path = self.dir.join(format!("{}.meta", self.key));
        let partial = self.dir.join(format!("{}.meta.partial", self.key));
        let json = serde_json::to_string_pretty(meta)
            .map_err(|e| Error::io("serialize", &partial, io::Error::other(e)))?;
        fs::write(&partial, json).map_err(|e| Error::io("write", &partial, e))?;
        self.partials.push((partial, final_path));
        Ok(())
    }

    /// Persist the build log immediately, atomically. Called on success and
    /// on failure alike, before commit or abort.
    pub fn save_log(&self, contents: &[u8]) -> Result<()> {
        let final_path = self.dir.join(format!("{}.build-log", self.key));
        let tmp = self.dir.join(format!("{}.build-log.tmp", self.key));
        fs::write(&tmp, contents).map_err(|e| Error::io("write", &tmp, e))?;
        fs::rename(&tmp, &final_path).map_err(|e| Error::io("rename", &final_path, e))?;
        Ok(())
    }

    /// Atomically publish all staged files.
    ///
    /// Metadata is renamed before artifact tarballs, so a visible artifact
    /// always has its companions.
    pub fn commit(mut self) -> Result<()> {
        self.partials.sort_by_key(|(_, final_path)| {
            // `.meta` first, artifacts after.
            let is_meta = final_path
                .extension()
                .is_some_and(|e| e == "meta");
            !is_meta
        });
        for (partial, final_path) in &self.partials {
            fs::rename(partial, final_path).map_err(|e| Error::io("rename", final_path, e))?;
        }
        debug!(key = %self.key, files = self.partials.len(), "Committed claim");
        self.partials.clear();
        self.committed = true;
        Ok(())
    }

    /// Discard staged files, keeping the build log and releasing the lock.
    pub fn abort(self) {
        drop(self);
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        if !self.committed {
            for (partial, _) in &self.partials {
                if let Err(e) = fs::remove_file(partial) {
                    if e.kind() != io::ErrorKind::NotFound {
                        warn!(path = %partial.display(), error = %e, "Failed to remove partial");
                    }
                }
            }
        }
        if let Err(e) = fs::remove_file(&self.lock_path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(key = %self.key, error = %e, "Failed to release claim lock");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn key(byte: char) -> CacheKey {
        CacheKey::from_hex(byte.to_string().repeat(64)).unwrap()
    }

    fn meta_for(k: &CacheKey) -> ArtifactMeta {
        let now = Utc::now();
        ArtifactMeta {
            cache_key: k.clone(),
            kind: "chunk".into(),
            artifacts: vec!["hello".into()],
            source_sha: "a".repeat(40),
            dependencies: vec![],
            started_at: now,
            finished_at: now,
            last_access: now,
        }
    }

    fn commit_artifact(store: &LocalArtifactStore, k: &CacheKey, contents: &[u8]) {
        let ClaimOutcome::Claimed(mut claim) = store.claim(k).unwrap() else {
            panic!("expected claim")
        };
        let partial = claim.artifact_partial(UnitKind::Chunk, "hello");
        fs::write(&partial, contents).unwrap();
        claim.stage_meta(&meta_for(k)).unwrap();
        claim.save_log(b"log line\n").unwrap();
        claim.commit().unwrap();
    }

    #[test]
    fn claim_commit_publishes_artifact() {
        let tmp = TempDir::new().unwrap();
        let store = LocalArtifactStore::open(tmp.path()).unwrap();
        let k = key('a');

        commit_artifact(&store, &k, b"tar bytes");
        assert!(store.has(&k, UnitKind::Chunk, "hello"));
        assert!(store.build_log_path(&k).exists());
        assert!(store.read_meta(&k).unwrap().is_some());
    }

    #[test]
    fn second_claim_is_busy_then_done() {
        let tmp = TempDir::new().unwrap();
        let store = LocalArtifactStore::open(tmp.path()).unwrap();
        let k = key('b');

        let ClaimOutcome::Claimed(claim) = store.claim(&k).unwrap() else {
            panic!("expected claim")
        };
        assert!(matches!(store.claim(&k).unwrap(), ClaimOutcome::Busy));
        drop(claim);

        commit_artifact(&store, &k, b"x");
        assert!(matches!(store.claim(&k).unwrap(), ClaimOutcome::Done));
    }

    #[test]
    fn abort_keeps_log_and_removes_partials() {
        let tmp = TempDir::new().unwrap();
        let store = LocalArtifactStore::open(tmp.path()).unwrap();
        let k = key('c');

        let ClaimOutcome::Claimed(mut claim) = store.claim(&k).unwrap() else {
            panic!("expected claim")
        };
        let partial = claim.artifact_partial(UnitKind::Chunk, "hello");
        fs::write(&partial, b"incomplete").unwrap();
        claim.save_log(b"build failed here\n").unwrap();
        claim.abort();

        assert!(!store.has(&k, UnitKind::Chunk, "hello"));
        assert!(!partial.exists());
        assert!(store.build_log_path(&k).exists(), "log must survive abort");
        // The key is claimable again.
        assert!(matches!(store.claim(&k).unwrap(), ClaimOutcome::Claimed(_)));
    }

    #[test]
    fn dropping_uncommitted_claim_releases_lock() {
        let tmp = TempDir::new().unwrap();
        let store = LocalArtifactStore::open(tmp.path()).unwrap();
        let k = key('d');
        {
            let ClaimOutcome::Claimed(_claim) = store.claim(&k).unwrap() else {
                panic!("expected claim")
            };
        }
        assert!(matches!(store.claim(&k).unwrap(), ClaimOutcome::Claimed(_)));
    }

    #[test]
    fn artifact_presence_implies_companions() {
        let tmp = TempDir::new().unwrap();
        let store = LocalArtifactStore::open(tmp.path()).unwrap();
        let k = key('e');
        commit_artifact(&store, &k, b"bytes");

        assert!(store.has_any(&k));
        assert!(store.build_log_path(&k).exists());
        assert!(store.meta_path(&k).exists());
    }

    #[test]
    fn gc_removes_least_recently_used_groups() {
        let tmp = TempDir::new().unwrap();
        let store = LocalArtifactStore::open(tmp.path()).unwrap();
        let old = key('1');
        let fresh = key('2');
        commit_artifact(&store, &old, b"old artifact bytes");
        commit_artifact(&store, &fresh, b"fresh artifact bytes");

        // Age the old group.
        let mut meta = store.read_meta(&old).unwrap().unwrap();
        meta.last_access = Utc::now() - chrono::Duration::days(30);
        fs::write(
            store.meta_path(&old),
            serde_json::to_string_pretty(&meta).unwrap(),
        )
        .unwrap();

        let outcome = store.gc(1).unwrap();
        assert_eq!(outcome.groups_removed, 1);
        assert!(!store.has_any(&old), "old group should be collected");
        assert!(store.has_any(&fresh), "fresh group should survive");
    }

    #[test]
    fn gc_skips_claimed_groups() {
        let tmp = TempDir::new().unwrap();
        let store = LocalArtifactStore::open(tmp.path()).unwrap();
        let k = key('3');
        let ClaimOutcome::Claimed(claim) = store.claim(&k).unwrap() else {
            panic!("expected claim")
        };
        let outcome = store.gc(u64::MAX).unwrap();
        assert_eq!(outcome.groups_removed, 0);
        drop(claim);
    }
}
