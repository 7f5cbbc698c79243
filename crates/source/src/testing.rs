//! In-memory `GitRepoCache` for tests.

use crate::{Error, GitRepoCache, Result, Submodule};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct Contents {
    refs: HashMap<(String, String), String>,
    files: HashMap<(String, String), HashMap<String, Vec<u8>>>,
    submodules: HashMap<(String, String), Vec<Submodule>>,
}

/// An in-memory repository cache holding refs, files, and submodule pins.
///
/// Intended for unit tests of anything that consumes [`GitRepoCache`].
#[derive(Default)]
pub struct InMemoryRepoCache {
    contents: Mutex<Contents>,
    fetches: Arc<AtomicUsize>,
}

impl InMemoryRepoCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a ref pointing at a commit.
    pub fn add_ref(&self, repo: &str, ref_name: &str, sha: &str) {
        let mut contents = self.contents.lock().expect("poisoned");
        contents
            .refs
            .insert((repo.to_string(), ref_name.to_string()), sha.to_string());
        // A SHA always resolves to itself, like git rev-parse.
        contents
            .refs
            .insert((repo.to_string(), sha.to_string()), sha.to_string());
    }

    /// Register a file in the tree at a commit.
    pub fn add_file(&self, repo: &str, sha: &str, path: &str, data: &[u8]) {
        self.contents
            .lock()
            .expect("poisoned")
            .files
            .entry((repo.to_string(), sha.to_string()))
            .or_default()
            .insert(path.to_string(), data.to_vec());
    }

    /// Register submodule pins for a commit.
    pub fn add_submodule(&self, repo: &str, sha: &str, submodule: Submodule) {
        self.contents
            .lock()
            .expect("poisoned")
            .submodules
            .entry((repo.to_string(), sha.to_string()))
            .or_default()
            .push(submodule);
    }

    /// Counter of `ensure_fetched` calls, for memoisation assertions.
    #[must_use]
    pub fn fetch_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.fetches)
    }
}

#[async_trait]
impl GitRepoCache for InMemoryRepoCache {
    async fn ensure_fetched(&self, repo: &str, ref_name: &str) -> Result<()> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let contents = self.contents.lock().expect("poisoned");
        if contents.refs.keys().any(|(r, _)| r.as_str() == repo) {
            Ok(())
        } else {
            Err(Error::unavailable(repo, ref_name, "unknown repository"))
        }
    }

    async fn resolve_ref(&self, repo: &str, ref_name: &str) -> Result<String> {
        self.contents
            .lock()
            .expect("poisoned")
            .refs
            .get(&(repo.to_string(), ref_name.to_string()))
            .cloned()
            .ok_or_else(|| Error::unavailable(repo, ref_name, "ref not found"))
    }

    async fn cat_file(&self, repo: &str, sha: &str, path: &str) -> Result<Vec<u8>> {
        self.contents
            .lock()
            .expect("poisoned")
            .files
            .get(&(repo.to_string(), sha.to_string()))
            .and_then(|tree| tree.get(path))
            .cloned()
            .ok_or_else(|| Error::unavailable(repo, sha, format!("no such file '{path}'")))
    }

    async fn submodules_at(&self, repo: &str, sha: &str) -> Result<Vec<Submodule>> {
        Ok(self
            .contents
            .lock()
            .expect("poisoned")
            .submodules
            .get(&(repo.to_string(), sha.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn checkout(&self, repo: &str, sha: &str, dest: &Path) -> Result<()> {
        let tree = self
            .contents
            .lock()
            .expect("poisoned")
            .files
            .get(&(repo.to_string(), sha.to_string()))
            .cloned()
            .ok_or_else(|| Error::unavailable(repo, sha, "no tree registered"))?;
        for (path, data) in tree {
            let target = dest.join(&path);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| Error::unavailable(repo, sha, e.to_string()))?;
            }
            std::fs::write(&target, data)
                .map_err(|e| Error::unavailable(repo, sha, e.to_string()))?;
        }
        Ok(())
    }
}
