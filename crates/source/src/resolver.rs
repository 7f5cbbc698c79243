//! Memoising source resolver.

use crate::{GitRepoCache, Result, Submodule};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// A fully resolved source reference.
#[derive(Debug, Clone)]
pub struct ResolvedSource {
    /// Pinned commit SHA-1.
    pub sha: String,
    /// Morphology text at that commit.
    pub text: String,
    /// Transitive submodule pins of the commit.
    pub submodules: Vec<Submodule>,
}

#[derive(Default)]
struct Memo {
    refs: HashMap<(String, String), String>,
    files: HashMap<(String, String, String), String>,
    submodules: HashMap<(String, String), Vec<Submodule>>,
}

/// Resolves `(repo, ref, morph path)` to a [`ResolvedSource`].
///
/// Resolution is a pure function of its inputs given a fixed git state, so
/// results are memoised by `(repo, ref)` and `(repo, sha, path)` for the
/// lifetime of the resolver.
pub struct SourceResolver {
    repos: Arc<dyn GitRepoCache>,
    memo: Mutex<Memo>,
}

impl SourceResolver {
    /// Create a resolver over the given repository cache.
    pub fn new(repos: Arc<dyn GitRepoCache>) -> Self {
        Self {
            repos,
            memo: Mutex::new(Memo::default()),
        }
    }

    /// The underlying repository cache.
    #[must_use]
    pub fn repos(&self) -> Arc<dyn GitRepoCache> {
        Arc::clone(&self.repos)
    }

    /// Pin a ref to a commit SHA-1, fetching if necessary.
    pub async fn pin(&self, repo: &str, ref_name: &str) -> Result<String> {
        let key = (repo.to_string(), ref_name.to_string());
        if let Some(sha) = self.memo.lock().await.refs.get(&key) {
            return Ok(sha.clone());
        }
        self.repos.ensure_fetched(repo, ref_name).await?;
        let sha = self.repos.resolve_ref(repo, ref_name).await?;
        debug!(repo, ref_name, sha, "Pinned ref");
        self.memo.lock().await.refs.insert(key, sha.clone());
        Ok(sha)
    }

    /// Resolve a morphology reference to its commit, text, and submodule pins.
    pub async fn resolve(
        &self,
        repo: &str,
        ref_name: &str,
        morph_path: &str,
    ) -> Result<ResolvedSource> {
        let sha = self.pin(repo, ref_name).await?;
        let text = self.morph_text(repo, &sha, morph_path).await?;
        let submodules = self.submodule_pins(repo, &sha).await?;
        Ok(ResolvedSource {
            sha,
            text,
            submodules,
        })
    }

    /// Morphology text at a pinned commit, memoised.
    pub async fn morph_text(&self, repo: &str, sha: &str, path: &str) -> Result<String> {
        let key = (repo.to_string(), sha.to_string(), path.to_string());
        if let Some(text) = self.memo.lock().await.files.get(&key) {
            return Ok(text.clone());
        }
        let bytes = self.repos.cat_file(repo, sha, path).await?;
        let text = String::from_utf8_lossy(&bytes).into_owned();
        self.memo.lock().await.files.insert(key, text.clone());
        Ok(text)
    }

    /// Submodule pins at a commit, memoised.
    pub async fn submodule_pins(&self, repo: &str, sha: &str) -> Result<Vec<Submodule>> {
        let key = (repo.to_string(), sha.to_string());
        if let Some(pins) = self.memo.lock().await.submodules.get(&key) {
            return Ok(pins.clone());
        }
        let pins = self.repos.submodules_at(repo, sha).await?;
        self.memo.lock().await.submodules.insert(key, pins.clone());
        Ok(pins)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::InMemoryRepoCache;

    const SHA: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";

    fn fixture() -> InMemoryRepoCache {
        let cache = InMemoryRepoCache::new();
        cache.add_ref("git://example.com/defs", "master", SHA);
        cache.add_file(
            "git://example.com/defs",
            SHA,
            "hello.morph",
            b"kind: chunk\nname: hello\n",
        );
        cache
    }

    #[tokio::test]
    async fn resolves_ref_text_and_pins() {
        let cache = fixture();
        let resolver = SourceResolver::new(Arc::new(cache));
        let resolved = resolver
            .resolve("git://example.com/defs", "master", "hello.morph")
            .await
            .unwrap();
        assert_eq!(resolved.sha, SHA);
        assert!(resolved.text.contains("kind: chunk"));
        assert!(resolved.submodules.is_empty());
    }

    #[tokio::test]
    async fn memoises_ref_resolution() {
        let cache = fixture();
        let counter = cache.fetch_counter();
        let resolver = SourceResolver::new(Arc::new(cache));
        for _ in 0..3 {
            resolver
                .resolve("git://example.com/defs", "master", "hello.morph")
                .await
                .unwrap();
        }
        assert_eq!(counter.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_ref_is_unavailable() {
        let cache = fixture();
        let resolver = SourceResolver::new(Arc::new(cache));
        let err = resolver
            .resolve("git://example.com/defs", "no-such-branch", "hello.morph")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no-such-branch"));
    }
}
