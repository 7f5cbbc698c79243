//! The `GitRepoCache` seam and its subprocess-backed implementation.
//!
//! The build core never talks to git directly; everything goes through this
//! trait so tests can substitute an in-memory implementation.

use crate::{Error, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// A pinned submodule: where it lives in the tree and which commit it holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submodule {
    /// Path of the submodule within the superproject tree.
    pub path: String,
    /// Repository URL of the submodule.
    pub url: String,
    /// Pinned commit SHA-1.
    pub sha: String,
}

/// Access to locally mirrored git repositories.
#[async_trait]
pub trait GitRepoCache: Send + Sync {
    /// Ensure `repo` is mirrored locally and `ref_name` is reachable.
    async fn ensure_fetched(&self, repo: &str, ref_name: &str) -> Result<()>;

    /// Resolve a ref (branch, tag, or SHA-1) to a commit SHA-1.
    async fn resolve_ref(&self, repo: &str, ref_name: &str) -> Result<String>;

    /// Read one file from the tree at `sha`.
    async fn cat_file(&self, repo: &str, sha: &str, path: &str) -> Result<Vec<u8>>;

    /// The submodules pinned by the tree at `sha`.
    async fn submodules_at(&self, repo: &str, sha: &str) -> Result<Vec<Submodule>>;

    /// Materialise the tree at `sha` under `dest` (no `.git`, no submodules).
    async fn checkout(&self, repo: &str, sha: &str, dest: &Path) -> Result<()>;
}

/// `GitRepoCache` backed by the `git` binary over bare mirrors.
///
/// Mirrors live under `<gits_dir>/<urlencoded-repo>/`.
#[derive(Debug, Clone)]
pub struct GitCliRepoCache {
    gits_dir: PathBuf,
}

impl GitCliRepoCache {
    /// Create a repo cache rooted at `gits_dir`.
    #[must_use]
    pub fn new(gits_dir: impl Into<PathBuf>) -> Self {
        Self {
            gits_dir: gits_dir.into(),
        }
    }

    fn mirror_path(&self, repo: &str) -> PathBuf {
        self.gits_dir.join(urlencoding::encode(repo).as_ref())
    }

    async fn git(&self, repo: &str, args: &[&str]) -> Result<Vec<u8>> {
        let mirror = self.mirror_path(repo);
        let output = Command::new("git")
            .arg("--git-dir")
            .arg(&mirror)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| Error::unavailable(repo, "", format!("failed to run git: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::unavailable(
                repo,
                args.join(" "),
                stderr.trim().to_string(),
            ));
        }
        Ok(output.stdout)
    }
}

#[async_trait]
impl GitRepoCache for GitCliRepoCache {
    async fn ensure_fetched(&self, repo: &str, ref_name: &str) -> Result<()> {
        let mirror = self.mirror_path(repo);
        if mirror.exists() {
            debug!(repo, ref_name, "Fetching into existing mirror");
            self.git(repo, &["fetch", "--quiet", "origin"]).await?;
            return Ok(());
        }
        debug!(repo, "Creating bare mirror");
        if let Some(parent) = mirror.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::unavailable(repo, ref_name, e.to_string()))?;
        }
        let output = Command::new("git")
            .arg("clone")
            .arg("--mirror")
            .arg("--quiet")
            .arg(repo)
            .arg(&mirror)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| Error::unavailable(repo, ref_name, format!("failed to run git: {e}")))?;
        if !output.status.success() {
            return Err(Error::unavailable(
                repo,
                ref_name,
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(())
    }

    async fn resolve_ref(&self, repo: &str, ref_name: &str) -> Result<String> {
        let spec = format!("{ref_name}^{{commit}}");
        let out = self.git(repo, &["rev-parse", "--verify", &spec]).await?;
        let sha = String::from_utf8_lossy(&out).trim().to_string();
        if sha.len() != 40 || !sha.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::unavailable(
                repo,
                ref_name,
                format!("rev-parse returned '{sha}'"),
            ));
        }
        Ok(sha)
    }

    async fn cat_file(&self, repo: &str, sha: &str, path: &str) -> Result<Vec<u8>> {
        self.git(repo, &["cat-file", "blob", &format!("{sha}:{path}")])
            .await
    }

    async fn submodules_at(&self, repo: &str, sha: &str) -> Result<Vec<Submodule>> {
        // No .gitmodules means no submodules; that is not an error.
        let Ok(gitmodules) = self.cat_file(repo, sha, ".gitmodules").await else {
            return Ok(Vec::new());
        };
        let text = String::from_utf8_lossy(&gitmodules);
        let mut submodules = Vec::new();
        for (path, url) in parse_gitmodules(&text) {
            let out = self.git(repo, &["ls-tree", sha, &path]).await?;
            let line = String::from_utf8_lossy(&out);
            // Format: <mode> commit <sha>\t<path>
            let pin = line
                .split_whitespace()
                .nth(2)
                .ok_or_else(|| {
                    Error::unavailable(repo, sha, format!("submodule '{path}' not in tree"))
                })?
                .to_string();
            submodules.push(Submodule { path, url, sha: pin });
        }
        Ok(submodules)
    }

    async fn checkout(&self, repo: &str, sha: &str, dest: &Path) -> Result<()> {
        tokio::fs::create_dir_all(dest)
            .await
            .map_err(|e| Error::unavailable(repo, sha, e.to_string()))?;
        let tarball = self.git(repo, &["archive", "--format=tar", sha]).await?;
        let dest = dest.to_path_buf();
        let repo_owned = repo.to_string();
        let sha_owned = sha.to_string();
        tokio::task::spawn_blocking(move || {
            tar::Archive::new(tarball.as_slice())
                .unpack(&dest)
                .map_err(|e| Error::unavailable(repo_owned, sha_owned, e.to_string()))
        })
        .await
        .map_err(|e| Error::unavailable(repo, sha, e.to_string()))??;
        Ok(())
    }
}

/// Parse `.gitmodules`, yielding `(path, url)` pairs in declaration order.
fn parse_gitmodules(text: &str) -> Vec<(String, String)> {
    let mut result = Vec::new();
    let mut path: Option<String> = None;
    let mut url: Option<String> = None;
    let mut flush = |path: &mut Option<String>, url: &mut Option<String>, out: &mut Vec<_>| {
        if let (Some(p), Some(u)) = (path.take(), url.take()) {
            out.push((p, u));
        }
    };
    for line in text.lines() {
        let line = line.trim();
        if line.starts_with("[submodule") {
            flush(&mut path, &mut url, &mut result);
        } else if let Some(value) = line.strip_prefix("path") {
            path = value.trim_start().strip_prefix('=').map(|v| v.trim().to_string());
        } else if let Some(value) = line.strip_prefix("url") {
            url = value.trim_start().strip_prefix('=').map(|v| v.trim().to_string());
        }
    }
    flush(&mut path, &mut url, &mut result);
    result
}
