//! HTTP client for a remote artifact cache.

use crate::{Error, Result};
use futures::StreamExt;
use reqwest::StatusCode;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Client for the remote cache's `/1.0/` routes.
#[derive(Debug, Clone)]
pub struct RemoteCacheClient {
    base_url: String,
    http: reqwest::Client,
}

impl RemoteCacheClient {
    /// Create a client for the cache at `base_url` (scheme + authority).
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    /// The URL that serves `filename` from this cache.
    #[must_use]
    pub fn artifact_url(&self, filename: &str) -> String {
        format!(
            "{}/1.0/artifacts?filename={}",
            self.base_url,
            urlencoding::encode(filename)
        )
    }

    /// Existence check via HEAD.
    pub async fn has(&self, filename: &str) -> Result<bool> {
        let response = self
            .http
            .head(self.artifact_url(filename))
            .send()
            .await
            .map_err(|e| Error::remote(e.to_string()))?;
        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND | StatusCode::CONFLICT => Ok(false),
            status => Err(Error::remote(format!("HEAD {filename}: {status}"))),
        }
    }

    /// Download `filename` into `dest`, atomically.
    pub async fn fetch_to(&self, filename: &str, dest: &Path) -> Result<()> {
        let response = self
            .http
            .get(self.artifact_url(filename))
            .send()
            .await
            .map_err(|e| Error::remote(e.to_string()))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(Error::NotFound {
                filename: filename.to_string(),
            });
        }
        if !response.status().is_success() {
            return Err(Error::remote(format!("GET {filename}: {}", response.status())));
        }

        let file_name = dest
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("artifact");
        let tmp: PathBuf = dest.with_file_name(format!("{file_name}.fetch-tmp"));
        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| Error::io("create", &tmp, e))?;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| Error::remote(e.to_string()))?;
            file.write_all(&chunk)
                .await
                .map_err(|e| Error::io("write", &tmp, e))?;
        }
        file.flush().await.map_err(|e| Error::io("flush", &tmp, e))?;
        drop(file);
        tokio::fs::rename(&tmp, dest)
            .await
            .map_err(|e| Error::io("rename", dest, e))?;
        debug!(filename, dest = %dest.display(), "Fetched artifact");
        Ok(())
    }

    /// Upload files as one multipart POST. Requires the server to be
    /// write-enabled.
    pub async fn upload(&self, files: &[(String, PathBuf)]) -> Result<()> {
        let mut form = reqwest::multipart::Form::new();
        for (filename, path) in files {
            let bytes = tokio::fs::read(path)
                .await
                .map_err(|e| Error::io("read", path, e))?;
            form = form.part(
                filename.clone(),
                reqwest::multipart::Part::bytes(bytes).file_name(filename.clone()),
            );
        }
        let response = self
            .http
            .post(format!("{}/1.0/artifacts", self.base_url))
            .multipart(form)
            .send()
            .await
            .map_err(|e| Error::remote(e.to_string()))?;
        if !response.status().is_success() {
            return Err(Error::remote(format!("POST artifacts: {}", response.status())));
        }
        debug!(count = files.len(), "Uploaded artifacts");
        Ok(())
    }

    /// Ask the cache to pull `url` from another cache, server-side.
    pub async fn fetch_from(&self, url: &str) -> Result<()> {
        let response = self
            .http
            .get(format!(
                "{}/1.0/fetch?url={}",
                self.base_url,
                urlencoding::encode(url)
            ))
            .send()
            .await
            .map_err(|e| Error::remote(e.to_string()))?;
        if !response.status().is_success() {
            return Err(Error::remote(format!("fetch {url}: {}", response.status())));
        }
        Ok(())
    }
}
