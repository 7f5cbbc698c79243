//! HTTP server exposing a local artifact store over the `/1.0/` routes.

use super::validate_cache_filename;
use crate::local::LocalArtifactStore;
use crate::{Error, Result};
use axum::Router;
use axum::body::Body;
use axum::extract::{Multipart, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

/// Configuration for the remote cache server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen address.
    pub addr: SocketAddr,
    /// Whether `POST /1.0/artifacts` is accepted.
    pub enable_writes: bool,
}

struct AppState {
    store: LocalArtifactStore,
    enable_writes: bool,
    http: reqwest::Client,
}

/// Serves one local store to the network.
pub struct RemoteCacheServer {
    store: LocalArtifactStore,
    config: ServerConfig,
}

impl RemoteCacheServer {
    /// Create a server over `store`.
    #[must_use]
    pub fn new(store: LocalArtifactStore, config: ServerConfig) -> Self {
        Self { store, config }
    }

    /// The axum router, for embedding or testing.
    #[must_use]
    pub fn router(&self) -> Router {
        let state = Arc::new(AppState {
            store: self.store.clone(),
            enable_writes: self.config.enable_writes,
            http: reqwest::Client::new(),
        });
        Router::new()
            .route("/1.0/artifacts", get(get_artifact).post(post_artifacts))
            .route("/1.0/fetch", get(fetch_from_other))
            .with_state(state)
    }

    /// Bind and serve until the process exits.
    pub async fn serve(self) -> Result<()> {
        let addr = self.config.addr;
        let router = self.router();
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| Error::remote(format!("bind {addr}: {e}")))?;
        info!(%addr, writes = self.config.enable_writes, "Artifact cache server listening");
        axum::serve(listener, router)
            .await
            .map_err(|e| Error::remote(e.to_string()))
    }
}

#[derive(Deserialize)]
struct FilenameParam {
    filename: String,
}

#[derive(Deserialize)]
struct UrlParam {
    url: String,
}

/// `GET`/`HEAD /1.0/artifacts?filename=KEY.KIND.NAME`.
///
/// 200 with the bytes, 404 if absent, 409 while a claim for the key is
/// outstanding.
async fn get_artifact(
    State(state): State<Arc<AppState>>,
    Query(param): Query<FilenameParam>,
) -> Response {
    let Some(filename) = validate_cache_filename(&param.filename) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    let dir = state.store.artifacts_dir();
    let path = dir.join(&filename);
    if path.exists() {
        return match tokio::fs::File::open(&path).await {
            Ok(file) => Body::from_stream(ReaderStream::new(file)).into_response(),
            Err(e) => {
                warn!(filename, error = %e, "Failed to open artifact");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        };
    }
    // Key claimed and mid-write: tell the caller to come back.
    if let Some(key) = filename.split('.').next() {
        if dir.join(format!("{key}.lock")).exists() {
            return StatusCode::CONFLICT.into_response();
        }
    }
    StatusCode::NOT_FOUND.into_response()
}

/// `POST /1.0/artifacts` multipart upload; only when write-enabled.
///
/// Companion files (`.meta`, `.build-log`) are published before artifact
/// tarballs so a visible artifact always has its companions.
async fn post_artifacts(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Response {
    if !state.enable_writes {
        return StatusCode::FORBIDDEN.into_response();
    }
    let dir = state.store.artifacts_dir().to_path_buf();
    let mut staged: Vec<(String, PathBuf)> = Vec::new();

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "Malformed multipart upload");
                return StatusCode::BAD_REQUEST.into_response();
            }
        };
        let Some(filename) = field
            .file_name()
            .map(ToString::to_string)
            .and_then(|f| validate_cache_filename(&f))
        else {
            return StatusCode::BAD_REQUEST.into_response();
        };
        let bytes = match field.bytes().await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(filename, error = %e, "Failed to read upload body");
                return StatusCode::BAD_REQUEST.into_response();
            }
        };
        let tmp = dir.join(format!("{filename}.upload-tmp"));
        if tokio::fs::write(&tmp, &bytes).await.is_err() {
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
        staged.push((filename, tmp));
    }

    staged.sort_by_key(|(filename, _)| {
        !(filename.ends_with(".meta") || filename.ends_with(".build-log"))
    });
    for (filename, tmp) in staged {
        let final_path = dir.join(&filename);
        if tokio::fs::rename(&tmp, &final_path).await.is_err() {
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
        debug!(filename, "Stored uploaded file");
    }
    StatusCode::CREATED.into_response()
}

/// `GET /1.0/fetch?url=U`: pull an artifact (and its companions) from
/// another cache into this one.
async fn fetch_from_other(
    State(state): State<Arc<AppState>>,
    Query(param): Query<UrlParam>,
) -> Response {
    let Some(filename) = filename_from_url(&param.url).and_then(|f| validate_cache_filename(&f))
    else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    let dir = state.store.artifacts_dir().to_path_buf();
    if dir.join(&filename).exists() {
        return StatusCode::OK.into_response();
    }

    // Companions first, artifact last, preserving the presence invariant.
    let Some(key) = filename.split('.').next().map(ToString::to_string) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    let mut to_fetch = Vec::new();
    for companion in [format!("{key}.meta"), format!("{key}.build-log")] {
        if !dir.join(&companion).exists() {
            to_fetch.push(companion);
        }
    }
    to_fetch.push(filename.clone());

    for fetch_name in to_fetch {
        let url = replace_filename(&param.url, &fetch_name);
        let response = match state.http.get(&url).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!(url, error = %e, "Server-side fetch failed");
                return StatusCode::BAD_GATEWAY.into_response();
            }
        };
        if !response.status().is_success() {
            warn!(url, status = %response.status(), "Server-side fetch rejected");
            return StatusCode::BAD_GATEWAY.into_response();
        }
        let bytes = match response.bytes().await {
            Ok(bytes) => bytes,
            Err(_) => return StatusCode::BAD_GATEWAY.into_response(),
        };
        let tmp = dir.join(format!("{fetch_name}.fetch-tmp"));
        if tokio::fs::write(&tmp, &bytes).await.is_err()
            || tokio::fs::rename(&tmp, dir.join(&fetch_name)).await.is_err()
        {
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
        debug!(fetch_name, "Mirrored file from peer cache");
    }
    StatusCode::OK.into_response()
}

/// Extract the `filename` query parameter from a peer-cache artifact URL.
fn filename_from_url(url: &str) -> Option<String> {
    let query = url.split_once('?')?.1;
    for pair in query.split('&') {
        if let Some(value) = pair.strip_prefix("filename=") {
            return urlencoding::decode(value).ok().map(|c| c.into_owned());
        }
    }
    None
}

/// Rewrite a peer-cache artifact URL to name a different file.
fn replace_filename(url: &str, filename: &str) -> String {
    match url.split_once('?') {
        Some((base, _)) => format!("{base}?filename={}", urlencoding::encode(filename)),
        None => url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_filename_from_peer_url() {
        let key = "ab".repeat(32);
        let url = format!("http://shared:8080/1.0/artifacts?filename={key}.chunk.hello");
        assert_eq!(
            filename_from_url(&url).unwrap(),
            format!("{key}.chunk.hello")
        );
    }

    #[test]
    fn rewrites_peer_url() {
        let url = "http://shared:8080/1.0/artifacts?filename=old";
        assert_eq!(
            replace_filename(url, "new"),
            "http://shared:8080/1.0/artifacts?filename=new"
        );
    }

    #[tokio::test]
    async fn router_builds() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = LocalArtifactStore::open(tmp.path()).unwrap();
        let server = RemoteCacheServer::new(
            store,
            ServerConfig {
                addr: "127.0.0.1:0".parse().unwrap(),
                enable_writes: true,
            },
        );
        let _router = server.router();
    }
}
