//! The remote artifact cache: HTTP client and server for the `/1.0/` routes.

mod client;
mod server;

pub use client::RemoteCacheClient;
pub use server::{RemoteCacheServer, ServerConfig};

/// Validate a cache filename: an artifact name, `<key>.build-log`, or
/// `<key>.meta`. Returns the normalised filename.
pub(crate) fn validate_cache_filename(filename: &str) -> Option<String> {
    if crate::naming::ArtifactFilename::parse(filename).is_ok() {
        return Some(filename.to_string());
    }
    let (key, suffix) = filename.split_once('.')?;
    if morph_graph::CacheKey::from_hex(key).is_ok()
        && matches!(suffix, "build-log" | "meta")
    {
        return Some(filename.to_string());
    }
    None
}
