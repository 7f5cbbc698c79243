//! The content-addressed artifact cache.
//!
//! Artifacts are keyed by their build unit's cache key. The local store is a
//! flat directory with an advisory-lock claim protocol guaranteeing at most
//! one concurrent builder per key on a host; the remote store is a small
//! HTTP service speaking the `/1.0/` routes, composable via server-side
//! fetch.

mod error;
mod local;
mod meta;
mod naming;
mod remote;

pub use error::{Error, Result};
pub use local::{Claim, ClaimOutcome, GcOutcome, LocalArtifactStore};
pub use meta::ArtifactMeta;
pub use naming::{ArtifactFilename, artifact_filename, is_valid_artifact_name};
pub use remote::{RemoteCacheClient, RemoteCacheServer, ServerConfig};
