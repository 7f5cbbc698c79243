//! Artifact metadata, persisted as `<key>.meta` JSON.

use chrono::{DateTime, Utc};
use morph_graph::CacheKey;
use serde::{Deserialize, Serialize};

/// Metadata written next to every committed artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactMeta {
    /// The artifact's cache key.
    pub cache_key: CacheKey,
    /// Artifact kind (`chunk`, `stratum`, `system`).
    pub kind: String,
    /// The artifact names this key's build committed (one per key; the
    /// sibling names record what was split off the same build).
    pub artifacts: Vec<String>,
    /// Pinned source commit the unit was built from.
    pub source_sha: String,
    /// Cache keys of the unit's direct dependencies.
    pub dependencies: Vec<CacheKey>,
    /// When the build started.
    pub started_at: DateTime<Utc>,
    /// When the build finished.
    pub finished_at: DateTime<Utc>,
    /// Last time the artifact was read; drives LRU garbage collection.
    pub last_access: DateTime<Utc>,
}

impl ArtifactMeta {
    /// Build-wall-clock duration in milliseconds.
    #[must_use]
    pub fn duration_ms(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_json() {
        let now = Utc::now();
        let meta = ArtifactMeta {
            cache_key: CacheKey::from_hex("cd".repeat(32)).unwrap(),
            kind: "chunk".into(),
            artifacts: vec!["hello".into()],
            source_sha: "a".repeat(40),
            dependencies: vec![],
            started_at: now,
            finished_at: now,
            last_access: now,
        };
        let json = serde_json::to_string(&meta).unwrap();
        let back: ArtifactMeta = serde_json::from_str(&json).unwrap();
        assert_eq!(back.cache_key, meta.cache_key);
        assert_eq!(back.duration_ms(), 0);
    }
}
