//! The stable on-disk naming scheme: `<64hex>.<kind>.<name>`.

use crate::{Error, Result};
use morph_graph::{CacheKey, UnitKind};

/// A parsed artifact filename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactFilename {
    /// The cache key.
    pub key: CacheKey,
    /// The artifact kind.
    pub kind: UnitKind,
    /// The artifact name.
    pub name: String,
}

impl ArtifactFilename {
    /// Parse and validate `KEY.KIND.NAME`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedFilename`] unless the key is 64 hex chars,
    /// the kind is one of `chunk`/`stratum`/`system`, and the name matches
    /// `[A-Za-z0-9._+-]+`.
    pub fn parse(filename: &str) -> Result<Self> {
        let malformed = || Error::MalformedFilename {
            filename: filename.to_string(),
        };
        let mut parts = filename.splitn(3, '.');
        let key = parts.next().ok_or_else(malformed)?;
        let kind = parts.next().ok_or_else(malformed)?;
        let name = parts.next().ok_or_else(malformed)?;

        let key = CacheKey::from_hex(key).map_err(|_| malformed())?;
        let kind = match kind {
            "chunk" => UnitKind::Chunk,
            "stratum" => UnitKind::Stratum,
            "system" => UnitKind::System,
            _ => return Err(malformed()),
        };
        if !is_valid_artifact_name(name) {
            return Err(malformed());
        }
        Ok(Self {
            key,
            kind,
            name: name.to_string(),
        })
    }
}

impl std::fmt::Display for ArtifactFilename {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.key, self.kind, self.name)
    }
}

/// Compose an artifact filename.
#[must_use]
pub fn artifact_filename(key: &CacheKey, kind: UnitKind, name: &str) -> String {
    format!("{key}.{kind}.{name}")
}

/// Whether `name` is a legal artifact name: `[A-Za-z0-9._+-]+`.
#[must_use]
pub fn is_valid_artifact_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '+' | '-'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> String {
        "ab".repeat(32)
    }

    #[test]
    fn parses_well_formed_names() {
        let filename = format!("{}.chunk.glibc-devel", key());
        let parsed = ArtifactFilename::parse(&filename).unwrap();
        assert_eq!(parsed.kind, UnitKind::Chunk);
        assert_eq!(parsed.name, "glibc-devel");
        assert_eq!(parsed.to_string(), filename);
    }

    #[test]
    fn name_may_contain_dots() {
        let filename = format!("{}.stratum.gtk+-3.0", key());
        let parsed = ArtifactFilename::parse(&filename).unwrap();
        assert_eq!(parsed.name, "gtk+-3.0");
    }

    #[test]
    fn rejects_bad_key_kind_and_name() {
        assert!(ArtifactFilename::parse("abc.chunk.x").is_err());
        assert!(ArtifactFilename::parse(&format!("{}.cluster.x", key())).is_err());
        assert!(ArtifactFilename::parse(&format!("{}.chunk.bad/name", key())).is_err());
        assert!(ArtifactFilename::parse(&format!("{}.chunk.", key())).is_err());
    }
}
