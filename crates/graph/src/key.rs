//! Cache keys: stable SHA-256 fingerprints of build-unit inputs.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// A build unit's cache key: 64 lowercase hex characters of SHA-256.
///
/// Equal keys imply equal artifacts; wall-clock time, filesystem state, and
/// machine identity never participate.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    /// Parse a key from hex, validating length and alphabet.
    ///
    /// # Errors
    ///
    /// Returns the offending string if it is not 64 lowercase hex characters.
    pub fn from_hex(hex: impl Into<String>) -> Result<Self, String> {
        let s = hex.into();
        if s.len() != 64 || !s.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()) {
            return Err(s);
        }
        Ok(Self(s))
    }

    /// The hex representation.
    #[must_use]
    pub fn as_hex(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Incremental hasher for cache-key computation.
///
/// Every field is written as `name NUL len NUL bytes`, so distinct field
/// sequences can never collide by concatenation.
pub struct KeyHasher {
    hasher: Sha256,
}

impl KeyHasher {
    /// Start a key computation for the given domain (e.g. unit kind).
    #[must_use]
    pub fn new(domain: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(domain.as_bytes());
        hasher.update([0]);
        Self { hasher }
    }

    /// Fold in one named field.
    pub fn field(&mut self, name: &str, value: &str) {
        self.hasher.update(name.as_bytes());
        self.hasher.update([0]);
        self.hasher.update(value.len().to_le_bytes());
        self.hasher.update([0]);
        self.hasher.update(value.as_bytes());
    }

    /// Fold in a list of values under one name, preserving order.
    pub fn field_list<I, S>(&mut self, name: &str, values: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for value in values {
            self.field(name, value.as_ref());
        }
    }

    /// Finish, producing the key.
    #[must_use]
    pub fn finish(self) -> CacheKey {
        CacheKey(hex::encode(self.hasher.finalize()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_validation() {
        assert!(CacheKey::from_hex("ab".repeat(32)).is_ok());
        assert!(CacheKey::from_hex("ab".repeat(31)).is_err());
        assert!(CacheKey::from_hex("AB".repeat(32)).is_err());
        assert!(CacheKey::from_hex("zz".repeat(32)).is_err());
    }

    #[test]
    fn hasher_is_deterministic() {
        let mut a = KeyHasher::new("chunk");
        a.field("name", "hello");
        let mut b = KeyHasher::new("chunk");
        b.field("name", "hello");
        assert_eq!(a.finish(), b.finish());
    }

    #[test]
    fn field_boundaries_matter() {
        let mut a = KeyHasher::new("chunk");
        a.field("name", "ab");
        a.field("ref", "c");
        let mut b = KeyHasher::new("chunk");
        b.field("name", "a");
        b.field("ref", "bc");
        assert_ne!(a.finish(), b.finish());
    }

    #[test]
    fn domain_matters() {
        let mut a = KeyHasher::new("chunk");
        a.field("name", "x");
        let mut b = KeyHasher::new("stratum");
        b.field("name", "x");
        assert_ne!(a.finish(), b.finish());
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn hash_fields(fields: &[(String, String)]) -> CacheKey {
            let mut hasher = KeyHasher::new("chunk");
            for (name, value) in fields {
                hasher.field(name, value);
            }
            hasher.finish()
        }

        proptest! {
            // Same inputs, same key, independent of run.
            #[test]
            fn deterministic(fields in proptest::collection::vec(
                ("[a-z]{1,8}", ".{0,32}"), 0..8)
            ) {
                prop_assert_eq!(hash_fields(&fields), hash_fields(&fields));
            }

            // Changing any byte of any input changes the key.
            #[test]
            fn monotone_in_inputs(
                fields in proptest::collection::vec(("[a-z]{1,8}", ".{0,32}"), 1..8),
                index in 0usize..8,
                extra in "[a-z0-9]{1,4}",
            ) {
                let index = index % fields.len();
                let mut changed = fields.clone();
                changed[index].1.push_str(&extra);
                prop_assert_ne!(hash_fields(&fields), hash_fields(&changed));
            }
        }
    }
}
