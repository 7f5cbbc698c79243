//! The controller's claim table.
//!
//! Tracks which worker is building which cache key, so a key is never built
//! twice in parallel across the fleet. A second request for an in-flight
//! key waits for the first build to land in the shared cache instead of
//! re-running it.

use morph_graph::CacheKey;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;
use tokio::sync::watch;
use tracing::debug;

struct Entry {
    worker: String,
    since: Instant,
    done: watch::Sender<bool>,
}

/// Outcome of trying to claim a key for a worker.
pub enum ClaimOutcome {
    /// The key is now claimed for the caller's worker.
    Claimed,
    /// Another worker holds the key; await the receiver, then re-check the
    /// shared cache.
    InFlight(watch::Receiver<bool>),
}

/// Key → (worker, in-flight since). One mutex, O(1) holds.
#[derive(Default)]
pub struct ClaimTable {
    entries: Mutex<HashMap<CacheKey, Entry>>,
}

impl ClaimTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `key` for `worker`, or learn who to wait for.
    pub fn claim(&self, key: &CacheKey, worker: &str) -> ClaimOutcome {
        let mut entries = self.entries.lock().expect("claim table poisoned");
        if let Some(entry) = entries.get(key) {
            debug!(%key, holder = %entry.worker, "Key already in flight");
            return ClaimOutcome::InFlight(entry.done.subscribe());
        }
        let (done, _) = watch::channel(false);
        entries.insert(
            key.clone(),
            Entry {
                worker: worker.to_string(),
                since: Instant::now(),
                done,
            },
        );
        ClaimOutcome::Claimed
    }

    /// Release `key`, waking waiters. `landed` says whether the artifact
    /// made it to the shared cache.
    pub fn release(&self, key: &CacheKey, landed: bool) {
        let entry = self
            .entries
            .lock()
            .expect("claim table poisoned")
            .remove(key);
        if let Some(entry) = entry {
            debug!(%key, landed, held_for = ?entry.since.elapsed(), "Released claim");
            let _ = entry.done.send(landed);
        }
    }

    /// Release every key held by `worker` (it disconnected), waking waiters
    /// with `landed = false` so the units get re-dispatched.
    pub fn release_worker(&self, worker: &str) -> Vec<CacheKey> {
        let mut entries = self.entries.lock().expect("claim table poisoned");
        let keys: Vec<CacheKey> = entries
            .iter()
            .filter(|(_, entry)| entry.worker == worker)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &keys {
            if let Some(entry) = entries.remove(key) {
                let _ = entry.done.send(false);
            }
        }
        keys
    }

    /// The worker currently holding `key`, if any.
    #[must_use]
    pub fn holder(&self, key: &CacheKey) -> Option<String> {
        self.entries
            .lock()
            .expect("claim table poisoned")
            .get(key)
            .map(|entry| entry.worker.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(byte: char) -> CacheKey {
        CacheKey::from_hex(byte.to_string().repeat(64)).unwrap()
    }

    #[test]
    fn claim_then_inflight_then_release() {
        let table = ClaimTable::new();
        let k = key('a');
        assert!(matches!(table.claim(&k, "w1"), ClaimOutcome::Claimed));
        assert_eq!(table.holder(&k).as_deref(), Some("w1"));

        let ClaimOutcome::InFlight(mut waiter) = table.claim(&k, "w2") else {
            panic!("expected in-flight")
        };
        table.release(&k, true);
        assert!(*waiter.borrow_and_update());
        assert!(table.holder(&k).is_none());
    }

    #[test]
    fn worker_release_frees_all_its_keys() {
        let table = ClaimTable::new();
        let (a, b, c) = (key('a'), key('b'), key('c'));
        assert!(matches!(table.claim(&a, "w1"), ClaimOutcome::Claimed));
        assert!(matches!(table.claim(&b, "w1"), ClaimOutcome::Claimed));
        assert!(matches!(table.claim(&c, "w2"), ClaimOutcome::Claimed));

        let mut released = table.release_worker("w1");
        released.sort();
        let mut expected = vec![a.clone(), b];
        expected.sort();
        assert_eq!(released, expected);
        assert!(table.holder(&a).is_none());
        assert_eq!(table.holder(&c).as_deref(), Some("w2"));
    }

    #[tokio::test]
    async fn waiter_wakes_on_release() {
        let table = ClaimTable::new();
        let k = key('d');
        assert!(matches!(table.claim(&k, "w1"), ClaimOutcome::Claimed));
        let ClaimOutcome::InFlight(mut waiter) = table.claim(&k, "w2") else {
            panic!("expected in-flight")
        };
        table.release(&k, false);
        waiter.changed().await.unwrap();
        assert!(!*waiter.borrow());
    }
}
