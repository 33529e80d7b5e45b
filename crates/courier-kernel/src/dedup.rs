//! Dedup cache for inbound notifications.
//!
//! Remembers the SHA-256 of every accepted payload for a fixed TTL. Entries are
//! removed by a timer task and, if that has not run yet, lazily on lookup.

use courier_types::config::DedupConfig;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Hex SHA-256 of a payload.
pub fn hash_payload(payload: &[u8]) -> String {
    hex::encode(Sha256::digest(payload))
}

/// TTL set of payload hashes.
#[derive(Clone)]
pub struct DedupCache {
    entries: Arc<DashMap<String, Instant>>,
    ttl: Duration,
}

impl DedupCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            ttl,
        }
    }

    /// `None` when dedup is disabled or the TTL is zero.
    pub fn from_config(config: &DedupConfig) -> Option<Self> {
        (config.enabled && config.ttl_ms > 0).then(|| Self::new(Duration::from_millis(config.ttl_ms)))
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Whether `hash` was seen within the TTL.
    pub fn is_duplicate(&self, hash: &str) -> bool {
        let Some(expires_at) = self.entries.get(hash).map(|e| *e) else {
            return false;
        };
        if expires_at > Instant::now() {
            return true;
        }
        self.entries.remove_if(hash, |_, exp| *exp <= Instant::now());
        false
    }

    /// Remember `hash` for one TTL.
    pub fn remember(&self, hash: String) {
        self.entries.insert(hash.clone(), Instant::now() + self.ttl);
        self.schedule_removal(hash);
    }

    /// Atomically test and remember the payload. Returns `true` for a duplicate,
    /// which the caller should drop.
    pub fn check_and_remember(&self, payload: &[u8]) -> bool {
        let hash = hash_payload(payload);
        let now = Instant::now();
        match self.entries.entry(hash.clone()) {
            Entry::Occupied(mut slot) => {
                if *slot.get() > now {
                    return true;
                }
                slot.insert(now + self.ttl);
            }
            Entry::Vacant(slot) => {
                slot.insert(now + self.ttl);
            }
        }
        self.schedule_removal(hash);
        false
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn schedule_removal(&self, hash: String) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let entries = Arc::clone(&self.entries);
        let ttl = self.ttl;
        runtime.spawn(async move {
            tokio::time::sleep(ttl).await;
            entries.remove_if(&hash, |_, exp| *exp <= Instant::now());
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_hex_sha256() {
        let hash = hash_payload(b"abc");
        assert_eq!(
            hash,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn test_duplicate_within_ttl_then_expires() {
        let cache = DedupCache::new(Duration::from_millis(200));
        assert!(!cache.check_and_remember(b"{\"id\":1}"));
        assert!(cache.check_and_remember(b"{\"id\":1}"));
        assert!(!cache.check_and_remember(b"{\"id\":2}"));

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!cache.check_and_remember(b"{\"id\":1}"));
    }

    #[tokio::test]
    async fn test_timer_removes_entries() {
        let cache = DedupCache::new(Duration::from_millis(50));
        cache.remember(hash_payload(b"x"));
        assert_eq!(cache.len(), 1);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(cache.is_empty());
    }

    #[test]
    fn test_lazy_expiry_without_runtime() {
        let cache = DedupCache::new(Duration::from_millis(1));
        let hash = hash_payload(b"y");
        cache.remember(hash.clone());
        std::thread::sleep(Duration::from_millis(5));
        assert!(!cache.is_duplicate(&hash));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_disabled_config() {
        let disabled = DedupConfig {
            enabled: false,
            ttl_ms: 5000,
        };
        assert!(DedupCache::from_config(&disabled).is_none());
        assert!(DedupCache::from_config(&DedupConfig::default()).is_some());
    }
}
