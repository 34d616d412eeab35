use std::collections::HashMap;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::time::Instant;
use tracing::trace;

mod entry;
mod key;
mod maintenance;

pub use entry::CacheEntry;
pub use key::CacheKey;
pub use maintenance::spawn_cache_sweeper;

/// Upper bound applied when `now + timeout` cannot be represented.
const MAX_EXPIRY_HORIZON: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// In-memory response cache with a fixed time-to-live.
///
/// Expiry is lazy: an entry whose deadline has passed is reported as absent by [`get`] and
/// removed opportunistically. [`purge_expired`] reclaims stale entries in bulk. The map is
/// guarded by a reader-writer lock that is only ever held for map operations.
///
/// [`get`]: ResponseCache::get
/// [`purge_expired`]: ResponseCache::purge_expired
#[derive(Debug)]
pub struct ResponseCache {
    entries: RwLock<HashMap<CacheKey, CacheEntry>>,
    timeout: Duration,
}

impl ResponseCache {
    pub fn new(timeout: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Returns a copy of the entry for `key` if it is still fresh.
    pub fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        let now = Instant::now();
        {
            let entries = self.entries.read();
            match entries.get(key) {
                None => return None,
                Some(entry) if entry.is_fresh_at(now) => return Some(entry.clone()),
                Some(_) => {}
            }
        }
        self.remove_if_stale(key, now);
        None
    }

    /// Stores `entry` under `key`, replacing any previous entry, with an expiry of
    /// `now + timeout`.
    pub fn set(&self, key: CacheKey, mut entry: CacheEntry) {
        let now = Instant::now();
        let expires_at = now
            .checked_add(self.timeout)
            .unwrap_or_else(|| now + MAX_EXPIRY_HORIZON);
        entry.stamp_expiry(expires_at);
        self.entries.write().insert(key, entry);
    }

    pub fn remove(&self, key: &CacheKey) {
        self.entries.write().remove(key);
    }

    /// Drops every expired entry and returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| entry.is_fresh_at(now));
        before - entries.len()
    }

    /// Number of entries physically present, stale ones included.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    // A concurrent `set` may have replaced the entry after the read lock was released, so the
    // freshness check is repeated under the write lock.
    fn remove_if_stale(&self, key: &CacheKey, now: Instant) {
        let mut entries = self.entries.write();
        let stale = entries
            .get(key)
            .is_some_and(|entry| !entry.is_fresh_at(now));
        if stale {
            entries.remove(key);
            trace!(key = %key, "removed expired cache entry");
        }
    }
}
