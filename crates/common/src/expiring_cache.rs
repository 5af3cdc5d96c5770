//! Per-key time-expiring value store.
//!
//! Backs the ACME directory cache: a directory document is reused for
//! several hours and refetched transparently once it lapses.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

/// A per-key value store where every entry carries its own TTL.
///
/// Expired entries are dropped lazily on access; there is no background
/// sweeper, which is fine for the handful of keys this holds.
pub struct ExpiringCache<K, V> {
    entries: Mutex<HashMap<K, Entry<V>>>,
}

impl<K: Eq + Hash, V: Clone> ExpiringCache<K, V> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Return the cached value for `key` if it has not expired.
    ///
    /// An expired entry is removed on the spot.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Insert or replace the value for `key` with a fresh TTL.
    pub fn insert(&self, key: K, value: V, ttl: Duration) {
        let mut entries = self.entries.lock();
        entries.insert(
            key,
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Drop the entry for `key` regardless of expiry.
    pub fn invalidate(&self, key: &K) {
        self.entries.lock().remove(key);
    }
}

impl<K: Eq + Hash, V: Clone> Default for ExpiringCache<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_unexpired() {
        let cache = ExpiringCache::new();
        cache.insert("k", 42, Duration::from_secs(60));
        assert_eq!(cache.get(&"k"), Some(42));
    }

    #[test]
    fn test_expired_entry_is_dropped() {
        let cache = ExpiringCache::new();
        cache.insert("k", 42, Duration::from_nanos(1));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.get(&"k"), None);
        // a second read still sees nothing
        assert_eq!(cache.get(&"k"), None);
    }

    #[test]
    fn test_insert_replaces_and_refreshes() {
        let cache = ExpiringCache::new();
        cache.insert("k", 1, Duration::from_nanos(1));
        cache.insert("k", 2, Duration::from_secs(60));
        assert_eq!(cache.get(&"k"), Some(2));
    }

    #[test]
    fn test_invalidate() {
        let cache = ExpiringCache::new();
        cache.insert("k", 1, Duration::from_secs(60));
        cache.invalidate(&"k");
        assert_eq!(cache.get(&"k"), None);
    }
}
