//! Per-key FIFO pool of single-use tokens.
//!
//! ACME servers hand out a fresh replay nonce with every response; the
//! client banks them per provider and spends each one exactly once.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

/// A per-key FIFO queue of single-use values.
///
/// `take` removes the value it returns, so a token handed out once is
/// never handed out again. Empty queues simply yield `None`; callers
/// are expected to fetch a fresh token out of band.
#[derive(Debug)]
pub struct NonceCache<K, V> {
    pools: Mutex<HashMap<K, VecDeque<V>>>,
}

impl<K: Eq + Hash, V> NonceCache<K, V> {
    pub fn new() -> Self {
        Self {
            pools: Mutex::new(HashMap::new()),
        }
    }

    /// Dequeue the oldest banked value for `key`, if any.
    pub fn take(&self, key: &K) -> Option<V> {
        let mut pools = self.pools.lock();
        pools.get_mut(key).and_then(|queue| queue.pop_front())
    }

    /// Bank a value for `key`.
    pub fn push(&self, key: K, value: V) {
        let mut pools = self.pools.lock();
        pools.entry(key).or_default().push_back(value);
    }

    /// Number of banked values for `key`.
    pub fn len(&self, key: &K) -> usize {
        let pools = self.pools.lock();
        pools.get(key).map_or(0, VecDeque::len)
    }

    pub fn is_empty(&self, key: &K) -> bool {
        self.len(key) == 0
    }
}

impl<K: Eq + Hash, V> Default for NonceCache<K, V> {
    fn default() -> Self {
        Self::new()
    }
}
