//! Short-lived keyed store with per-entry expiry.
//!
//! Entries are stamped with the `Instant` they were inserted. Reads treat an
//! entry older than the TTL as absent; `sweep` drops them for good.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

pub struct ExpiringMap<K, V> {
    ttl: Duration,
    entries: Mutex<HashMap<K, (V, Instant)>>,
}

impl<K: Eq + Hash, V> ExpiringMap<K, V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, key: K, value: V) {
        self.entries.lock().insert(key, (value, Instant::now()));
    }

    /// Remove and return the entry if it has not expired. One-time use.
    pub fn take(&self, key: &K) -> Option<V> {
        let (value, inserted) = self.entries.lock().remove(key)?;
        (inserted.elapsed() < self.ttl).then_some(value)
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, (_, inserted)| inserted.elapsed() < self.ttl);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
