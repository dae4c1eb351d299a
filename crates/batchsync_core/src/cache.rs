//! Time-bounded cache with an injected clock.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;

/// Whether an entry fetched at `fetched_at` is stale at `now`.
pub fn is_expired(fetched_at: u64, now: u64, ttl: Duration) -> bool {
    now.saturating_sub(fetched_at) > ttl.as_millis() as u64
}

/// A cache of `(value, fetched_at)` pairs that expire after a TTL.
///
/// Expiry is evaluated on read against the injected [`Clock`].
#[derive(Debug)]
pub struct TimedCache<K, V> {
    clock: Arc<dyn Clock>,
    ttl: Duration,
    entries: RwLock<HashMap<K, (V, u64)>>,
}

impl<K, V> TimedCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Creates an empty cache.
    pub fn new(clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self {
            clock,
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Returns a fresh value, or `None` if absent or expired.
    pub fn get(&self, key: &K) -> Option<V> {
        let now = self.clock.now_millis();
        self.entries
            .read()
            .get(key)
            .filter(|(_, fetched_at)| !is_expired(*fetched_at, now, self.ttl))
            .map(|(v, _)| v.clone())
    }

    /// Stores a value fetched now.
    pub fn insert(&self, key: K, value: V) {
        let now = self.clock.now_millis();
        self.entries.write().insert(key, (value, now));
    }

    /// Returns a fresh value or loads, stores and returns a new one.
    ///
    /// # Errors
    ///
    /// Propagates the loader's error; nothing is cached in that case.
    pub fn get_or_try_load<E>(&self, key: &K, load: impl FnOnce() -> Result<V, E>) -> Result<V, E> {
        if let Some(value) = self.get(key) {
            return Ok(value);
        }
        let value = load()?;
        self.insert(key.clone(), value.clone());
        Ok(value)
    }

    /// Drops one entry.
    pub fn invalidate(&self, key: &K) {
        self.entries.write().remove(key);
    }

    /// Drops every entry.
    pub fn invalidate_all(&self) {
        self.entries.write().clear();
    }
}
