//! String-keyed TTL cache with lazy eviction.

use crate::error::{Result, SyncError};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct Entry<V> {
    value: V,
    expires_at: Instant,
}

/// Key → value map with per-entry expiry.
///
/// Eviction is lazy: an expired entry is deleted the next time `get` touches
/// it. There is no sweeper task.
pub struct TtlCache<V> {
    default_ttl: Duration,
    inner: RwLock<HashMap<String, Entry<V>>>,
}

impl<V: std::fmt::Debug> std::fmt::Debug for TtlCache<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TtlCache")
            .field("default_ttl", &self.default_ttl)
            .field("inner", &self.inner)
            .finish()
    }
}

impl<V: Clone> TtlCache<V> {
    /// Create a cache whose `set` calls without an explicit TTL use
    /// `default_ttl`.
    #[must_use]
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            default_ttl,
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Fetch a live value. Expired entries are removed and reported as a miss.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let mut map = self.inner.write();
        let entry = map.get(key)?;
        if entry.expires_at <= now {
            map.remove(key);
            return None;
        }
        Some(entry.value.clone())
    }

    /// Store `value` under `key` for `ttl` (or the cache default).
    ///
    /// # Errors
    ///
    /// `InvalidKey` for an empty key, `InvalidTtl` for a zero TTL.
    pub fn set(&self, key: &str, value: V, ttl: Option<Duration>) -> Result<()> {
        if key.is_empty() {
            return Err(SyncError::InvalidKey);
        }
        let ttl = ttl.unwrap_or(self.default_ttl);
        if ttl.is_zero() {
            return Err(SyncError::InvalidTtl);
        }
        self.inner.write().insert(
            key.to_string(),
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    /// Remove an entry. Returns whether it was present (live or expired).
    pub fn delete(&self, key: &str) -> bool {
        self.inner.write().remove(key).is_some()
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.inner.write().clear();
    }

    /// Number of stored entries, counting not-yet-evicted expired ones.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}
