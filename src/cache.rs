//! # Dedup Cache
//!
//! Fingerprint deduplication for the message plane. [`DedupCache`] is a
//! thin facade over an external admission-controlled key/value store: a
//! write records the current nanosecond timestamp under the fingerprint,
//! and a read consults a caller-supplied TTL. The consensus layer supplies
//! the backend through `SyncHandle::get_cache_store`; [`LruCacheStore`] is
//! the bundled bounded implementation.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use lru::LruCache;

/// TTL applied by the transport core to all of its own dedup checks.
pub const DEDUP_TTL: Duration = Duration::from_secs(60);

/// Default entry bound for the bundled [`LruCacheStore`].
const DEFAULT_STORE_ENTRIES: usize = 1 << 20;

/// Key/value store with cost-based eviction, provided by the consensus
/// layer. Implementations must be thread-safe; eviction may drop entries
/// at any time, which weakens dedup to best-effort (acceptable: delivery
/// is best-effort too).
pub trait CacheStore: Send + Sync {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;
    fn set(&self, key: &[u8], value: Vec<u8>, cost: i64);
}

/// TTL-keyed fingerprint set shared by every session of a host.
#[derive(Clone)]
pub struct DedupCache {
    store: Arc<dyn CacheStore>,
}

impl DedupCache {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self { store }
    }

    /// True iff `key` was stored less than `ttl` ago. An absent key
    /// ("do not dedup") always misses.
    pub fn contains(&self, key: Option<&[u8]>, ttl: Duration) -> bool {
        let Some(key) = key else {
            return false;
        };
        let Some(value) = self.store.get(key) else {
            return false;
        };
        let Ok(raw) = <[u8; 8]>::try_from(value.as_slice()) else {
            return false;
        };
        let stored = UNIX_EPOCH + Duration::from_nanos(u64::from_be_bytes(raw));
        match SystemTime::now().duration_since(stored) {
            Ok(age) => age < ttl,
            // Stored timestamp in the future: treat as fresh.
            Err(_) => true,
        }
    }

    /// Record `key` as seen at `ts`.
    pub fn store(&self, key: &[u8], ts: SystemTime) {
        let nanos = ts
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();
        self.store.set(key, nanos.to_be_bytes().to_vec(), 8);
    }
}

/// Bounded in-process [`CacheStore`] backed by an LRU map. Eviction is
/// recency-based rather than cost-based; `cost` is accepted for interface
/// parity with richer backends.
pub struct LruCacheStore {
    inner: Mutex<LruCache<Vec<u8>, Vec<u8>>>,
}

impl LruCacheStore {
    pub fn new(entries: usize) -> Self {
        let cap = NonZeroUsize::new(entries).expect("cache entry bound must be non-zero");
        Self {
            inner: Mutex::new(LruCache::new(cap)),
        }
    }
}

impl Default for LruCacheStore {
    fn default() -> Self {
        Self::new(DEFAULT_STORE_ENTRIES)
    }
}

impl CacheStore for LruCacheStore {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.inner.lock().expect("cache lock poisoned").get(key).cloned()
    }

    fn set(&self, key: &[u8], value: Vec<u8>, _cost: i64) {
        self.inner
            .lock()
            .expect("cache lock poisoned")
            .put(key.to_vec(), value);
    }
}
