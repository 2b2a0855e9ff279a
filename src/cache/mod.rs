//! Keyed TTL store used for read-through caching of manager API responses
//! and for the engine's `recently_acted_on` idempotence set.
//!
//! # Overview
//!
//! Entries carry an absolute expiry computed at insertion time. [`TtlCache::get`]
//! treats a missing or expired key as a miss, never an error. A background
//! [`TtlCache::sweep`] call drops expired entries so memory does not grow
//! unbounded from keys nobody reads again.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use reconciler_core::cache::TtlCache;
//!
//! let cache: TtlCache<String> = TtlCache::new();
//! cache.put("queue".to_string(), "snapshot".to_string(), Duration::from_secs(60));
//! let (value, hit) = cache.get("queue");
//! assert!(hit);
//! assert_eq!(value.as_deref(), Some(&"snapshot".to_string()));
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, instrument};

/// Snapshot of cache activity since construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Total entries currently stored, expired or not.
    pub size: u64,
    /// Entries stored that have not yet passed their expiry.
    pub active: u64,
    /// Entries stored that have passed their expiry but not yet swept.
    pub expired: u64,
    /// Cumulative `get` calls that found a live entry.
    pub hits: u64,
    /// Cumulative `get` calls that found nothing live.
    pub misses: u64,
}

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

/// A keyed store mapping string keys to values with a per-entry absolute expiry.
///
/// Safe for concurrent use: reads may proceed alongside writers. Values are
/// treated as immutable snapshots once inserted — callers must not mutate a
/// value returned by `get` and expect the cache to see the change.
#[derive(Debug)]
pub struct TtlCache<V> {
    entries: DashMap<String, Entry<V>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<V> Default for TtlCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone> TtlCache<V> {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Looks up `key`, returning `(value, hit)`. A missing or expired key is a
    /// miss, not an error.
    #[instrument(skip(self, key), fields(key = %key))]
    pub fn get(&self, key: &str) -> (Option<V>, bool) {
        let found = self.entries.get(key).and_then(|entry| {
            if entry.expires_at > Instant::now() {
                Some(entry.value.clone())
            } else {
                None
            }
        });

        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            (found, true)
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            (None, false)
        }
    }

    /// Inserts `value` under `key` with the given time-to-live.
    pub fn put(&self, key: String, value: V, ttl: Duration) {
        self.entries.insert(
            key,
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Removes `key` unconditionally.
    pub fn invalidate(&self, key: &str) {
        self.entries.remove(key);
    }

    /// Removes every key starting with `prefix`.
    pub fn invalidate_prefix(&self, prefix: &str) {
        self.entries.retain(|key, _| !key.starts_with(prefix));
    }

    /// Drops expired entries, bounding memory growth from stale keys.
    #[instrument(skip(self))]
    pub fn sweep(&self) {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        let removed = before - self.entries.len();
        if removed > 0 {
            debug!(removed, remaining = self.entries.len(), "swept expired cache entries");
        }
    }

    /// Returns a point-in-time snapshot of size and hit/miss counters.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let now = Instant::now();
        let mut active = 0u64;
        let mut expired = 0u64;
        for entry in &self.entries {
            if entry.expires_at > now {
                active += 1;
            } else {
                expired += 1;
            }
        }
        CacheStats {
            size: active + expired,
            active,
            expired,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    /// Returns whether `key` is present and unexpired, without counting
    /// towards hit/miss statistics. Used by the idempotence set where a
    /// membership check is semantically distinct from a cache read.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.entries
            .get(key)
            .is_some_and(|entry| entry.expires_at > Instant::now())
    }
}
