//! Short-lived metadata cache.
//!
//! Container and blob property lookups are cached for a few seconds to
//! avoid repeating store round trips when a filesystem client stats the
//! same path many times in a row.  The cache is process-local and
//! best-effort: it never fails, and every problem degrades to a miss.
//!
//! Entries are stored in a sharded [`DashMap`]; the value and its expiry
//! live in one map slot, so a reader never sees a value paired with
//! another write's expiry.
//!
//! Fills race with invalidations: a fetch that started before a writer's
//! close may finish after the close dropped the key.  Callers read
//! [`MetadataCache::generation`] before fetching and fill through
//! [`MetadataCache::insert_if_current`], which discards the value if any
//! invalidation happened in between.

use dashmap::DashMap;
use metrics::counter;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;

use crate::metrics::{CACHE_HITS_TOTAL, CACHE_MISSES_TOTAL};
use crate::store::{BlobProperties, ContainerProperties};

/// Default time-to-live for cached entries.
pub const DEFAULT_TTL: Duration = Duration::from_secs(5);

/// Entry count above which inserts trigger sweeps of expired entries.
/// At most one sweep runs per `threshold` inserts.
pub const DEFAULT_SWEEP_THRESHOLD: usize = 10_000;

/// Composite cache key for a container or a blob.
///
/// Encoded as `{len}:{container}` for container-level entries and
/// `{len}:{container}/{blob}` for blob entries.  The length prefix pins
/// where the container name ends, so distinct pairs never collide even
/// when names contain `/` or `:`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Build the key for `(container, blob)`; `None` addresses the container.
    pub fn formatted(container: &str, blob: Option<&str>) -> Self {
        match blob {
            None => CacheKey(format!("{}:{}", container.len(), container)),
            Some(blob) => CacheKey(format!("{}:{}/{}", container.len(), container, blob)),
        }
    }

    /// Key of a container-level entry.
    pub fn container(container: &str) -> Self {
        Self::formatted(container, None)
    }

    /// Key of a blob-level entry.
    pub fn blob(container: &str, blob: &str) -> Self {
        Self::formatted(container, Some(blob))
    }

    /// The encoded key string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A cached payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CachedValue {
    /// Properties of a container.
    Container(ContainerProperties),
    /// Properties and metadata of a blob.
    Blob(BlobProperties),
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: CachedValue,
    inserted_at: Instant,
    ttl: Duration,
    /// Invalidation generation the value was fetched under.
    generation: u64,
}

impl CacheEntry {
    #[inline]
    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.inserted_at) >= self.ttl
    }
}

/// Thread-safe TTL cache keyed by [`CacheKey`].
#[derive(Debug)]
pub struct MetadataCache {
    entries: DashMap<CacheKey, CacheEntry>,
    default_ttl: Duration,
    sweep_threshold: usize,
    /// Bumped by every invalidation, before entries are removed.
    generation: AtomicU64,
    inserts_since_sweep: AtomicUsize,
}

impl Default for MetadataCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl MetadataCache {
    /// Create a cache whose [`insert`](Self::insert) uses `default_ttl`.
    pub fn new(default_ttl: Duration) -> Self {
        Self::with_sweep_threshold(default_ttl, DEFAULT_SWEEP_THRESHOLD)
    }

    /// Create a cache with an explicit sweep threshold.
    pub fn with_sweep_threshold(default_ttl: Duration, sweep_threshold: usize) -> Self {
        Self {
            entries: DashMap::new(),
            default_ttl,
            sweep_threshold,
            generation: AtomicU64::new(0),
            inserts_since_sweep: AtomicUsize::new(0),
        }
    }

    /// The TTL applied by [`insert`](Self::insert).
    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Return the value for `key` if it is present and unexpired.
    ///
    /// Missing and expired entries look the same to the caller.  An expired
    /// entry is removed on the way out.
    pub fn get(&self, key: &CacheKey) -> Option<CachedValue> {
        let now = Instant::now();
        // The read guard must be dropped before `remove_if` takes the shard lock.
        let hit = self
            .entries
            .get(key)
            .and_then(|entry| (!entry.is_expired(now)).then(|| entry.value.clone()));

        match hit {
            Some(value) => {
                counter!(CACHE_HITS_TOTAL).increment(1);
                Some(value)
            }
            None => {
                self.entries.remove_if(key, |_, entry| entry.is_expired(now));
                counter!(CACHE_MISSES_TOTAL).increment(1);
                None
            }
        }
    }

    /// Insert or overwrite `key` with an explicit TTL.  Overwriting restarts
    /// the expiry clock.  A zero TTL removes the entry instead.
    pub fn put(&self, key: CacheKey, value: CachedValue, ttl: Duration) {
        self.store(key, value, ttl, self.generation());
    }

    /// Insert with the default TTL.
    pub fn insert(&self, key: CacheKey, value: CachedValue) {
        self.put(key, value, self.default_ttl);
    }

    /// Current invalidation generation.  Read it before fetching the value
    /// that will be passed to [`insert_if_current`](Self::insert_if_current).
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Insert with the default TTL unless an invalidation happened since
    /// `generation` was read.  Returns whether the value was kept.
    pub fn insert_if_current(&self, key: CacheKey, value: CachedValue, generation: u64) -> bool {
        if self.generation() != generation {
            return false;
        }
        self.store(key.clone(), value, self.default_ttl, generation);
        // An invalidation may have slipped in between the check and the
        // insert.  It bumped the generation first, so it is visible here.
        if self.generation() != generation {
            self.entries.remove_if(&key, |_, entry| entry.generation == generation);
            return false;
        }
        true
    }

    fn store(&self, key: CacheKey, value: CachedValue, ttl: Duration, generation: u64) {
        if ttl.is_zero() {
            self.entries.remove(&key);
            return;
        }
        self.entries.insert(
            key,
            CacheEntry {
                value,
                inserted_at: Instant::now(),
                ttl,
                generation,
            },
        );
        let inserts = self.inserts_since_sweep.fetch_add(1, Ordering::Relaxed) + 1;
        if self.entries.len() > self.sweep_threshold && inserts >= self.sweep_threshold.max(1) {
            self.inserts_since_sweep.store(0, Ordering::Relaxed);
            self.purge_expired();
        }
    }

    fn bump_generation(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Remove one entry.
    pub fn invalidate(&self, key: &CacheKey) {
        self.bump_generation();
        self.entries.remove(key);
    }

    /// Remove the container entry and every blob entry of `container`.
    pub fn invalidate_container(&self, container: &str) {
        self.bump_generation();
        let container_key = CacheKey::container(container);
        let blob_prefix = format!("{}/", container_key.as_str());
        self.entries.retain(|key, _| {
            key != &container_key && !key.as_str().starts_with(&blob_prefix)
        });
    }

    /// Drop every expired entry.
    pub fn purge_expired(&self) {
        let now = Instant::now();
        self.entries.retain(|_, entry| !entry.is_expired(now));
    }

    /// Drop everything.
    pub fn clear(&self) {
        self.bump_generation();
        self.entries.clear();
    }

    /// Number of stored entries, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// -- Tests --------------------------------------------------------------------
