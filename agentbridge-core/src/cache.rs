//! Bounded, write-expiring concurrent cache with an eviction listener.
//!
//! Backs both the registration view and the pending-reply table. Every
//! removal (explicit, replacement, expiry, size, clear) is reported to the
//! eviction listener *while the entry's shard lock is still held*, so a
//! secondary index maintained from the listener can never be observed out of
//! step with the cache. The flip side: a listener must not call back into the
//! same cache.
//!
//! Expiry counts from the last write, never the last read. Expired entries
//! are dropped lazily when touched and in bulk by [`CorrelationCache::run_pending_tasks`].
//! When an insert pushes the cache above `max_entries`, the oldest written
//! entries are evicted.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

use crate::timeout;

/// Why an entry left the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemovalCause {
    /// Removed by [`CorrelationCache::remove`]
    Explicit,
    /// Overwritten by a newer value for the same key
    Replaced,
    /// Outlived its time-to-live
    Expired,
    /// Evicted to stay within `max_entries`
    Size,
    /// Dropped by [`CorrelationCache::clear`]
    Cleared,
}

impl RemovalCause {
    /// True for removals the owner did not ask for.
    #[must_use]
    pub fn was_evicted(&self) -> bool {
        matches!(self, Self::Expired | Self::Size)
    }
}

/// Called for every removed entry, inside the entry's critical section.
pub type EvictionListener<K, V> = Arc<dyn Fn(&K, &V, RemovalCause) + Send + Sync>;

/// Called on a miss to populate the cache.
pub type Loader<K, V> = Arc<dyn Fn(&K) -> Option<V> + Send + Sync>;

/// Cache sizing and expiry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Maximum number of live entries
    pub max_entries: usize,
    /// Time-to-live counted from the last write (`None` = never expire)
    pub expire_after_write: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            expire_after_write: Some(Duration::from_secs(300)),
        }
    }
}

struct Slot<V> {
    value: V,
    written_at: Instant,
    ttl: Option<Duration>,
    seq: u64,
}

impl<V> Slot<V> {
    fn is_expired(&self, now: Instant) -> bool {
        self.ttl
            .is_some_and(|ttl| timeout::is_expired(self.written_at, ttl, now))
    }
}

/// Concurrent cache keyed by `K`.
pub struct CorrelationCache<K, V> {
    entries: DashMap<K, Slot<V>>,
    config: CacheConfig,
    listener: Option<EvictionListener<K, V>>,
    loader: Option<Loader<K, V>>,
    write_seq: AtomicU64,
}

impl<K: Eq + Hash, V> fmt::Debug for CorrelationCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CorrelationCache")
            .field("entries", &self.entries.len())
            .field("config", &self.config)
            .field("has_listener", &self.listener.is_some())
            .field("has_loader", &self.loader.is_some())
            .finish()
    }
}

impl<K, V> CorrelationCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    #[must_use]
    pub fn new(config: CacheConfig) -> Self {
        Self {
            entries: DashMap::new(),
            config,
            listener: None,
            loader: None,
            write_seq: AtomicU64::new(0),
        }
    }

    /// Installs the eviction listener.
    #[must_use]
    pub fn with_listener(
        mut self,
        listener: impl Fn(&K, &V, RemovalCause) + Send + Sync + 'static,
    ) -> Self {
        self.listener = Some(Arc::new(listener));
        self
    }

    /// Installs a loader consulted on misses.
    #[must_use]
    pub fn with_loader(mut self, loader: impl Fn(&K) -> Option<V> + Send + Sync + 'static) -> Self {
        self.loader = Some(Arc::new(loader));
        self
    }

    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn notify(&self, key: &K, value: &V, cause: RemovalCause) {
        if let Some(listener) = &self.listener {
            listener(key, value, cause);
        }
    }

    fn slot(&self, value: V, ttl: Option<Duration>) -> Slot<V> {
        Slot {
            value,
            written_at: Instant::now(),
            ttl,
            seq: self.write_seq.fetch_add(1, Ordering::Relaxed),
        }
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Returns the live value for `key`, loading it on a miss.
    pub fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        if let Some(slot) = self.entries.get(key)
            && !slot.is_expired(now)
        {
            return Some(slot.value.clone());
        }

        self.expire_if_stale(key, now);

        let loader = self.loader.as_ref()?;
        let value = loader(key)?;
        self.insert(key.clone(), value.clone());
        Some(value)
    }

    /// True if `key` maps to a live entry. Never consults the loader.
    #[must_use]
    pub fn contains_key(&self, key: &K) -> bool {
        let now = Instant::now();
        self.entries
            .get(key)
            .is_some_and(|slot| !slot.is_expired(now))
    }

    /// Number of stored entries, including expired ones not yet swept.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot of all live entries.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(K, V)> {
        let now = Instant::now();
        self.entries
            .iter()
            .filter(|entry| !entry.value().is_expired(now))
            .map(|entry| (entry.key().clone(), entry.value().value.clone()))
            .collect()
    }

    /// Snapshot of all live values.
    #[must_use]
    pub fn values(&self) -> Vec<V> {
        self.snapshot().into_iter().map(|(_, value)| value).collect()
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Stores `value` with the configured time-to-live.
    pub fn insert(&self, key: K, value: V) {
        self.insert_with_ttl(key, value, self.config.expire_after_write);
    }

    /// Stores `value` with an explicit time-to-live.
    pub fn insert_with_ttl(&self, key: K, value: V, ttl: Option<Duration>) {
        let slot = self.slot(value, ttl);
        match self.entries.entry(key) {
            Entry::Occupied(mut entry) => {
                let previous = entry.insert(slot);
                self.notify(entry.key(), &previous.value, RemovalCause::Replaced);
            }
            Entry::Vacant(entry) => {
                entry.insert(slot);
            }
        }
        self.enforce_capacity();
    }

    /// Stores `value` only if no live entry exists for `key`.
    ///
    /// An expired entry in the way is removed with [`RemovalCause::Expired`].
    /// Returns false when a live entry was already present.
    pub fn try_insert_with_ttl(&self, key: K, value: V, ttl: Option<Duration>) -> bool {
        let now = Instant::now();
        match self.entries.entry(key) {
            Entry::Occupied(entry) if !entry.get().is_expired(now) => return false,
            Entry::Occupied(mut entry) => {
                let previous = entry.insert(self.slot(value, ttl));
                self.notify(entry.key(), &previous.value, RemovalCause::Expired);
            }
            Entry::Vacant(entry) => {
                entry.insert(self.slot(value, ttl));
            }
        }
        self.enforce_capacity();
        true
    }

    /// Removes and returns the live value for `key`.
    ///
    /// An entry found past its deadline is removed as expired instead and
    /// `None` is returned, so a late remover never wins against expiry.
    pub fn remove(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        match self.entries.entry(key.clone()) {
            Entry::Occupied(entry) => {
                if entry.get().is_expired(now) {
                    self.notify(entry.key(), &entry.get().value, RemovalCause::Expired);
                    entry.remove();
                    None
                } else {
                    self.notify(entry.key(), &entry.get().value, RemovalCause::Explicit);
                    Some(entry.remove().value)
                }
            }
            Entry::Vacant(_) => None,
        }
    }

    /// Removes every entry, reporting [`RemovalCause::Cleared`].
    pub fn clear(&self) -> usize {
        let keys: Vec<K> = self.entries.iter().map(|entry| entry.key().clone()).collect();
        let mut removed = 0;
        for key in keys {
            if let Entry::Occupied(entry) = self.entries.entry(key) {
                self.notify(entry.key(), &entry.get().value, RemovalCause::Cleared);
                entry.remove();
                removed += 1;
            }
        }
        removed
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Sweeps expired entries. Returns how many were removed.
    pub fn run_pending_tasks(&self) -> usize {
        let now = Instant::now();
        let stale: Vec<K> = self
            .entries
            .iter()
            .filter(|entry| entry.value().is_expired(now))
            .map(|entry| entry.key().clone())
            .collect();

        stale
            .into_iter()
            .filter(|key| self.expire_if_stale(key, now))
            .count()
    }

    fn expire_if_stale(&self, key: &K, now: Instant) -> bool {
        if let Entry::Occupied(entry) = self.entries.entry(key.clone())
            && entry.get().is_expired(now)
        {
            self.notify(entry.key(), &entry.get().value, RemovalCause::Expired);
            entry.remove();
            return true;
        }
        false
    }

    fn enforce_capacity(&self) {
        while self.entries.len() > self.config.max_entries {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|entry| entry.value().seq)
                .map(|entry| entry.key().clone());
            let Some(key) = oldest else {
                break;
            };
            if let Entry::Occupied(entry) = self.entries.entry(key) {
                self.notify(entry.key(), &entry.get().value, RemovalCause::Size);
                entry.remove();
            }
        }
    }
}
