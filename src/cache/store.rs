//! Entry store.
//!
//! A single reader/writer lock guards the entry map. Reads stay on the read
//! lock and record access through per-entry atomics; the write lock is taken
//! only to drop an entry found expired, and by every mutation. The store owns
//! the dependency graph and always locks it second (store, then graph).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use metrics::{counter, gauge};
use serde::Serialize;
use tracing::debug;

use super::clock::Clock;
use super::config::{CacheConfig, EvictionPolicy};
use super::entry::{CacheEntry, EntryInfo, NewEntry};
use super::error::CacheError;
use super::eviction::select_victim;
use super::graph::DependencyGraph;
use super::lock::{rw_read, rw_write};

const SOURCE: &str = "cache::store";

const METRIC_HIT: &str = "revcache_cache_hit_total";
const METRIC_MISS: &str = "revcache_cache_miss_total";
const METRIC_EVICT: &str = "revcache_cache_evict_total";
const METRIC_EXPIRED: &str = "revcache_cache_expired_total";
const METRIC_ENTRIES: &str = "revcache_cache_entries";

#[derive(Debug, Default)]
struct StoreInner {
    entries: HashMap<String, CacheEntry>,
    bytes: u64,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expired: AtomicU64,
}

/// Point-in-time counters of a cache instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expired: u64,
    pub tags: usize,
    pub approx_bytes: u64,
}

#[derive(Debug)]
pub struct EntryStore {
    inner: RwLock<StoreInner>,
    graph: DependencyGraph,
    policy: EvictionPolicy,
    max_entries: usize,
    max_memory: u64,
    clock: Arc<dyn Clock>,
    /// Logical clock shared by insertions and reads.
    ticks: AtomicU64,
    counters: Counters,
}

impl EntryStore {
    pub fn new(config: &CacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: RwLock::new(StoreInner::default()),
            graph: DependencyGraph::new(),
            policy: config.eviction_policy,
            max_entries: config.max_entries,
            max_memory: config.max_memory,
            clock,
            ticks: AtomicU64::new(0),
            counters: Counters::default(),
        }
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn policy(&self) -> EvictionPolicy {
        self.policy
    }

    fn next_tick(&self) -> u64 {
        self.ticks.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Look up `key`, dropping it when it has expired.
    pub fn get(&self, key: &str) -> Option<Bytes> {
        let now = self.clock.now();
        {
            let inner = rw_read(&self.inner, SOURCE, "get");
            match inner.entries.get(key) {
                Some(entry) if !entry.is_expired(now) => {
                    entry.touch(self.next_tick());
                    self.counters.hits.fetch_add(1, Ordering::Relaxed);
                    counter!(METRIC_HIT).increment(1);
                    debug!(key, outcome = "hit", "Cache lookup");
                    return Some(entry.value.clone());
                }
                Some(_) => {}
                None => {
                    self.record_miss(key, "absent");
                    return None;
                }
            }
        }

        let mut inner = rw_write(&self.inner, SOURCE, "get_expired");
        // A writer may have replaced the entry between the two locks.
        if inner
            .entries
            .get(key)
            .is_some_and(|entry| entry.is_expired(now))
        {
            self.remove_locked(&mut inner, key);
            self.counters.expired.fetch_add(1, Ordering::Relaxed);
            counter!(METRIC_EXPIRED).increment(1);
            gauge!(METRIC_ENTRIES).set(inner.entries.len() as f64);
        }
        self.record_miss(key, "expired");
        None
    }

    fn record_miss(&self, key: &str, reason: &'static str) {
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        counter!(METRIC_MISS).increment(1);
        debug!(key, outcome = "miss", reason, "Cache lookup");
    }

    /// Insert or replace an entry.
    ///
    /// The previous entry under the same key is unlinked before the new
    /// dependencies are registered. `admit` is consulted while both the store
    /// and graph write locks are held; when it refuses, nothing is inserted and
    /// `Ok(false)` is returned. Eviction runs synchronously until the new entry
    /// fits both bounds or the store is empty.
    pub fn insert<F>(&self, entry: NewEntry, admit: F) -> Result<bool, CacheError>
    where
        F: FnOnce() -> bool,
    {
        if entry.key.is_empty() {
            return Err(CacheError::KeyEmpty);
        }
        let size = entry.approx_size();
        if self.max_memory > 0 && size > self.max_memory {
            return Err(CacheError::EntryTooLarge {
                size,
                limit: self.max_memory,
            });
        }

        let now = self.clock.now();
        let mut inner = rw_write(&self.inner, SOURCE, "insert");

        let replaced = self.remove_locked(&mut inner, &entry.key).is_some();
        if !self
            .graph
            .register_if(&entry.key, &entry.dependencies, admit)
        {
            debug!(key = %entry.key, replaced, "Cache write refused");
            return Ok(false);
        }

        while self.needs_room(&inner, size) {
            if !self.evict_one(&mut inner) {
                break;
            }
        }

        let key = entry.key.clone();
        let entry = CacheEntry::new(entry, now, self.next_tick());
        debug!(
            key = %key,
            ttl = ?entry.ttl,
            dependencies = entry.dependencies.len(),
            size,
            replaced,
            "Cache entry stored"
        );
        inner.bytes = inner.bytes.saturating_add(size);
        inner.entries.insert(key, entry);
        gauge!(METRIC_ENTRIES).set(inner.entries.len() as f64);
        Ok(true)
    }

    fn needs_room(&self, inner: &StoreInner, incoming: u64) -> bool {
        let over_count = self.max_entries > 0 && inner.entries.len() >= self.max_entries;
        let over_memory =
            self.max_memory > 0 && inner.bytes.saturating_add(incoming) > self.max_memory;
        over_count || over_memory
    }

    fn evict_one(&self, inner: &mut StoreInner) -> bool {
        let Some(victim) = select_victim(self.policy, inner.entries.values()).map(str::to_owned)
        else {
            return false;
        };

        self.remove_locked(inner, &victim);
        self.counters.evictions.fetch_add(1, Ordering::Relaxed);
        counter!(METRIC_EVICT, "policy" => self.policy.as_str()).increment(1);
        debug!(key = %victim, policy = %self.policy, "Cache entry evicted");
        true
    }

    /// Remove `key` and its dependency back-links. Caller holds the write lock.
    fn remove_locked(&self, inner: &mut StoreInner, key: &str) -> Option<CacheEntry> {
        let entry = inner.entries.remove(key)?;
        inner.bytes = inner.bytes.saturating_sub(entry.approx_size());
        self.graph.unlink(key, &entry.dependencies);
        Some(entry)
    }

    /// Remove `key`; absent keys are ignored. Returns whether an entry was removed.
    pub fn delete(&self, key: &str) -> bool {
        let mut inner = rw_write(&self.inner, SOURCE, "delete");
        let removed = self.remove_locked(&mut inner, key).is_some();
        if removed {
            gauge!(METRIC_ENTRIES).set(inner.entries.len() as f64);
            debug!(key, "Cache entry deleted");
        }
        removed
    }

    /// Remove every key in `keys` under one lock acquisition.
    pub fn delete_many(&self, keys: &[String]) -> usize {
        if keys.is_empty() {
            return 0;
        }
        let mut inner = rw_write(&self.inner, SOURCE, "delete_many");
        let removed = keys
            .iter()
            .filter(|key| self.remove_locked(&mut inner, key).is_some())
            .count();
        gauge!(METRIC_ENTRIES).set(inner.entries.len() as f64);
        removed
    }

    /// Drop every expired entry in one pass.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut inner = rw_write(&self.inner, SOURCE, "purge_expired");
        let expired: Vec<String> = inner
            .entries
            .values()
            .filter(|entry| entry.is_expired(now))
            .map(|entry| entry.key.clone())
            .collect();

        for key in &expired {
            self.remove_locked(&mut inner, key);
        }
        let count = expired.len();
        if count > 0 {
            self.counters
                .expired
                .fetch_add(count as u64, Ordering::Relaxed);
            counter!(METRIC_EXPIRED).increment(count as u64);
            gauge!(METRIC_ENTRIES).set(inner.entries.len() as f64);
        }
        count
    }

    /// Drop every entry and every dependency back-link.
    pub fn clear(&self) -> usize {
        let mut inner = rw_write(&self.inner, SOURCE, "clear");
        let count = inner.entries.len();
        inner.entries.clear();
        inner.bytes = 0;
        self.graph.clear();
        gauge!(METRIC_ENTRIES).set(0.0);
        count
    }

    pub fn len(&self) -> usize {
        rw_read(&self.inner, SOURCE, "len").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> Vec<String> {
        rw_read(&self.inner, SOURCE, "keys")
            .entries
            .keys()
            .cloned()
            .collect()
    }

    /// Diagnostic view of `key`, expired or not. Does not count as an access.
    pub fn inspect(&self, key: &str) -> Option<EntryInfo> {
        rw_read(&self.inner, SOURCE, "inspect")
            .entries
            .get(key)
            .map(CacheEntry::info)
    }

    pub fn stats(&self) -> CacheStats {
        let (entries, approx_bytes) = {
            let inner = rw_read(&self.inner, SOURCE, "stats");
            (inner.entries.len(), inner.bytes)
        };
        CacheStats {
            entries,
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            expired: self.counters.expired.load(Ordering::Relaxed),
            tags: self.graph.tag_count(),
            approx_bytes,
        }
    }
}
