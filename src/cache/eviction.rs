//! Victim selection.
//!
//! Recency and frequency come from the logical access clock kept by the store,
//! so two reads in the same wall-clock instant still order strictly.

use super::config::EvictionPolicy;
use super::entry::CacheEntry;

/// Pick the entry to evict, or `None` when there is nothing to evict.
///
/// - FIFO: smallest insertion sequence.
/// - LRU: smallest last access, then insertion sequence.
/// - LFU: smallest access count, then last access, then insertion sequence.
pub(crate) fn select_victim<'a, I>(policy: EvictionPolicy, entries: I) -> Option<&'a str>
where
    I: IntoIterator<Item = &'a CacheEntry>,
{
    entries
        .into_iter()
        .min_by_key(|entry| rank(policy, entry))
        .map(|entry| entry.key.as_str())
}

fn rank(policy: EvictionPolicy, entry: &CacheEntry) -> (u64, u64, u64) {
    match policy {
        EvictionPolicy::Fifo => (entry.sequence, 0, 0),
        EvictionPolicy::Lru => (entry.last_access(), entry.sequence, 0),
        EvictionPolicy::Lfu => (entry.access_count(), entry.last_access(), entry.sequence),
    }
}
