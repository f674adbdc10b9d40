use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use time::OffsetDateTime;

use super::clock;
use super::config::duration_millis;

/// A value owned by the entry store.
#[derive(Debug)]
pub struct CacheEntry {
    pub key: String,
    pub value: Bytes,
    pub created_at: OffsetDateTime,
    /// `None` means the entry never expires.
    pub expires_at: Option<OffsetDateTime>,
    pub ttl: Duration,
    pub dependencies: Vec<String>,
    pub metadata: BTreeMap<String, String>,
    /// Insertion order, used for FIFO and as the final tie-break.
    pub(crate) sequence: u64,
    last_access: AtomicU64,
    access_count: AtomicU64,
}

impl CacheEntry {
    pub(crate) fn new(parts: NewEntry, now: OffsetDateTime, sequence: u64) -> Self {
        let NewEntry {
            key,
            value,
            ttl,
            dependencies,
            metadata,
        } = parts;

        let expires_at = if ttl.is_zero() {
            None
        } else {
            clock::offset(now, ttl)
        };

        Self {
            key,
            value,
            created_at: now,
            expires_at,
            ttl,
            dependencies,
            metadata,
            sequence,
            last_access: AtomicU64::new(sequence),
            access_count: AtomicU64::new(0),
        }
    }

    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        self.expires_at.is_some_and(|expires_at| now >= expires_at)
    }

    /// Record a read at logical time `tick`.
    pub(crate) fn touch(&self, tick: u64) {
        self.last_access.fetch_max(tick, Ordering::Relaxed);
        self.access_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn last_access(&self) -> u64 {
        self.last_access.load(Ordering::Relaxed)
    }

    pub fn access_count(&self) -> u64 {
        self.access_count.load(Ordering::Relaxed)
    }

    /// Bytes charged against `max_memory`.
    pub fn approx_size(&self) -> u64 {
        NewEntry::size_of(&self.key, &self.value, &self.dependencies, &self.metadata)
    }

    pub fn info(&self) -> EntryInfo {
        EntryInfo {
            key: self.key.clone(),
            created_at: self.created_at,
            expires_at: self.expires_at,
            ttl_ms: duration_millis(self.ttl),
            dependencies: self.dependencies.clone(),
            metadata: self.metadata.clone(),
            access_count: self.access_count(),
            size: self.approx_size(),
        }
    }
}

/// Everything a caller supplies when storing a value.
#[derive(Debug, Clone, Default)]
pub struct NewEntry {
    pub key: String,
    pub value: Bytes,
    pub ttl: Duration,
    pub dependencies: Vec<String>,
    pub metadata: BTreeMap<String, String>,
}

impl NewEntry {
    pub fn new(key: impl Into<String>, value: impl Into<Bytes>, ttl: Duration) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            ttl,
            ..Default::default()
        }
    }

    pub fn with_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn with_metadata(mut self, metadata: BTreeMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn approx_size(&self) -> u64 {
        Self::size_of(&self.key, &self.value, &self.dependencies, &self.metadata)
    }

    fn size_of(
        key: &str,
        value: &Bytes,
        dependencies: &[String],
        metadata: &BTreeMap<String, String>,
    ) -> u64 {
        let tags: usize = dependencies.iter().map(String::len).sum();
        let meta: usize = metadata.iter().map(|(k, v)| k.len() + v.len()).sum();
        (key.len() + value.len() + tags + meta) as u64
    }
}

/// Diagnostic view of a live entry.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct EntryInfo {
    pub key: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
    pub ttl_ms: u64,
    pub dependencies: Vec<String>,
    pub metadata: BTreeMap<String, String>,
    pub access_count: u64,
    pub size: u64,
}
