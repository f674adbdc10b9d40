//! Cache manager: the operations exposed to the rest of the service.
//!
//! [`MemoryCache`] composes the entry store, the dependency graph it owns and
//! the revision ledger, and adds the start/stop lifecycle with the background
//! expiry sweep.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bytes::Bytes;
use metrics::counter;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::clock::{Clock, SystemClock};
use super::config::CacheConfig;
use super::entry::{EntryInfo, NewEntry};
use super::error::CacheError;
use super::keys::{Fingerprint, build_cache_key};
use super::ledger::RevisionLedger;
use super::lock::mutex_lock;
use super::store::{CacheStats, EntryStore};

const SOURCE: &str = "cache::manager";
const METRIC_INVALIDATE: &str = "revcache_cache_invalidate_total";

/// Operations every cache provider exposes.
pub trait CacheManager: Send + Sync + fmt::Debug {
    /// Provider name as used by `cache.type`.
    fn kind(&self) -> &'static str;

    fn get(&self, key: &str) -> Option<Bytes>;

    fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), CacheError>;

    /// Store an entry with its dependency tags and metadata.
    fn set_entry(&self, entry: NewEntry) -> Result<(), CacheError>;

    /// Store `value` under a fingerprint, unless the cache is not running or a
    /// revision the fingerprint was built against has moved on.
    ///
    /// Returns whether the value was stored.
    fn set_fingerprint(
        &self,
        fingerprint: &Fingerprint,
        value: Bytes,
        ttl: Duration,
        metadata: BTreeMap<String, String>,
    ) -> Result<bool, CacheError>;

    fn delete(&self, key: &str) -> Result<(), CacheError>;

    /// Bump every tag, then purge the keys registered under it.
    fn invalidate(&self, tags: &[&str]) -> Result<(), CacheError>;

    fn build_cache_key(
        &self,
        path: &str,
        dependencies: &[String],
        metadata: &BTreeMap<String, String>,
    ) -> Fingerprint;

    fn get_revision(&self, tag: &str) -> u64;

    fn set_revision(&self, tag: &str, revision: u64);

    /// Keys currently registered under `tag`.
    fn dependents(&self, tag: &str) -> Vec<String>;

    fn entry_info(&self, key: &str) -> Option<EntryInfo>;

    fn stats(&self) -> CacheStats;

    fn start(&self) -> Result<(), CacheError>;

    fn stop(&self) -> Result<(), CacheError>;

    fn is_running(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Lifecycle {
    Stopped = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
}

impl Lifecycle {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Starting,
            2 => Self::Running,
            3 => Self::Stopping,
            _ => Self::Stopped,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
        }
    }
}

#[derive(Debug)]
struct Cleaner {
    shutdown: oneshot::Sender<()>,
}

#[derive(Debug)]
struct MemoryInner {
    config: CacheConfig,
    store: EntryStore,
    ledger: RevisionLedger,
    state: AtomicU8,
    cleaner: Mutex<Option<Cleaner>>,
}

/// In-process cache provider.
#[derive(Debug)]
pub struct MemoryCache {
    inner: Arc<MemoryInner>,
}

impl MemoryCache {
    pub fn new(config: CacheConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        let store = EntryStore::new(&config, clock);
        Self {
            inner: Arc::new(MemoryInner {
                config,
                store,
                ledger: RevisionLedger::new(),
                state: AtomicU8::new(Lifecycle::Stopped as u8),
                cleaner: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    pub fn lifecycle(&self) -> Lifecycle {
        Lifecycle::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: Lifecycle, to: Lifecycle) -> bool {
        self.inner
            .state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn spawn_cleaner(&self) -> Option<Cleaner> {
        let period = self.inner.config.cleanup_period()?;
        let runtime = match Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                warn!(
                    target_module = SOURCE,
                    "No async runtime available, expired entries are only dropped on read"
                );
                return None;
            }
        };

        let (shutdown, signal) = oneshot::channel();
        runtime.spawn(run_cleaner(Arc::downgrade(&self.inner), period, signal));
        debug!(period = ?period, "Cache cleaner started");
        Some(Cleaner { shutdown })
    }
}

async fn run_cleaner(
    inner: Weak<MemoryInner>,
    period: Duration,
    mut shutdown: oneshot::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = ticker.tick() => {
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                let removed = inner.store.purge_expired();
                if removed > 0 {
                    info!(removed, remaining = inner.store.len(), "Swept expired cache entries");
                }
            }
        }
    }

    debug!("Cache cleaner stopped");
}

impl CacheManager for MemoryCache {
    fn kind(&self) -> &'static str {
        "memory"
    }

    fn get(&self, key: &str) -> Option<Bytes> {
        self.inner.store.get(key)
    }

    fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), CacheError> {
        self.set_entry(NewEntry::new(key, value, ttl))
    }

    fn set_entry(&self, entry: NewEntry) -> Result<(), CacheError> {
        self.inner.store.insert(entry, || true).map(|_| ())
    }

    fn set_fingerprint(
        &self,
        fingerprint: &Fingerprint,
        value: Bytes,
        ttl: Duration,
        metadata: BTreeMap<String, String>,
    ) -> Result<bool, CacheError> {
        let entry = NewEntry::new(fingerprint.as_str(), value, ttl)
            .with_dependencies(fingerprint.dependencies().to_vec())
            .with_metadata(metadata);

        let inner = &self.inner;
        inner.store.insert(entry, || {
            Lifecycle::from_u8(inner.state.load(Ordering::Acquire)) == Lifecycle::Running
                && inner
                    .ledger
                    .matches(fingerprint.dependencies(), fingerprint.revisions())
        })
    }

    fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.inner.store.delete(key);
        Ok(())
    }

    fn invalidate(&self, tags: &[&str]) -> Result<(), CacheError> {
        for tag in tags {
            let revision = self.inner.ledger.bump(tag);
            let keys = self.inner.store.graph().drain(tag);
            let removed = self.inner.store.delete_many(&keys);
            counter!(METRIC_INVALIDATE).increment(1);
            debug!(tag, revision, removed, "Cache tag invalidated");
        }
        Ok(())
    }

    fn build_cache_key(
        &self,
        path: &str,
        dependencies: &[String],
        metadata: &BTreeMap<String, String>,
    ) -> Fingerprint {
        build_cache_key(&self.inner.ledger, path, dependencies, metadata)
    }

    fn get_revision(&self, tag: &str) -> u64 {
        self.inner.ledger.get(tag)
    }

    fn set_revision(&self, tag: &str, revision: u64) {
        let effective = self.inner.ledger.set(tag, revision);
        if effective != revision {
            debug!(tag, requested = revision, effective, "Revision kept, ledger never moves back");
        }
    }

    fn dependents(&self, tag: &str) -> Vec<String> {
        self.inner.store.graph().keys_for(tag)
    }

    fn entry_info(&self, key: &str) -> Option<EntryInfo> {
        self.inner.store.inspect(key)
    }

    fn stats(&self) -> CacheStats {
        self.inner.store.stats()
    }

    fn start(&self) -> Result<(), CacheError> {
        if !self.transition(Lifecycle::Stopped, Lifecycle::Starting) {
            warn!(state = self.lifecycle().as_str(), "Cache start rejected");
            return Err(CacheError::AlreadyRunning);
        }

        if let Err(err) = self.inner.config.validate() {
            self.inner
                .state
                .store(Lifecycle::Stopped as u8, Ordering::Release);
            return Err(err);
        }

        let cleaner = self.spawn_cleaner();
        *mutex_lock(&self.inner.cleaner, SOURCE, "start") = cleaner;
        self.inner
            .state
            .store(Lifecycle::Running as u8, Ordering::Release);

        info!(
            kind = self.kind(),
            policy = %self.inner.config.eviction_policy,
            max_entries = self.inner.config.max_entries,
            max_memory = self.inner.config.max_memory,
            "Cache started"
        );
        Ok(())
    }

    fn stop(&self) -> Result<(), CacheError> {
        if !self.transition(Lifecycle::Running, Lifecycle::Stopping) {
            warn!(state = self.lifecycle().as_str(), "Cache stop rejected");
            return Err(CacheError::NotRunning);
        }

        if let Some(cleaner) = mutex_lock(&self.inner.cleaner, SOURCE, "stop").take() {
            // The task may already be gone when its runtime shut down first.
            let _ = cleaner.shutdown.send(());
        }

        let dropped = self.inner.store.clear();
        self.inner.ledger.reset();
        self.inner
            .state
            .store(Lifecycle::Stopped as u8, Ordering::Release);

        info!(kind = self.kind(), dropped, "Cache stopped");
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.lifecycle() == Lifecycle::Running
    }
}
