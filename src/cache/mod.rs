//! Dependency-aware response cache.
//!
//! - **Entry store**: TTL-bounded entries with FIFO/LRU/LFU eviction
//! - **Dependency graph**: tag → cache keys, for cascading deletes
//! - **Revision ledger**: per-tag counters embedded in every fingerprint
//! - **Middleware**: fingerprinting, single-flight fills and write-back
//!
//! ## Configuration
//!
//! ```toml
//! [cache]
//! enabled = true
//! type = "memory"
//! default_ttl = "5m"
//!
//! [cache.config]
//! max_entries = 10000
//! cleanup_interval = "5m"
//! eviction_policy = "lru"
//! ```

mod clock;
mod config;
mod entry;
mod error;
mod eviction;
mod flight;
mod graph;
mod keys;
mod ledger;
mod lock;
mod manager;
mod middleware;
mod providers;
mod response;
mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    CacheConfig, DEFAULT_CLEANUP_INTERVAL, DEFAULT_MAX_BODY_BYTES, DEFAULT_MAX_ENTRIES,
    DEFAULT_TTL, DurationParseError, EvictionPolicy, duration_millis, parse_duration,
};
pub use entry::{EntryInfo, NewEntry};
pub use error::CacheError;
pub use flight::{Flight, FlightAbandoned, FlightFollower, FlightLeader, SingleFlight};
pub use graph::DependencyGraph;
pub use keys::{Fingerprint, build_cache_key};
pub use ledger::RevisionLedger;
pub use manager::{CacheManager, Lifecycle, MemoryCache};
pub use middleware::{CacheLayerState, LayerStats, RouteCachePolicy, response_cache_layer};
pub use providers::{CacheCreator, ProviderRegistry};
pub use response::{CachedResponse, request_bypasses_cache, should_store_response};
pub use store::{CacheStats, EntryStore};
