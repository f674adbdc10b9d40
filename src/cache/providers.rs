//! Named cache providers selected by `cache.type`.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::info;

use super::config::CacheConfig;
use super::error::CacheError;
use super::manager::{CacheManager, MemoryCache};

pub type CacheCreator = fn(&CacheConfig) -> Result<Arc<dyn CacheManager>, CacheError>;

/// Table of provider constructors keyed by name.
#[derive(Debug, Clone)]
pub struct ProviderRegistry {
    creators: BTreeMap<&'static str, CacheCreator>,
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register("memory", create_memory);
        registry
    }
}

impl ProviderRegistry {
    pub fn empty() -> Self {
        Self {
            creators: BTreeMap::new(),
        }
    }

    /// Add or replace the constructor for `name`.
    pub fn register(&mut self, name: &'static str, creator: CacheCreator) {
        self.creators.insert(name, creator);
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.creators.keys().copied()
    }

    /// Build the provider called `kind` (case-insensitive).
    pub fn create(
        &self,
        kind: &str,
        config: &CacheConfig,
    ) -> Result<Arc<dyn CacheManager>, CacheError> {
        let normalized = kind.trim().to_ascii_lowercase();
        let creator = self.creators.get(normalized.as_str()).ok_or_else(|| {
            let known: Vec<&str> = self.names().collect();
            CacheError::config_invalid(
                "cache.type",
                format!("unknown cache type `{kind}` (available: {})", known.join(", ")),
            )
        })?;

        config.validate()?;
        let cache = creator(config)?;
        info!(kind = cache.kind(), "Cache provider created");
        Ok(cache)
    }
}

fn create_memory(config: &CacheConfig) -> Result<Arc<dyn CacheManager>, CacheError> {
    Ok(Arc::new(MemoryCache::new(config.clone())))
}
