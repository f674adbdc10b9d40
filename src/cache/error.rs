use thiserror::Error;

/// Failure kinds surfaced by the cache.
///
/// Tags without entries are not an error: draining or unlinking them is a no-op.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("cache key must not be empty")]
    KeyEmpty,
    #[error("cache is already running")]
    AlreadyRunning,
    #[error("cache is not running")]
    NotRunning,
    #[error("failed to serialize cached value: {0}")]
    Serialization(String),
    #[error("entry of {size} bytes exceeds the memory limit of {limit} bytes")]
    EntryTooLarge { size: u64, limit: u64 },
    #[error("invalid cache configuration for `{key}`: {reason}")]
    ConfigInvalid { key: String, reason: String },
}

impl CacheError {
    pub fn config_invalid(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ConfigInvalid {
            key: key.into(),
            reason: reason.into(),
        }
    }

    pub fn serialization(reason: impl std::fmt::Display) -> Self {
        Self::Serialization(reason.to_string())
    }

    /// Lifecycle misuse and configuration errors propagate to the service root;
    /// everything else is swallowed on the request path.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ConfigInvalid { .. })
    }
}
