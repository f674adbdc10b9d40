//! Cache configuration.
//!
//! Controls the in-memory entry store: capacity, eviction policy, expiry sweep
//! cadence and the default TTL applied by the response middleware.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

use super::error::CacheError;

// Default values for cache configuration
pub const DEFAULT_MAX_ENTRIES: usize = 10_000;
pub const DEFAULT_CLEANUP_INTERVAL: &str = "5m";
pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_MAX_BODY_BYTES: usize = 1024 * 1024;
const FALLBACK_CLEANUP_PERIOD: Duration = Duration::from_secs(5 * 60);

/// Rule used to pick the victim when the store is at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPolicy {
    /// Oldest insertion goes first.
    #[default]
    Fifo,
    /// Least recently accessed goes first.
    Lru,
    /// Least frequently accessed goes first.
    Lfu,
}

impl EvictionPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvictionPolicy::Fifo => "fifo",
            EvictionPolicy::Lru => "lru",
            EvictionPolicy::Lfu => "lfu",
        }
    }
}

impl fmt::Display for EvictionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EvictionPolicy {
    type Err = CacheError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "fifo" => Ok(EvictionPolicy::Fifo),
            "lru" => Ok(EvictionPolicy::Lru),
            "lfu" => Ok(EvictionPolicy::Lfu),
            other => Err(CacheError::config_invalid(
                "cache.config.eviction_policy",
                format!("unknown eviction policy `{other}` (expected fifo, lru or lfu)"),
            )),
        }
    }
}

/// Resolved configuration of the memory cache.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum live entries; `0` disables the count bound.
    pub max_entries: usize,
    /// Expiry sweep cadence as written in the settings (Go duration syntax).
    /// An empty string disables the background sweep.
    pub cleanup_interval: String,
    /// Approximate byte budget for keys, values and tags; `0` disables it.
    pub max_memory: u64,
    pub eviction_policy: EvictionPolicy,
    /// TTL used by the middleware when a route does not set its own.
    pub default_ttl: Duration,
    /// Largest response body the middleware will buffer and store.
    pub max_body_bytes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_MAX_ENTRIES,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL.to_string(),
            max_memory: 0,
            eviction_policy: EvictionPolicy::Fifo,
            default_ttl: DEFAULT_TTL,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            max_entries: settings.max_entries,
            cleanup_interval: settings.cleanup_interval.clone(),
            max_memory: settings.max_memory,
            eviction_policy: settings.eviction_policy,
            default_ttl: settings.default_ttl,
            max_body_bytes: settings.max_body_bytes,
        }
    }
}

impl CacheConfig {
    /// Reject combinations the store cannot honor.
    pub fn validate(&self) -> Result<(), CacheError> {
        if self.max_body_bytes == 0 {
            return Err(CacheError::config_invalid(
                "cache.config.max_body_bytes",
                "must be greater than zero",
            ));
        }
        Ok(())
    }

    /// Cadence of the expiry sweep, or `None` when the sweep is disabled.
    ///
    /// Unparseable values fall back to five minutes with a warning.
    pub fn cleanup_period(&self) -> Option<Duration> {
        let raw = self.cleanup_interval.trim();
        if raw.is_empty() {
            return None;
        }

        match parse_duration(raw) {
            Ok(period) if !period.is_zero() => Some(period),
            Ok(_) => {
                warn!(
                    interval = raw,
                    fallback = ?FALLBACK_CLEANUP_PERIOD,
                    "Zero cleanup interval, using default"
                );
                Some(FALLBACK_CLEANUP_PERIOD)
            }
            Err(err) => {
                warn!(
                    interval = raw,
                    error = %err,
                    fallback = ?FALLBACK_CLEANUP_PERIOD,
                    "Invalid cleanup interval, using default"
                );
                Some(FALLBACK_CLEANUP_PERIOD)
            }
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DurationParseError {
    #[error("empty duration")]
    Empty,
    #[error("missing unit in duration `{0}`")]
    MissingUnit(String),
    #[error("unknown unit `{unit}` in duration `{input}`")]
    UnknownUnit { unit: String, input: String },
    #[error("invalid number in duration `{0}`")]
    InvalidNumber(String),
    #[error("duration `{0}` is out of range")]
    Overflow(String),
}

/// Whole milliseconds of `duration`, saturating at `u64::MAX`.
pub fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Parse a Go-style duration such as `90s`, `1h30m` or `250ms`.
///
/// Fractions are accepted per component (`1.5h`). A bare `0` is zero.
pub fn parse_duration(input: &str) -> Result<Duration, DurationParseError> {
    let s = input.trim();
    if s.is_empty() {
        return Err(DurationParseError::Empty);
    }
    if s == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(|| DurationParseError::MissingUnit(s.to_string()))?;
        if number_len == 0 {
            return Err(DurationParseError::InvalidNumber(s.to_string()));
        }
        let (number, tail) = rest.split_at(number_len);
        let value: f64 = number
            .parse()
            .map_err(|_| DurationParseError::InvalidNumber(s.to_string()))?;

        let unit_len = tail
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(tail.len());
        let (unit, next) = tail.split_at(unit_len);
        let scale = match unit {
            "ns" => 1e-9,
            "us" | "µs" | "μs" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            other => {
                return Err(DurationParseError::UnknownUnit {
                    unit: other.to_string(),
                    input: s.to_string(),
                });
            }
        };

        let seconds = value * scale;
        if !seconds.is_finite() {
            return Err(DurationParseError::Overflow(s.to_string()));
        }
        total = Duration::try_from_secs_f64(seconds)
            .ok()
            .and_then(|component| total.checked_add(component))
            .ok_or_else(|| DurationParseError::Overflow(s.to_string()))?;
        rest = next;
    }

    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = CacheConfig::default();
        assert_eq!(config.max_entries, 10_000);
        assert_eq!(config.cleanup_interval, "5m");
        assert_eq!(config.max_memory, 0);
        assert_eq!(config.eviction_policy, EvictionPolicy::Fifo);
        assert_eq!(config.default_ttl, Duration::from_secs(300));
        assert_eq!(config.max_body_bytes, 1024 * 1024);
    }

    #[test]
    fn parses_go_durations() {
        assert_eq!(parse_duration("90s"), Ok(Duration::from_secs(90)));
        assert_eq!(parse_duration("5m"), Ok(Duration::from_secs(300)));
        assert_eq!(parse_duration("1h30m"), Ok(Duration::from_secs(5400)));
        assert_eq!(parse_duration("250ms"), Ok(Duration::from_millis(250)));
        assert_eq!(parse_duration("1.5h"), Ok(Duration::from_secs(5400)));
        assert_eq!(parse_duration("0"), Ok(Duration::ZERO));
    }

    #[test]
    fn rejects_malformed_durations() {
        assert_eq!(parse_duration(""), Err(DurationParseError::Empty));
        assert!(matches!(
            parse_duration("15"),
            Err(DurationParseError::MissingUnit(_))
        ));
        assert!(matches!(
            parse_duration("3 days"),
            Err(DurationParseError::UnknownUnit { .. })
        ));
        assert!(matches!(
            parse_duration("m"),
            Err(DurationParseError::InvalidNumber(_))
        ));
    }

    #[test]
    fn cleanup_period_falls_back_to_five_minutes() {
        let config = CacheConfig {
            cleanup_interval: "every tuesday".to_string(),
            ..Default::default()
        };
        assert_eq!(config.cleanup_period(), Some(Duration::from_secs(300)));
    }

    #[test]
    fn out_of_range_durations_are_errors() {
        assert_eq!(
            parse_duration("99999999999999999999999h"),
            Err(DurationParseError::Overflow(
                "99999999999999999999999h".to_string()
            ))
        );
        assert!(matches!(
            parse_duration("18446744073709551615s1h"),
            Err(DurationParseError::Overflow(_))
        ));

        let config = CacheConfig {
            cleanup_interval: "99999999999999999999999h".to_string(),
            ..Default::default()
        };
        assert_eq!(config.cleanup_period(), Some(Duration::from_secs(300)));
    }

    #[test]
    fn millis_saturate_instead_of_truncating() {
        assert_eq!(duration_millis(Duration::from_secs(30)), 30_000);
        assert_eq!(duration_millis(Duration::MAX), u64::MAX);
    }

    #[test]
    fn empty_cleanup_interval_disables_sweep() {
        let config = CacheConfig {
            cleanup_interval: String::new(),
            ..Default::default()
        };
        assert_eq!(config.cleanup_period(), None);
    }

    #[test]
    fn eviction_policy_parsing() {
        assert_eq!("LRU".parse::<EvictionPolicy>().ok(), Some(EvictionPolicy::Lru));
        assert_eq!("lfu".parse::<EvictionPolicy>().ok(), Some(EvictionPolicy::Lfu));
        assert!(matches!(
            "random".parse::<EvictionPolicy>(),
            Err(CacheError::ConfigInvalid { .. })
        ));
    }

    #[test]
    fn zero_body_limit_is_rejected() {
        let config = CacheConfig {
            max_body_bytes: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
