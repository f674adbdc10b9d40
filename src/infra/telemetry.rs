use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "revcache_cache_hit_total",
            Unit::Count,
            "Total number of cache lookups that found a live entry."
        );
        describe_counter!(
            "revcache_cache_miss_total",
            Unit::Count,
            "Total number of cache lookups that found nothing or an expired entry."
        );
        describe_counter!(
            "revcache_cache_evict_total",
            Unit::Count,
            "Total number of entries evicted to honor capacity bounds, by policy."
        );
        describe_counter!(
            "revcache_cache_expired_total",
            Unit::Count,
            "Total number of entries removed because their TTL elapsed."
        );
        describe_counter!(
            "revcache_cache_invalidate_total",
            Unit::Count,
            "Total number of dependency tags invalidated."
        );
        describe_counter!(
            "revcache_cache_coalesced_total",
            Unit::Count,
            "Total number of requests served by a concurrent build of the same fingerprint."
        );
        describe_counter!(
            "revcache_cache_store_failure_total",
            Unit::Count,
            "Total number of responses that could not be written to the cache."
        );
        describe_gauge!(
            "revcache_cache_entries",
            Unit::Count,
            "Current number of entries in the cache."
        );
        describe_histogram!(
            "revcache_cache_build_ms",
            Unit::Milliseconds,
            "Handler latency of cache misses in milliseconds."
        );
    });
}
