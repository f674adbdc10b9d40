//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{net::SocketAddr, str::FromStr, time::Duration};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::cache::{
    CacheError, DEFAULT_CLEANUP_INTERVAL, DEFAULT_MAX_BODY_BYTES, DEFAULT_MAX_ENTRIES,
    DEFAULT_TTL, EvictionPolicy, parse_duration,
};

mod cli;

pub use cli::{CliArgs, Command, ServeArgs, ServeOverrides};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "revcache";
const ENV_PREFIX: &str = "REVCACHE";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 8080;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_CACHE_TYPE: &str = "memory";

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub cache: CacheSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub graceful_shutdown: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub enabled: bool,
    /// Provider name, resolved against the provider table at startup.
    pub kind: String,
    pub default_ttl: Duration,
    pub max_entries: usize,
    /// Kept verbatim; parse failures fall back at start with a warning.
    pub cleanup_interval: String,
    pub max_memory: u64,
    pub eviction_policy: EvictionPolicy,
    pub max_body_bytes: usize,
    pub routes: Vec<RouteCacheSettings>,
}

/// Per-route override of the built-in cache policies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteCacheSettings {
    pub path: String,
    pub ttl: Option<Duration>,
    pub dependencies: Vec<String>,
    pub metadata_keys: Vec<String>,
    pub key_template: Option<String>,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: String, reason: String },
    #[error(transparent)]
    Cache(#[from] CacheError),
}

impl LoadError {
    fn invalid(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) | Some(Command::CheckConfig(args)) => {
            raw.apply_serve_overrides(&args.overrides)
        }
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    cache: RawCacheSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
        }
        if let Some(seconds) = overrides.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(enabled) = overrides.cache_enabled {
            self.cache.enabled = Some(enabled);
        }
        if let Some(ttl) = overrides.cache_default_ttl.as_ref() {
            self.cache.default_ttl = Some(ttl.clone());
        }
        if let Some(max) = overrides.cache_max_entries {
            self.cache.config.max_entries = Some(max);
        }
        if let Some(policy) = overrides.cache_eviction_policy.as_ref() {
            self.cache.config.eviction_policy = Some(policy.clone());
        }
        if let Some(interval) = overrides.cache_cleanup_interval.as_ref() {
            self.cache.config.cleanup_interval = Some(interval.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            cache,
        } = raw;

        let server = build_server_settings(server)?;
        let logging = build_logging_settings(logging)?;
        let cache = build_cache_settings(cache)?;

        Ok(Self {
            server,
            logging,
            cache,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());

    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }

    let addr = parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("server.addr", reason))?;

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    if graceful_secs == 0 {
        return Err(LoadError::invalid(
            "server.graceful_shutdown_seconds",
            "must be greater than zero",
        ));
    }

    Ok(ServerSettings {
        addr,
        graceful_shutdown: Duration::from_secs(graceful_secs),
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let RawCacheSettings {
        enabled,
        kind,
        default_ttl,
        config,
        routes,
    } = cache;

    let kind = kind
        .map(|value| value.trim().to_ascii_lowercase())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| DEFAULT_CACHE_TYPE.to_string());

    let default_ttl = match default_ttl {
        Some(raw) => parse_duration_setting("cache.default_ttl", &raw)?,
        None => DEFAULT_TTL,
    };

    let eviction_policy = match config.eviction_policy {
        Some(raw) => EvictionPolicy::from_str(&raw)?,
        None => EvictionPolicy::default(),
    };

    let max_body_bytes = config.max_body_bytes.unwrap_or(DEFAULT_MAX_BODY_BYTES);
    if max_body_bytes == 0 {
        return Err(LoadError::invalid(
            "cache.config.max_body_bytes",
            "must be greater than zero",
        ));
    }

    let routes = routes
        .into_iter()
        .enumerate()
        .map(|(index, route)| build_route_settings(index, route))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(CacheSettings {
        enabled: enabled.unwrap_or(true),
        kind,
        default_ttl,
        max_entries: config.max_entries.unwrap_or(DEFAULT_MAX_ENTRIES),
        cleanup_interval: config
            .cleanup_interval
            .unwrap_or_else(|| DEFAULT_CLEANUP_INTERVAL.to_string()),
        max_memory: config.max_memory.unwrap_or(0),
        eviction_policy,
        max_body_bytes,
        routes,
    })
}

fn build_route_settings(index: usize, route: RawRouteSettings) -> Result<RouteCacheSettings, LoadError> {
    let key = |field: &str| format!("cache.routes[{index}].{field}");

    let path = route.path.trim().to_string();
    if !path.starts_with('/') {
        return Err(LoadError::invalid(key("path"), "must start with `/`"));
    }

    let ttl = route
        .ttl
        .map(|raw| parse_duration_setting(&key("ttl"), &raw))
        .transpose()?;

    if route.dependencies.iter().any(|tag| tag.trim().is_empty()) {
        return Err(LoadError::invalid(
            key("dependencies"),
            "dependency tags must not be empty",
        ));
    }

    Ok(RouteCacheSettings {
        path,
        ttl,
        dependencies: route.dependencies,
        metadata_keys: route.metadata_keys,
        key_template: route.key_template.filter(|template| !template.is_empty()),
    })
}

fn parse_duration_setting(key: &str, raw: &str) -> Result<Duration, LoadError> {
    parse_duration(raw).map_err(|err| LoadError::invalid(key, err.to_string()))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    enabled: Option<bool>,
    #[serde(rename = "type")]
    kind: Option<String>,
    default_ttl: Option<String>,
    config: RawCacheStoreSettings,
    routes: Vec<RawRouteSettings>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheStoreSettings {
    max_entries: Option<usize>,
    cleanup_interval: Option<String>,
    max_memory: Option<u64>,
    eviction_policy: Option<String>,
    max_body_bytes: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRouteSettings {
    path: String,
    ttl: Option<String>,
    dependencies: Vec<String>,
    metadata_keys: Vec<String>,
    key_template: Option<String>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}
