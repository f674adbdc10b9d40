//! Response cache middleware.
//!
//! Serves `GET` requests on routes with a [`RouteCachePolicy`] from the cache,
//! coalesces concurrent misses for the same fingerprint into one handler run
//! and stores cacheable results bound to the revisions they were built against.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use axum::{
    body::Body,
    extract::{MatchedPath, Request, State},
    http::{HeaderMap, Method, StatusCode, Uri},
    middleware::Next,
    response::{IntoResponse, Response},
};
use metrics::{counter, histogram};
use serde::Serialize;
use tracing::{Instrument, debug, error, instrument, warn};

use super::config::CacheConfig;
use super::error::CacheError;
use super::flight::{Flight, FlightAbandoned, FlightLeader, SingleFlight};
use super::keys::Fingerprint;
use super::manager::CacheManager;
use super::response::{
    Buffered, CachedResponse, buffer_response, request_bypasses_cache, should_store_response,
};

const METRIC_COALESCED: &str = "revcache_cache_coalesced_total";
const METRIC_STORE_FAILURE: &str = "revcache_cache_store_failure_total";
const METRIC_BUILD_MS: &str = "revcache_cache_build_ms";

const USER_ID_HEADER: &str = "x-user-id";

/// How responses of one route are cached.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteCachePolicy {
    /// Falls back to the layer default when unset or zero.
    pub ttl: Option<Duration>,
    /// Dependency tags, in the order they enter the fingerprint.
    pub dependencies: Vec<String>,
    /// Request headers whose values vary the cached response.
    pub metadata_keys: Vec<String>,
    /// Replaces the request component; `{path}`, `{query}` and `{method}` are substituted.
    pub key_template: Option<String>,
}

impl RouteCachePolicy {
    pub fn new<I, S>(dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            dependencies: dependencies.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_metadata_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.metadata_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_key_template(mut self, template: impl Into<String>) -> Self {
        self.key_template = Some(template.into());
        self
    }

    fn request_component(&self, method: &Method, uri: &Uri) -> String {
        let path = uri.path();
        let query = uri.query().unwrap_or("");
        match &self.key_template {
            Some(template) => template
                .replace("{path}", path)
                .replace("{query}", query)
                .replace("{method}", method.as_str()),
            None if query.is_empty() => path.to_string(),
            None => format!("{path}?{query}"),
        }
    }

    fn metadata(&self, method: &Method, headers: &HeaderMap) -> BTreeMap<String, String> {
        let mut metadata = BTreeMap::new();
        metadata.insert("method".to_string(), method.as_str().to_string());

        if let Some(user) = header_str(headers, USER_ID_HEADER).filter(|user| !user.is_empty()) {
            metadata.insert("user_id".to_string(), user.to_string());
        }
        for key in &self.metadata_keys {
            let name = key.to_ascii_lowercase();
            if let Some(value) = header_str(headers, &name) {
                let value = value.to_string();
                metadata.insert(name, value);
            }
        }
        metadata
    }

    fn resolve_ttl(&self, default_ttl: Duration) -> Duration {
        self.ttl.filter(|ttl| !ttl.is_zero()).unwrap_or(default_ttl)
    }
}

impl From<&crate::config::RouteCacheSettings> for RouteCachePolicy {
    fn from(settings: &crate::config::RouteCacheSettings) -> Self {
        Self {
            ttl: settings.ttl,
            dependencies: settings.dependencies.clone(),
            metadata_keys: settings.metadata_keys.clone(),
            key_template: settings.key_template.clone(),
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// Request-level counters of the middleware.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LayerStats {
    /// Served from the store or from a coalesced flight.
    pub hits: u64,
    /// Handler executions on a cacheable route.
    pub misses: u64,
    pub coalesced: u64,
    pub bypassed: u64,
    pub store_failures: u64,
}

#[derive(Debug, Default)]
struct LayerCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
    bypassed: AtomicU64,
    store_failures: AtomicU64,
}

#[derive(Debug, Clone)]
enum FlightOutcome {
    Ready(Arc<CachedResponse>),
    /// The leader's response could not be buffered; followers run the handler themselves.
    Uncacheable,
}

/// Shared state of [`response_cache_layer`].
#[derive(Debug, Clone)]
pub struct CacheLayerState {
    cache: Arc<dyn CacheManager>,
    routes: Arc<HashMap<String, RouteCachePolicy>>,
    default_ttl: Duration,
    max_body_bytes: usize,
    flights: SingleFlight<FlightOutcome>,
    counters: Arc<LayerCounters>,
}

impl CacheLayerState {
    pub fn new(cache: Arc<dyn CacheManager>, config: &CacheConfig) -> Self {
        Self {
            cache,
            routes: Arc::new(HashMap::new()),
            default_ttl: config.default_ttl,
            max_body_bytes: config.max_body_bytes,
            flights: SingleFlight::new(),
            counters: Arc::new(LayerCounters::default()),
        }
    }

    /// Cache responses of the route registered as `path`.
    pub fn with_route(mut self, path: impl Into<String>, policy: RouteCachePolicy) -> Self {
        Arc::make_mut(&mut self.routes).insert(path.into(), policy);
        self
    }

    pub fn cache(&self) -> &Arc<dyn CacheManager> {
        &self.cache
    }

    pub fn route(&self, path: &str) -> Option<&RouteCachePolicy> {
        self.routes.get(path)
    }

    pub fn stats(&self) -> LayerStats {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        LayerStats {
            hits: load(&self.counters.hits),
            misses: load(&self.counters.misses),
            coalesced: load(&self.counters.coalesced),
            bypassed: load(&self.counters.bypassed),
            store_failures: load(&self.counters.store_failures),
        }
    }

    fn policy_for(&self, request: &Request) -> Option<&RouteCachePolicy> {
        request
            .extensions()
            .get::<MatchedPath>()
            .and_then(|matched| self.routes.get(matched.as_str()))
            .or_else(|| self.routes.get(request.uri().path()))
    }

    fn lookup(&self, fingerprint: &Fingerprint) -> Option<CachedResponse> {
        let raw = self.cache.get(fingerprint.as_str())?;
        match CachedResponse::decode(&raw) {
            Ok(cached) => Some(cached),
            Err(err) => {
                warn!(key = %fingerprint, error = %err, "Dropping undecodable cache entry");
                let _ = self.cache.delete(fingerprint.as_str());
                None
            }
        }
    }

    fn store(
        &self,
        fingerprint: &Fingerprint,
        cached: &CachedResponse,
        ttl: Duration,
        metadata: BTreeMap<String, String>,
    ) {
        let encoded = match cached.encode() {
            Ok(encoded) => encoded,
            Err(err) => {
                self.record_store_failure(fingerprint, &err);
                return;
            }
        };

        match self.cache.set_fingerprint(fingerprint, encoded, ttl, metadata) {
            Ok(true) => debug!(key = %fingerprint, ttl = ?ttl, "Response cached"),
            Ok(false) => debug!(key = %fingerprint, "Response not cached, revision moved or cache stopped"),
            Err(err) => self.record_store_failure(fingerprint, &err),
        }
    }

    fn record_store_failure(&self, fingerprint: &Fingerprint, err: &CacheError) {
        self.counters.store_failures.fetch_add(1, Ordering::Relaxed);
        counter!(METRIC_STORE_FAILURE).increment(1);
        match err {
            CacheError::Serialization(_) => {
                error!(key = %fingerprint, error = %err, "Failed to serialize response for caching")
            }
            _ => warn!(key = %fingerprint, error = %err, "Failed to cache response"),
        }
    }

    fn record_hit(&self) {
        self.counters.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn record_miss(&self) {
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
    }
}

/// Middleware for dependency-aware response caching.
#[instrument(skip_all, fields(path = %request.uri().path()))]
pub async fn response_cache_layer(
    State(state): State<CacheLayerState>,
    request: Request,
    next: Next,
) -> Response {
    if request.method() != Method::GET {
        return next.run(request).await;
    }

    let Some(policy) = state.policy_for(&request).cloned() else {
        return next.run(request).await;
    };

    if !state.cache.is_running() || request_bypasses_cache(request.headers()) {
        state.counters.bypassed.fetch_add(1, Ordering::Relaxed);
        debug!(outcome = "bypass", "Skipping response cache");
        return next.run(request).await;
    }

    let component = policy.request_component(request.method(), request.uri());
    let metadata = policy.metadata(request.method(), request.headers());
    let fingerprint = state
        .cache
        .build_cache_key(&component, &policy.dependencies, &metadata);

    if let Some(cached) = state.lookup(&fingerprint) {
        state.record_hit();
        debug!(outcome = "hit", "Serving cached response");
        return cached.to_response();
    }

    match state.flights.join(fingerprint.as_str()) {
        Flight::Follower(follower) => match follower.wait().await {
            Ok(FlightOutcome::Ready(cached)) => {
                state.record_hit();
                state.counters.coalesced.fetch_add(1, Ordering::Relaxed);
                counter!(METRIC_COALESCED).increment(1);
                debug!(outcome = "coalesced", "Serving response of concurrent build");
                cached.to_response()
            }
            Ok(FlightOutcome::Uncacheable) => {
                state.record_miss();
                debug!(outcome = "miss", "Concurrent build was uncacheable, running handler");
                next.run(request).await
            }
            Err(FlightAbandoned) => {
                warn!(key = %fingerprint, "Concurrent build failed");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        },
        Flight::Leader(leader) => {
            // Another leader may have finished between the lookup and the join.
            if let Some(cached) = state.lookup(&fingerprint) {
                let cached = Arc::new(cached);
                leader.complete(FlightOutcome::Ready(Arc::clone(&cached)));
                state.record_hit();
                debug!(outcome = "hit", "Serving cached response");
                return cached.to_response();
            }

            state.record_miss();
            debug!(outcome = "miss", "Cache miss, executing handler");
            let ttl = policy.resolve_ttl(state.default_ttl);

            // The build runs detached so it completes and is cached even when
            // this request is cancelled.
            let build = tokio::spawn(
                build_and_store(
                    state.clone(),
                    leader,
                    fingerprint,
                    metadata,
                    ttl,
                    next.run(request),
                )
                .in_current_span(),
            );

            match build.await {
                Ok(response) => response,
                Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
                Err(err) => {
                    error!(error = %err, "Response build task failed");
                    StatusCode::INTERNAL_SERVER_ERROR.into_response()
                }
            }
        }
    }
}

async fn build_and_store<F>(
    state: CacheLayerState,
    leader: FlightLeader<FlightOutcome>,
    fingerprint: Fingerprint,
    metadata: BTreeMap<String, String>,
    ttl: Duration,
    handler: F,
) -> Response
where
    F: Future<Output = Response>,
{
    let started = Instant::now();
    let response = handler.await;
    histogram!(METRIC_BUILD_MS).record(started.elapsed().as_secs_f64() * 1000.0);

    match buffer_response(response, state.max_body_bytes).await {
        Buffered::Passthrough(response) => {
            debug!(key = %fingerprint, "Response body not bufferable, passing through");
            leader.complete(FlightOutcome::Uncacheable);
            response
        }
        Buffered::Failed(reason) => {
            warn!(key = %fingerprint, reason = %reason, "Failed to buffer response body");
            drop(leader);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
        Buffered::Complete { parts, body } => {
            match CachedResponse::from_parts(parts.status, &parts.headers, body.clone()) {
                Ok(cached) => {
                    if should_store_response(parts.status, &parts.headers, &body) {
                        state.store(&fingerprint, &cached, ttl, metadata);
                    }
                    leader.complete(FlightOutcome::Ready(Arc::new(cached)));
                }
                Err(err) => {
                    state.record_store_failure(&fingerprint, &err);
                    leader.complete(FlightOutcome::Uncacheable);
                }
            }
            Response::from_parts(parts, Body::from(body))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use axum::{Router, http::HeaderValue, middleware, routing::get};
    use tower::ServiceExt;

    use super::*;
    use crate::cache::MemoryCache;

    fn get_request(uri: &str) -> Request {
        Request::builder()
            .method(Method::GET)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    #[test]
    fn component_includes_query() {
        let policy = RouteCachePolicy::new(["users"]);
        let uri: Uri = "/api/users?page=2".parse().unwrap();
        assert_eq!(
            policy.request_component(&Method::GET, &uri),
            "/api/users?page=2"
        );
        let uri: Uri = "/api/users".parse().unwrap();
        assert_eq!(policy.request_component(&Method::GET, &uri), "/api/users");
    }

    #[test]
    fn component_uses_template() {
        let policy = RouteCachePolicy::new(["users"]).with_key_template("users:{method}:{query}");
        let uri: Uri = "/api/users?page=2".parse().unwrap();
        assert_eq!(
            policy.request_component(&Method::GET, &uri),
            "users:GET:page=2"
        );
    }

    #[test]
    fn metadata_collects_vary_axes() {
        let policy = RouteCachePolicy::new(["perm"]).with_metadata_keys(["Accept-Language"]);
        let mut headers = HeaderMap::new();
        headers.insert("x-user-id", HeaderValue::from_static("42"));
        headers.insert("accept-language", HeaderValue::from_static("de"));

        let metadata = policy.metadata(&Method::GET, &headers);
        let pairs: Vec<_> = metadata
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        assert_eq!(
            pairs,
            vec![("accept-language", "de"), ("method", "GET"), ("user_id", "42")]
        );
    }

    #[test]
    fn zero_route_ttl_uses_default() {
        let default_ttl = Duration::from_secs(300);
        assert_eq!(RouteCachePolicy::default().resolve_ttl(default_ttl), default_ttl);
        assert_eq!(
            RouteCachePolicy::default()
                .with_ttl(Duration::ZERO)
                .resolve_ttl(default_ttl),
            default_ttl
        );
        assert_eq!(
            RouteCachePolicy::default()
                .with_ttl(Duration::from_secs(5))
                .resolve_ttl(default_ttl),
            Duration::from_secs(5)
        );
    }

    #[tokio::test]
    async fn second_request_is_served_from_cache() {
        let config = CacheConfig::default();
        let cache: Arc<dyn CacheManager> = Arc::new(MemoryCache::new(config.clone()));
        cache.start().unwrap();
        let state = CacheLayerState::new(Arc::clone(&cache), &config)
            .with_route("/items", RouteCachePolicy::new(["items"]));

        let calls = Arc::new(AtomicUsize::new(0));
        let handler_calls = Arc::clone(&calls);
        let app = Router::new()
            .route(
                "/items",
                get(move || {
                    let calls = Arc::clone(&handler_calls);
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        "items"
                    }
                }),
            )
            .route_layer(middleware::from_fn_with_state(
                state.clone(),
                response_cache_layer,
            ));

        for _ in 0..3 {
            let response = app.clone().oneshot(get_request("/items")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(state.stats().hits, 2);
        assert_eq!(state.stats().misses, 1);
        assert_eq!(cache.dependents("items").len(), 1);
        cache.stop().unwrap();
    }

    #[tokio::test]
    async fn stopped_cache_is_bypassed() {
        let config = CacheConfig::default();
        let cache: Arc<dyn CacheManager> = Arc::new(MemoryCache::new(config.clone()));
        let state = CacheLayerState::new(Arc::clone(&cache), &config)
            .with_route("/items", RouteCachePolicy::new(["items"]));
        let app = Router::new()
            .route("/items", get(|| async { "items" }))
            .route_layer(middleware::from_fn_with_state(
                state.clone(),
                response_cache_layer,
            ));

        app.clone().oneshot(get_request("/items")).await.unwrap();
        app.oneshot(get_request("/items")).await.unwrap();
        assert_eq!(state.stats().bypassed, 2);
        assert_eq!(cache.stats().entries, 0);
    }
}
