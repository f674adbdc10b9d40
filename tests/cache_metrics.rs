use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode},
    middleware,
    routing::get,
};
use bytes::Bytes;
use metrics_util::debugging::{DebugValue, DebuggingRecorder};
use revcache::cache::{
    CacheConfig, CacheLayerState, CacheManager, EvictionPolicy, MemoryCache, RouteCachePolicy,
    response_cache_layer,
};
use serial_test::serial;
use tower::ServiceExt;

#[tokio::test]
#[serial]
async fn cache_paths_emit_expected_metric_keys() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder
        .install()
        .expect("debug metrics recorder should install in this test process");

    // Store hit/miss/evict/expired through the manager.
    let store = MemoryCache::new(CacheConfig {
        max_entries: 1,
        eviction_policy: EvictionPolicy::Lru,
        cleanup_interval: String::new(),
        ..Default::default()
    });
    assert!(store.get("absent").is_none());
    store
        .set("a", Bytes::from_static(b"1"), Duration::ZERO)
        .unwrap();
    assert!(store.get("a").is_some());
    store
        .set("b", Bytes::from_static(b"2"), Duration::ZERO)
        .unwrap();
    store
        .set("short", Bytes::from_static(b"3"), Duration::from_nanos(1))
        .unwrap();
    std::thread::sleep(Duration::from_millis(2));
    assert!(store.get("short").is_none());
    store.invalidate(&["users"]).unwrap();

    // Middleware miss/coalesce/build latency.
    let config = CacheConfig::default();
    let cache: Arc<dyn CacheManager> = Arc::new(MemoryCache::new(config.clone()));
    cache.start().unwrap();
    let state = CacheLayerState::new(Arc::clone(&cache), &config)
        .with_route("/items", RouteCachePolicy::new(["items"]));
    let app = Router::new()
        .route(
            "/items",
            get(|| async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                "items"
            }),
        )
        .route_layer(middleware::from_fn_with_state(state, response_cache_layer));

    let requests = (0..3).map(|_| {
        let request = Request::builder()
            .method(Method::GET)
            .uri("/items")
            .body(Body::empty())
            .expect("request should build");
        app.clone().oneshot(request)
    });
    for response in futures::future::join_all(requests).await {
        assert_eq!(response.expect("router should respond").status(), StatusCode::OK);
    }
    cache.stop().unwrap();

    let snapshot = snapshotter.snapshot().into_vec();
    let names: HashSet<String> = snapshot
        .iter()
        .map(|(composite_key, _, _, _)| composite_key.key().name().to_string())
        .collect();

    let expected = [
        "revcache_cache_hit_total",
        "revcache_cache_miss_total",
        "revcache_cache_evict_total",
        "revcache_cache_expired_total",
        "revcache_cache_invalidate_total",
        "revcache_cache_coalesced_total",
        "revcache_cache_entries",
        "revcache_cache_build_ms",
    ];
    for metric in expected {
        assert!(names.contains(metric), "missing metric: {metric}");
    }

    let evict_policy_labelled = snapshot.iter().any(|(composite_key, _, _, value)| {
        composite_key.key().name() == "revcache_cache_evict_total"
            && composite_key
                .key()
                .labels()
                .any(|label| label.key() == "policy" && label.value() == "lru")
            && matches!(value, DebugValue::Counter(count) if *count >= 1)
    });
    assert!(evict_policy_labelled, "eviction counter should carry the policy label");
}
