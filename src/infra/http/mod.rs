mod admin;
mod api;
mod middleware;

pub use middleware::{RequestContext, log_responses, set_request_context};

use std::sync::Arc;

use axum::{Router, middleware as axum_middleware};
use tracing::debug;

use crate::application::directory::{PERMISSIONS_TAG, USERS_TAG, UserDirectory};
use crate::cache::{
    CacheConfig, CacheLayerState, CacheManager, RouteCachePolicy, response_cache_layer,
};
use crate::config::CacheSettings;

pub const USERS_ROUTE: &str = "/api/users";
pub const USER_ROUTE: &str = "/api/users/{id}";
pub const PERMISSIONS_ROUTE: &str = "/api/permissions";

/// Shared state of every handler.
#[derive(Debug, Clone)]
pub struct HttpState {
    pub cache: Arc<dyn CacheManager>,
    pub directory: UserDirectory,
    /// `None` when response caching is disabled.
    pub cache_layer: Option<CacheLayerState>,
}

impl HttpState {
    pub fn new(
        cache: Arc<dyn CacheManager>,
        directory: UserDirectory,
        settings: &CacheSettings,
    ) -> Self {
        let cache_layer = settings
            .enabled
            .then(|| cache_layer_state(Arc::clone(&cache), settings));
        Self {
            cache,
            directory,
            cache_layer,
        }
    }
}

/// Built-in policies of the demo API, overridden per path by `cache.routes`.
pub fn cache_layer_state(
    cache: Arc<dyn CacheManager>,
    settings: &CacheSettings,
) -> CacheLayerState {
    let mut state = CacheLayerState::new(cache, &CacheConfig::from(settings))
        .with_route(USERS_ROUTE, RouteCachePolicy::new([USERS_TAG]))
        .with_route(USER_ROUTE, RouteCachePolicy::new([USERS_TAG]))
        .with_route(
            PERMISSIONS_ROUTE,
            RouteCachePolicy::new([PERMISSIONS_TAG]).with_metadata_keys(["accept-language"]),
        );

    for route in &settings.routes {
        debug!(
            path = %route.path,
            dependencies = ?route.dependencies,
            "Route cache policy configured"
        );
        state = state.with_route(route.path.clone(), RouteCachePolicy::from(route));
    }
    state
}

pub fn build_router(state: HttpState) -> Router {
    let api_routes = api::router();

    // Writes pass through the layer untouched; only GETs on routes with a policy are cached.
    let api_routes = match state.cache_layer.clone() {
        Some(cache_state) => api_routes.route_layer(axum_middleware::from_fn_with_state(
            cache_state,
            response_cache_layer,
        )),
        None => api_routes,
    };

    api_routes
        .merge(admin::router())
        .with_state(state)
        .layer(axum_middleware::from_fn(log_responses))
        .layer(axum_middleware::from_fn(set_request_context))
}
