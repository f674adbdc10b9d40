use std::collections::BTreeMap;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::application::error::HttpError;
use crate::cache::{CacheStats, LayerStats};

use super::HttpState;

const SOURCE: &str = "infra::http::admin";

pub(super) fn router() -> Router<HttpState> {
    Router::new()
        .route("/health", get(health))
        .route("/admin/cache/stats", get(cache_stats))
        .route("/admin/cache/invalidate", post(invalidate_cache))
        .route("/admin/cache/revisions/{tag}", get(tag_revision))
}

#[derive(Debug, Serialize)]
struct HealthBody {
    status: &'static str,
    cache: CacheHealth,
}

#[derive(Debug, Serialize)]
struct CacheHealth {
    running: bool,
    entries: usize,
}

async fn health(State(state): State<HttpState>) -> Response {
    let running = state.cache.is_running();
    let body = HealthBody {
        status: "ok",
        cache: CacheHealth {
            running,
            entries: state.cache.stats().entries,
        },
    };
    Json(body).into_response()
}

#[derive(Debug, Serialize)]
struct StatsBody {
    kind: &'static str,
    running: bool,
    cache: CacheStats,
    /// Absent when response caching is disabled.
    layer: Option<LayerStats>,
}

async fn cache_stats(State(state): State<HttpState>) -> Response {
    let body = StatsBody {
        kind: state.cache.kind(),
        running: state.cache.is_running(),
        cache: state.cache.stats(),
        layer: state.cache_layer.as_ref().map(|layer| layer.stats()),
    };
    Json(body).into_response()
}

#[derive(Debug, Deserialize)]
struct InvalidateRequest {
    #[serde(default)]
    tags: Vec<String>,
}

#[derive(Debug, Serialize)]
struct InvalidateBody {
    invalidated: Vec<String>,
    revisions: BTreeMap<String, u64>,
}

async fn invalidate_cache(
    State(state): State<HttpState>,
    Json(request): Json<InvalidateRequest>,
) -> Result<Response, HttpError> {
    let tags: Vec<String> = request
        .tags
        .into_iter()
        .map(|tag| tag.trim().to_string())
        .filter(|tag| !tag.is_empty())
        .collect();
    if tags.is_empty() {
        return Err(HttpError::new(
            SOURCE,
            StatusCode::BAD_REQUEST,
            "Invalid input",
            "at least one non-empty tag is required",
        ));
    }

    let refs: Vec<&str> = tags.iter().map(String::as_str).collect();
    state.cache.invalidate(&refs).map_err(|err| {
        HttpError::from_error(
            SOURCE,
            StatusCode::INTERNAL_SERVER_ERROR,
            "Cache invalidation failed",
            &err,
        )
    })?;

    let revisions = tags
        .iter()
        .map(|tag| (tag.clone(), state.cache.get_revision(tag)))
        .collect();
    info!(tags = ?tags, "Cache tags invalidated by admin request");

    Ok(Json(InvalidateBody {
        invalidated: tags,
        revisions,
    })
    .into_response())
}

#[derive(Debug, Serialize)]
struct RevisionBody {
    tag: String,
    revision: u64,
    dependents: usize,
}

async fn tag_revision(State(state): State<HttpState>, Path(tag): Path<String>) -> Response {
    let body = RevisionBody {
        revision: state.cache.get_revision(&tag),
        dependents: state.cache.dependents(&tag).len(),
        tag,
    };
    Json(body).into_response()
}
