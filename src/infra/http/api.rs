use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode, header::ACCEPT_LANGUAGE},
    response::{IntoResponse, Response},
    routing::{get, put},
};
use serde::Deserialize;

use crate::application::{directory::NewUser, error::HttpError};

use super::{HttpState, PERMISSIONS_ROUTE, USER_ROUTE, USERS_ROUTE};

pub(super) fn router() -> Router<HttpState> {
    Router::new()
        .route(USERS_ROUTE, get(list_users).post(create_user))
        .route(USER_ROUTE, get(show_user))
        .route(PERMISSIONS_ROUTE, get(show_permissions))
        .route("/api/permissions/{role}", put(update_permissions))
}

async fn list_users(State(state): State<HttpState>) -> Response {
    Json(state.directory.list_users().await).into_response()
}

async fn show_user(
    State(state): State<HttpState>,
    Path(id): Path<u64>,
) -> Result<Response, HttpError> {
    let user = state.directory.user(id).await?;
    Ok(Json(user).into_response())
}

async fn create_user(
    State(state): State<HttpState>,
    Json(new_user): Json<NewUser>,
) -> Result<Response, HttpError> {
    let user = state.directory.create_user(new_user).await?;
    Ok((StatusCode::CREATED, Json(user)).into_response())
}

async fn show_permissions(State(state): State<HttpState>, headers: HeaderMap) -> Response {
    let accept_language = headers
        .get(ACCEPT_LANGUAGE)
        .and_then(|value| value.to_str().ok());
    Json(state.directory.permissions(accept_language).await).into_response()
}

#[derive(Debug, Deserialize)]
struct PermissionsUpdate {
    permissions: Vec<String>,
}

async fn update_permissions(
    State(state): State<HttpState>,
    Path(role): Path<String>,
    Json(update): Json<PermissionsUpdate>,
) -> Result<Response, HttpError> {
    let permissions = state
        .directory
        .set_permissions(&role, update.permissions)
        .await?;
    Ok(Json(serde_json::json!({ "role": role, "permissions": permissions })).into_response())
}
