//! Public and internal HTTP routers.
//!
//! The public surface here is the slice the core subsystems need to be
//! exercised: app lifecycle operations, the name lookup the proxy domain
//! uses, and the WebSocket streams. Authentication middleware and the
//! wider catalog endpoints live outside this service.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::error;
use uuid::Uuid;

use sandpiper_logmgr::LogError;
use sandpiper_proxy::{enable_app_process, restart_app_process, AppRecord};

use crate::state::ServerState;
use crate::store::{App, EnvVar, NewApp};
use crate::ws;

/// Error shape shared by every REST handler.
pub enum ApiError {
    NotFound,
    BadRequest(String),
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::NotFound => StatusCode::NOT_FOUND.into_response(),
            ApiError::BadRequest(reason) => {
                (StatusCode::BAD_REQUEST, Json(json!({ "error": reason }))).into_response()
            }
            ApiError::Internal(err) => {
                error!(error = %err, "Request failed");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        }
    }
}

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        ApiError::Internal(err.into())
    }
}

/// Public API router.
pub fn api_router(state: ServerState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/name/{name}", get(name_lookup))
        .route("/app", post(create_app))
        .route("/app/{id}", get(get_app))
        .route("/app/{id}/alive", post(app_alive))
        .route("/app/{id}/enable", post(app_enable))
        .route("/app/{id}/update", post(app_update))
        .route("/app/{id}/fork", post(app_fork))
        .route("/app/{id}/log/ws", get(ws::logs::app_log_ws))
        .route("/app/{id}/state/ws", get(ws::state::app_state_ws))
        .route("/app/{id}/langserver/ws", get(ws::langserver::app_langserver_ws))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Internal router: reachable from sandboxes only, no auth.
pub fn internal_router(state: ServerState) -> Router {
    Router::new()
        .route("/internal/app/{id}/log", post(ingest_log_line))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Public name→id lookup; deliberately returns nothing else.
async fn name_lookup(
    State(state): State<ServerState>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let app = state
        .store
        .app_by_name(&name)
        .await?
        .ok_or(ApiError::NotFound)?;
    Ok(Json(json!({ "id": app.id })))
}

#[derive(Deserialize)]
struct CreateAppInput {
    #[serde(default)]
    description: String,
    #[serde(default = "default_start_cmd")]
    start_cmd: String,
}

fn default_start_cmd() -> String {
    "npm start".to_string()
}

async fn create_app(
    State(state): State<ServerState>,
    Json(input): Json<CreateAppInput>,
) -> Result<Json<App>, ApiError> {
    let template = NewApp {
        description: input.description,
        worktree_id: Uuid::new_v4().to_string(),
        start_cmd: input.start_cmd,
        ..Default::default()
    };
    let app = state.store.create_app(template).await?;

    // Prewarm the sandbox; the lease is released right away and idle
    // expiry cleans up if nobody comes back.
    let lease = state.broker.lease(&app.id, "", &app.worktree_id).await?;
    drop(lease);

    Ok(Json(app))
}

async fn get_app(
    State(state): State<ServerState>,
    Path(id): Path<String>,
) -> Result<Json<App>, ApiError> {
    let app = state.store.app(&id).await?.ok_or(ApiError::NotFound)?;
    Ok(Json(app))
}

/// Touching the context through a lease refreshes its expiry.
async fn app_alive(
    State(state): State<ServerState>,
    Path(id): Path<String>,
) -> Result<Json<App>, ApiError> {
    let app = state.store.app(&id).await?.ok_or(ApiError::NotFound)?;
    let _lease = state.broker.lease(&app.id, "", &app.worktree_id).await?;
    state.store.touch_accessed(&app.id).await?;

    let app = state.store.app(&app.id).await?.ok_or(ApiError::NotFound)?;
    Ok(Json(app))
}

async fn app_enable(
    State(state): State<ServerState>,
    Path(id): Path<String>,
) -> Result<Json<App>, ApiError> {
    let app = state.store.app(&id).await?.ok_or(ApiError::NotFound)?;
    let lease = state.broker.lease(&app.id, "", &app.worktree_id).await?;

    let record = AppRecord::from(app.clone());
    enable_app_process(&lease, &record).await?;

    Ok(Json(app))
}

/// Enable first in case the app is asleep, then restart it with the
/// current command and environment.
async fn app_update(
    State(state): State<ServerState>,
    Path(id): Path<String>,
) -> Result<Json<App>, ApiError> {
    let app = state.store.app(&id).await?.ok_or(ApiError::NotFound)?;
    let lease = state.broker.lease(&app.id, "", &app.worktree_id).await?;

    let record = AppRecord::from(app.clone());
    enable_app_process(&lease, &record).await?;
    restart_app_process(&lease, &record).await?;
    state.store.touch_running(&app.id).await?;

    let app = state.store.app(&app.id).await?.ok_or(ApiError::NotFound)?;
    Ok(Json(app))
}

/// Fork an app: snapshot the source worktree if its sandbox is live, copy
/// the metadata (environment keys only, values stay private), then prewarm
/// the fork's sandbox seeded from the source worktree.
async fn app_fork(
    State(state): State<ServerState>,
    Path(id): Path<String>,
) -> Result<Json<App>, ApiError> {
    let app = state.store.app(&id).await?.ok_or(ApiError::NotFound)?;

    if let Some(source) = state.broker.existing_lease(&app.id).await? {
        sandpiper_broker::ops::save_worktree(&source).await?;
    }

    let template = NewApp {
        description: app.description.clone(),
        icon: app.icon.clone(),
        user_id: app.user_id.clone(),
        worktree_id: Uuid::new_v4().to_string(),
        start_cmd: app.start_cmd.clone(),
        env_vars: app
            .env_vars
            .iter()
            .map(|kv| EnvVar {
                key: kv.key.clone(),
                value: String::new(),
            })
            .collect(),
    };
    let fork = state.store.create_app(template).await?;

    let lease = state
        .broker
        .lease(&fork.id, &app.worktree_id, &fork.worktree_id)
        .await?;
    drop(lease);

    Ok(Json(fork))
}

/// One line in, appended and fanned out.
async fn ingest_log_line(
    State(state): State<ServerState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    match state.logs.write(&id, body).await {
        Ok(()) => Ok(StatusCode::OK),
        Err(LogError::LineContainsNewline) => Err(ApiError::BadRequest(
            "log line cannot contain a newline".to_string(),
        )),
        Err(err) => Err(ApiError::Internal(err.into())),
    }
}
