use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tracing::error;

use super::history::{DEFAULT_LIST_LIMIT, MAX_LIST_LIMIT};
use super::log_sink::LogSink;
use super::models::{BuildConfig, BuildStatus};
use super::supervisor::{BuildSupervisor, BuildView};
use crate::errors::BuildError;

/// Lines returned by the log endpoint when `lines` is not given.
const DEFAULT_LOG_LINES: usize = 100;
const MAX_LOG_LINES: usize = 5000;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub supervisor: BuildSupervisor,
}

pub type SharedState = Arc<AppState>;

// ── Request / response payload types ──────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub lines: Option<usize>,
    pub offset: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct ActiveBuildResponse {
    pub has_active_build: bool,
    pub active_build: Option<BuildView>,
}

#[derive(Debug, Serialize)]
pub struct LogsResponse {
    pub build_id: String,
    pub lines: Vec<String>,
    /// Byte offset to pass back as `offset` to fetch only newer output.
    pub offset: u64,
}

#[derive(Debug, Serialize)]
pub struct KillResponse {
    pub build_id: String,
    pub status: BuildStatus,
}

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict { message: String, build_id: String },
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::NotFound(msg) => (
                StatusCode::NOT_FOUND,
                Json(serde_json::json!({"error": msg})),
            )
                .into_response(),
            ApiError::BadRequest(msg) => (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({"error": msg})),
            )
                .into_response(),
            ApiError::Conflict { message, build_id } => (
                StatusCode::CONFLICT,
                Json(serde_json::json!({"error": message, "build_id": build_id})),
            )
                .into_response(),
            ApiError::Internal(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": msg})),
            )
                .into_response(),
        }
    }
}

impl From<BuildError> for ApiError {
    fn from(err: BuildError) -> Self {
        match err {
            BuildError::AlreadyRunning { ref build_id, .. } => ApiError::Conflict {
                build_id: build_id.clone(),
                message: err.to_string(),
            },
            BuildError::NotFound { .. } | BuildError::UnknownEnvironment { .. } => {
                ApiError::NotFound(err.to_string())
            }
            BuildError::InvalidConfig(msg) => ApiError::BadRequest(msg),
            other => {
                error!(error = %other, "request failed");
                ApiError::Internal(other.to_string())
            }
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/environments/{env}/builds", post(start_build))
        .route("/api/environments/{env}/active", get(get_active_build))
        .route("/api/environments/{env}/history", get(list_history))
        .route("/api/builds/{id}", get(get_build))
        .route("/api/builds/{id}/logs", get(get_build_logs))
        .route("/api/builds/{id}/kill", post(kill_build))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn start_build(
    State(state): State<SharedState>,
    Path(env): Path<String>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let config = if body.iter().all(u8::is_ascii_whitespace) {
        BuildConfig::default()
    } else {
        serde_json::from_slice::<BuildConfig>(&body)
            .map_err(|e| ApiError::BadRequest(format!("Invalid request body: {}", e)))?
    };
    let record = state.supervisor.start(&env, config).await?;
    Ok((StatusCode::CREATED, Json(state.supervisor.view(record))))
}

async fn get_active_build(
    State(state): State<SharedState>,
    Path(env): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.supervisor.config().environment(&env)?;
    let active = state
        .supervisor
        .active(&env)?
        .map(|record| state.supervisor.view(record));
    Ok(Json(ActiveBuildResponse {
        has_active_build: active.is_some(),
        active_build: active,
    }))
}

async fn list_history(
    State(state): State<SharedState>,
    Path(env): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT);
    if limit == 0 || limit > MAX_LIST_LIMIT {
        return Err(ApiError::BadRequest(format!(
            "limit must be between 1 and {}",
            MAX_LIST_LIMIT
        )));
    }
    let views: Vec<BuildView> = state
        .supervisor
        .history(&env, limit)?
        .into_iter()
        .map(|record| state.supervisor.view(record))
        .collect();
    Ok(Json(views))
}

async fn get_build(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let record = state.supervisor.observe(&id)?;
    Ok(Json(state.supervisor.view(record)))
}

async fn get_build_logs(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let max_lines = query.lines.unwrap_or(DEFAULT_LOG_LINES).min(MAX_LOG_LINES);

    let response = match query.offset {
        Some(offset) => {
            let chunk = state
                .supervisor
                .read_log_lines_since(&id, offset, max_lines)?;
            let lines: Vec<String> = chunk.content.lines().map(str::to_string).collect();
            LogsResponse {
                build_id: id,
                lines,
                offset: chunk.offset,
            }
        }
        None => {
            let record = state.supervisor.observe(&id)?;
            let sink = LogSink::new(record.log_path);
            let offset = sink.size()?;
            let lines = sink.tail(max_lines)?;
            LogsResponse {
                build_id: id,
                lines,
                offset,
            }
        }
    };
    Ok(Json(response))
}

async fn kill_build(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let record = state.supervisor.kill(&id).await?;
    Ok(Json(KillResponse {
        build_id: record.build_id,
        status: record.status,
    }))
}

// ── Tests ─────────────────────────────────────────────────────────────
