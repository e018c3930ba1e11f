//! REST endpoints for task submission, status and cleanup.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State, rejection::JsonRejection},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use crate::error::TaskError;
use crate::lifecycle::TaskLifecycleManager;
use crate::task::{TaskRequest, TaskResponse, TaskState};

const SERVICE: &str = "tasklane";
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<TaskLifecycleManager>,
}

/// Build the router with every task route and permissive CORS.
pub fn task_routes(manager: Arc<TaskLifecycleManager>) -> Router {
    let state = AppState { manager };

    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/api/v1/tasks", post(submit_task))
        .route(
            "/api/v1/tasks/{task_id}",
            get(get_task_status).delete(cleanup_task),
        )
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Error body: `{"detail": "..."}`.
struct ApiError {
    status: StatusCode,
    detail: String,
}

impl ApiError {
    fn internal(e: impl std::fmt::Display) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            detail: e.to_string(),
        }
    }
}

impl From<TaskError> for ApiError {
    fn from(e: TaskError) -> Self {
        match e {
            TaskError::InvalidRequest(_) => Self {
                status: StatusCode::UNPROCESSABLE_ENTITY,
                detail: e.to_string(),
            },
            other => Self::internal(other),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "detail": self.detail }))).into_response()
    }
}

// ── Service info ────────────────────────────────────────────────────────

async fn root() -> impl IntoResponse {
    Json(json!({
        "service": SERVICE,
        "version": VERSION,
        "health": "/health",
        "metrics": "/metrics",
        "tasks": "/api/v1/tasks",
    }))
}

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "service": SERVICE,
        "version": VERSION,
    }))
}

/// Prometheus exposition text.
async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        state.manager.render_metrics().await,
    )
}

// ── Tasks ───────────────────────────────────────────────────────────────

async fn submit_task(
    State(state): State<AppState>,
    body: Result<Json<TaskRequest>, JsonRejection>,
) -> Result<Json<TaskResponse>, ApiError> {
    let Json(request) = body.map_err(|rejection| ApiError {
        status: StatusCode::UNPROCESSABLE_ENTITY,
        detail: rejection.body_text(),
    })?;

    let manager = &state.manager;
    let submitted = manager
        .submit(&request.task_name, request.args, request.kwargs, request.priority)
        .await
        .inspect_err(|e| error!(task_name = %request.task_name, error = %e, "Failed to submit task"))?;
    let task_id = submitted.task_id;
    let submitted_at = submitted.submitted_at;

    if !request.sync {
        return Ok(Json(TaskResponse {
            task_id,
            state: TaskState::Pending,
            submitted_at,
        }));
    }

    let status = manager
        .wait(&task_id, Some(manager.default_timeout()), None)
        .await?;
    info!(task_id = %task_id, state = %status.state, "Synchronous task finished");

    let cleanup = state.manager.clone();
    let cleanup_id = task_id.clone();
    tokio::spawn(async move { cleanup.cleanup(&cleanup_id).await });

    Ok(Json(TaskResponse {
        task_id,
        state: status.state,
        submitted_at,
    }))
}

async fn get_task_status(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let status = state
        .manager
        .get_status(&task_id)
        .await
        .inspect_err(|e| error!(task_id = %task_id, error = %e, "Failed to get task status"))?;
    Ok(Json(status))
}

async fn cleanup_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .manager
        .try_cleanup(&task_id)
        .await
        .inspect_err(|e| error!(task_id = %task_id, error = %e, "Failed to cleanup task"))?;
    Ok(Json(json!({
        "status": "success",
        "message": format!("Task {task_id} cleaned up"),
    })))
}
