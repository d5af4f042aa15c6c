//! HTTP server.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/ingest` | Start ingesting `{repository}`; `202` with `{task_id}` |
//! | `GET`  | `/tasks/{id}` | Task status, message, current step, warnings |
//! | `POST` | `/tasks/{id}/cancel` | Request cooperative cancellation |
//! | `POST` | `/query` | Answer `{repository, question}` |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "not_ready", "message": "repository './repo' has no completed ingestion" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `not_ready` (409),
//! `already_running` (409), `internal` (500).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use reporover_core::error::{ServiceError, WorkflowError};
use reporover_core::service::RepoRover;
use reporover_core::workflow::Task;

use crate::ask::QueryResponse;
use crate::config::Config;
use crate::rover::build_rover;

#[derive(Clone)]
struct AppState {
    rover: Arc<RepoRover>,
}

/// Starts the HTTP server on `[server].bind` and runs until the process is
/// terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let rover = Arc::new(build_rover(config).await?);
    let app = router(rover);

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    tracing::info!(bind = %config.server.bind, "listening");
    axum::serve(listener, app).await?;
    Ok(())
}

/// All routes over a shared service. Exposed for embedding and tests.
pub fn router(rover: Arc<RepoRover>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/ingest", post(handle_ingest))
        .route("/tasks/{id}", get(handle_task))
        .route("/tasks/{id}/cancel", post(handle_cancel))
        .route("/query", post(handle_query))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(AppState { rover })
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn app_error(status: StatusCode, code: &'static str, message: impl Into<String>) -> AppError {
    AppError {
        status,
        code,
        message: message.into(),
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    app_error(StatusCode::BAD_REQUEST, "bad_request", message)
}

impl From<ServiceError> for AppError {
    fn from(e: ServiceError) -> Self {
        let message = e.to_string();
        match e {
            ServiceError::InvalidRequest(_) => bad_request(message),
            ServiceError::NotReady(_) => app_error(StatusCode::CONFLICT, "not_ready", message),
            ServiceError::AlreadyRunning { .. } => {
                app_error(StatusCode::CONFLICT, "already_running", message)
            }
            ServiceError::Workflow(WorkflowError::TaskNotFound(_))
            | ServiceError::Workflow(WorkflowError::UnknownWorkflow(_)) => {
                app_error(StatusCode::NOT_FOUND, "not_found", message)
            }
            ServiceError::QueryFailed { .. } | ServiceError::Workflow(_) => {
                tracing::error!(error = %message, "request failed");
                app_error(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
            }
        }
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /ingest ============

#[derive(Deserialize)]
struct IngestRequest {
    #[serde(default)]
    repository: String,
}

#[derive(Serialize)]
struct IngestResponse {
    task_id: String,
}

async fn handle_ingest(
    State(state): State<AppState>,
    Json(req): Json<IngestRequest>,
) -> Result<(StatusCode, Json<IngestResponse>), AppError> {
    let task_id = state.rover.ingest(&req.repository).await?;
    Ok((StatusCode::ACCEPTED, Json(IngestResponse { task_id })))
}

// ============ /tasks/{id} ============

async fn handle_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Task>, AppError> {
    Ok(Json(state.rover.status(&id)?))
}

async fn handle_cancel(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Task>, AppError> {
    Ok(Json(state.rover.cancel(&id)?))
}

// ============ POST /query ============

#[derive(Deserialize)]
struct QueryRequest {
    #[serde(default)]
    repository: String,
    #[serde(default)]
    question: String,
}

async fn handle_query(
    State(state): State<AppState>,
    Json(req): Json<QueryRequest>,
) -> Result<Json<QueryResponse>, AppError> {
    if req.repository.trim().is_empty() {
        return Err(bad_request("repository is required"));
    }
    let result = state.rover.ask(&req.repository, &req.question).await?;
    Ok(Json(QueryResponse::from(result)))
}
