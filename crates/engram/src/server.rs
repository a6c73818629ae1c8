//! HTTP API over the memory manager
//!
//! Routes:
//! - `GET  /health`
//! - `POST /v1/sessions` start a session
//! - `POST /v1/sessions/{id}/resume` load a persisted session
//! - `DELETE /v1/sessions/{id}` end a session (`?purge=true` also deletes it)
//! - `POST /v1/sessions/{id}/turns` write path
//! - `POST /v1/sessions/{id}/recall` read path
//! - `GET  /v1/sessions/{id}/metrics`
//! - `GET  /v1/sessions/{id}/records`
//! - `GET  /admin/sessions`, `GET /admin/events` (SSE)

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    body::Body,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::admin::handlers::{events_handler, sessions_handler};
use crate::config::ServerConfig;
use crate::error::{EngramError, Result};
use crate::memory::manager::{MemoryManager, RecalledMemory, TurnReport};
use crate::memory::reabsorption::TriggerReason;
use crate::memory::types::{FilterReason, HistoryEntry, MetricsSnapshot, RecordId};
use crate::session::SessionId;

/// Shared application state for all handlers
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<MemoryManager>,
    pub config: ServerConfig,
}

/// The HTTP server
pub struct EngramServer {
    config: ServerConfig,
    manager: Arc<MemoryManager>,
}

impl EngramServer {
    pub fn new(config: ServerConfig, manager: Arc<MemoryManager>) -> Self {
        Self { config, manager }
    }

    /// Bind and serve until Ctrl+C or SIGTERM
    pub async fn serve(&self) -> Result<()> {
        let state = Arc::new(AppState {
            manager: Arc::clone(&self.manager),
            config: self.config.clone(),
        });
        let app = create_router(state);

        let addr: SocketAddr = self
            .config
            .listen_addr
            .parse()
            .map_err(|e| EngramError::Config(format!("Invalid listen address: {e}")))?;

        tracing::info!("Starting engram server on {addr}");

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| EngramError::Server(format!("Failed to bind to {addr}: {e}")))?;

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| EngramError::Server(format!("Server error: {e}")))?;

        tracing::info!("Engram server shut down gracefully");
        Ok(())
    }
}

/// Create the router with all routes configured
pub fn create_router(state: Arc<AppState>) -> Router {
    let timeout = Duration::from_secs(state.config.timeout_secs.max(1));
    Router::new()
        .route("/health", get(health_handler))
        .route("/v1/sessions", post(start_session_handler))
        .route("/v1/sessions/{id}", axum::routing::delete(end_session_handler))
        .route("/v1/sessions/{id}/resume", post(resume_session_handler))
        .route("/v1/sessions/{id}/turns", post(record_turn_handler))
        .route("/v1/sessions/{id}/recall", post(recall_handler))
        .route("/v1/sessions/{id}/metrics", get(metrics_handler))
        .route("/v1/sessions/{id}/records", get(records_handler))
        .route("/admin/sessions", get(sessions_handler))
        .route("/admin/events", get(events_handler))
        .layer(TimeoutLayer::new(timeout))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Error body: `{"error": {"type": ..., "message": ...}}`
pub struct ApiError(EngramError);

impl From<EngramError> for ApiError {
    fn from(e: EngramError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type) = match &self.0 {
            EngramError::SessionNotFound(_) => (StatusCode::NOT_FOUND, "session_not_found"),
            EngramError::SessionActive(_) => (StatusCode::CONFLICT, "session_active"),
            EngramError::InvalidSession(_) => (StatusCode::BAD_REQUEST, "invalid_session"),
            EngramError::Codec(_) => (StatusCode::UNPROCESSABLE_ENTITY, "corrupt_payload"),
            EngramError::Storage(_) => (StatusCode::SERVICE_UNAVAILABLE, "storage_unavailable"),
            EngramError::Generator(_) => (StatusCode::BAD_GATEWAY, "generator_unavailable"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };
        if status.is_server_error() {
            tracing::error!("{}", self.0);
        }
        create_error_response(status, error_type, &self.0.to_string())
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

fn parse_session_id(raw: &str) -> ApiResult<SessionId> {
    SessionId::try_from(raw).map_err(|e| ApiError(e.into()))
}

/// Health check endpoint - returns JSON status
async fn health_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "active_sessions": state.manager.registry().len(),
    }))
}

#[derive(Debug, Default, Deserialize)]
pub struct StartSessionRequest {
    pub session_id: Option<String>,
    pub title: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StartSessionResponse {
    pub session_id: String,
}

async fn start_session_handler(
    State(state): State<Arc<AppState>>,
    body: Option<Json<StartSessionRequest>>,
) -> ApiResult<(StatusCode, Json<StartSessionResponse>)> {
    let Json(request) = body.unwrap_or_default();
    let id = request
        .session_id
        .as_deref()
        .map(parse_session_id)
        .transpose()?;
    let id = state
        .manager
        .start_session(id, request.title.as_deref())
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(StartSessionResponse {
            session_id: id.to_string(),
        }),
    ))
}

async fn resume_session_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<MetricsSnapshot>> {
    let id = parse_session_id(&id)?;
    Ok(Json(state.manager.resume_session(&id).await?))
}

#[derive(Debug, Default, Deserialize)]
pub struct EndSessionQuery {
    #[serde(default)]
    pub purge: bool,
}

async fn end_session_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<EndSessionQuery>,
) -> ApiResult<Json<MetricsSnapshot>> {
    let id = parse_session_id(&id)?;
    let snapshot = state.manager.end_session(&id).await?;
    if query.purge {
        state.manager.delete_session(&id).await?;
    }
    Ok(Json(snapshot))
}

#[derive(Debug, Deserialize)]
pub struct TurnRequest {
    pub response: String,
    #[serde(default)]
    pub prompt: Option<String>,
}

/// Reinjection block as returned over HTTP
#[derive(Debug, Serialize, Deserialize)]
pub struct ReinjectionBody {
    pub trigger: Option<TriggerReason>,
    pub record_ids: Vec<RecordId>,
    pub texts: Vec<String>,
    pub tokens: usize,
    pub skipped: Vec<RecordId>,
    /// Texts joined, ready to merge into the next prompt
    pub context: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TurnResponse {
    pub turn: u64,
    pub tokens: usize,
    pub grade: Option<u8>,
    pub fallback_grade: bool,
    pub stored_record_id: Option<RecordId>,
    pub filtered: Option<FilterReason>,
    pub reinjection: ReinjectionBody,
}

impl From<TurnReport> for TurnResponse {
    fn from(report: TurnReport) -> Self {
        let stored_record_id = report.stored_record().map(|r| r.id);
        let filtered = report.filter_reason().cloned();
        let block = report.reinjection;
        Self {
            turn: report.turn,
            tokens: report.tokens,
            grade: report.grade,
            fallback_grade: report.fallback_grade,
            stored_record_id,
            filtered,
            reinjection: ReinjectionBody {
                trigger: block.reason,
                context: block.render(),
                record_ids: block.record_ids,
                texts: block.texts,
                tokens: block.tokens,
                skipped: block.skipped.iter().map(|s| s.record_id).collect(),
            },
        }
    }
}

async fn record_turn_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<TurnRequest>,
) -> ApiResult<Json<TurnResponse>> {
    let id = parse_session_id(&id)?;
    let report = state
        .manager
        .record_turn_with_prompt(&id, request.prompt.as_deref(), &request.response)
        .await?;
    Ok(Json(report.into()))
}

#[derive(Debug, Deserialize)]
pub struct RecallRequest {
    pub query: String,
    #[serde(default)]
    pub k: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RecallResponse {
    pub memories: Vec<RecalledMemory>,
}

async fn recall_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<RecallRequest>,
) -> ApiResult<Json<RecallResponse>> {
    let id = parse_session_id(&id)?;
    let memories = state.manager.recall(&id, &request.query, request.k).await?;
    Ok(Json(RecallResponse { memories }))
}

async fn metrics_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<MetricsSnapshot>> {
    let id = parse_session_id(&id)?;
    Ok(Json(state.manager.metrics(&id).await?))
}

async fn records_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<HistoryEntry>>> {
    let id = parse_session_id(&id)?;
    Ok(Json(state.manager.session_history(&id).await?))
}

/// Create a JSON error response
pub(crate) fn create_error_response(
    status: StatusCode,
    error_type: &str,
    message: &str,
) -> Response<Body> {
    let body = serde_json::json!({
        "error": {
            "type": error_type,
            "message": message,
        }
    });

    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown");
        },
    }
}
