//! HTTP side channel
//!
//! Request/response endpoints next to the WebSocket:
//!
//! - `GET /health` - status, session and source counts, uptime
//! - `GET /api/sources` - source summaries
//! - `GET /api/sources/{id}` - full snapshot for initial sync
//! - `POST /api/sources` - upload `{fileName, content}` as a new source
//! - `POST /api/sources/{id}/refresh` - manual change signal

use std::io;
use std::net::SocketAddr;
use std::time::Instant;

use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::hub::HubHandle;
use crate::error::HubError;
use crate::source::{SourceSnapshot, SourceSummary};

/// Shared handler state
#[derive(Debug, Clone)]
pub struct AppState {
    hub: HubHandle,
    started: Instant,
}

impl AppState {
    pub fn new(hub: HubHandle) -> Self {
        Self {
            hub,
            started: Instant::now(),
        }
    }
}

/// API errors
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("payload too large: {0}")]
    PayloadTooLarge(String),

    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Conflict(_) => "CONFLICT",
            Self::PayloadTooLarge(_) => "PAYLOAD_TOO_LARGE",
            Self::Unavailable(_) => "UNAVAILABLE",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl From<HubError> for ApiError {
    fn from(error: HubError) -> Self {
        let message = error.to_string();
        match error {
            HubError::UnknownSource(_) => Self::NotFound(message),
            HubError::DuplicateSource(_) => Self::Conflict(message),
            HubError::InvalidTable { .. } => Self::BadRequest(message),
            HubError::TooLarge { .. } => Self::PayloadTooLarge(message),
            HubError::Rejected(_) => Self::BadRequest(message),
            HubError::Origin(_) | HubError::Store { .. } => Self::Internal(message),
            HubError::Stopped => Self::Unavailable(message),
        }
    }
}

/// Error response body
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            error: self.code().to_string(),
            message: self.to_string(),
        };

        warn!(
            error_code = %body.error,
            error_message = %body.message,
            status = %status,
            "API error"
        );

        (status, Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, ApiError>;

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub sessions: usize,
    pub sources: usize,
    pub uptime_secs: u64,
}

/// Upload request body
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadRequest {
    pub file_name: String,
    pub content: String,
}

/// Refresh acknowledgement
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshResponse {
    pub data_source_id: String,
    pub status: String,
}

/// Build the HTTP router
pub fn build_router(state: AppState) -> Router {
    // JSON escaping can roughly double the raw file size
    let body_limit = state.hub.max_upload_bytes().saturating_mul(2).max(64 * 1024);

    Router::new()
        .route("/health", get(health_handler))
        .route("/api/sources", get(list_handler).post(upload_handler))
        .route("/api/sources/{id}", get(snapshot_handler))
        .route("/api/sources/{id}/refresh", post(refresh_handler))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Result<Json<HealthResponse>> {
    let stats = state.hub.stats().await?;

    Ok(Json(HealthResponse {
        status: "ok".to_string(),
        sessions: stats.sessions,
        sources: stats.sources,
        uptime_secs: state.started.elapsed().as_secs(),
    }))
}

/// GET /api/sources
async fn list_handler(State(state): State<AppState>) -> Result<Json<Vec<SourceSummary>>> {
    Ok(Json(state.hub.list_sources().await?))
}

/// GET /api/sources/{id}
async fn snapshot_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SourceSnapshot>> {
    Ok(Json(state.hub.snapshot(&id).await?))
}

/// POST /api/sources
async fn upload_handler(
    State(state): State<AppState>,
    Json(req): Json<UploadRequest>,
) -> Result<(StatusCode, Json<SourceSummary>)> {
    if req.file_name.trim().is_empty() {
        return Err(ApiError::BadRequest("fileName is required".to_string()));
    }

    let summary = state.hub.upload(&req.file_name, &req.content).await?;
    Ok((StatusCode::CREATED, Json(summary)))
}

/// POST /api/sources/{id}/refresh
async fn refresh_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<RefreshResponse>)> {
    state.hub.refresh(&id).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(RefreshResponse {
            data_source_id: id,
            status: "refreshing".to_string(),
        }),
    ))
}

/// HTTP server bound to an address
pub struct ApiServer {
    listener: TcpListener,
    router: Router,
}

impl ApiServer {
    /// Bind the listening socket; port 0 picks an ephemeral port
    pub async fn bind(addr: impl ToSocketAddrs, hub: HubHandle) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            router: build_router(AppState::new(hub)),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self) -> io::Result<()> {
        if let Ok(addr) = self.listener.local_addr() {
            info!(address = %addr, "HTTP API listening");
        }
        axum::serve(self.listener, self.router).await
    }

    /// Run the server on a background task
    pub fn spawn(self) -> JoinHandle<io::Result<()>> {
        tokio::spawn(self.run())
    }
}
