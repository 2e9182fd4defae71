//! HTTP surface for the session API.
//!
//! Thin layer over [`SessionManager`]: capture clients create, start,
//! feed, and end sessions here. Enrollment and reporting dashboards are
//! separate services; only the session report read path is exposed.

use crate::sessions::{EndSummary, FrameSummary, SessionError, SessionManager};
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<SessionManager>,
    pub max_frame_bytes: usize,
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Unprocessable(String),
    #[error("extraction queue full, retry later")]
    Saturated,
    #[error("{0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Unprocessable(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Saturated => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Unknown(_) | SessionError::UnknownInstitution(_) => {
                ApiError::NotFound(err.to_string())
            }
            SessionError::InvalidState(_) | SessionError::NotActive => {
                ApiError::Conflict(err.to_string())
            }
            SessionError::MalformedFrame(_) => ApiError::Unprocessable(err.to_string()),
            SessionError::Saturated => ApiError::Saturated,
            SessionError::PoolUnavailable | SessionError::Store(_) => {
                ApiError::Internal(err.to_string())
            }
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/v1/sessions", post(create_session))
        .route("/api/v1/sessions/:id/start", post(start_session))
        .route("/api/v1/sessions/:id/frames", post(submit_frame))
        .route("/api/v1/sessions/:id/end", post(end_session))
        .route("/api/v1/sessions/:id/report", get(report))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz() -> impl IntoResponse {
    Json(json!({ "status": "ok", "service": "rollcalld" }))
}

#[derive(Debug, Deserialize)]
struct CreateSessionRequest {
    institution_id: Uuid,
    course: String,
}

#[derive(Debug, Serialize)]
struct CreateSessionResponse {
    session_id: Uuid,
}

async fn create_session(
    State(state): State<AppState>,
    Json(request): Json<CreateSessionRequest>,
) -> Result<Json<CreateSessionResponse>, ApiError> {
    let session_id = state
        .manager
        .create_session(request.institution_id, &request.course)
        .await?;
    Ok(Json(CreateSessionResponse { session_id }))
}

async fn start_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let started_at = state.manager.start_session(id).await?;
    Ok(Json(json!({ "session_id": id, "started_at": started_at })))
}

async fn submit_frame(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    body: Bytes,
) -> Result<Json<FrameSummary>, ApiError> {
    if body.is_empty() {
        return Err(ApiError::Unprocessable("empty frame payload".into()));
    }
    if body.len() > state.max_frame_bytes {
        return Err(ApiError::Unprocessable(format!(
            "frame payload of {} bytes exceeds limit of {}",
            body.len(),
            state.max_frame_bytes
        )));
    }
    let summary = state.manager.submit_frame(id, body.to_vec()).await?;
    Ok(Json(summary))
}

async fn end_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<EndSummary>, ApiError> {
    Ok(Json(state.manager.end_session(id).await?))
}

async fn report(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let records = state.manager.report(id).await?;
    Ok(Json(json!({ "session_id": id, "records": records })))
}
