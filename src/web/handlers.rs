use axum::{
    body::Bytes,
    extract::{Path, State},
    Json,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

use crate::error::{AppError, Result};
use crate::state::AppState;
use crate::webrtc::{SessionDescription, SessionInfo, SessionOrigin};

// ============================================================================
// Health
// ============================================================================

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub sessions: usize,
}

pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        sessions: state.sessions.session_count().await,
    })
}

// ============================================================================
// Signaling
// ============================================================================

/// Answer a browser offer.
///
/// The body is parsed by hand so malformed JSON gets the same error shape
/// as every other failure.
pub async fn do_signaling(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<SessionDescription>> {
    let offer: SessionDescription = serde_json::from_slice(&body)
        .map_err(|e| AppError::BadRequest(format!("Invalid session description: {}", e)))?;

    let (session, answer) = state
        .sessions
        .negotiate(SessionOrigin::Http, offer)
        .await?;
    info!("Answered offer for session {}", session.session_id());

    Ok(Json(answer))
}

// ============================================================================
// Sessions
// ============================================================================

#[derive(Serialize)]
pub struct SessionListResponse {
    pub sessions: Vec<SessionInfo>,
}

pub async fn list_sessions(State(state): State<Arc<AppState>>) -> Json<SessionListResponse> {
    Json(SessionListResponse {
        sessions: state.sessions.list_sessions().await,
    })
}

#[derive(Serialize)]
pub struct SuccessResponse {
    pub success: bool,
    pub message: String,
}

pub async fn close_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<SuccessResponse>> {
    state.sessions.close_session(&id, "closed via API").await?;
    Ok(Json(SuccessResponse {
        success: true,
        message: format!("Session {} closed", id),
    }))
}
