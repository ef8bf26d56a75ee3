use super::state::AppState;
use crate::error::LinkError;
use crate::session::SessionState;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde::Serialize;
use tracing::{error, info};

// ============================================================================
// Response Types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct SessionStatusResponse {
    #[serde(flatten)]
    pub state: SessionState,
    pub healthy: bool,
    pub seconds_until_expiry: u64,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub status: String,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

// ============================================================================
// Handlers
// ============================================================================

/// GET /session/state
/// Current session snapshot
pub async fn get_session_state(State(state): State<AppState>) -> impl IntoResponse {
    let manager = &state.session;

    Json(SessionStatusResponse {
        state: manager.state(),
        healthy: manager.is_healthy(),
        seconds_until_expiry: manager.time_until_expiry().as_secs(),
    })
}

/// POST /session/extend
/// Ask the session service for more time
pub async fn extend_session(State(state): State<AppState>) -> impl IntoResponse {
    match state.session.extend_session().await {
        Ok(()) => {
            info!("Session extended via HTTP");
            (
                StatusCode::OK,
                Json(MessageResponse {
                    status: "extended".to_string(),
                    message: "Session extended".to_string(),
                }),
            )
                .into_response()
        }
        Err(e) if e.downcast_ref::<LinkError>() == Some(&LinkError::NoSession) => (
            StatusCode::CONFLICT,
            Json(ErrorResponse {
                error: e.to_string(),
            }),
        )
            .into_response(),
        Err(e) => {
            error!("Failed to extend session: {:#}", e);
            (
                StatusCode::BAD_GATEWAY,
                Json(ErrorResponse {
                    error: format!("Failed to extend session: {:#}", e),
                }),
            )
                .into_response()
        }
    }
}

/// POST /session/leave
/// Leave the session and stop keeping it alive
pub async fn leave_session(State(state): State<AppState>) -> impl IntoResponse {
    state.session.leave().await;

    (
        StatusCode::OK,
        Json(MessageResponse {
            status: "left".to_string(),
            message: "Session left".to_string(),
        }),
    )
}

/// GET /health
/// Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}
