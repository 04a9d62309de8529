//! REST API Server for the Deposit Rate Assistant
//!
//! Exposes chat turns, confirmation resume, session lookup and
//! cancellation over HTTP

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::error::AssistantError;
use crate::models::ResumePayload;
use crate::workflow::Orchestrator;

/// =============================
/// Request Models
/// =============================

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub session_id: Option<String>,
    pub message: String,
}

/// =============================
/// Response Wrapper
/// =============================

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    pub timestamp: String,
}

impl ApiResponse {
    pub fn success<T: Serialize>(data: T) -> Self {
        Self {
            success: true,
            data: serde_json::to_value(data).ok(),
            error: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

type ApiResult = (StatusCode, Json<ApiResponse>);

fn ok<T: Serialize>(data: T) -> ApiResult {
    (StatusCode::OK, Json(ApiResponse::success(data)))
}

fn fail(error: AssistantError) -> ApiResult {
    let status = match &error {
        AssistantError::SessionNotFound(_) => StatusCode::NOT_FOUND,
        AssistantError::SessionClosed(_)
        | AssistantError::AwaitingConfirmation(_)
        | AssistantError::NotAwaitingConfirmation(_)
        | AssistantError::ConfirmationExpired(_)
        | AssistantError::RequestMismatch { .. } => StatusCode::CONFLICT,
        AssistantError::InvalidResume(_) => StatusCode::BAD_REQUEST,
        e if e.is_recoverable() => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };

    if status.is_server_error() {
        warn!("Request failed: {}", error);
    }
    (status, Json(ApiResponse::error(error.user_message())))
}

/// =============================
/// API State
/// =============================

#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Arc<Orchestrator>,
}

/// =============================
/// Helpers: Session Ids
/// =============================

fn stable_uuid_from_string(input: &str) -> uuid::Uuid {
    use sha2::{Digest, Sha256};

    let hash = Sha256::digest(input.as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&hash[..16]);

    // Set UUID version (4) and variant (RFC4122) bits.
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;

    uuid::Uuid::from_bytes(bytes)
}

/// Client-chosen ids that are not UUIDs map to a stable UUID
fn session_uuid(value: &str) -> uuid::Uuid {
    let value = value.trim();
    uuid::Uuid::parse_str(value).unwrap_or_else(|_| stable_uuid_from_string(value))
}

/// =============================
/// Health Endpoint
/// =============================

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// =============================
/// Session Endpoints
/// =============================

async fn chat_handler(State(state): State<ApiState>, Json(req): Json<ChatRequest>) -> ApiResult {
    if req.message.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::error("Message must not be empty".into())),
        );
    }

    let session_id = match req.session_id.as_deref() {
        Some(value) if !value.trim().is_empty() => session_uuid(value),
        _ => uuid::Uuid::new_v4(),
    };
    info!(%session_id, "Chat message received");

    match state.orchestrator.handle_message(session_id, &req.message).await {
        Ok(outcome) => ok(outcome),
        Err(e) => fail(e),
    }
}

async fn resume_handler(
    State(state): State<ApiState>,
    Path(session_id): Path<String>,
    Json(payload): Json<ResumePayload>,
) -> ApiResult {
    let session_id = session_uuid(&session_id);
    info!(%session_id, "Confirmation answer received");

    match state.orchestrator.resume(session_id, payload).await {
        Ok(outcome) => ok(outcome),
        Err(e) => fail(e),
    }
}

async fn get_session(State(state): State<ApiState>, Path(session_id): Path<String>) -> ApiResult {
    let session_id = session_uuid(&session_id);

    match state.orchestrator.session(session_id).await {
        Ok(session) => ok(serde_json::json!({
            "session_id": session.session_id,
            "stage": session.stage,
            "deposit_amount": session.state.deposit_amount(),
            "deposit_duration": session.state.deposit_duration(),
            "confirmed": session.state.is_confirmed(),
            "rates": session.state.rates(),
            "messages": session.state.messages(),
            "created_at": session.created_at,
            "updated_at": session.updated_at,
        })),
        Err(e) => fail(e),
    }
}

async fn cancel_session(State(state): State<ApiState>, Path(session_id): Path<String>) -> ApiResult {
    let session_id = session_uuid(&session_id);

    match state.orchestrator.cancel(session_id).await {
        Ok(outcome) => ok(outcome),
        Err(e) => fail(e),
    }
}

/// =============================
/// Router
/// =============================

pub fn create_router(orchestrator: Arc<Orchestrator>) -> Router {
    let state = ApiState { orchestrator };

    Router::new()
        .route("/health", get(health))
        .route("/api/chat", post(chat_handler))
        .route("/api/sessions/:session_id", get(get_session).delete(cancel_session))
        .route("/api/sessions/:session_id/resume", post(resume_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// =============================
/// Server Startup
/// =============================

pub async fn start_server(
    orchestrator: Arc<Orchestrator>,
    port: u16,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let router = create_router(orchestrator);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    info!("API Server listening on http://0.0.0.0:{}", port);
    info!("Local: http://127.0.0.1:{}", port);

    axum::serve(listener, router).await?;

    Ok(())
}
