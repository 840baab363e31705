//! HTTP routes for the state token API and health reporting.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};
use uuid::Uuid;

use super::middleware::{with_rate_limit, RateGuard};
use crate::ratelimit::{Environment, RequestClass};
use crate::state::{EphemeralStateStore, StateError};

const API_KEY_HEADER: &str = "x-api-key";

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub guard: RateGuard,
    pub states: EphemeralStateStore,
    /// When set, the state endpoints require a matching `X-API-Key`
    pub api_key: Option<Arc<str>>,
    pub environment: Environment,
}

/// Build the service router.
pub fn router(state: AppState) -> Router {
    let guard = state.guard.clone();

    Router::new()
        .route("/health", get(health))
        .route(
            "/v1/state",
            with_rate_limit(post(issue_state), RequestClass::Auth, &guard),
        )
        .route(
            "/v1/state/consume",
            with_rate_limit(post(consume_state), RequestClass::Auth, &guard),
        )
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct IssueStateRequest {
    pub subject: String,
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct IssueStateResponse {
    pub state: String,
    pub session_id: String,
    /// Epoch milliseconds
    pub expires_at: u64,
}

#[derive(Debug, Deserialize)]
pub struct ConsumeStateRequest {
    pub state: String,
}

#[derive(Debug, Serialize)]
pub struct ConsumeStateResponse {
    pub subject: String,
    pub session_id: String,
}

/// Errors surfaced by the handlers.
#[derive(Debug)]
pub enum ApiError {
    Unauthorized,
    State(StateError),
}

impl From<StateError> for ApiError {
    fn from(e: StateError) -> Self {
        ApiError::State(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized".to_string()),
            ApiError::State(StateError::Invalid) => (
                StatusCode::BAD_REQUEST,
                "Invalid or expired state. Please restart the flow.".to_string(),
            ),
            ApiError::State(StateError::BadRequest(reason)) => {
                (StatusCode::BAD_REQUEST, reason.to_string())
            }
            ApiError::State(StateError::Policy(e)) => {
                warn!(error = %e, "State policy misconfigured");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal error".to_string(),
                )
            }
            ApiError::State(StateError::Backend(e)) => {
                warn!(error = %e, "State store unavailable");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "Service temporarily unavailable".to_string(),
                )
            }
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let controller = state.guard.controller();
    let backend = if controller.connection().is_healthy() {
        "healthy"
    } else {
        "degraded"
    };

    Json(json!({
        "status": "ok",
        "environment": state.environment.as_str(),
        "backend": backend,
        "fallback_keys": controller.fallback().len(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn issue_state(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<IssueStateRequest>,
) -> Result<Json<IssueStateResponse>, ApiError> {
    authorize(&state, &headers)?;

    let session_id = request
        .session_id
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let issued = state
        .states
        .issue_for(RequestClass::Auth, &request.subject, &session_id)
        .await?;

    Ok(Json(IssueStateResponse {
        state: issued.token,
        session_id: issued.session_id,
        expires_at: issued.expires_at_ms,
    }))
}

async fn consume_state(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ConsumeStateRequest>,
) -> Result<Json<ConsumeStateResponse>, ApiError> {
    authorize(&state, &headers)?;

    let claim = state.states.consume(request.state.trim()).await?;
    Ok(Json(ConsumeStateResponse {
        subject: claim.subject,
        session_id: claim.session_id,
    }))
}

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = state.api_key.as_deref() else {
        return Ok(());
    };

    let provided = headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok());
    if provided == Some(expected) {
        Ok(())
    } else {
        debug!("Rejected request with missing or wrong API key");
        Err(ApiError::Unauthorized)
    }
}
