//! HTTP API layer
//!
//! REST endpoints over the flow store:
//! - Flow creation, reads, step saves and status transitions
//! - Pending conflicts and their resolution
//! - Version history and completion estimates

pub mod conflicts;
pub mod flows;

use crate::error::FlowError;
use crate::store::FlowStore;
use axum::{
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde_json::json;
use std::sync::Arc;

/// Header carrying the caller's identity, set by the authentication layer
pub const AUTHOR_HEADER: &str = "x-author-id";

/// Application state shared by every handler
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<FlowStore>,
}

/// Create the flow API routes
pub fn create_flow_routes() -> Router<AppState> {
    Router::new()
        .route("/api/flows", post(flows::create_flow))
        .route("/api/flows/{id}", get(flows::get_flow).put(flows::save_flow))
        .route("/api/flows/{id}/submit", post(flows::submit_flow))
        .route("/api/flows/{id}/abandon", post(flows::abandon_flow))
        .route("/api/flows/{id}/versions", get(flows::list_versions))
        .route("/api/flows/{id}/versions/{version}", get(flows::get_version))
        .route("/api/flows/{id}/completion", get(flows::get_completion))
        .route("/api/flows/{id}/conflicts", get(conflicts::list_conflicts))
        .route(
            "/api/flows/{id}/conflicts/{conflict_id}/resolve",
            post(conflicts::resolve_conflict),
        )
}

/// A `FlowError` rendered as an HTTP response
#[derive(Debug)]
pub struct ApiError(pub FlowError);

impl From<FlowError> for ApiError {
    fn from(err: FlowError) -> Self {
        Self(err)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            FlowError::NotFound { .. }
            | FlowError::ConflictNotFound { .. }
            | FlowError::VersionNotFound { .. } => StatusCode::NOT_FOUND,
            FlowError::Validation { .. } => StatusCode::BAD_REQUEST,
            FlowError::InvalidTransition { .. } | FlowError::StaleVersion { .. } => StatusCode::CONFLICT,
            FlowError::StorageTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            FlowError::StorageUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            FlowError::Corrupt { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("❌ Request failed: {}", self.0);
        } else {
            tracing::debug!("Request rejected ({}): {}", status, self.0);
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

/// Caller identity from the `x-author-id` header
pub fn author_id(headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get(AUTHOR_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ApiError(FlowError::validation(format!("missing {} header", AUTHOR_HEADER))))
}
