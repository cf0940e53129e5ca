//! Flow endpoints
//!
//! Writes identify the caller through the `x-author-id` header. A save that
//! races another writer on the same fields is answered with 202 and the
//! pending conflict, not an error.

use crate::api::{author_id, ApiError, AppState};
use crate::completion::{estimate_flow, StepCompletion};
use crate::flow::{FlowSnapshot, FlowVersion, SaveOutcome, SaveRequest, VersionOrigin};
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateFlowRequest {
    pub owner_id: String,
}

/// Body of `PUT /api/flows/{id}`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveStepRequest {
    pub base_version: i64,
    pub step_id: String,
    pub patch: Map<String, Value>,
}

#[derive(Debug, Serialize)]
pub struct CommittedResponse {
    pub version: i64,
    pub origin: VersionOrigin,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    pub base_version: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionResponse {
    pub flow_id: String,
    pub steps: Vec<StepCompletion>,
}

/// POST /api/flows
/// Body: { "ownerId": "..." }
pub async fn create_flow(
    State(state): State<AppState>,
    Json(payload): Json<CreateFlowRequest>,
) -> Result<(StatusCode, Json<FlowSnapshot>), ApiError> {
    let snapshot = state.store.create(&payload.owner_id).await?;
    Ok((StatusCode::CREATED, Json(snapshot)))
}

/// GET /api/flows/{id}
/// Returns: { "flow": {...}, "version": n }
pub async fn get_flow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<FlowSnapshot>, ApiError> {
    Ok(Json(state.store.get(&id).await?))
}

/// PUT /api/flows/{id}
/// Body: { "baseVersion": n, "stepId": "...", "patch": {...} }
/// Returns: 200 { "version", "origin" } or 202 { "conflict" }
pub async fn save_flow(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(payload): Json<SaveStepRequest>,
) -> Result<Response, ApiError> {
    let author_id = author_id(&headers)?;
    let outcome = state
        .store
        .save(SaveRequest {
            flow_id: id,
            base_version: payload.base_version,
            step_id: payload.step_id,
            patch: payload.patch,
            author_id,
        })
        .await?;

    Ok(match outcome {
        SaveOutcome::Committed { version, origin } => {
            (StatusCode::OK, Json(CommittedResponse { version, origin })).into_response()
        }
        SaveOutcome::Conflict(conflict) => {
            (StatusCode::ACCEPTED, Json(json!({ "conflict": conflict }))).into_response()
        }
    })
}

/// POST /api/flows/{id}/submit
/// Body: { "baseVersion": n }
pub async fn submit_flow(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(payload): Json<SubmitRequest>,
) -> Result<Json<FlowSnapshot>, ApiError> {
    let actor = author_id(&headers)?;
    Ok(Json(state.store.submit(&id, payload.base_version, &actor).await?))
}

/// POST /api/flows/{id}/abandon
pub async fn abandon_flow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<FlowSnapshot>, ApiError> {
    Ok(Json(state.store.abandon(&id).await?))
}

/// GET /api/flows/{id}/versions
/// Returns: { "versions": [...] } oldest first, without snapshots
pub async fn list_versions(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let versions = state.store.versions(&id).await?;
    Ok(Json(json!({ "versions": versions })))
}

/// GET /api/flows/{id}/versions/{version}
pub async fn get_version(
    State(state): State<AppState>,
    Path((id, version)): Path<(String, i64)>,
) -> Result<Json<FlowVersion>, ApiError> {
    Ok(Json(state.store.version(&id, version).await?))
}

/// GET /api/flows/{id}/completion
pub async fn get_completion(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<CompletionResponse>, ApiError> {
    let snapshot = state.store.get(&id).await?;
    let steps = estimate_flow(state.store.schema(), &snapshot.flow);
    Ok(Json(CompletionResponse { flow_id: id, steps }))
}
