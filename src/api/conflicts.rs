//! Conflict endpoints

use crate::api::{author_id, ApiError, AppState};
use crate::error::FlowError;
use crate::flow::FieldPath;
use crate::store::{ResolutionStrategy, ResolveOutcome};
use axum::{
    extract::{Path, State},
    http::HeaderMap,
    response::Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// Body of a resolve call: one strategy for everything, or per-field values
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveRequest {
    #[serde(default)]
    pub strategy: Option<ResolutionStrategy>,
    #[serde(default)]
    pub per_field: Option<BTreeMap<String, Value>>,
}

/// GET /api/flows/{id}/conflicts
/// Returns: { "conflicts": [...] } pending only, oldest first
pub async fn list_conflicts(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let conflicts = state.store.pending_conflicts(&id).await?;
    Ok(Json(json!({ "conflicts": conflicts })))
}

/// POST /api/flows/{id}/conflicts/{conflict_id}/resolve
/// Body: { "strategy": "keep_mine" | "keep_theirs" } or { "perField": { "<path>": value } }
/// Returns: { "version": n } or { "remaining": [paths] }
pub async fn resolve_conflict(
    State(state): State<AppState>,
    Path((id, conflict_id)): Path<(String, String)>,
    headers: HeaderMap,
    Json(payload): Json<ResolveRequest>,
) -> Result<Json<Value>, ApiError> {
    let resolver = author_id(&headers)?;

    let conflict = state.store.conflict(&conflict_id).await?;
    if conflict.flow_id != id {
        return Err(FlowError::ConflictNotFound { conflict_id }.into());
    }

    let outcome = match (payload.strategy, payload.per_field) {
        (Some(strategy), None) => state.store.resolve_all(&conflict_id, strategy, &resolver).await?,
        (None, Some(per_field)) => {
            let choices = per_field
                .into_iter()
                .map(|(path, value)| Ok((FieldPath::parse(&path)?, value)))
                .collect::<Result<BTreeMap<_, _>, FlowError>>()?;
            state.store.resolve_fields(&conflict_id, choices, &resolver).await?
        }
        _ => {
            return Err(FlowError::validation("exactly one of 'strategy' or 'perField' is required").into());
        }
    };

    Ok(Json(match outcome {
        ResolveOutcome::Committed { version } => json!({ "version": version }),
        ResolveOutcome::Pending { remaining } => json!({ "remaining": remaining }),
    }))
}
