//! Conflict resolution
//!
//! Choices are stored per contested field. Once every field has one, the
//! writer's patch and then the chosen values are applied on top of the
//! current stored state and committed as a single `resolved` version, in
//! the same transaction that closes the conflict.
//!
//! A commit that lands after detection and touches the conflicted write's
//! fields makes the stored choices stale. The conflict is then re-captured
//! against the current version with its choices cleared.

use crate::error::{FlowError, Result};
use crate::events::FlowEvent;
use crate::flow::paths::{apply_step_patch, write_field};
use crate::flow::{
    ConflictStatus, EstimationFlow, FieldChoice, FieldPath, FlowConflict, FlowStatus, Resolution, StepData,
    VersionOrigin,
};
use crate::store::storage::{commit_step_data, now, Commit, FlowStore};
use crate::store::{conflicts, detector, ledger};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::SqliteConnection;
use std::collections::{BTreeMap, BTreeSet};

/// Side to take for every contested field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    KeepMine,
    KeepTheirs,
}

impl ResolutionStrategy {
    fn resolution(self) -> Resolution {
        match self {
            Self::KeepMine => Resolution::ManualKeepMine,
            Self::KeepTheirs => Resolution::ManualKeepTheirs,
        }
    }
}

/// Result of recording one or more field choices
#[derive(Debug, Clone, PartialEq)]
pub enum ResolveOutcome {
    /// Every field had a choice; the merged state was committed
    Committed { version: i64 },
    /// Choices stored; these paths still need one
    Pending { remaining: Vec<FieldPath> },
}

/// Step data produced by resolving `conflict` on top of `current`
pub fn merged_step_data(current: &StepData, conflict: &FlowConflict) -> StepData {
    let mut merged = current.clone();
    apply_step_patch(&mut merged, &conflict.step_id, &conflict.patch);
    for field in &conflict.conflicting_fields {
        if let Some(choice) = &field.resolved {
            write_field(&mut merged, &field.path, choice.value.clone());
        }
    }
    merged
}

impl FlowStore {
    /// Choose a value for one contested field
    pub async fn resolve_field(
        &self,
        conflict_id: &str,
        field: &FieldPath,
        chosen: Value,
        resolver_id: &str,
    ) -> Result<ResolveOutcome> {
        let mut choices = BTreeMap::new();
        choices.insert(field.clone(), chosen);
        self.resolve_fields(conflict_id, choices, resolver_id).await
    }

    /// Choose values for several contested fields at once
    pub async fn resolve_fields(
        &self,
        conflict_id: &str,
        choices: BTreeMap<FieldPath, Value>,
        resolver_id: &str,
    ) -> Result<ResolveOutcome> {
        if choices.is_empty() {
            return Err(FlowError::validation("no field choices given"));
        }
        self.resolve_with(conflict_id, resolver_id, Resolution::ManualPerField, |conflict| {
            let id = conflict.id.clone();
            for (path, value) in choices {
                let field = conflict
                    .conflicting_fields
                    .iter_mut()
                    .find(|f| f.path == path)
                    .ok_or_else(|| {
                        FlowError::validation(format!("'{}' is not contested in conflict {}", path, id))
                    })?;
                field.resolved = Some(FieldChoice { value });
            }
            Ok(())
        })
        .await
    }

    /// Take one side for every contested field and commit
    pub async fn resolve_all(
        &self,
        conflict_id: &str,
        strategy: ResolutionStrategy,
        resolver_id: &str,
    ) -> Result<ResolveOutcome> {
        self.resolve_with(conflict_id, resolver_id, strategy.resolution(), |conflict| {
            for field in &mut conflict.conflicting_fields {
                let value = match strategy {
                    ResolutionStrategy::KeepMine => field.mine.clone(),
                    ResolutionStrategy::KeepTheirs => field.theirs.clone(),
                };
                field.resolved = Some(FieldChoice { value });
            }
            Ok(())
        })
        .await
    }

    async fn resolve_with<F>(
        &self,
        conflict_id: &str,
        resolver_id: &str,
        resolution: Resolution,
        choose: F,
    ) -> Result<ResolveOutcome>
    where
        F: FnOnce(&mut FlowConflict) -> Result<()>,
    {
        if resolver_id.trim().is_empty() {
            return Err(FlowError::validation("resolver id is required"));
        }

        let flow_id = self
            .bounded(async {
                let mut conn = self.pool().acquire().await?;
                conflicts::flow_of(&mut conn, conflict_id).await
            })
            .await?
            .ok_or_else(|| FlowError::ConflictNotFound {
                conflict_id: conflict_id.to_string(),
            })?;

        let _guard = self.locks().acquire(&flow_id).await;
        let result = self
            .bounded(async {
                let mut tx = self.pool().begin().await?;
                let stored = self.lock_flow_row(&mut tx, &flow_id).await?;
                let mut conflict = conflicts::fetch(&mut tx, conflict_id)
                    .await?
                    .ok_or_else(|| FlowError::ConflictNotFound {
                        conflict_id: conflict_id.to_string(),
                    })?;

                if conflict.status == ConflictStatus::Resolved {
                    return Err(FlowError::validation(format!("conflict {} is already resolved", conflict.id)));
                }
                if !stored.status.is_open() {
                    return Err(FlowError::InvalidTransition {
                        flow_id: stored.id.clone(),
                        from: stored.status.to_string(),
                        to: FlowStatus::Active.to_string(),
                    });
                }

                let moved = self.moved_since_detection(&mut tx, &stored, &conflict).await?;
                if !moved.is_empty() {
                    let mut contested: BTreeSet<FieldPath> = conflict.contested_paths().into_iter().collect();
                    contested.extend(moved);
                    let contested: Vec<FieldPath> = contested.into_iter().collect();
                    conflict.conflicting_fields =
                        detector::conflict_fields(&stored.step_data, &conflict.step_id, &conflict.patch, &contested);
                    conflict.current_version_at_detection = stored.version;
                    conflicts::update(&mut tx, &conflict).await?;
                    tx.commit().await?;

                    tracing::warn!(
                        "⚠️ Conflict {} on flow {} went stale, re-captured at version {} with {} fields",
                        conflict.id,
                        flow_id,
                        stored.version,
                        contested.len()
                    );
                    let event = FlowEvent::ConflictDetected {
                        flow_id: flow_id.clone(),
                        conflict_id: conflict.id.clone(),
                        author_id: conflict.author_id.clone(),
                        base_version: conflict.base_version,
                        detected_at_version: stored.version,
                        kind: conflict.kind,
                        fields: contested,
                    };
                    let remaining = conflict.unresolved_paths();
                    return Ok((ResolveOutcome::Pending { remaining }, vec![event]));
                }

                choose(&mut conflict)?;

                let remaining = conflict.unresolved_paths();
                if !remaining.is_empty() {
                    conflicts::update(&mut tx, &conflict).await?;
                    tx.commit().await?;
                    tracing::debug!(
                        "📝 Conflict {} recorded choices, {} fields remaining",
                        conflict.id,
                        remaining.len()
                    );
                    return Ok((ResolveOutcome::Pending { remaining }, Vec::new()));
                }

                let mut changed: BTreeSet<FieldPath> =
                    self.schema().changed_fields(&conflict.step_id, &conflict.patch)?;
                changed.extend(conflict.contested_paths());

                let (version, mut events) = commit_step_data(
                    &mut tx,
                    &stored,
                    Commit {
                        step_data: merged_step_data(&stored.step_data, &conflict),
                        current_step: stored.current_step,
                        changed: &changed,
                        author_id: resolver_id,
                        origin: VersionOrigin::Resolved,
                    },
                )
                .await?;

                conflict.status = ConflictStatus::Resolved;
                conflict.resolution = Some(resolution);
                conflict.resolved_by = Some(resolver_id.to_string());
                conflict.resolved_at = Some(now());
                conflicts::update(&mut tx, &conflict).await?;
                tx.commit().await?;

                tracing::info!(
                    "🤝 Conflict {} on flow {} resolved as {} by {} at version {}",
                    conflict.id,
                    flow_id,
                    resolution.as_str(),
                    resolver_id,
                    version
                );
                events.push(FlowEvent::ConflictResolved {
                    flow_id: flow_id.clone(),
                    conflict_id: conflict.id.clone(),
                    version,
                    resolution,
                    resolved_by: resolver_id.to_string(),
                });
                Ok((ResolveOutcome::Committed { version }, events))
            })
            .await;

        self.cache_invalidate(&flow_id);
        let (outcome, events) = result?;
        self.publish(events);
        Ok(outcome)
    }

    /// Fields of the conflicted write that later commits changed
    async fn moved_since_detection(
        &self,
        conn: &mut SqliteConnection,
        stored: &EstimationFlow,
        conflict: &FlowConflict,
    ) -> Result<Vec<FieldPath>> {
        if stored.version <= conflict.current_version_at_detection {
            return Ok(Vec::new());
        }
        let mut touched = self.schema().changed_fields(&conflict.step_id, &conflict.patch)?;
        touched.extend(conflict.contested_paths());

        let moved =
            ledger::changed_fields_since(conn, &stored.id, conflict.current_version_at_detection, stored.version)
                .await?;
        Ok(match moved {
            Some(moved) => detector::overlap(&moved, &touched),
            // Rows are pinned by the pending conflict; treat a gap as all moved
            None => touched.into_iter().collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{ConflictField, ConflictKind};
    use chrono::Utc;
    use serde_json::json;

    fn conflict_with(fields: Vec<ConflictField>, patch: Value) -> FlowConflict {
        FlowConflict {
            id: "c1".into(),
            flow_id: "f1".into(),
            base_version: 5,
            current_version_at_detection: 6,
            step_id: "expenses".into(),
            author_id: "y".into(),
            patch: patch.as_object().unwrap().clone(),
            kind: ConflictKind::FieldOverlap,
            conflicting_fields: fields,
            status: ConflictStatus::Pending,
            resolution: None,
            resolved_by: None,
            resolved_at: None,
            created_at: Utc::now(),
        }
    }

    fn current() -> StepData {
        let mut data = StepData::new();
        data.insert("expenses".into(), json!({ "materials": 500, "equipment": 40 }));
        data
    }

    #[test]
    fn keep_theirs_restores_stored_value_but_keeps_uncontested_edits() {
        let conflict = conflict_with(
            vec![ConflictField {
                path: FieldPath::parse("expenses.materials").unwrap(),
                theirs: json!(500),
                mine: json!(750),
                resolved: Some(FieldChoice { value: json!(500) }),
            }],
            json!({ "materials": 750, "labor": 12 }),
        );
        let merged = merged_step_data(&current(), &conflict);
        assert_eq!(merged["expenses"], json!({ "materials": 500, "labor": 12, "equipment": 40 }));
    }

    #[test]
    fn null_choice_removes_field() {
        let conflict = conflict_with(
            vec![ConflictField {
                path: FieldPath::parse("expenses.materials").unwrap(),
                theirs: json!(500),
                mine: json!(750),
                resolved: Some(FieldChoice { value: Value::Null }),
            }],
            json!({ "materials": 750 }),
        );
        let merged = merged_step_data(&current(), &conflict);
        assert_eq!(merged["expenses"], json!({ "equipment": 40 }));
    }

    #[test]
    fn strategy_maps_to_recorded_resolution() {
        assert_eq!(ResolutionStrategy::KeepMine.resolution(), Resolution::ManualKeepMine);
        assert_eq!(ResolutionStrategy::KeepTheirs.resolution(), Resolution::ManualKeepTheirs);
        let parsed: ResolutionStrategy = serde_json::from_value(json!("keep_theirs")).unwrap();
        assert_eq!(parsed, ResolutionStrategy::KeepTheirs);
    }
}
