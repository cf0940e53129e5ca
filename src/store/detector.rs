//! Field-level conflict detection
//!
//! Decides what happens to a write whose base version is behind the stored
//! version: rebase it automatically when it touches nothing the other
//! writers changed, otherwise park it as a conflict. These functions are
//! pure; the store calls them inside the same transaction as the CAS.

use crate::flow::paths::{apply_step_patch, read_field_or_null};
use crate::flow::{ConflictField, ConflictKind, FieldPath, StepData};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

/// What to do with a stale write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// No overlap: apply on top of the current state
    Rebase,
    /// Overlap (or no reliable diff): hold the write for resolution
    Conflict {
        kind: ConflictKind,
        contested: Vec<FieldPath>,
    },
}

/// Whether the ledger still holds every row needed to diff from `base_version`
pub fn within_retention(base_version: i64, retention_floor: i64) -> bool {
    base_version >= retention_floor
}

/// Writer paths that overlap anything changed on the server since the base
pub fn overlap(server_changed: &BTreeSet<FieldPath>, writer_changed: &BTreeSet<FieldPath>) -> Vec<FieldPath> {
    writer_changed
        .iter()
        .filter(|mine| server_changed.iter().any(|theirs| theirs.overlaps(mine)))
        .cloned()
        .collect()
}

/// Verdict for a write whose base is within retention
pub fn assess(server_changed: &BTreeSet<FieldPath>, writer_changed: &BTreeSet<FieldPath>) -> Verdict {
    let contested = overlap(server_changed, writer_changed);
    if contested.is_empty() {
        tracing::debug!(
            "🔀 No overlap between {} server and {} writer fields, rebasing",
            server_changed.len(),
            writer_changed.len()
        );
        Verdict::Rebase
    } else {
        tracing::debug!("⚔️ {} contested fields", contested.len());
        Verdict::Conflict {
            kind: ConflictKind::FieldOverlap,
            contested,
        }
    }
}

/// Full-document conflict for a base older than the retention floor
pub fn retention_gap(writer_changed: &BTreeSet<FieldPath>) -> Verdict {
    Verdict::Conflict {
        kind: ConflictKind::RetentionGap,
        contested: writer_changed.iter().cloned().collect(),
    }
}

/// Both sides of every contested path, as of detection time
pub fn conflict_fields(
    current: &StepData,
    step_id: &str,
    patch: &Map<String, Value>,
    contested: &[FieldPath],
) -> Vec<ConflictField> {
    let mut proposed = current.clone();
    apply_step_patch(&mut proposed, step_id, patch);
    contested
        .iter()
        .map(|path| ConflictField {
            path: path.clone(),
            theirs: read_field_or_null(current, path),
            mine: read_field_or_null(&proposed, path),
            resolved: None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn paths(raw: &[&str]) -> BTreeSet<FieldPath> {
        raw.iter().map(|p| FieldPath::parse(p).unwrap()).collect()
    }

    #[test]
    fn disjoint_fields_rebase() {
        let verdict = assess(&paths(&["duration.startDate"]), &paths(&["expenses.materials"]));
        assert_eq!(verdict, Verdict::Rebase);
    }

    #[test]
    fn shared_field_conflicts() {
        let verdict = assess(
            &paths(&["expenses.materials", "duration.startDate"]),
            &paths(&["expenses.materials", "expenses.labor"]),
        );
        assert_eq!(
            verdict,
            Verdict::Conflict {
                kind: ConflictKind::FieldOverlap,
                contested: vec![FieldPath::parse("expenses.materials").unwrap()],
            }
        );
    }

    #[test]
    fn parent_and_child_paths_conflict() {
        let verdict = assess(&paths(&["expenses"]), &paths(&["expenses.labor"]));
        assert!(matches!(verdict, Verdict::Conflict { .. }));
    }

    #[test]
    fn retention_gap_contests_everything() {
        assert!(!within_retention(2, 5));
        assert!(within_retention(5, 5));
        let Verdict::Conflict { kind, contested } = retention_gap(&paths(&["a.x", "b.y"])) else {
            panic!("expected conflict");
        };
        assert_eq!(kind, ConflictKind::RetentionGap);
        assert_eq!(contested.len(), 2);
    }

    #[test]
    fn conflict_fields_capture_both_sides() {
        let mut current = StepData::new();
        current.insert("expenses".into(), json!({ "materials": 500 }));
        let patch = json!({ "materials": 750, "labor": 10 }).as_object().unwrap().clone();
        let contested = vec![FieldPath::parse("expenses.materials").unwrap()];
        let fields = conflict_fields(&current, "expenses", &patch, &contested);
        assert_eq!(fields.len(), 1);
        assert_eq!(fields[0].theirs, json!(500));
        assert_eq!(fields[0].mine, json!(750));
        assert!(fields[0].resolved.is_none());
    }
}
