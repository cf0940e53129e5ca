//! Conflict record persistence
//!
//! Rows in `flow_conflicts`. Contested fields and the writer's patch are JSON
//! columns; the fingerprint column makes resubmitting the same conflicting
//! write return the existing pending record.

use crate::error::{FlowError, Result};
use crate::flow::types::parse_timestamp;
use crate::flow::{ConflictKind, ConflictStatus, FlowConflict, Resolution, SaveRequest};
use crate::store::storage::{timestamp, FlowStore};
use serde_json::{json, Value};
use sqlx::{sqlite::SqliteRow, Row, SqliteConnection};

const CONFLICT_COLUMNS: &str = "id, flow_id, base_version, detected_version, step_id, author_id, patch, kind, \
     fields, status, resolution, resolved_by, resolved_at, created_at";

/// Canonical identity of a write (object keys serialize sorted)
pub(crate) fn fingerprint(request: &SaveRequest) -> Result<String> {
    Ok(serde_json::to_string(&json!({
        "base": request.base_version,
        "step": request.step_id,
        "author": request.author_id,
        "patch": Value::Object(request.patch.clone()),
    }))?)
}

pub(crate) async fn insert(conn: &mut SqliteConnection, conflict: &FlowConflict, fingerprint: &str) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO flow_conflicts
            (id, flow_id, base_version, detected_version, step_id, author_id, patch, kind,
             fields, fingerprint, status, resolution, resolved_by, resolved_at, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL, NULL, NULL, ?)
        "#,
    )
    .bind(&conflict.id)
    .bind(&conflict.flow_id)
    .bind(conflict.base_version)
    .bind(conflict.current_version_at_detection)
    .bind(&conflict.step_id)
    .bind(&conflict.author_id)
    .bind(serde_json::to_string(&conflict.patch)?)
    .bind(conflict.kind.as_str())
    .bind(serde_json::to_string(&conflict.conflicting_fields)?)
    .bind(fingerprint)
    .bind(conflict.status.as_str())
    .bind(timestamp(conflict.created_at))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Persist field choices and (when closed) the resolution columns
pub(crate) async fn update(conn: &mut SqliteConnection, conflict: &FlowConflict) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE flow_conflicts
        SET fields = ?, detected_version = ?, status = ?, resolution = ?, resolved_by = ?, resolved_at = ?
        WHERE id = ?
        "#,
    )
    .bind(serde_json::to_string(&conflict.conflicting_fields)?)
    .bind(conflict.current_version_at_detection)
    .bind(conflict.status.as_str())
    .bind(conflict.resolution.map(|r| r.as_str()))
    .bind(conflict.resolved_by.as_deref())
    .bind(conflict.resolved_at.map(timestamp))
    .bind(&conflict.id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub(crate) async fn fetch(conn: &mut SqliteConnection, conflict_id: &str) -> Result<Option<FlowConflict>> {
    let row = sqlx::query(&format!("SELECT {} FROM flow_conflicts WHERE id = ?", CONFLICT_COLUMNS))
        .bind(conflict_id)
        .fetch_optional(&mut *conn)
        .await?;
    row.as_ref().map(decode).transpose()
}

pub(crate) async fn list_pending(conn: &mut SqliteConnection, flow_id: &str) -> Result<Vec<FlowConflict>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM flow_conflicts WHERE flow_id = ? AND status = 'pending' ORDER BY created_at ASC",
        CONFLICT_COLUMNS
    ))
    .bind(flow_id)
    .fetch_all(&mut *conn)
    .await?;
    rows.iter().map(decode).collect()
}

pub(crate) async fn find_pending_by_fingerprint(
    conn: &mut SqliteConnection,
    flow_id: &str,
    fingerprint: &str,
) -> Result<Option<FlowConflict>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM flow_conflicts WHERE flow_id = ? AND fingerprint = ? AND status = 'pending'",
        CONFLICT_COLUMNS
    ))
    .bind(flow_id)
    .bind(fingerprint)
    .fetch_optional(&mut *conn)
    .await?;
    row.as_ref().map(decode).transpose()
}

/// Flow a conflict belongs to
pub(crate) async fn flow_of(conn: &mut SqliteConnection, conflict_id: &str) -> Result<Option<String>> {
    let row = sqlx::query("SELECT flow_id FROM flow_conflicts WHERE id = ?")
        .bind(conflict_id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(row.map(|r| r.try_get::<String, _>("flow_id")).transpose()?)
}

/// Smallest base version referenced by a pending conflict
pub(crate) async fn min_pending_base(conn: &mut SqliteConnection, flow_id: &str) -> Result<Option<i64>> {
    let row = sqlx::query(
        "SELECT MIN(base_version) AS pinned FROM flow_conflicts WHERE flow_id = ? AND status = 'pending'",
    )
    .bind(flow_id)
    .fetch_one(&mut *conn)
    .await?;
    Ok(row.try_get::<Option<i64>, _>("pinned")?)
}

pub(crate) async fn count_pending(conn: &mut SqliteConnection, flow_id: &str) -> Result<i64> {
    let row = sqlx::query("SELECT COUNT(*) AS pending FROM flow_conflicts WHERE flow_id = ? AND status = 'pending'")
        .bind(flow_id)
        .fetch_one(&mut *conn)
        .await?;
    Ok(row.try_get("pending")?)
}

fn decode(row: &SqliteRow) -> Result<FlowConflict> {
    let patch: String = row.try_get("patch")?;
    let fields: String = row.try_get("fields")?;
    let kind: String = row.try_get("kind")?;
    let status: String = row.try_get("status")?;
    let resolution: Option<String> = row.try_get("resolution")?;
    let resolved_at: Option<String> = row.try_get("resolved_at")?;
    let created_at: String = row.try_get("created_at")?;

    Ok(FlowConflict {
        id: row.try_get("id")?,
        flow_id: row.try_get("flow_id")?,
        base_version: row.try_get("base_version")?,
        current_version_at_detection: row.try_get("detected_version")?,
        step_id: row.try_get("step_id")?,
        author_id: row.try_get("author_id")?,
        patch: serde_json::from_str(&patch)?,
        kind: ConflictKind::parse(&kind)?,
        conflicting_fields: serde_json::from_str(&fields)?,
        status: ConflictStatus::parse(&status)?,
        resolution: resolution.as_deref().map(Resolution::parse).transpose()?,
        resolved_by: row.try_get("resolved_by")?,
        resolved_at: resolved_at.as_deref().map(parse_timestamp).transpose()?,
        created_at: parse_timestamp(&created_at)?,
    })
}

impl FlowStore {
    /// Pending conflicts of a flow, oldest first
    pub async fn pending_conflicts(&self, flow_id: &str) -> Result<Vec<FlowConflict>> {
        self.bounded(async {
            let mut conn = self.pool().acquire().await?;
            self.ensure_exists(&mut conn, flow_id).await?;
            list_pending(&mut conn, flow_id).await
        })
        .await
    }

    /// Any conflict by id, pending or resolved
    pub async fn conflict(&self, conflict_id: &str) -> Result<FlowConflict> {
        self.bounded(async {
            let mut conn = self.pool().acquire().await?;
            fetch(&mut conn, conflict_id)
                .await?
                .ok_or_else(|| FlowError::ConflictNotFound {
                    conflict_id: conflict_id.to_string(),
                })
        })
        .await
    }
}
