//! Append-only version ledger
//!
//! One immutable row per committed version with the full step data and the
//! field paths touched relative to the previous version. Diffing between a
//! writer's base and the current version is the union of the intervening
//! change summaries. Pruning only ever removes a prefix of old rows.

use crate::error::{FlowError, Result};
use crate::flow::types::parse_timestamp;
use crate::flow::{FieldPath, FlowVersion, StepData, VersionOrigin};
use crate::store::storage::{timestamp, FlowStore};
use crate::store::conflicts;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqliteConnection};
use std::collections::BTreeSet;

/// Fields of one ledger row to append
pub(crate) struct LedgerEntry<'a> {
    pub flow_id: &'a str,
    pub version: i64,
    pub snapshot: &'a StepData,
    pub change_summary: &'a BTreeSet<FieldPath>,
    pub author_id: &'a str,
    pub origin: VersionOrigin,
    pub saved_at: DateTime<Utc>,
}

/// Append a row; the primary key rejects a second row for the same version
pub(crate) async fn append(conn: &mut SqliteConnection, entry: LedgerEntry<'_>) -> Result<()> {
    let snapshot_json = serde_json::to_string(entry.snapshot)?;
    let summary_json = serde_json::to_string(entry.change_summary)?;

    sqlx::query(
        r#"
        INSERT INTO flow_versions (flow_id, version, snapshot, change_summary, author_id, origin, saved_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(entry.flow_id)
    .bind(entry.version)
    .bind(&snapshot_json)
    .bind(&summary_json)
    .bind(entry.author_id)
    .bind(entry.origin.as_str())
    .bind(timestamp(entry.saved_at))
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Union of change summaries for versions in `(from_exclusive, to_inclusive]`
///
/// Returns `None` when any row in the range is missing, so callers can fall
/// back to treating the write as a full-document conflict.
pub(crate) async fn changed_fields_since(
    conn: &mut SqliteConnection,
    flow_id: &str,
    from_exclusive: i64,
    to_inclusive: i64,
) -> Result<Option<BTreeSet<FieldPath>>> {
    if to_inclusive <= from_exclusive {
        return Ok(Some(BTreeSet::new()));
    }

    let rows = sqlx::query(
        "SELECT change_summary FROM flow_versions WHERE flow_id = ? AND version > ? AND version <= ?",
    )
    .bind(flow_id)
    .bind(from_exclusive)
    .bind(to_inclusive)
    .fetch_all(&mut *conn)
    .await?;

    if rows.len() as i64 != to_inclusive - from_exclusive {
        tracing::warn!(
            "⚠️ Ledger for flow {} is missing rows in ({}, {}]: found {}",
            flow_id,
            from_exclusive,
            to_inclusive,
            rows.len()
        );
        return Ok(None);
    }

    let mut changed = BTreeSet::new();
    for row in rows {
        let summary: String = row.try_get("change_summary")?;
        let fields: BTreeSet<FieldPath> = serde_json::from_str(&summary)?;
        changed.extend(fields);
    }
    Ok(Some(changed))
}

/// Oldest version still retained, `None` for an unknown flow
pub(crate) async fn retention_floor(conn: &mut SqliteConnection, flow_id: &str) -> Result<Option<i64>> {
    let row = sqlx::query("SELECT MIN(version) AS floor FROM flow_versions WHERE flow_id = ?")
        .bind(flow_id)
        .fetch_one(&mut *conn)
        .await?;
    Ok(row.try_get::<Option<i64>, _>("floor")?)
}

/// Version history in ascending order, without snapshots
pub(crate) async fn list(conn: &mut SqliteConnection, flow_id: &str) -> Result<Vec<FlowVersion>> {
    let rows = sqlx::query(
        r#"
        SELECT flow_id, version, change_summary, author_id, origin, saved_at
        FROM flow_versions WHERE flow_id = ? ORDER BY version ASC
        "#,
    )
    .bind(flow_id)
    .fetch_all(&mut *conn)
    .await?;

    rows.iter().map(|row| decode_version(row, None)).collect()
}

/// One ledger row including its snapshot
pub(crate) async fn fetch(conn: &mut SqliteConnection, flow_id: &str, version: i64) -> Result<Option<FlowVersion>> {
    let row = sqlx::query(
        r#"
        SELECT flow_id, version, snapshot, change_summary, author_id, origin, saved_at
        FROM flow_versions WHERE flow_id = ? AND version = ?
        "#,
    )
    .bind(flow_id)
    .bind(version)
    .fetch_optional(&mut *conn)
    .await?;

    match row {
        Some(row) => {
            let snapshot_json: String = row.try_get("snapshot")?;
            let snapshot: StepData = serde_json::from_str(&snapshot_json)?;
            Ok(Some(decode_version(&row, Some(snapshot))?))
        }
        None => Ok(None),
    }
}

/// Where a prune may cut: keep the newest `keep` rows, the current version,
/// and everything from the oldest pending conflict base upwards
pub(crate) fn prune_floor(current_version: i64, keep: i64, pinned_base: Option<i64>) -> i64 {
    let mut floor = (current_version - keep.max(1) + 1).max(0);
    if let Some(pinned) = pinned_base {
        floor = floor.min(pinned);
    }
    floor.min(current_version)
}

/// Delete every row strictly below `floor`
pub(crate) async fn delete_below(conn: &mut SqliteConnection, flow_id: &str, floor: i64) -> Result<u64> {
    let result = sqlx::query("DELETE FROM flow_versions WHERE flow_id = ? AND version < ?")
        .bind(flow_id)
        .bind(floor)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected())
}

fn decode_version(row: &sqlx::sqlite::SqliteRow, snapshot: Option<StepData>) -> Result<FlowVersion> {
    let summary: String = row.try_get("change_summary")?;
    let origin: String = row.try_get("origin")?;
    let saved_at: String = row.try_get("saved_at")?;
    Ok(FlowVersion {
        flow_id: row.try_get("flow_id")?,
        version: row.try_get("version")?,
        snapshot,
        author_id: row.try_get("author_id")?,
        saved_at: parse_timestamp(&saved_at)?,
        change_summary: serde_json::from_str(&summary)?,
        origin: VersionOrigin::parse(&origin)?,
    })
}

impl FlowStore {
    /// Ordered version history of a flow
    pub async fn versions(&self, flow_id: &str) -> Result<Vec<FlowVersion>> {
        self.bounded(async {
            let mut conn = self.pool().acquire().await?;
            self.ensure_exists(&mut conn, flow_id).await?;
            list(&mut conn, flow_id).await
        })
        .await
    }

    /// A single retained version with its snapshot
    pub async fn version(&self, flow_id: &str, version: i64) -> Result<FlowVersion> {
        self.bounded(async {
            let mut conn = self.pool().acquire().await?;
            self.ensure_exists(&mut conn, flow_id).await?;
            fetch(&mut conn, flow_id, version)
                .await?
                .ok_or_else(|| FlowError::VersionNotFound {
                    flow_id: flow_id.to_string(),
                    version,
                })
        })
        .await
    }

    /// Oldest version still guaranteed retrievable
    pub async fn retention_floor(&self, flow_id: &str) -> Result<i64> {
        self.bounded(async {
            let mut conn = self.pool().acquire().await?;
            retention_floor(&mut conn, flow_id)
                .await?
                .ok_or_else(|| FlowError::NotFound {
                    flow_id: flow_id.to_string(),
                })
        })
        .await
    }

    /// Field paths changed in `(from_exclusive, to_inclusive]`
    ///
    /// Fails with `VersionNotFound` when part of the range has been pruned.
    pub async fn changed_fields_since(
        &self,
        flow_id: &str,
        from_exclusive: i64,
        to_inclusive: i64,
    ) -> Result<BTreeSet<FieldPath>> {
        self.bounded(async {
            let mut conn = self.pool().acquire().await?;
            self.ensure_exists(&mut conn, flow_id).await?;
            changed_fields_since(&mut conn, flow_id, from_exclusive, to_inclusive)
                .await?
                .ok_or_else(|| FlowError::VersionNotFound {
                    flow_id: flow_id.to_string(),
                    version: from_exclusive + 1,
                })
        })
        .await
    }

    /// Apply count-based retention to one flow, returning rows removed
    pub async fn prune(&self, flow_id: &str) -> Result<u64> {
        let _guard = self.locks().acquire(flow_id).await;
        self.bounded(async {
            let mut tx = self.pool().begin().await?;
            let stored = self.lock_flow_row(&mut tx, flow_id).await?;
            let pinned = conflicts::min_pending_base(&mut tx, flow_id).await?;
            let floor = prune_floor(stored.version, self.keep_versions(), pinned);
            let removed = delete_below(&mut tx, flow_id, floor).await?;
            tx.commit().await?;
            if removed > 0 {
                tracing::info!("✂️ Pruned {} ledger rows of flow {} below version {}", removed, flow_id, floor);
            }
            Ok(removed)
        })
        .await
    }
}
