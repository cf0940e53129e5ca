//! SQLite persistence for flows with atomic compare-and-swap saves
//!
//! `FlowStore` owns the pool, the per-flow cache and the per-flow locks. A
//! save takes the flow's lock, opens a transaction whose first statement
//! takes SQLite's write lock on the flow row, and only then reads, detects
//! and commits. Nothing can land between detection and commit.

use crate::config::DatabaseConfig;
use crate::error::{FlowError, Result};
use crate::events::{EventSink, FlowEvent};
use crate::flow::paths::apply_step_patch;
use crate::flow::types::parse_timestamp;
use crate::flow::{
    ConflictStatus, EstimationFlow, FieldPath, FlowConflict, FlowSnapshot, FlowStatus, SaveOutcome,
    SaveRequest, StepData, StepSchema, VersionOrigin,
};
use crate::store::cache::FlowCache;
use crate::store::conflicts;
use crate::store::detector::{self, Verdict};
use crate::store::ledger::{self, LedgerEntry};
use crate::store::locks::FlowLocks;
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqliteConnection};
use std::collections::BTreeSet;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Fixed-width UTC timestamps so text comparison matches time order
pub(crate) fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Current time at the precision timestamps are stored with
pub(crate) fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Durable flow storage with per-flow serialized commits
pub struct FlowStore {
    /// SQLite connection pool
    pool: SqlitePool,
    /// Declarative step schema used to validate and diff writes
    schema: Arc<StepSchema>,
    /// Validated snapshot cache, evicted on every write
    cache: FlowCache,
    /// Per-flow critical sections
    locks: FlowLocks,
    /// Audit / notification consumers
    events: Arc<dyn EventSink>,
    /// Upper bound for any single storage operation
    timeout: Duration,
    /// Newest ledger rows kept per flow
    keep_versions: i64,
}

/// Outcome of a locked operation plus the events to publish after commit
type Emitting<T> = (T, Vec<FlowEvent>);

impl FlowStore {
    /// Create a store over an existing pool
    pub fn new(
        pool: SqlitePool,
        schema: Arc<StepSchema>,
        events: Arc<dyn EventSink>,
        timeout: Duration,
        keep_versions: i64,
    ) -> Self {
        Self {
            pool,
            schema,
            cache: FlowCache::new(),
            locks: FlowLocks::new(),
            events,
            timeout,
            keep_versions: keep_versions.max(1),
        }
    }

    /// Open (or create) the database described by `config` and initialize the schema
    pub async fn connect(
        config: &DatabaseConfig,
        schema: Arc<StepSchema>,
        events: Arc<dyn EventSink>,
        keep_versions: i64,
    ) -> Result<Self> {
        let in_memory = config.url.contains(":memory:");
        let mut options = SqliteConnectOptions::from_str(&config.url)?
            .create_if_missing(true)
            .busy_timeout(config.busy_timeout());
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
            if let Some(parent) = options.get_filename().parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(|e| FlowError::StorageUnavailable {
                        reason: format!("cannot create {}: {}", parent.display(), e),
                    })?;
                }
            }
        }

        // An in-memory database lives and dies with its single connection
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(config.max_connections.max(1))
        };

        tracing::info!("🗄️ Opening flow database: {}", config.url);
        let pool = pool_options
            .acquire_timeout(config.storage_timeout())
            .connect_with(options)
            .await?;

        let store = Self::new(pool, schema, events, config.storage_timeout(), keep_versions);
        store.init_schema().await?;
        Ok(store)
    }

    /// In-memory store with the given schema, for tests and tooling
    pub async fn in_memory(schema: StepSchema, events: Arc<dyn EventSink>) -> Result<Self> {
        Self::connect(&DatabaseConfig::in_memory(), Arc::new(schema), events, 200).await
    }

    /// Initialize the flow storage schema
    ///
    /// Safe to call multiple times (uses IF NOT EXISTS).
    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS flows (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                current_step INTEGER NOT NULL,
                step_data TEXT NOT NULL,
                version INTEGER NOT NULL,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                last_saved_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS flow_versions (
                flow_id TEXT NOT NULL,
                version INTEGER NOT NULL,
                snapshot TEXT NOT NULL,
                change_summary TEXT NOT NULL,
                author_id TEXT NOT NULL,
                origin TEXT NOT NULL,
                saved_at TEXT NOT NULL,
                PRIMARY KEY (flow_id, version)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS flow_conflicts (
                id TEXT PRIMARY KEY,
                flow_id TEXT NOT NULL,
                base_version INTEGER NOT NULL,
                detected_version INTEGER NOT NULL,
                step_id TEXT NOT NULL,
                author_id TEXT NOT NULL,
                patch TEXT NOT NULL,
                kind TEXT NOT NULL,
                fields TEXT NOT NULL,
                fingerprint TEXT NOT NULL,
                status TEXT NOT NULL,
                resolution TEXT,
                resolved_by TEXT,
                resolved_at TEXT,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_flow_conflicts_flow ON flow_conflicts(flow_id, status)")
            .execute(&self.pool)
            .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_flows_status ON flows(status, last_saved_at)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub fn schema(&self) -> &StepSchema {
        &self.schema
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub(crate) fn locks(&self) -> &FlowLocks {
        &self.locks
    }

    pub(crate) fn keep_versions(&self) -> i64 {
        self.keep_versions
    }

    /// Run a storage future under the configured timeout
    ///
    /// Expiry drops the future, which rolls back any open transaction.
    pub(crate) async fn bounded<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!("⏱️ Storage operation exceeded {:?}", self.timeout);
                Err(FlowError::StorageTimeout { elapsed: self.timeout })
            }
        }
    }

    pub(crate) fn cache_invalidate(&self, flow_id: &str) {
        self.cache.invalidate(flow_id);
    }

    pub(crate) fn publish(&self, events: Vec<FlowEvent>) {
        for event in &events {
            self.events.publish(event);
        }
    }

    /// Create a new flow in `draft` at version 0
    pub async fn create(&self, owner_id: &str) -> Result<FlowSnapshot> {
        if owner_id.trim().is_empty() {
            return Err(FlowError::validation("owner id is required"));
        }

        let now = now();
        let flow = EstimationFlow {
            id: Uuid::new_v4().to_string(),
            owner_id: owner_id.to_string(),
            current_step: 1,
            step_data: StepData::new(),
            version: 0,
            status: FlowStatus::Draft,
            created_at: now,
            last_saved_at: now,
        };

        self.bounded(async {
            let mut tx = self.pool.begin().await?;
            sqlx::query(
                r#"
                INSERT INTO flows (id, owner_id, current_step, step_data, version, status, created_at, last_saved_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&flow.id)
            .bind(&flow.owner_id)
            .bind(flow.current_step as i64)
            .bind(serde_json::to_string(&flow.step_data)?)
            .bind(flow.version)
            .bind(flow.status.as_str())
            .bind(timestamp(flow.created_at))
            .bind(timestamp(flow.last_saved_at))
            .execute(&mut *tx)
            .await?;

            ledger::append(
                &mut tx,
                LedgerEntry {
                    flow_id: &flow.id,
                    version: 0,
                    snapshot: &flow.step_data,
                    change_summary: &BTreeSet::new(),
                    author_id: &flow.owner_id,
                    origin: VersionOrigin::Created,
                    saved_at: now,
                },
            )
            .await?;
            tx.commit().await?;
            Ok(())
        })
        .await?;

        tracing::info!("🆕 Created flow {} for owner {}", flow.id, flow.owner_id);
        self.publish(vec![FlowEvent::FlowCreated {
            flow_id: flow.id.clone(),
            owner_id: flow.owner_id.clone(),
        }]);

        Ok(FlowSnapshot { version: flow.version, flow })
    }

    /// Current flow state and version
    pub async fn get(&self, flow_id: &str) -> Result<FlowSnapshot> {
        self.bounded(async {
            let mut conn = self.pool.acquire().await?;
            let stored_version = self.stored_version(&mut conn, flow_id).await?;
            if let Some(cached) = self.cache.get_if_current(flow_id, stored_version) {
                return Ok(FlowSnapshot::clone(&cached));
            }

            let flow = self.load_flow(&mut conn, flow_id).await?;
            let snapshot = FlowSnapshot {
                version: flow.version,
                flow,
            };
            self.cache.put(snapshot.clone());
            Ok(snapshot)
        })
        .await
    }

    /// Save a step patch against `base_version`
    ///
    /// Matching base: commit directly. Stale base: rebase when the touched
    /// fields are disjoint from everything committed since, otherwise return
    /// a pending conflict holding the write. Validation runs before any
    /// storage access.
    pub async fn save(&self, request: SaveRequest) -> Result<SaveOutcome> {
        let writer_fields = self.schema.changed_fields(&request.step_id, &request.patch)?;
        if request.author_id.trim().is_empty() {
            return Err(FlowError::validation("author id is required"));
        }
        if request.base_version < 0 {
            return Err(FlowError::validation("base version must be non-negative"));
        }

        let _guard = self.locks.acquire(&request.flow_id).await;
        let result = self.bounded(self.save_locked(&request, &writer_fields)).await;
        self.cache.invalidate(&request.flow_id);
        let (outcome, events) = result?;
        self.publish(events);
        Ok(outcome)
    }

    async fn save_locked(
        &self,
        request: &SaveRequest,
        writer_fields: &BTreeSet<FieldPath>,
    ) -> Result<Emitting<SaveOutcome>> {
        let mut tx = self.pool.begin().await?;
        let stored = self.lock_flow_row(&mut tx, &request.flow_id).await?;

        if !stored.status.is_open() {
            return Err(FlowError::InvalidTransition {
                flow_id: stored.id.clone(),
                from: stored.status.to_string(),
                to: FlowStatus::Active.to_string(),
            });
        }
        if request.base_version > stored.version {
            return Err(FlowError::validation(format!(
                "base version {} is ahead of stored version {}",
                request.base_version, stored.version
            )));
        }

        let step_position = self.schema.position(&request.step_id).unwrap_or(stored.current_step);

        if request.base_version == stored.version {
            let mut next = stored.step_data.clone();
            apply_step_patch(&mut next, &request.step_id, &request.patch);
            let (version, events) = commit_step_data(
                &mut tx,
                &stored,
                Commit {
                    step_data: next,
                    current_step: step_position,
                    changed: writer_fields,
                    author_id: &request.author_id,
                    origin: VersionOrigin::Direct,
                },
            )
            .await?;
            tx.commit().await?;
            tracing::info!("💾 Flow {} committed version {} (direct)", stored.id, version);
            return Ok((
                SaveOutcome::Committed {
                    version,
                    origin: VersionOrigin::Direct,
                },
                events,
            ));
        }

        let floor = ledger::retention_floor(&mut tx, &stored.id)
            .await?
            .unwrap_or(stored.version);
        let verdict = if !detector::within_retention(request.base_version, floor) {
            tracing::warn!(
                "⚠️ Base version {} of flow {} is below retention floor {}, contesting whole write",
                request.base_version,
                stored.id,
                floor
            );
            detector::retention_gap(writer_fields)
        } else {
            match ledger::changed_fields_since(&mut tx, &stored.id, request.base_version, stored.version).await? {
                Some(server_changed) => detector::assess(&server_changed, writer_fields),
                None => detector::retention_gap(writer_fields),
            }
        };

        match verdict {
            Verdict::Rebase => {
                let mut next = stored.step_data.clone();
                apply_step_patch(&mut next, &request.step_id, &request.patch);
                let (version, events) = commit_step_data(
                    &mut tx,
                    &stored,
                    Commit {
                        step_data: next,
                        current_step: step_position,
                        changed: writer_fields,
                        author_id: &request.author_id,
                        origin: VersionOrigin::AutoRebased,
                    },
                )
                .await?;
                tx.commit().await?;
                tracing::info!(
                    "🔀 Flow {} auto-rebased write from base {} onto version {}",
                    stored.id,
                    request.base_version,
                    version
                );
                Ok((
                    SaveOutcome::Committed {
                        version,
                        origin: VersionOrigin::AutoRebased,
                    },
                    events,
                ))
            }
            Verdict::Conflict { kind, contested } => {
                let fingerprint = conflicts::fingerprint(request)?;
                if let Some(existing) =
                    conflicts::find_pending_by_fingerprint(&mut tx, &stored.id, &fingerprint).await?
                {
                    tracing::debug!("🔁 Identical conflicting write, returning conflict {}", existing.id);
                    tx.commit().await?;
                    return Ok((SaveOutcome::Conflict(existing), Vec::new()));
                }

                let conflict = FlowConflict {
                    id: Uuid::new_v4().to_string(),
                    flow_id: stored.id.clone(),
                    base_version: request.base_version,
                    current_version_at_detection: stored.version,
                    step_id: request.step_id.clone(),
                    author_id: request.author_id.clone(),
                    patch: request.patch.clone(),
                    kind,
                    conflicting_fields: detector::conflict_fields(
                        &stored.step_data,
                        &request.step_id,
                        &request.patch,
                        &contested,
                    ),
                    status: ConflictStatus::Pending,
                    resolution: None,
                    resolved_by: None,
                    resolved_at: None,
                    created_at: now(),
                };
                conflicts::insert(&mut tx, &conflict, &fingerprint).await?;
                tx.commit().await?;

                tracing::info!(
                    "⚔️ Flow {} conflict {} on {} fields (base {}, stored {})",
                    stored.id,
                    conflict.id,
                    contested.len(),
                    request.base_version,
                    stored.version
                );
                let event = FlowEvent::ConflictDetected {
                    flow_id: stored.id.clone(),
                    conflict_id: conflict.id.clone(),
                    author_id: conflict.author_id.clone(),
                    base_version: conflict.base_version,
                    detected_at_version: conflict.current_version_at_detection,
                    kind,
                    fields: contested,
                };
                Ok((SaveOutcome::Conflict(conflict), vec![event]))
            }
        }
    }

    /// Mark the final step submitted: `active -> completed`
    ///
    /// Requires the caller to hold the latest version, the flow to be on its
    /// final step, and no pending conflicts.
    pub async fn submit(&self, flow_id: &str, base_version: i64, actor_id: &str) -> Result<FlowSnapshot> {
        let _guard = self.locks.acquire(flow_id).await;
        let result = self
            .bounded(async {
                let mut tx = self.pool.begin().await?;
                let stored = self.lock_flow_row(&mut tx, flow_id).await?;
                if stored.status != FlowStatus::Active {
                    return Err(FlowError::InvalidTransition {
                        flow_id: stored.id.clone(),
                        from: stored.status.to_string(),
                        to: FlowStatus::Completed.to_string(),
                    });
                }
                if stored.version != base_version {
                    return Err(FlowError::StaleVersion {
                        flow_id: stored.id.clone(),
                        expected: base_version,
                        actual: stored.version,
                    });
                }
                if stored.current_step as usize != self.schema.total_steps() {
                    return Err(FlowError::validation(format!(
                        "flow is on step {} of {}, only the final step can be submitted",
                        stored.current_step,
                        self.schema.total_steps()
                    )));
                }
                let pending = conflicts::count_pending(&mut tx, flow_id).await?;
                if pending > 0 {
                    return Err(FlowError::validation(format!(
                        "{} pending conflicts must be resolved before submitting",
                        pending
                    )));
                }
                set_status(&mut tx, flow_id, FlowStatus::Completed).await?;
                tx.commit().await?;
                Ok(stored)
            })
            .await;
        self.cache.invalidate(flow_id);
        let stored = result?;

        tracing::info!("🏁 Flow {} submitted by {}", flow_id, actor_id);
        self.publish(vec![FlowEvent::StatusChanged {
            flow_id: flow_id.to_string(),
            from: stored.status,
            to: FlowStatus::Completed,
        }]);
        self.get(flow_id).await
    }

    /// Close an open flow: `draft|active -> abandoned`
    pub async fn abandon(&self, flow_id: &str) -> Result<FlowSnapshot> {
        let _guard = self.locks.acquire(flow_id).await;
        let result = self
            .bounded(async {
                let mut tx = self.pool.begin().await?;
                let stored = self.lock_flow_row(&mut tx, flow_id).await?;
                if !stored.status.is_open() {
                    return Err(FlowError::InvalidTransition {
                        flow_id: stored.id.clone(),
                        from: stored.status.to_string(),
                        to: FlowStatus::Abandoned.to_string(),
                    });
                }
                set_status(&mut tx, flow_id, FlowStatus::Abandoned).await?;
                tx.commit().await?;
                Ok(stored.status)
            })
            .await;
        self.cache.invalidate(flow_id);
        let from = result?;

        tracing::info!("🪦 Flow {} abandoned (was {})", flow_id, from);
        self.publish(vec![FlowEvent::StatusChanged {
            flow_id: flow_id.to_string(),
            from,
            to: FlowStatus::Abandoned,
        }]);
        self.get(flow_id).await
    }

    /// Abandon every open flow not saved within `idle_for`
    ///
    /// Returns the ids of flows that were closed.
    pub async fn abandon_inactive(&self, idle_for: chrono::Duration) -> Result<Vec<String>> {
        let cutoff = timestamp(Utc::now() - idle_for);
        let candidates: Vec<String> = self
            .bounded(async {
                let rows = sqlx::query(
                    "SELECT id FROM flows WHERE status IN ('draft', 'active') AND last_saved_at < ?",
                )
                .bind(&cutoff)
                .fetch_all(&self.pool)
                .await?;
                rows.iter()
                    .map(|row| row.try_get::<String, _>("id").map_err(FlowError::from))
                    .collect()
            })
            .await?;

        let mut abandoned = Vec::new();
        for flow_id in candidates {
            let _guard = self.locks.acquire(&flow_id).await;
            let result = self
                .bounded(async {
                    let mut tx = self.pool.begin().await?;
                    let stored = self.lock_flow_row(&mut tx, &flow_id).await?;
                    // Re-check under the lock: a save may have landed since the scan
                    if !stored.status.is_open() || timestamp(stored.last_saved_at) >= cutoff {
                        return Ok(None);
                    }
                    set_status(&mut tx, &flow_id, FlowStatus::Abandoned).await?;
                    tx.commit().await?;
                    Ok(Some(stored.status))
                })
                .await;
            self.cache.invalidate(&flow_id);

            match result {
                Ok(Some(from)) => {
                    self.publish(vec![FlowEvent::StatusChanged {
                        flow_id: flow_id.clone(),
                        from,
                        to: FlowStatus::Abandoned,
                    }]);
                    abandoned.push(flow_id);
                }
                Ok(None) => {}
                Err(e) => tracing::warn!("⚠️ Could not abandon idle flow {}: {}", flow_id, e),
            }
        }

        if !abandoned.is_empty() {
            tracing::info!("🪦 Abandoned {} inactive flows", abandoned.len());
        }
        Ok(abandoned)
    }

    /// Ids of every stored flow
    pub async fn flow_ids(&self) -> Result<Vec<String>> {
        self.bounded(async {
            let rows = sqlx::query("SELECT id FROM flows ORDER BY created_at ASC")
                .fetch_all(&self.pool)
                .await?;
            rows.iter()
                .map(|row| row.try_get::<String, _>("id").map_err(FlowError::from))
                .collect()
        })
        .await
    }

    /// Take SQLite's write lock via a no-op update, then read the flow row
    ///
    /// Must be the first statement of a write transaction.
    pub(crate) async fn lock_flow_row(&self, conn: &mut SqliteConnection, flow_id: &str) -> Result<EstimationFlow> {
        let touched = sqlx::query("UPDATE flows SET version = version WHERE id = ?")
            .bind(flow_id)
            .execute(&mut *conn)
            .await?;
        if touched.rows_affected() == 0 {
            return Err(FlowError::NotFound {
                flow_id: flow_id.to_string(),
            });
        }
        self.load_flow(conn, flow_id).await
    }

    pub(crate) async fn ensure_exists(&self, conn: &mut SqliteConnection, flow_id: &str) -> Result<()> {
        self.stored_version(conn, flow_id).await.map(|_| ())
    }

    async fn stored_version(&self, conn: &mut SqliteConnection, flow_id: &str) -> Result<i64> {
        let row = sqlx::query("SELECT version FROM flows WHERE id = ?")
            .bind(flow_id)
            .fetch_optional(&mut *conn)
            .await?;
        match row {
            Some(row) => Ok(row.try_get("version")?),
            None => Err(FlowError::NotFound {
                flow_id: flow_id.to_string(),
            }),
        }
    }

    async fn load_flow(&self, conn: &mut SqliteConnection, flow_id: &str) -> Result<EstimationFlow> {
        let row = sqlx::query(
            r#"
            SELECT id, owner_id, current_step, step_data, version, status, created_at, last_saved_at
            FROM flows WHERE id = ?
            "#,
        )
        .bind(flow_id)
        .fetch_optional(&mut *conn)
        .await?;

        match row {
            Some(row) => decode_flow(&row),
            None => Err(FlowError::NotFound {
                flow_id: flow_id.to_string(),
            }),
        }
    }
}

/// New step data to commit on top of a locked flow row
pub(crate) struct Commit<'a> {
    pub step_data: StepData,
    pub current_step: u32,
    pub changed: &'a BTreeSet<FieldPath>,
    pub author_id: &'a str,
    pub origin: VersionOrigin,
}

/// Write the next version and its ledger row inside the caller's transaction
///
/// Bumps the version by exactly one and moves a draft flow to active. The
/// guarded update re-checks the CAS so a lost race can never overwrite.
pub(crate) async fn commit_step_data(
    conn: &mut SqliteConnection,
    stored: &EstimationFlow,
    commit: Commit<'_>,
) -> Result<Emitting<i64>> {
    let next_version = stored.version + 1;
    let next_status = match stored.status {
        FlowStatus::Draft => FlowStatus::Active,
        other => other,
    };
    let now = now();

    let updated = sqlx::query(
        r#"
        UPDATE flows
        SET step_data = ?, version = ?, current_step = ?, status = ?, last_saved_at = ?
        WHERE id = ? AND version = ?
        "#,
    )
    .bind(serde_json::to_string(&commit.step_data)?)
    .bind(next_version)
    .bind(commit.current_step as i64)
    .bind(next_status.as_str())
    .bind(timestamp(now))
    .bind(&stored.id)
    .bind(stored.version)
    .execute(&mut *conn)
    .await?;

    if updated.rows_affected() != 1 {
        return Err(FlowError::StorageUnavailable {
            reason: format!("flow {} moved past version {} during commit", stored.id, stored.version),
        });
    }

    ledger::append(
        conn,
        LedgerEntry {
            flow_id: &stored.id,
            version: next_version,
            snapshot: &commit.step_data,
            change_summary: commit.changed,
            author_id: commit.author_id,
            origin: commit.origin,
            saved_at: now,
        },
    )
    .await?;

    let mut events = vec![FlowEvent::VersionCommitted {
        flow_id: stored.id.clone(),
        version: next_version,
        author_id: commit.author_id.to_string(),
        origin: commit.origin,
        changed: commit.changed.iter().cloned().collect(),
    }];
    if next_status != stored.status {
        events.push(FlowEvent::StatusChanged {
            flow_id: stored.id.clone(),
            from: stored.status,
            to: next_status,
        });
    }

    Ok((next_version, events))
}

async fn set_status(conn: &mut SqliteConnection, flow_id: &str, status: FlowStatus) -> Result<()> {
    sqlx::query("UPDATE flows SET status = ? WHERE id = ?")
        .bind(status.as_str())
        .bind(flow_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

fn decode_flow(row: &SqliteRow) -> Result<EstimationFlow> {
    let step_data: String = row.try_get("step_data")?;
    let status: String = row.try_get("status")?;
    let created_at: String = row.try_get("created_at")?;
    let last_saved_at: String = row.try_get("last_saved_at")?;
    let current_step: i64 = row.try_get("current_step")?;

    Ok(EstimationFlow {
        id: row.try_get("id")?,
        owner_id: row.try_get("owner_id")?,
        current_step: u32::try_from(current_step).map_err(|_| FlowError::Corrupt {
            details: format!("current_step {} out of range", current_step),
        })?,
        step_data: serde_json::from_str(&step_data)?,
        version: row.try_get("version")?,
        status: FlowStatus::parse(&status)?,
        created_at: parse_timestamp(&created_at)?,
        last_saved_at: parse_timestamp(&last_saved_at)?,
    })
}
