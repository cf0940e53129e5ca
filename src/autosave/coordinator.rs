//! Auto-save session for one writer on one flow
//!
//! Edits are merged per step with patch semantics (newer edits win). A
//! flush drains the pending patches, saves them one step at a time against
//! the last known base version, and puts back anything that did not land.
//! Edits recorded while a flush is in flight stay pending for the next one.
//!
//! Paths this writer lost in a conflict keep the base at which the writer
//! last saw them. Later edits to those paths are saved against that base, so
//! they conflict again instead of overwriting a value the writer never saw,
//! until `reload` adopts the current stored state.

use crate::autosave::{FlowSaver, SaveState, SaveTrigger};
use crate::config::AutoSaveConfig;
use crate::error::{FlowError, Result};
use crate::flow::paths::{merge_patches, remove_from_patch, take_from_patch};
use crate::flow::{FieldPath, FlowConflict, SaveOutcome, SaveRequest};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

type Patch = Map<String, Value>;

#[derive(Debug)]
struct Session {
    base_version: i64,
    /// step id -> merged local edits not yet persisted
    pending: BTreeMap<String, Patch>,
    /// contested path -> base at which this writer last saw it
    contested: BTreeMap<FieldPath, i64>,
    state: SaveState,
    last_flush: Option<Instant>,
}

/// How saving one step's patch ended
enum StepResult {
    Saved,
    /// Contested fields moved into conflict records; the rest was retried
    Conflicted(Vec<FlowConflict>),
    /// Retries exhausted or a non-retryable error; the patch must be kept
    Failed {
        conflicts: Vec<FlowConflict>,
        patch: Patch,
        attempts: u32,
        error: FlowError,
    },
}

/// Debounced, retrying auto-save for one `(flow, author)` session
pub struct AutoSaveCoordinator<S> {
    saver: Arc<S>,
    config: AutoSaveConfig,
    flow_id: String,
    author_id: String,
    session: Mutex<Session>,
    /// Serializes flushes of this session
    flush_lock: tokio::sync::Mutex<()>,
}

impl<S: FlowSaver> AutoSaveCoordinator<S> {
    /// Start a session at a known base version
    pub fn new(
        saver: Arc<S>,
        config: AutoSaveConfig,
        flow_id: impl Into<String>,
        author_id: impl Into<String>,
        base_version: i64,
    ) -> Self {
        Self {
            saver,
            config,
            flow_id: flow_id.into(),
            author_id: author_id.into(),
            session: Mutex::new(Session {
                base_version,
                pending: BTreeMap::new(),
                contested: BTreeMap::new(),
                state: SaveState::Clean,
                last_flush: None,
            }),
            flush_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Start a session based on the flow's current stored version
    pub async fn open(
        saver: Arc<S>,
        config: AutoSaveConfig,
        flow_id: impl Into<String>,
        author_id: impl Into<String>,
    ) -> Result<Self> {
        let flow_id = flow_id.into();
        let snapshot = saver.snapshot(&flow_id).await?;
        Ok(Self::new(saver, config, flow_id, author_id, snapshot.version))
    }

    pub fn flow_id(&self) -> &str {
        &self.flow_id
    }

    pub fn base_version(&self) -> i64 {
        self.session().base_version
    }

    pub fn status(&self) -> SaveState {
        self.session().state.clone()
    }

    pub fn has_pending(&self) -> bool {
        !self.session().pending.is_empty()
    }

    /// Paths lost in a conflict and not yet reloaded
    pub fn contested_paths(&self) -> Vec<FieldPath> {
        self.session().contested.keys().cloned().collect()
    }

    /// Adopt the flow's current stored version once the writer has re-read it
    ///
    /// Forgets contested paths, so later edits to them save against the
    /// fresh base. Pending edits are kept.
    pub async fn reload(&self) -> Result<i64> {
        let _flushing = self.flush_lock.lock().await;
        let snapshot = self.saver.snapshot(&self.flow_id).await?;
        let mut session = self.session();
        session.base_version = session.base_version.max(snapshot.version);
        session.contested.clear();
        tracing::debug!(
            "🔄 Session on flow {} reloaded at version {}",
            self.flow_id,
            session.base_version
        );
        Ok(session.base_version)
    }

    /// Merged local edits for a step, if any
    pub fn pending_patch(&self, step_id: &str) -> Option<Patch> {
        self.session().pending.get(step_id).cloned()
    }

    /// Record a local edit to one step
    pub fn record(&self, step_id: &str, patch: Patch) {
        if patch.is_empty() {
            return;
        }
        let mut session = self.session();
        merge_patches(session.pending.entry(step_id.to_string()).or_default(), &patch);
        if matches!(session.state, SaveState::Clean) {
            session.state = SaveState::Dirty;
        }
    }

    /// Save now or skip, depending on the trigger
    pub async fn trigger(&self, trigger: SaveTrigger) -> Result<SaveState> {
        if !trigger.is_immediate() {
            let session = self.session();
            let within_window = session
                .last_flush
                .is_some_and(|at| at.elapsed() < self.config.debounce());
            if session.pending.is_empty() || within_window {
                return Ok(session.state.clone());
            }
        }
        tracing::debug!("💾 Auto-save of flow {} triggered by {:?}", self.flow_id, trigger);
        self.flush().await
    }

    /// Push every pending patch to storage
    ///
    /// Exhausted retries leave the state `Unsaved` and return it; errors that
    /// retrying cannot fix are returned after the edits are put back.
    pub async fn flush(&self) -> Result<SaveState> {
        let _flushing = self.flush_lock.lock().await;

        let (mut base_version, drained, held) = {
            let mut session = self.session();
            if session.pending.is_empty() {
                return Ok(session.state.clone());
            }
            session.state = SaveState::Saving;
            (
                session.base_version,
                std::mem::take(&mut session.pending),
                session.contested.clone(),
            )
        };

        let mut conflicts = Vec::new();
        let mut unsaved = BTreeMap::new();
        let mut failure: Option<(u32, FlowError)> = None;

        for (step_id, patch) in drained {
            if failure.is_some() {
                unsaved.insert(step_id, patch);
                continue;
            }
            match self.save_step(&step_id, patch, &mut base_version, &held).await {
                StepResult::Saved => {}
                StepResult::Conflicted(found) => conflicts.extend(found),
                StepResult::Failed {
                    conflicts: found,
                    patch,
                    attempts,
                    error,
                } => {
                    conflicts.extend(found);
                    unsaved.insert(step_id, patch);
                    failure = Some((attempts, error));
                }
            }
        }

        let mut session = self.session();
        session.base_version = base_version;
        session.last_flush = Some(Instant::now());
        for conflict in &conflicts {
            for path in conflict.contested_paths() {
                session
                    .contested
                    .entry(path)
                    .and_modify(|base| *base = (*base).min(conflict.base_version))
                    .or_insert(conflict.base_version);
            }
        }
        for (step_id, mut patch) in unsaved {
            // Edits recorded during the flush are newer than the drained ones
            if let Some(newer) = session.pending.remove(&step_id) {
                merge_patches(&mut patch, &newer);
            }
            session.pending.insert(step_id, patch);
        }

        match failure {
            Some((attempts, error)) if error.is_transient() => {
                tracing::warn!(
                    "⚠️ Flow {} has unsaved changes after {} attempts: {}",
                    self.flow_id,
                    attempts,
                    error
                );
                session.state = SaveState::Unsaved {
                    attempts,
                    last_error: error.to_string(),
                };
                Ok(session.state.clone())
            }
            Some((attempts, error)) => {
                tracing::error!("❌ Auto-save of flow {} failed: {}", self.flow_id, error);
                session.state = SaveState::Unsaved {
                    attempts,
                    last_error: error.to_string(),
                };
                Err(error)
            }
            None if !conflicts.is_empty() => {
                session.state = SaveState::Conflicted { conflicts };
                Ok(session.state.clone())
            }
            None if session.pending.is_empty() => {
                session.state = SaveState::Clean;
                Ok(SaveState::Clean)
            }
            None => {
                session.state = SaveState::Dirty;
                Ok(SaveState::Dirty)
            }
        }
    }

    /// Save one step's patch, sending edits to contested paths against their old base
    async fn save_step(
        &self,
        step_id: &str,
        mut patch: Patch,
        base_version: &mut i64,
        held: &BTreeMap<FieldPath, i64>,
    ) -> StepResult {
        let held_paths: Vec<FieldPath> = held.keys().filter(|p| p.step_id() == step_id).cloned().collect();
        let contended = take_from_patch(&mut patch, step_id, &held_paths);
        let mut conflicts = Vec::new();

        if !contended.is_empty() {
            let mut stale_base = held
                .iter()
                .filter(|(path, _)| path.step_id() == step_id)
                .map(|(_, base)| *base)
                .min()
                .unwrap_or(*base_version);
            tracing::debug!(
                "⏪ Saving contested edits of step {} against version {}",
                step_id,
                stale_base
            );
            match self.save_patch(step_id, contended, &mut stale_base).await {
                StepResult::Saved => *base_version = (*base_version).max(stale_base),
                StepResult::Conflicted(found) => conflicts.extend(found),
                StepResult::Failed {
                    conflicts: found,
                    patch: mut kept,
                    attempts,
                    error,
                } => {
                    conflicts.extend(found);
                    merge_patches(&mut kept, &patch);
                    return StepResult::Failed {
                        conflicts,
                        patch: kept,
                        attempts,
                        error,
                    };
                }
            }
        }

        if patch.is_empty() {
            return if conflicts.is_empty() {
                StepResult::Saved
            } else {
                StepResult::Conflicted(conflicts)
            };
        }
        match self.save_patch(step_id, patch, base_version).await {
            StepResult::Saved if conflicts.is_empty() => StepResult::Saved,
            StepResult::Saved => StepResult::Conflicted(conflicts),
            StepResult::Conflicted(found) => {
                conflicts.extend(found);
                StepResult::Conflicted(conflicts)
            }
            StepResult::Failed {
                conflicts: found,
                patch,
                attempts,
                error,
            } => {
                conflicts.extend(found);
                StepResult::Failed {
                    conflicts,
                    patch,
                    attempts,
                    error,
                }
            }
        }
    }

    /// Save a patch with retries and at most one rebase
    async fn save_patch(&self, step_id: &str, mut patch: Patch, base_version: &mut i64) -> StepResult {
        let mut conflicts = Vec::new();
        let mut rebased = false;
        let mut attempt: u32 = 0;

        loop {
            let request = SaveRequest {
                flow_id: self.flow_id.clone(),
                base_version: *base_version,
                step_id: step_id.to_string(),
                patch: patch.clone(),
                author_id: self.author_id.clone(),
            };

            match self.saver.save(request).await {
                Ok(SaveOutcome::Committed { version, origin }) => {
                    tracing::debug!(
                        "✅ Auto-saved step {} of flow {} as version {} ({})",
                        step_id,
                        self.flow_id,
                        version,
                        origin.as_str()
                    );
                    *base_version = version;
                    return if conflicts.is_empty() {
                        StepResult::Saved
                    } else {
                        StepResult::Conflicted(conflicts)
                    };
                }
                Ok(SaveOutcome::Conflict(conflict)) => {
                    *base_version = (*base_version).max(conflict.current_version_at_detection);
                    if rebased {
                        // The whole remaining write now lives in the conflict record
                        tracing::info!(
                            "⚔️ Flow {} step {} still conflicts after rebase, surfacing conflict {}",
                            self.flow_id,
                            step_id,
                            conflict.id
                        );
                        conflicts.push(conflict);
                        return StepResult::Conflicted(conflicts);
                    }

                    for path in conflict.contested_paths() {
                        remove_from_patch(&mut patch, &path.relative_segments());
                    }
                    let remaining = patch.len();
                    conflicts.push(conflict);
                    if remaining == 0 {
                        return StepResult::Conflicted(conflicts);
                    }
                    tracing::info!(
                        "🔀 Rebasing uncontested edits of step {} onto version {}",
                        step_id,
                        base_version
                    );
                    rebased = true;
                }
                Err(error) if error.is_transient() => {
                    attempt += 1;
                    if attempt >= self.config.max_attempts.max(1) {
                        return StepResult::Failed {
                            conflicts,
                            patch,
                            attempts: attempt,
                            error,
                        };
                    }
                    let delay = self.config.backoff(attempt - 1);
                    tracing::warn!(
                        "🔁 Save of flow {} failed (attempt {}), retrying in {:?}: {}",
                        self.flow_id,
                        attempt,
                        delay,
                        error
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(error) => {
                    return StepResult::Failed {
                        conflicts,
                        patch,
                        attempts: attempt + 1,
                        error,
                    };
                }
            }
        }
    }

    fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<S: FlowSaver + 'static> AutoSaveCoordinator<S> {
    /// Run debounce ticks until `shutdown` fires, then flush one last time
    pub fn spawn_debounce_loop(self: Arc<Self>, mut shutdown: oneshot::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.debounce());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.trigger(SaveTrigger::Debounce).await {
                            tracing::error!("❌ Debounced save of flow {} failed: {}", self.flow_id, e);
                        }
                    }
                    _ = &mut shutdown => {
                        if let Err(e) = self.trigger(SaveTrigger::NavigateAway).await {
                            tracing::error!("❌ Final save of flow {} failed: {}", self.flow_id, e);
                        }
                        break;
                    }
                }
            }
            tracing::debug!("🛑 Auto-save loop for flow {} stopped", self.flow_id);
        })
    }
}
