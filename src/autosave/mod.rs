//! Client-side auto-save
//!
//! Buffers local edits per step and pushes them through a `FlowSaver`
//! on debounce, step transitions, explicit saves and navigation away.
//! Failed saves never discard edits.

pub mod coordinator;

use crate::error::Result;
use crate::flow::{FlowConflict, FlowSnapshot, SaveOutcome, SaveRequest};
use crate::store::FlowStore;
use serde::Serialize;
use std::future::Future;

pub use coordinator::AutoSaveCoordinator;

/// Storage seam used by the coordinator
pub trait FlowSaver: Send + Sync {
    fn snapshot(&self, flow_id: &str) -> impl Future<Output = Result<FlowSnapshot>> + Send;

    fn save(&self, request: SaveRequest) -> impl Future<Output = Result<SaveOutcome>> + Send;
}

impl FlowSaver for FlowStore {
    fn snapshot(&self, flow_id: &str) -> impl Future<Output = Result<FlowSnapshot>> + Send {
        self.get(flow_id)
    }

    fn save(&self, request: SaveRequest) -> impl Future<Output = Result<SaveOutcome>> + Send {
        FlowStore::save(self, request)
    }
}

/// What asked for a save
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveTrigger {
    /// Periodic tick; skipped inside the debounce window
    Debounce,
    /// User moved to another step
    StepTransition,
    /// User pressed save
    Explicit,
    /// Page is being left
    NavigateAway,
}

impl SaveTrigger {
    /// Whether the trigger bypasses the debounce window
    pub fn is_immediate(&self) -> bool {
        !matches!(self, Self::Debounce)
    }
}

/// Save status shown to the user
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SaveState {
    /// Everything recorded is persisted
    Clean,
    /// Local edits waiting for the next save
    Dirty,
    /// A flush is in flight
    Saving,
    /// Retries exhausted; edits are still held locally
    #[serde(rename_all = "camelCase")]
    Unsaved { attempts: u32, last_error: String },
    /// Some edits raced another writer and wait for resolution
    Conflicted { conflicts: Vec<FlowConflict> },
}

impl SaveState {
    pub fn needs_attention(&self) -> bool {
        matches!(self, Self::Unsaved { .. } | Self::Conflicted { .. })
    }
}
