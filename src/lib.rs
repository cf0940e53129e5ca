/// GuidedFlow: versioned persistence and collaboration engine for guided estimate flows
///
/// Flows are saved step by step with optimistic concurrency. Stale writes on
/// disjoint fields are rebased automatically; overlapping ones become pending
/// conflicts that keep every writer's edits until someone resolves them.

// Core configuration and setup
pub mod config;

// Error taxonomy shared by every layer
pub mod error;

// Data model, field paths and step schema
pub mod flow;

// SQLite flow store, version ledger, conflict detection and resolution
pub mod store;

// Debounced, retrying client-side auto-save
pub mod autosave;

// Per-step completion estimates
pub mod completion;

// Audit and notification events
pub mod events;

// Inactivity sweeper and ledger retention
pub mod lifecycle;

// HTTP API layer
pub mod api;

// Server setup and initialization
pub mod server;

// Re-export commonly used types for external consumers
pub use error::{FlowError, Result};
pub use flow::{EstimationFlow, FieldPath, FlowConflict, FlowSnapshot, SaveOutcome, SaveRequest, StepSchema};
pub use server::start_server;
pub use store::FlowStore;
