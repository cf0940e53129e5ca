//! Flow data model
//!
//! - Types: flows, ledger rows, conflicts, save outcomes
//! - Field-path algebra over opaque step payloads
//! - Declarative step schema supplied as configuration

pub mod paths;
pub mod schema;
pub mod types;

pub use paths::{FieldPath, StepData};
pub use schema::{StepDefinition, StepSchema};
pub use types::{
    ConflictField, ConflictKind, ConflictStatus, EstimationFlow, FieldChoice, FlowConflict,
    FlowSnapshot, FlowStatus, FlowVersion, Resolution, SaveOutcome, SaveRequest, VersionOrigin,
};
