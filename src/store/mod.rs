//! Flow storage
//!
//! - `FlowStore`: atomic per-flow CAS saves over SQLite
//! - Version ledger with count-based retention
//! - Field-level conflict detection and resolution
//! - Per-flow snapshot cache and critical sections

pub mod cache;
pub mod conflicts;
pub mod detector;
pub mod ledger;
pub mod locks;
pub mod resolver;
pub mod storage;

pub use cache::FlowCache;
pub use detector::Verdict;
pub use locks::FlowLocks;
pub use resolver::{merged_step_data, ResolutionStrategy, ResolveOutcome};
pub use storage::FlowStore;
