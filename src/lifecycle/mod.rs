//! Background lifecycle maintenance
//!
//! A cron job that abandons idle flows and applies ledger retention.

pub mod sweeper;

pub use sweeper::{sweep, LifecycleService, SweepReport};
