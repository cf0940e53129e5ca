//! Error taxonomy for the flow engine
//!
//! Detected write conflicts are NOT errors: they come back as
//! `SaveOutcome::Conflict` so the caller can keep the writer's edit around
//! for resolution. Everything here is a genuine failure.

use std::time::Duration;

/// Failures surfaced by the store, resolver and auto-save layers
#[derive(Debug, thiserror::Error)]
pub enum FlowError {
    #[error("flow not found: {flow_id}")]
    NotFound { flow_id: String },

    #[error("conflict not found: {conflict_id}")]
    ConflictNotFound { conflict_id: String },

    #[error("version {version} of flow {flow_id} is not retained")]
    VersionNotFound { flow_id: String, version: i64 },

    #[error("flow {flow_id} is at version {actual}, not {expected}")]
    StaleVersion {
        flow_id: String,
        expected: i64,
        actual: i64,
    },

    #[error("validation failed: {reason}")]
    Validation { reason: String },

    #[error("flow {flow_id} cannot go from {from} to {to}")]
    InvalidTransition {
        flow_id: String,
        from: String,
        to: String,
    },

    #[error("storage operation timed out after {}ms", elapsed.as_millis())]
    StorageTimeout { elapsed: Duration },

    #[error("storage unavailable: {reason}")]
    StorageUnavailable { reason: String },

    #[error("corrupt stored record: {details}")]
    Corrupt { details: String },
}

impl FlowError {
    /// Shorthand for a validation failure
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation {
            reason: reason.into(),
        }
    }

    /// Transient failures are safe to retry with the same payload
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::StorageTimeout { .. } | Self::StorageUnavailable { .. }
        )
    }
}

impl From<sqlx::Error> for FlowError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut => Self::StorageTimeout {
                elapsed: Duration::ZERO,
            },
            other => Self::StorageUnavailable {
                reason: other.to_string(),
            },
        }
    }
}

impl From<serde_json::Error> for FlowError {
    fn from(err: serde_json::Error) -> Self {
        Self::Corrupt {
            details: err.to_string(),
        }
    }
}

/// Result alias used across the library layer
pub type Result<T> = std::result::Result<T, FlowError>;
