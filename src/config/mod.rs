//! Configuration management for the guided flow engine
//!
//! Handles server binding, storage, auto-save pacing, ledger retention and
//! the lifecycle sweeper. Every value has an env var override for container
//! deployments.

use crate::flow::StepSchema;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Client-side auto-save pacing
    pub autosave: AutoSaveConfig,
    /// Version ledger retention
    pub retention: RetentionConfig,
    /// Inactivity sweeper
    pub lifecycle: LifecycleConfig,
    /// Notification delivery
    pub notifications: NotificationConfig,
    /// Optional path to a JSON step schema; built-in schema when unset
    pub step_schema_path: Option<String>,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Server port number
    pub port: u16,
}

/// SQLite storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// sqlx connection URL, e.g. "sqlite://data/guidedflow.db" or "sqlite::memory:"
    pub url: String,
    /// Upper bound on any single storage operation
    pub storage_timeout_ms: u64,
    /// How long SQLite waits on a locked database before failing
    pub busy_timeout_ms: u64,
    pub max_connections: u32,
}

/// Auto-save debounce and retry policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoSaveConfig {
    /// Minimum spacing between debounced saves
    pub debounce_ms: u64,
    /// Attempts per save before reporting unsaved changes
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

/// Count-based ledger retention
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Newest ledger rows kept per flow
    pub keep_versions: i64,
}

/// Inactivity sweep configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    /// Cron expression (seconds first) for the sweep job
    pub sweep_schedule: String,
    /// Flows untouched for this many days are abandoned
    pub inactivity_days: i64,
}

/// Notification delivery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    /// Endpoint receiving new pending conflicts; disabled when unset
    pub webhook_url: Option<String>,
}

impl DatabaseConfig {
    pub fn storage_timeout(&self) -> Duration {
        Duration::from_millis(self.storage_timeout_ms)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    /// In-memory configuration used by tests and local experiments
    pub fn in_memory() -> Self {
        Self {
            url: "sqlite::memory:".to_string(),
            storage_timeout_ms: 5_000,
            busy_timeout_ms: 5_000,
            max_connections: 1,
        }
    }
}

impl AutoSaveConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Delay before retry number `attempt` (0-based), capped at the max
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let delay = self.backoff_base_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.backoff_max_ms))
    }
}

impl Config {
    /// Load the step schema named by the config, or the built-in one
    pub fn load_step_schema(&self) -> anyhow::Result<StepSchema> {
        match &self.step_schema_path {
            Some(path) => StepSchema::from_file(path),
            None => Ok(StepSchema::default()),
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, fallback: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(fallback)
}

impl Default for Config {
    /// Default configuration with ENV_VAR support for k8s/container deployment
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: std::env::var("GUIDEDFLOW_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: env_or("GUIDEDFLOW_PORT", 3004),
            },
            database: DatabaseConfig {
                url: std::env::var("GUIDEDFLOW_DATABASE_URL")
                    .unwrap_or_else(|_| "sqlite://data/guidedflow.db".to_string()),
                storage_timeout_ms: env_or("GUIDEDFLOW_STORAGE_TIMEOUT_MS", 5_000),
                busy_timeout_ms: env_or("GUIDEDFLOW_BUSY_TIMEOUT_MS", 5_000),
                max_connections: env_or("GUIDEDFLOW_MAX_CONNECTIONS", 8),
            },
            autosave: AutoSaveConfig {
                debounce_ms: env_or("GUIDEDFLOW_DEBOUNCE_MS", 2_000),
                max_attempts: env_or("GUIDEDFLOW_SAVE_ATTEMPTS", 5),
                backoff_base_ms: env_or("GUIDEDFLOW_BACKOFF_BASE_MS", 200),
                backoff_max_ms: env_or("GUIDEDFLOW_BACKOFF_MAX_MS", 10_000),
            },
            retention: RetentionConfig {
                keep_versions: env_or("GUIDEDFLOW_KEEP_VERSIONS", 200),
            },
            lifecycle: LifecycleConfig {
                sweep_schedule: std::env::var("GUIDEDFLOW_SWEEP_SCHEDULE")
                    .unwrap_or_else(|_| "0 0 * * * *".to_string()),
                inactivity_days: env_or("GUIDEDFLOW_INACTIVITY_DAYS", 30),
            },
            notifications: NotificationConfig {
                webhook_url: std::env::var("GUIDEDFLOW_NOTIFY_WEBHOOK").ok(),
            },
            step_schema_path: std::env::var("GUIDEDFLOW_STEP_SCHEMA").ok(),
        }
    }
}
