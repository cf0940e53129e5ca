//! Core flow type definitions
//!
//! Flows, ledger rows and conflict records as they are persisted and served
//! over the API. JSON field names are camelCase for the web client.

use crate::error::{FlowError, Result};
use crate::flow::paths::{FieldPath, StepData};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fmt;

/// Lifecycle status of a flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowStatus {
    /// Created, nothing saved yet
    Draft,
    /// At least one successful save
    Active,
    /// Final step submitted; read-only
    Completed,
    /// Closed by the inactivity policy; read-only
    Abandoned,
}

impl FlowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Abandoned => "abandoned",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "draft" => Ok(Self::Draft),
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "abandoned" => Ok(Self::Abandoned),
            other => Err(FlowError::Corrupt {
                details: format!("unknown flow status '{}'", other),
            }),
        }
    }

    /// Whether step data may still change
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Draft | Self::Active)
    }
}

impl fmt::Display for FlowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One in-progress guided estimate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EstimationFlow {
    pub id: String,
    pub owner_id: String,
    /// 1-based step the flow was last saved on
    pub current_step: u32,
    /// Step id -> opaque payload
    pub step_data: StepData,
    /// Bumped by exactly one on every commit
    pub version: i64,
    pub status: FlowStatus,
    pub created_at: DateTime<Utc>,
    pub last_saved_at: DateTime<Utc>,
}

/// A flow read together with the version a writer should use as its base
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowSnapshot {
    pub flow: EstimationFlow,
    pub version: i64,
}

/// How a ledger row came to be
///
/// Auto-rebased and manually resolved commits are kept apart on purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionOrigin {
    /// Version 0, written when the flow is created
    Created,
    /// CAS matched the stored version
    Direct,
    /// Stale base, disjoint fields, merged onto the newer state
    AutoRebased,
    /// Produced by resolving a conflict
    Resolved,
}

impl VersionOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Direct => "direct",
            Self::AutoRebased => "auto_rebased",
            Self::Resolved => "resolved",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "created" => Ok(Self::Created),
            "direct" => Ok(Self::Direct),
            "auto_rebased" => Ok(Self::AutoRebased),
            "resolved" => Ok(Self::Resolved),
            other => Err(FlowError::Corrupt {
                details: format!("unknown version origin '{}'", other),
            }),
        }
    }
}

/// Immutable ledger row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowVersion {
    pub flow_id: String,
    pub version: i64,
    /// Full step data at this version; omitted in history listings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<StepData>,
    pub author_id: String,
    pub saved_at: DateTime<Utc>,
    /// Field paths touched relative to the previous version
    pub change_summary: BTreeSet<FieldPath>,
    pub origin: VersionOrigin,
}

/// Why a write was turned into a conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// The write touched fields another writer changed since its base
    FieldOverlap,
    /// The base is older than the ledger retains; the whole write is contested
    RetentionGap,
}

impl ConflictKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FieldOverlap => "field_overlap",
            Self::RetentionGap => "retention_gap",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "field_overlap" => Ok(Self::FieldOverlap),
            "retention_gap" => Ok(Self::RetentionGap),
            other => Err(FlowError::Corrupt {
                details: format!("unknown conflict kind '{}'", other),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStatus {
    Pending,
    Resolved,
}

impl ConflictStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Resolved => "resolved",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "pending" => Ok(Self::Pending),
            "resolved" => Ok(Self::Resolved),
            other => Err(FlowError::Corrupt {
                details: format!("unknown conflict status '{}'", other),
            }),
        }
    }
}

/// How a conflict was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    ManualKeepMine,
    ManualKeepTheirs,
    ManualPerField,
}

impl Resolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ManualKeepMine => "manual_keep_mine",
            Self::ManualKeepTheirs => "manual_keep_theirs",
            Self::ManualPerField => "manual_per_field",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "manual_keep_mine" => Ok(Self::ManualKeepMine),
            "manual_keep_theirs" => Ok(Self::ManualKeepTheirs),
            "manual_per_field" => Ok(Self::ManualPerField),
            other => Err(FlowError::Corrupt {
                details: format!("unknown resolution '{}'", other),
            }),
        }
    }
}

/// A chosen value for a contested field (`null` removes the field)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChoice {
    pub value: Value,
}

/// One contested field path with both sides of the race
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictField {
    pub path: FieldPath,
    /// Stored value at detection time (`null` when absent)
    pub theirs: Value,
    /// Value the writer's patch would have produced at detection time
    pub mine: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved: Option<FieldChoice>,
}

/// A write that raced another writer on overlapping fields
///
/// The writer's full patch is kept so nothing they typed is lost.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowConflict {
    pub id: String,
    pub flow_id: String,
    pub base_version: i64,
    pub current_version_at_detection: i64,
    pub step_id: String,
    pub author_id: String,
    pub patch: Map<String, Value>,
    pub kind: ConflictKind,
    pub conflicting_fields: Vec<ConflictField>,
    pub status: ConflictStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<Resolution>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl FlowConflict {
    /// Contested paths that still lack a choice
    pub fn unresolved_paths(&self) -> Vec<FieldPath> {
        self.conflicting_fields
            .iter()
            .filter(|f| f.resolved.is_none())
            .map(|f| f.path.clone())
            .collect()
    }

    pub fn contested_paths(&self) -> Vec<FieldPath> {
        self.conflicting_fields.iter().map(|f| f.path.clone()).collect()
    }
}

/// A single step write against a base version
#[derive(Debug, Clone, PartialEq)]
pub struct SaveRequest {
    pub flow_id: String,
    pub base_version: i64,
    pub step_id: String,
    pub patch: Map<String, Value>,
    pub author_id: String,
}

/// Result of a save: committed, or parked as a conflict
#[derive(Debug, Clone, PartialEq)]
pub enum SaveOutcome {
    Committed { version: i64, origin: VersionOrigin },
    Conflict(FlowConflict),
}

impl SaveOutcome {
    pub fn committed_version(&self) -> Option<i64> {
        match self {
            Self::Committed { version, .. } => Some(*version),
            Self::Conflict(_) => None,
        }
    }
}

/// Parse an RFC 3339 timestamp read back from storage
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| FlowError::Corrupt {
            details: format!("bad timestamp '{}': {}", raw, e),
        })
}
