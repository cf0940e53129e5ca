//! Flow events for audit logging and notification delivery
//!
//! The store emits one event per commit, detected conflict, resolution and
//! status change, always after the owning transaction has committed. Sinks
//! are external collaborators; the ones here log to the `audit` tracing
//! target and forward new conflicts to a webhook.

pub mod notifier;

use crate::flow::{ConflictKind, FieldPath, FlowStatus, Resolution, VersionOrigin};
use serde::Serialize;
use std::sync::Arc;

pub use notifier::WebhookNotifier;

/// Something durable happened to a flow
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum FlowEvent {
    FlowCreated {
        flow_id: String,
        owner_id: String,
    },
    VersionCommitted {
        flow_id: String,
        version: i64,
        author_id: String,
        origin: VersionOrigin,
        changed: Vec<FieldPath>,
    },
    ConflictDetected {
        flow_id: String,
        conflict_id: String,
        author_id: String,
        base_version: i64,
        detected_at_version: i64,
        kind: ConflictKind,
        fields: Vec<FieldPath>,
    },
    ConflictResolved {
        flow_id: String,
        conflict_id: String,
        version: i64,
        resolution: Resolution,
        resolved_by: String,
    },
    StatusChanged {
        flow_id: String,
        from: FlowStatus,
        to: FlowStatus,
    },
}

impl FlowEvent {
    pub fn flow_id(&self) -> &str {
        match self {
            Self::FlowCreated { flow_id, .. }
            | Self::VersionCommitted { flow_id, .. }
            | Self::ConflictDetected { flow_id, .. }
            | Self::ConflictResolved { flow_id, .. }
            | Self::StatusChanged { flow_id, .. } => flow_id,
        }
    }
}

/// Consumer of flow events; must not block the caller
pub trait EventSink: Send + Sync {
    fn publish(&self, event: &FlowEvent);
}

/// Writes every event as a structured record under the `audit` target
#[derive(Debug, Default, Clone)]
pub struct AuditLogSink;

impl EventSink for AuditLogSink {
    fn publish(&self, event: &FlowEvent) {
        match event {
            FlowEvent::FlowCreated { flow_id, owner_id } => {
                tracing::info!(target: "audit", flow_id = %flow_id, owner_id = %owner_id, "flow created");
            }
            FlowEvent::VersionCommitted {
                flow_id,
                version,
                author_id,
                origin,
                changed,
            } => {
                tracing::info!(
                    target: "audit",
                    flow_id = %flow_id,
                    version = *version,
                    author_id = %author_id,
                    origin = origin.as_str(),
                    changed = changed.len(),
                    "version committed"
                );
            }
            FlowEvent::ConflictDetected {
                flow_id,
                conflict_id,
                author_id,
                base_version,
                detected_at_version,
                kind,
                fields,
            } => {
                tracing::info!(
                    target: "audit",
                    flow_id = %flow_id,
                    conflict_id = %conflict_id,
                    author_id = %author_id,
                    base_version = *base_version,
                    detected_at_version = *detected_at_version,
                    kind = kind.as_str(),
                    fields = fields.len(),
                    "conflict detected"
                );
            }
            FlowEvent::ConflictResolved {
                flow_id,
                conflict_id,
                version,
                resolution,
                resolved_by,
            } => {
                tracing::info!(
                    target: "audit",
                    flow_id = %flow_id,
                    conflict_id = %conflict_id,
                    version = *version,
                    resolution = resolution.as_str(),
                    resolved_by = %resolved_by,
                    "conflict resolved"
                );
            }
            FlowEvent::StatusChanged { flow_id, from, to } => {
                tracing::info!(target: "audit", flow_id = %flow_id, from = from.as_str(), to = to.as_str(), "status changed");
            }
        }
    }
}

/// Forwards each event to every registered sink
#[derive(Default, Clone)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl EventSink for FanoutSink {
    fn publish(&self, event: &FlowEvent) {
        for sink in &self.sinks {
            sink.publish(event);
        }
    }
}
