//! Per-flow snapshot cache using ArcSwap
//!
//! Lock-free reads of recently loaded flows. The map is owned by one
//! `FlowStore`, never shared process-wide, and it is never authoritative:
//! readers validate an entry against the stored version before trusting it,
//! and every local write evicts the flow's entry.

use crate::flow::FlowSnapshot;
use arc_swap::ArcSwap;
use std::{collections::HashMap, sync::Arc};

/// Copy-on-write map of flow id -> last loaded snapshot
#[derive(Debug)]
pub struct FlowCache {
    /// Key: flow_id, Value: snapshot as of its version
    entries: ArcSwap<HashMap<String, Arc<FlowSnapshot>>>,
}

impl Default for FlowCache {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowCache {
    pub fn new() -> Self {
        Self {
            entries: ArcSwap::new(Arc::new(HashMap::new())),
        }
    }

    /// Cached snapshot, only if it is still at `stored_version`
    ///
    /// A stale entry (written by another instance) is evicted.
    pub fn get_if_current(&self, flow_id: &str, stored_version: i64) -> Option<Arc<FlowSnapshot>> {
        let cached = self.entries.load().get(flow_id).cloned()?;
        if cached.version == stored_version {
            tracing::debug!("🎯 Cache hit for flow {} at version {}", flow_id, stored_version);
            Some(cached)
        } else {
            tracing::debug!(
                "♻️ Evicting stale cache entry for flow {} ({} != {})",
                flow_id,
                cached.version,
                stored_version
            );
            self.invalidate(flow_id);
            None
        }
    }

    pub fn put(&self, snapshot: FlowSnapshot) {
        let snapshot = Arc::new(snapshot);
        self.entries.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.insert(snapshot.flow.id.clone(), Arc::clone(&snapshot));
            next
        });
    }

    pub fn invalidate(&self, flow_id: &str) {
        if !self.entries.load().contains_key(flow_id) {
            return;
        }
        self.entries.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.remove(flow_id);
            next
        });
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.load().len()
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.entries.load().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{EstimationFlow, FlowStatus, StepData};
    use chrono::Utc;

    fn snapshot(id: &str, version: i64) -> FlowSnapshot {
        FlowSnapshot {
            flow: EstimationFlow {
                id: id.to_string(),
                owner_id: "owner".to_string(),
                current_step: 1,
                step_data: StepData::new(),
                version,
                status: FlowStatus::Draft,
                created_at: Utc::now(),
                last_saved_at: Utc::now(),
            },
            version,
        }
    }

    #[test]
    fn serves_only_matching_versions() {
        let cache = FlowCache::new();
        cache.put(snapshot("f1", 3));
        assert!(cache.get_if_current("f1", 3).is_some());
        assert!(cache.get_if_current("f1", 4).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn invalidate_removes_entry() {
        let cache = FlowCache::new();
        cache.put(snapshot("f1", 1));
        cache.put(snapshot("f2", 1));
        cache.invalidate("f1");
        assert_eq!(cache.len(), 1);
        assert!(cache.get_if_current("f2", 1).is_some());
    }
}
