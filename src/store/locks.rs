//! Per-flow critical sections
//!
//! Commits on one flow are serialized; different flows never wait on each
//! other. Slots nobody holds or waits on are dropped on the next acquire.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

#[derive(Debug, Default)]
pub struct FlowLocks {
    slots: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl FlowLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to one flow
    pub async fn acquire(&self, flow_id: &str) -> OwnedMutexGuard<()> {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            slots.retain(|_, slot| Arc::strong_count(slot) > 1);
            Arc::clone(slots.entry(flow_id.to_string()).or_default())
        };
        slot.lock_owned().await
    }

    /// Number of flows currently held or awaited
    #[cfg(test)]
    fn active(&self) -> usize {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.values().filter(|slot| Arc::strong_count(slot) > 1).count()
    }
}
