//! Webhook delivery of new pending conflicts
//!
//! Fire-and-forget: delivery runs on the tokio runtime and failures are only
//! logged, so a slow notification endpoint never holds up a save.

use crate::events::{EventSink, FlowEvent};
use std::time::Duration;

/// Posts `ConflictDetected` events as JSON to a fixed URL
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

impl EventSink for WebhookNotifier {
    fn publish(&self, event: &FlowEvent) {
        if !matches!(event, FlowEvent::ConflictDetected { .. }) {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("⚠️ No tokio runtime, dropping conflict notification for {}", event.flow_id());
            return;
        };
        let client = self.client.clone();
        let url = self.url.clone();
        let event = event.clone();
        runtime.spawn(async move {
            match client.post(&url).json(&event).send().await {
                Ok(response) if response.status().is_success() => {
                    tracing::debug!("📨 Conflict notification delivered for flow {}", event.flow_id());
                }
                Ok(response) => {
                    tracing::warn!(
                        "⚠️ Conflict notification for flow {} rejected with {}",
                        event.flow_id(),
                        response.status()
                    );
                }
                Err(e) => {
                    tracing::warn!("⚠️ Conflict notification for flow {} failed: {}", event.flow_id(), e);
                }
            }
        });
    }
}
