#![allow(dead_code)]

use guidedflow::config::DatabaseConfig;
use guidedflow::events::{EventSink, FlowEvent};
use guidedflow::flow::{SaveOutcome, SaveRequest, StepSchema};
use guidedflow::FlowStore;
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex};

/// Keeps every published event for assertions
#[derive(Default)]
pub struct RecordingSink(Mutex<Vec<FlowEvent>>);

impl RecordingSink {
    pub fn events(&self) -> Vec<FlowEvent> {
        self.0.lock().unwrap().clone()
    }
}

impl EventSink for RecordingSink {
    fn publish(&self, event: &FlowEvent) {
        self.0.lock().unwrap().push(event.clone());
    }
}

pub async fn store() -> (Arc<FlowStore>, Arc<RecordingSink>) {
    let sink = Arc::new(RecordingSink::default());
    let store = FlowStore::in_memory(StepSchema::default(), sink.clone())
        .await
        .expect("open in-memory store");
    (Arc::new(store), sink)
}

pub fn patch(value: Value) -> Map<String, Value> {
    value.as_object().expect("patch must be an object").clone()
}

pub fn request(flow_id: &str, base_version: i64, step_id: &str, value: Value, author: &str) -> SaveRequest {
    SaveRequest {
        flow_id: flow_id.to_string(),
        base_version,
        step_id: step_id.to_string(),
        patch: patch(value),
        author_id: author.to_string(),
    }
}

/// Create a flow and commit direct saves until it reaches `version`
pub async fn flow_at_version(store: &FlowStore, version: i64) -> String {
    let created = store.create("owner").await.expect("create flow");
    let flow_id = created.flow.id;
    for v in 0..version {
        let outcome = store
            .save(request(&flow_id, v, "client", serde_json::json!({ "name": format!("Client v{}", v + 1) }), "owner"))
            .await
            .expect("seed save");
        assert_eq!(outcome.committed_version(), Some(v + 1));
    }
    flow_id
}

pub fn committed(outcome: &SaveOutcome) -> i64 {
    outcome.committed_version().expect("expected a committed save")
}

/// In-memory store with a small ledger retention window
pub async fn store_keeping(keep_versions: i64) -> (Arc<FlowStore>, Arc<RecordingSink>) {
    let sink = Arc::new(RecordingSink::default());
    let store = FlowStore::connect(
        &DatabaseConfig::in_memory(),
        Arc::new(StepSchema::default()),
        sink.clone(),
        keep_versions,
    )
    .await
    .expect("open in-memory store");
    (Arc::new(store), sink)
}
