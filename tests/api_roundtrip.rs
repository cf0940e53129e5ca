mod common;

use common::store;
use guidedflow::server::create_app;
use serde_json::{json, Value};
use tokio::net::TcpListener;

/// Serve the router on an ephemeral port and return its base URL
async fn serve() -> String {
    let (store, _) = store().await;
    let app = create_app(store);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app.into_make_service()).await.unwrap();
    });
    format!("http://{}", addr)
}

async fn create_flow(client: &reqwest::Client, base: &str) -> String {
    let response = client
        .post(format!("{}/api/flows", base))
        .json(&json!({ "ownerId": "owner-1" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["version"], 0);
    assert_eq!(body["flow"]["status"], "draft");
    body["flow"]["id"].as_str().unwrap().to_string()
}

async fn put_step(
    client: &reqwest::Client,
    base: &str,
    flow_id: &str,
    author: &str,
    body: Value,
) -> reqwest::Response {
    client
        .put(format!("{}/api/flows/{}", base, flow_id))
        .header("x-author-id", author)
        .json(&body)
        .send()
        .await
        .unwrap()
}

#[tokio::test]
async fn health_check_responds() {
    let base = serve().await;
    let body = reqwest::get(format!("{}/healthz", base)).await.unwrap().text().await.unwrap();
    assert_eq!(body, "ok");
}

#[tokio::test]
async fn save_conflict_and_resolve_over_http() {
    let base = serve().await;
    let client = reqwest::Client::new();
    let flow_id = create_flow(&client, &base).await;

    let response = put_step(
        &client,
        &base,
        &flow_id,
        "x",
        json!({ "baseVersion": 0, "stepId": "expenses", "patch": { "materials": 500 } }),
    )
    .await;
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body, json!({ "version": 1, "origin": "direct" }));

    let response = put_step(
        &client,
        &base,
        &flow_id,
        "y",
        json!({ "baseVersion": 0, "stepId": "expenses", "patch": { "materials": 750 } }),
    )
    .await;
    assert_eq!(response.status(), 202);
    let body: Value = response.json().await.unwrap();
    let conflict_id = body["conflict"]["id"].as_str().unwrap().to_string();
    assert_eq!(body["conflict"]["conflictingFields"][0]["path"], "expenses.materials");
    assert_eq!(body["conflict"]["conflictingFields"][0]["theirs"], 500);
    assert_eq!(body["conflict"]["conflictingFields"][0]["mine"], 750);

    let body: Value = client
        .get(format!("{}/api/flows/{}/conflicts", base, flow_id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["conflicts"].as_array().unwrap().len(), 1);

    let response = client
        .post(format!("{}/api/flows/{}/conflicts/{}/resolve", base, flow_id, conflict_id))
        .header("x-author-id", "lead")
        .json(&json!({ "perField": { "expenses.materials": 600 } }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body, json!({ "version": 2 }));

    let body: Value = client
        .get(format!("{}/api/flows/{}", base, flow_id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["version"], 2);
    assert_eq!(body["flow"]["stepData"]["expenses"]["materials"], 600);
    assert_eq!(body["flow"]["status"], "active");

    let body: Value = client
        .get(format!("{}/api/flows/{}/versions", base, flow_id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let origins: Vec<&str> = body["versions"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v["origin"].as_str().unwrap())
        .collect();
    assert_eq!(origins, vec!["created", "direct", "resolved"]);

    let body: Value = client
        .get(format!("{}/api/flows/{}/versions/1", base, flow_id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["snapshot"]["expenses"]["materials"], 500);
}

#[tokio::test]
async fn errors_map_to_status_codes() {
    let base = serve().await;
    let client = reqwest::Client::new();

    let response = client.get(format!("{}/api/flows/missing", base)).send().await.unwrap();
    assert_eq!(response.status(), 404);
    let body: Value = response.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("missing"));

    let flow_id = create_flow(&client, &base).await;

    let response = client
        .put(format!("{}/api/flows/{}", base, flow_id))
        .json(&json!({ "baseVersion": 0, "stepId": "client", "patch": { "name": "Acme" } }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    let response = put_step(
        &client,
        &base,
        &flow_id,
        "x",
        json!({ "baseVersion": 0, "stepId": "unknown", "patch": { "name": "Acme" } }),
    )
    .await;
    assert_eq!(response.status(), 400);

    let response = client
        .get(format!("{}/api/flows/{}/versions/42", base, flow_id))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);

    let response = client
        .post(format!("{}/api/flows/{}/abandon", base, flow_id))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let response = put_step(
        &client,
        &base,
        &flow_id,
        "x",
        json!({ "baseVersion": 0, "stepId": "client", "patch": { "name": "Acme" } }),
    )
    .await;
    assert_eq!(response.status(), 409);
}

#[tokio::test]
async fn completion_and_submit_over_http() {
    let base = serve().await;
    let client = reqwest::Client::new();
    let flow_id = create_flow(&client, &base).await;

    put_step(
        &client,
        &base,
        &flow_id,
        "owner-1",
        json!({ "baseVersion": 0, "stepId": "client", "patch": { "name": "Acme", "address": "" } }),
    )
    .await;
    let response = put_step(
        &client,
        &base,
        &flow_id,
        "owner-1",
        json!({ "baseVersion": 1, "stepId": "review", "patch": { "approved": true } }),
    )
    .await;
    assert_eq!(response.status(), 200);

    let body: Value = client
        .get(format!("{}/api/flows/{}/completion", base, flow_id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let steps = body["steps"].as_array().unwrap();
    assert_eq!(steps.len(), 6);
    assert_eq!(steps[0]["stepId"], "client");
    assert_eq!(steps[0]["ratio"], 0.5);
    assert_eq!(steps[0]["category"], "partial");
    assert_eq!(steps[1]["category"], "empty");
    assert_eq!(steps[5]["category"], "complete");

    let response = client
        .post(format!("{}/api/flows/{}/submit", base, flow_id))
        .header("x-author-id", "owner-1")
        .json(&json!({ "baseVersion": 1 }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 409);

    let response = client
        .post(format!("{}/api/flows/{}/submit", base, flow_id))
        .header("x-author-id", "owner-1")
        .json(&json!({ "baseVersion": 2 }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["flow"]["status"], "completed");
}
