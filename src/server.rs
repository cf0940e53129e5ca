/// Server setup and initialization
///
/// Wires together storage, event sinks, the lifecycle sweeper and HTTP routes.

use crate::{
    api::{create_flow_routes, AppState},
    config::Config,
    events::{AuditLogSink, EventSink, FanoutSink, WebhookNotifier},
    lifecycle::LifecycleService,
    store::FlowStore,
};
use anyhow::Result;
use axum::{routing::get, Router};
use std::sync::Arc;
use tokio::net::TcpListener;

/// Build the flow store with the configured schema and event sinks
pub async fn create_store(config: &Config) -> Result<Arc<FlowStore>> {
    tracing::info!("📋 Loading step schema");
    let schema = Arc::new(config.load_step_schema()?);
    tracing::debug!("📋 Step schema has {} steps", schema.total_steps());

    let mut sinks = FanoutSink::new().with(Arc::new(AuditLogSink));
    if let Some(url) = &config.notifications.webhook_url {
        tracing::info!("🔔 Conflict notifications go to {}", url);
        sinks = sinks.with(Arc::new(WebhookNotifier::new(url.clone())?));
    }
    let events: Arc<dyn EventSink> = Arc::new(sinks);

    let store = FlowStore::connect(&config.database, schema, events, config.retention.keep_versions)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to open flow database: {}", e))?;
    Ok(Arc::new(store))
}

/// Create the main Axum application over an existing store
pub fn create_app(store: Arc<FlowStore>) -> Router {
    tracing::info!("📡 Creating HTTP router with all endpoints");
    Router::new()
        .route("/healthz", get(health_check))
        .merge(create_flow_routes().with_state(AppState { store }))
}

/// Start the HTTP server with the given configuration
///
/// Opens storage, starts the lifecycle sweeper and serves until the process exits.
pub async fn start_server(config: Config) -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    tracing::info!("Starting guided flow server...");

    let store = create_store(&config).await?;

    tracing::info!("⏰ Initializing lifecycle sweeper");
    let lifecycle = LifecycleService::new(Arc::clone(&store), config.lifecycle.clone()).await?;
    lifecycle.start().await?;

    let app = create_app(store);

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&bind_addr).await?;
    tracing::info!("Server listening on http://{}", bind_addr);

    let served = axum::serve(listener, app.into_make_service()).await;

    if let Err(e) = lifecycle.stop().await {
        tracing::warn!("⚠️ Lifecycle sweeper did not stop cleanly: {}", e);
    }
    served?;
    Ok(())
}

/// Health check endpoint handler
async fn health_check() -> &'static str {
    "ok"
}
