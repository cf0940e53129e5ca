/// GuidedFlow server entry point
///
/// Loads configuration from the environment and serves:
/// - Flow API at /api/flows/*
/// - Health check at /healthz

use guidedflow::{config::Config, server::start_server};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::default();

    start_server(config).await?;

    Ok(())
}
