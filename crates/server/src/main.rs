//! BatchLoop Server - Main Entry Point

use batchloop_common::ServerConfig;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config_path = std::env::var("BATCHLOOP_CONFIG").ok().map(PathBuf::from);
    let config = ServerConfig::load(config_path.as_deref())?;

    // Initialize logging
    let level = &config.observability.log_level;
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!(
                    "batchloop_server={level},batchloop_worker={level},tower_http=info"
                )
                .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting BatchLoop Server");
    info!(
        "Configuration loaded: bind={}, spec={:?}, routine={:?}, max_batch_size={}, workers={}",
        config.addr(),
        config.api.spec,
        config.api.routine,
        config.batching.max_batch_size,
        config.workers.num_workers
    );

    batchloop_server::serve(config).await?;

    info!("BatchLoop Server shutdown complete");
    Ok(())
}
