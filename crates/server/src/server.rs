//! Router assembly and the serve loop

use crate::engine::Engine;
use crate::handlers::{chat_completions, health, metrics, predict, AppState};
use crate::routines;
use axum::routing::{get, post};
use axum::Router;
use batchloop_common::{ApiSpec, ServerConfig};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Path of the chat-completion endpoint
pub const CHAT_COMPLETIONS_PATH: &str = "/v1/chat/completions";

/// Create the router for the configured API flavor
pub fn build_router(engine: Arc<Engine>, config: &ServerConfig) -> Router {
    let mut router = Router::new().route("/health", get(health));

    router = match config.api.spec {
        ApiSpec::Plain => router.route(&config.api.path, post(predict)),
        ApiSpec::OpenAi => router.route(CHAT_COMPLETIONS_PATH, post(chat_completions)),
    };

    if config.observability.enable_metrics {
        router = router.route("/metrics", get(metrics));
    }

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    router
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(AppState::new(engine))
}

async fn shutdown_signal(engine: Arc<Engine>) {
    if let Err(e) = signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Received shutdown signal");

    engine.shutdown().await;
}

/// Start the HTTP server and run until Ctrl-C
pub async fn serve(config: ServerConfig) -> anyhow::Result<()> {
    let (factory, codec) = routines::build(config.api.routine);
    let engine = Engine::start(&config, factory, codec).await?;

    let app = build_router(engine.clone(), &config);

    let addr = config.addr();
    let listener = TcpListener::bind(&addr).await?;

    info!("Server listening on http://{}", addr);
    match config.api.spec {
        ApiSpec::Plain => info!("  POST {} - Predict ({:?})", config.api.path, config.api.routine),
        ApiSpec::OpenAi => info!("  POST {} - Chat completion", CHAT_COMPLETIONS_PATH),
    }
    info!("  GET  /health - Health check");
    if config.observability.enable_metrics {
        info!("  GET  /metrics - Prometheus metrics");
    }

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(engine))
        .await?;

    info!("Server stopped");
    Ok(())
}
