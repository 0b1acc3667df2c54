use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use tokio::net::TcpListener;

use servicebot_backend::core::config::{AppPaths, ConfigService};
use servicebot_backend::core::logging;
use servicebot_backend::llm::build_gateways;
use servicebot_backend::server;
use servicebot_backend::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let paths = Arc::new(AppPaths::new());
    let config = ConfigService::new(paths.clone());
    let settings = config
        .settings()
        .with_context(|| format!("Invalid configuration in {}", config.config_path().display()))?;
    logging::init(&paths, &settings.logging.level);

    let bind_addr = format!("{}:{}", settings.server.host, settings.server.port);
    let gateways = build_gateways(&settings.llm);
    let state = AppState::build(paths, config, settings, gateways).await?;

    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", bind_addr))?;
    let addr = listener.local_addr()?;
    tracing::info!("Listening on {}", addr);

    let app: Router = server::router::router(state);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!("Failed to listen for shutdown signal: {}", err);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}
