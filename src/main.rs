use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};

use dataviz_backend::api;
use dataviz_backend::config::Config;
use dataviz_backend::services::EngineContext;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::from_env().map_err(|e| {
        eprintln!("Failed to load configuration: {}", e);
        e
    })?;

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_new(&config.logging.level)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_ansi(config.logging.style != "never")
        .init();

    info!("Starting server on {}", config.server_address());
    info!(
        "Query limits: preview {}, max {}, timeout {}s; pool max {}",
        config.query.preview_limit,
        config.query.max_limit,
        config.query.timeout_secs,
        config.pool.max_size
    );

    std::fs::create_dir_all(&config.data.root).map_err(|e| {
        error!("Failed to create data directory {}: {}", config.data.root, e);
        e
    })?;
    info!("Serving file sources from {}", config.data.root);

    let engine = Arc::new(EngineContext::new(config.clone()));
    let app = api::routes::create_router_with_state(engine.clone());

    // Start server
    let addr: SocketAddr = config.server_address().parse()?;
    info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    engine.shutdown().await;
    if let Err(e) = served {
        error!("Server error: {}", e);
        return Err(e.into());
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
