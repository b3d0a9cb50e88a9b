//! Main entry point for the LWW sync server.
//!
//! Restores the dictionary from its snapshot and serves it to replicas over
//! WebSocket using the Axum web framework.

use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use lww_sync::config::Config;
use lww_sync::server::{create_router, open_engine};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();

    // Initialize tracing, RUST_LOG takes precedence over --log-level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting LWW sync server...");

    let engine = open_engine(&config)
        .await
        .context("failed to open snapshot store")?;
    let app = create_router(Arc::new(engine));

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;
    let addr = listener.local_addr()?;

    info!("Server listening on http://{}", addr);
    info!("Available endpoints:");
    info!("  GET  /health - Health check");
    info!("  GET  /ws     - WebSocket replica channel");

    axum::serve(listener, app).await?;
    Ok(())
}
