//! Line chat server - Entry Point
//!
//! Loads configuration, starts the server and runs until Ctrl-C.

use tracing::info;
use tracing_subscriber::EnvFilter;

use line_chat::{ChatServerHandle, EventSink, ServerConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = ServerConfig::load()?;

    // Use RUST_LOG env var to override the configured level
    // e.g., RUST_LOG=debug or RUST_LOG=line_chat=trace
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(format!("line_chat={}", config.log_level))),
        )
        .init();

    info!(
        host = %config.host,
        port = config.port,
        max_connections = config.max_connections,
        "Starting line chat server"
    );

    let server = ChatServerHandle::bind(&config, EventSink::new()).await?;

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    server.shutdown().await;

    Ok(())
}
