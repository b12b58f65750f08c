//! # Synclink Server
//!
//! Realtime chat sync server.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! synclink
//!
//! # Run with a config file in the working directory
//! cp synclink.example.toml synclink.toml && synclink
//!
//! # Run with a specific config file
//! SYNCLINK_CONFIG=/path/to/synclink.toml synclink
//!
//! # Override any setting through the environment
//! SYNCLINK__PORT=9000 SYNCLINK__HEARTBEAT__INTERVAL_MS=10000 synclink
//! ```

use anyhow::Result;
use synclink_server::{metrics, run_server, Config};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "synclink=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::load()?;

    tracing::info!("Starting Synclink server on {}:{}", config.host, config.port);

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    run_server(config).await?;

    Ok(())
}
