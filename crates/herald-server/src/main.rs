//! # Herald Server
//!
//! Realtime broadcasting server speaking the Pusher channels protocol.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! herald
//!
//! # Run with a config file
//! HERALD_CONFIG=/path/to/herald.toml herald
//!
//! # Run with environment variables
//! HERALD_PORT=8080 HERALD_HOST=0.0.0.0 herald
//!
//! # Join a cluster over Redis
//! HERALD_ADAPTER__DRIVER=redis HERALD_ADAPTER__REDIS_URL=redis://10.0.0.5 herald
//! ```

mod api;
mod config;
mod handlers;
mod metrics;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "herald=debug,tenvis_herald_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config::Config::load()?;

    tracing::info!(
        driver = ?config.adapter.driver,
        "Starting Herald server on {}:{}",
        config.host,
        config.port
    );

    metrics::init_metrics();

    handlers::run_server(config).await?;

    Ok(())
}
