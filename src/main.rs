//! Registry Store - Main entry point.
//!
//! Starts the SQL-backed storage manager, registers this server in the
//! shared host table, and keeps the peer view refreshed until shutdown.

use std::sync::Arc;

use registry_store::config::ServerConfig;
use registry_store::db::TransactionManager;
use registry_store::ha::coordinator::{HaConfig, PeerCoordinator};
use registry_store::ha::notifier::LoggingNotifier;
use registry_store::storage::{SqlStorageManager, StorageManager};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &ServerConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber
            .with(fmt::layer().with_target(true).with_thread_ids(false))
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = ServerConfig::parse_args();
    init_tracing(&config);

    info!(
        server_url = %config.server_url,
        "Starting Registry Store v{}",
        env!("CARGO_PKG_VERSION")
    );

    let ha_config = HaConfig::new(
        config.server_url.as_str(),
        config.refresh_interval_duration(),
    )?;

    let manager =
        Arc::new(SqlStorageManager::from_properties(&config.storage_properties()).await?);

    let coordinator = Arc::new(PeerCoordinator::new(
        Arc::clone(&manager) as Arc<dyn StorageManager>,
        Arc::clone(&manager) as Arc<dyn TransactionManager>,
        Arc::new(LoggingNotifier),
        ha_config,
    ));

    if let Err(e) = coordinator.register().await {
        error!(error = %e, "Server registration failed");
        manager.close().await;
        return Err(e.into());
    }
    coordinator.start();

    info!("Registry store running, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    info!("Shutdown signal received");
    coordinator.stop().await;
    manager.close().await;

    info!("Server shutdown complete");
    Ok(())
}
