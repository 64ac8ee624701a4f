//! Shard manager service binary

use std::sync::Arc;

use flotilla_core::storage::{FileStorage, NoopStorage, StateStorage};
use flotilla_core::transport::TcpPinger;
use flotilla_core::{server, Manager, ManagerConfig};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("Starting flotilla shard manager");

    // Load configuration from environment
    let total_shards = std::env::var("TOTAL_SHARDS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(1024);
    let config = ManagerConfig {
        total_shards,
        ..Default::default()
    };

    let storage: Arc<dyn StateStorage> = match std::env::var("STATE_PATH") {
        Ok(path) => {
            info!("Persisting state to {path}");
            Arc::new(FileStorage::new(path))
        }
        Err(_) => {
            info!("No STATE_PATH set, running ephemeral");
            Arc::new(NoopStorage::new())
        }
    };

    let manager = Manager::start(config, storage, Arc::new(TcpPinger)).await?;

    let bind_addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:7400".into());
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("Shard manager listening on {bind_addr}");

    let app = server::router(manager.handle());
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await?;

    manager.shutdown().await?;
    Ok(())
}
