// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Steward Worker - standalone binary
//!
//! Serves the demo greeting service and waits for states pushed over the
//! control channel.

use tracing::{info, warn};

use steward_worker::config::Config;
use steward_worker::demo::{GreetingService, TextSlot};
use steward_worker::runtime::WorkerRuntime;
use steward_worker::slots::SlotRegistry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "steward_worker=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    info!(
        control_addr = %config.control_addr,
        listen_ip = %config.listen_ip,
        state_dir = %config.state_dir.display(),
        worker_id = %config.worker_id,
        "Starting Steward Worker"
    );

    let registry = SlotRegistry::new().register(TextSlot {
        default: "world".to_string(),
    });

    let runtime = WorkerRuntime::builder()
        .service(GreetingService)
        .registry(registry)
        .config(config)
        .build()?
        .start()
        .await?;

    info!(addr = %runtime.control_addr(), "Steward Worker ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    runtime.shutdown().await?;

    info!("Steward Worker shut down");

    Ok(())
}
