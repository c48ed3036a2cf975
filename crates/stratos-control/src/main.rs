// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Stratos Control - Control Plane Server
//!
//! Runs the job runner, confirmers, repair scheduler, and host poller
//! against the configured zones. Subsystem SDK drivers are linked by the
//! deploying binary; this one wires the in-memory implementations so the
//! control plane can be exercised locally.

use tracing::{info, warn};

use stratos_control::config::Config;
use stratos_control::runtime::ControlPlaneRuntime;
use stratos_control::subsystems::HostCapacities;
use stratos_control::subsystems::memory::MemorySubsystems;
use stratos_core::Database;
use stratos_core::config::DatabaseConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stratos_control=info,stratos_core=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    // Load configuration
    let config = Config::from_env()?;

    info!(
        database = %config.database_path.display(),
        deployer_id = %config.deployer_id,
        zones = config.zones.len(),
        claim_order = ?config.claim_order,
        "Starting Stratos Control"
    );

    // Open database (runs migrations)
    let db = Database::from_path(&config.database_path, &DatabaseConfig::default()).await?;
    info!("Database ready");

    // Local subsystems: every configured host answers with a nominal capacity
    let memory = MemorySubsystems::new();
    for zone in &config.zones {
        for host in &zone.hosts {
            let capacities = HostCapacities {
                ram_total: 256,
                ram_used: 0,
                cpu_cores: 64,
                gpu_count: 0,
            };
            memory.hosts.add_host(&host.name, capacities, Vec::new()).await;
        }
    }
    let subsystems = memory.bundle(&config.zones);
    warn!("Using in-memory subsystems");

    // Start the runtime
    let runtime = ControlPlaneRuntime::builder()
        .database(db)
        .subsystems(subsystems)
        .config(config)
        .build()?
        .start()
        .await?;

    info!("Control plane ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    // Graceful shutdown
    runtime.shutdown().await;

    info!("Stratos Control shut down");

    Ok(())
}
