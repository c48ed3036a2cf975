// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker that polls compute hosts.
//!
//! Every configured host is queried concurrently. Capacities and telemetry
//! land in the key/value cache for VM placement; enumerated GPUs are
//! synchronized into the GPU store without touching existing leases.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use stratos_core::models::{Gpu, GpuData};
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::context::ControlContext;
use crate::error::Result;
use crate::services::{host_capacities_key, host_status_key};
use crate::subsystems::{HostCapacities, HostStatus, SubsystemError, with_timeout};

/// Name the poller reports liveness under.
pub const WORKER_NAME: &str = "host-poller";

/// Configuration for the host poller.
#[derive(Debug, Clone)]
pub struct HostPollerConfig {
    /// How often to poll every host.
    pub poll_interval: Duration,
    /// How long cached host data stays valid.
    pub cache_ttl: Duration,
    /// Upper bound on each host query.
    pub request_timeout: Duration,
}

impl Default for HostPollerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30), // Poll every 30 seconds
            cache_ttl: Duration::from_secs(120),
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// What one host reported.
#[derive(Debug, Clone)]
struct HostReport {
    capacities: HostCapacities,
    status: HostStatus,
    gpus: Vec<GpuData>,
}

/// Result of one poll round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollReport {
    /// Hosts that answered.
    pub polled: Vec<String>,
    /// Hosts that did not.
    pub failed: Vec<String>,
    /// GPUs written to the store.
    pub gpus_synced: usize,
}

/// Background worker that polls compute hosts.
pub struct HostPoller {
    ctx: ControlContext,
    config: HostPollerConfig,
    shutdown: Arc<Notify>,
}

impl HostPoller {
    /// Create a new host poller.
    pub fn new(ctx: ControlContext, config: HostPollerConfig) -> Self {
        Self {
            ctx,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the poll loop until shutdown is signalled.
    ///
    /// The first round runs immediately so placement data exists before the
    /// first VM is created.
    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            hosts = self.ctx.config().zones.iter().map(|z| z.hosts.len()).sum::<usize>(),
            "Host poller started"
        );

        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Host poller received shutdown signal");
                    break;
                }

                _ = interval.tick() => {
                    if let Err(e) = self.ctx.worker_status().report(WORKER_NAME).await {
                        warn!(error = %e, "Failed to report host poller status");
                    }
                    if let Err(e) = self.poll_once().await {
                        error!(error = %e, "Host poll failed");
                    }
                }
            }
        }

        info!("Host poller stopped");
    }

    /// Query every configured host once and store what they report.
    pub async fn poll_once(&self) -> Result<PollReport> {
        let mut set = JoinSet::new();
        for zone in &self.ctx.config().zones {
            for host in &zone.hosts {
                let api = self.ctx.subsystems().hosts.clone();
                let host_name = host.name.clone();
                let zone_name = zone.name.clone();
                let timeout = self.config.request_timeout;
                set.spawn(async move {
                    let report = async {
                        let capacities =
                            with_timeout("host", timeout, api.capacities(&host_name)).await?;
                        let status = with_timeout("host", timeout, api.status(&host_name)).await?;
                        let gpus = with_timeout("host", timeout, api.gpus(&host_name)).await?;
                        Ok::<_, SubsystemError>(HostReport {
                            capacities,
                            status,
                            gpus,
                        })
                    }
                    .await;
                    (host_name, zone_name, report)
                });
            }
        }

        let mut report = PollReport::default();
        while let Some(joined) = set.join_next().await {
            let (host, zone, result) = match joined {
                Ok(done) => done,
                Err(e) => {
                    error!(error = %e, "Host query task failed");
                    continue;
                }
            };
            match result {
                Ok(host_report) => {
                    report.gpus_synced += self.store(&host, &zone, host_report).await?;
                    report.polled.push(host);
                }
                Err(e) => {
                    warn!(host = %host, error = %e, "Host did not answer");
                    report.failed.push(host);
                }
            }
        }

        debug!(
            polled = report.polled.len(),
            failed = report.failed.len(),
            gpus = report.gpus_synced,
            "Host poll finished"
        );
        Ok(report)
    }

    async fn store(&self, host: &str, zone: &str, report: HostReport) -> Result<usize> {
        let cache = self.ctx.cache();
        let ttl = Some(self.config.cache_ttl);
        cache
            .set_json(&host_capacities_key(host), &report.capacities, ttl)
            .await?;
        cache
            .set_json(&host_status_key(host), &report.status, ttl)
            .await?;

        let gpus = self.ctx.gpus();
        let mut seen = HashSet::new();
        for data in report.gpus {
            let gpu = Gpu::new(host, zone, data);
            gpus.upsert(&gpu).await?;
            seen.insert(gpu.id);
        }

        // Cards that vanished from the host go too, unless a VM still holds one.
        for stale in gpus.list_on_host(host).await? {
            if !seen.contains(&stale.id) && !stale.is_attached() {
                gpus.delete(&stale.id).await?;
                info!(host = %host, gpu_id = %stale.id, "Removed GPU no longer reported by host");
            }
        }
        Ok(seen.len())
    }
}
