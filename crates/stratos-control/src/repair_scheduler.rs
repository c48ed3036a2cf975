// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker that queues periodic repairs.
//!
//! Idle live resources that have not been repaired within the repair
//! interval get a `repairVm`, `repairDeployment`, or `repairSm` job. A
//! resource that was never repaired counts from its creation time.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use stratos_core::models::{JobType, ResourceKind};
use stratos_core::persistence::{JobQuery, ResourceFilter, ResourceRepository};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::context::ControlContext;
use crate::error::{Error, Result};
use crate::jobs::args::IdArgs;
use crate::jobs::{JobArgs, JobSubmitter};

/// Name the scheduler reports liveness under.
pub const WORKER_NAME: &str = "repair-scheduler";

/// Configuration for the repair scheduler.
#[derive(Debug, Clone)]
pub struct RepairSchedulerConfig {
    /// How often to look for stale resources.
    pub poll_interval: Duration,
    /// Resources not repaired for this long are due.
    pub repair_interval: Duration,
}

impl Default for RepairSchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(600),         // Check every 10 minutes
            repair_interval: Duration::from_secs(6 * 3600), // 6 hours
        }
    }
}

/// Background worker that enqueues repair jobs.
pub struct RepairScheduler {
    ctx: ControlContext,
    submitter: JobSubmitter,
    config: RepairSchedulerConfig,
    shutdown: Arc<Notify>,
}

impl RepairScheduler {
    /// Create a new repair scheduler.
    pub fn new(ctx: ControlContext, config: RepairSchedulerConfig) -> Self {
        Self {
            submitter: JobSubmitter::new(ctx.clone()),
            ctx,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the scheduler loop until shutdown is signalled.
    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            repair_interval_secs = self.config.repair_interval.as_secs(),
            "Repair scheduler started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Repair scheduler received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.ctx.worker_status().report(WORKER_NAME).await {
                        warn!(error = %e, "Failed to report repair scheduler status");
                    }
                    match self.tick().await {
                        Ok(ids) if !ids.is_empty() => info!(count = ids.len(), "Queued repairs"),
                        Ok(_) => debug!("No resources due for repair"),
                        Err(e) => error!(error = %e, "Failed to schedule repairs"),
                    }
                }
            }
        }

        info!("Repair scheduler stopped");
    }

    /// Queue a repair for every due resource. Returns the ids queued.
    pub async fn tick(&self) -> Result<Vec<String>> {
        let interval = chrono::Duration::from_std(self.config.repair_interval)
            .map_err(|e| Error::Other(format!("Invalid duration: {}", e)))?;
        let cutoff = Utc::now() - interval;

        let mut queued = self
            .schedule(self.ctx.vms(), JobType::RepairVm, JobArgs::RepairVm, cutoff)
            .await?;
        queued.extend(
            self.schedule(
                self.ctx.deployments(),
                JobType::RepairDeployment,
                JobArgs::RepairDeployment,
                cutoff,
            )
            .await?,
        );
        queued.extend(
            self.schedule(self.ctx.sms(), JobType::RepairSm, JobArgs::RepairSm, cutoff)
                .await?,
        );
        Ok(queued)
    }

    async fn schedule<K: ResourceKind>(
        &self,
        repo: ResourceRepository<K>,
        job_type: JobType,
        make_args: fn(IdArgs) -> JobArgs,
        cutoff: chrono::DateTime<Utc>,
    ) -> Result<Vec<String>> {
        let filter = ResourceFilter::new().idle().repaired_before(cutoff);
        let jobs = self.ctx.jobs();
        let mut queued = Vec::new();

        for resource in repo.list(&filter).await? {
            if resource.repaired_at.unwrap_or(resource.created_at) >= cutoff {
                continue;
            }
            let in_flight = JobQuery::new()
                .of_types(&[job_type])
                .for_resource(&resource.id)
                .non_terminal();
            if jobs.exists(&in_flight).await? {
                debug!(resource_id = %resource.id, job_type = %job_type, "Repair already queued");
                continue;
            }

            let args = make_args(IdArgs {
                id: resource.id.clone(),
            });
            self.submitter.submit(&resource.owner_id, args).await?;
            debug!(resource_id = %resource.id, job_type = %job_type, "Repair queued");
            queued.push(resource.id);
        }
        Ok(queued)
    }
}
