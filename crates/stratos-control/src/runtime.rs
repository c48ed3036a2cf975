// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable control plane runtime.
//!
//! [`ControlPlaneRuntime`] owns every background worker: the job runner,
//! the three confirmers, the repair scheduler, and the host poller.
//!
//! ```rust,ignore
//! use stratos_control::config::Config;
//! use stratos_control::runtime::ControlPlaneRuntime;
//! use stratos_control::subsystems::memory::MemorySubsystems;
//! use stratos_core::Database;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let db = Database::in_memory().await?;
//!     let subsystems = MemorySubsystems::new().bundle(&config.zones);
//!
//!     let runtime = ControlPlaneRuntime::builder()
//!         .database(db)
//!         .subsystems(subsystems)
//!         .config(config)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     // ... submit jobs through runtime.submitter() ...
//!
//!     runtime.shutdown().await;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

use stratos_core::Database;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::Config;
use crate::confirmer::{
    Confirm, Confirmer, ConfirmerConfig, DeploymentConfirm, SmConfirm, VmConfirm,
};
use crate::context::ControlContext;
use crate::error::{Error, Result};
use crate::host_poller::{HostPoller, HostPollerConfig};
use crate::jobs::{JobRunner, JobRunnerConfig, JobSubmitter};
use crate::repair_scheduler::{RepairScheduler, RepairSchedulerConfig};
use crate::subsystems::Subsystems;

/// Builder for creating a [`ControlPlaneRuntime`].
#[derive(Default)]
pub struct ControlPlaneRuntimeBuilder {
    database: Option<Database>,
    subsystems: Option<Subsystems>,
    config: Option<Config>,
    job_runner: Option<JobRunnerConfig>,
    confirmer: Option<ConfirmerConfig>,
    repair_scheduler: Option<RepairSchedulerConfig>,
    host_poller: Option<HostPollerConfig>,
}

impl ControlPlaneRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the database (required).
    pub fn database(mut self, database: Database) -> Self {
        self.database = Some(database);
        self
    }

    /// Set the subsystem handles (required).
    pub fn subsystems(mut self, subsystems: Subsystems) -> Self {
        self.subsystems = Some(subsystems);
        self
    }

    /// Set the control plane configuration (required).
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Override the job runner configuration.
    ///
    /// Default: [`JobRunnerConfig::default`] with the claim order from [`Config`].
    pub fn job_runner(mut self, config: JobRunnerConfig) -> Self {
        self.job_runner = Some(config);
        self
    }

    /// Override the confirmer configuration shared by all three confirmers.
    ///
    /// Default: poll every [`Config::confirmer_interval`].
    pub fn confirmer(mut self, config: ConfirmerConfig) -> Self {
        self.confirmer = Some(config);
        self
    }

    /// Override the repair scheduler configuration.
    ///
    /// Default: repair after [`Config::repair_interval`].
    pub fn repair_scheduler(mut self, config: RepairSchedulerConfig) -> Self {
        self.repair_scheduler = Some(config);
        self
    }

    /// Override the host poller configuration.
    ///
    /// Default: poll every [`Config::host_poll_interval`].
    pub fn host_poller(mut self, config: HostPollerConfig) -> Self {
        self.host_poller = Some(config);
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<ControlPlaneRuntimeConfig> {
        let database = self
            .database
            .ok_or_else(|| Error::Other("database is required".to_string()))?;
        let subsystems = self
            .subsystems
            .ok_or_else(|| Error::Other("subsystems are required".to_string()))?;
        let config = self
            .config
            .ok_or_else(|| Error::Other("config is required".to_string()))?;

        let job_runner = self.job_runner.unwrap_or_else(|| JobRunnerConfig {
            claim_order: config.claim_order,
            ..Default::default()
        });
        let confirmer = self.confirmer.unwrap_or(ConfirmerConfig {
            poll_interval: config.confirmer_interval,
        });
        let repair_scheduler = self
            .repair_scheduler
            .unwrap_or_else(|| RepairSchedulerConfig {
                repair_interval: config.repair_interval,
                ..Default::default()
            });
        let host_poller = self.host_poller.unwrap_or_else(|| HostPollerConfig {
            poll_interval: config.host_poll_interval,
            request_timeout: config.subsystem_timeout,
            ..Default::default()
        });

        Ok(ControlPlaneRuntimeConfig {
            ctx: ControlContext::new(database, subsystems, config),
            job_runner,
            confirmer,
            repair_scheduler,
            host_poller,
        })
    }
}

/// Configuration for a [`ControlPlaneRuntime`].
pub struct ControlPlaneRuntimeConfig {
    ctx: ControlContext,
    job_runner: JobRunnerConfig,
    confirmer: ConfirmerConfig,
    repair_scheduler: RepairSchedulerConfig,
    host_poller: HostPollerConfig,
}

struct Worker {
    name: &'static str,
    shutdown: Arc<Notify>,
    handle: JoinHandle<()>,
}

fn spawn_confirmer<C: Confirm>(
    ctx: &ControlContext,
    confirm: C,
    config: &ConfirmerConfig,
) -> Worker {
    let confirmer = Confirmer::new(ctx.clone(), confirm, config.clone());
    let shutdown = confirmer.shutdown_handle();
    let handle = tokio::spawn(async move {
        confirmer.run().await;
    });
    Worker {
        name: C::NAME,
        shutdown,
        handle,
    }
}

impl ControlPlaneRuntimeConfig {
    /// Start the runtime, spawning every background worker.
    pub async fn start(self) -> Result<ControlPlaneRuntime> {
        let ctx = self.ctx;
        let mut workers = Vec::new();

        let runner = JobRunner::new(ctx.clone(), self.job_runner);
        let runner_shutdown = runner.shutdown_handle();
        let runner_handle = tokio::spawn(async move {
            runner.run().await;
        });
        workers.push(Worker {
            name: crate::jobs::runner::WORKER_NAME,
            shutdown: runner_shutdown,
            handle: runner_handle,
        });

        workers.push(spawn_confirmer(&ctx, VmConfirm::new(ctx.clone()), &self.confirmer));
        workers.push(spawn_confirmer(
            &ctx,
            DeploymentConfirm::new(ctx.clone()),
            &self.confirmer,
        ));
        workers.push(spawn_confirmer(&ctx, SmConfirm::new(ctx.clone()), &self.confirmer));

        let repair = RepairScheduler::new(ctx.clone(), self.repair_scheduler);
        let repair_shutdown = repair.shutdown_handle();
        let repair_handle = tokio::spawn(async move {
            repair.run().await;
        });
        workers.push(Worker {
            name: crate::repair_scheduler::WORKER_NAME,
            shutdown: repair_shutdown,
            handle: repair_handle,
        });

        let poller = HostPoller::new(ctx.clone(), self.host_poller);
        let poller_shutdown = poller.shutdown_handle();
        let poller_handle = tokio::spawn(async move {
            poller.run().await;
        });
        workers.push(Worker {
            name: crate::host_poller::WORKER_NAME,
            shutdown: poller_shutdown,
            handle: poller_handle,
        });

        info!(
            workers = workers.len(),
            zones = ctx.config().zones.len(),
            "ControlPlaneRuntime started"
        );

        Ok(ControlPlaneRuntime {
            submitter: JobSubmitter::new(ctx.clone()),
            ctx,
            workers,
        })
    }
}

/// A running control plane that can be embedded in an application.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct ControlPlaneRuntime {
    ctx: ControlContext,
    submitter: JobSubmitter,
    workers: Vec<Worker>,
}

impl ControlPlaneRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> ControlPlaneRuntimeBuilder {
        ControlPlaneRuntimeBuilder::new()
    }

    /// Shared handles.
    pub fn context(&self) -> &ControlContext {
        &self.ctx
    }

    /// Submitter for enqueueing jobs.
    pub fn submitter(&self) -> &JobSubmitter {
        &self.submitter
    }

    /// Gracefully shut down the runtime.
    ///
    /// Signals every worker, waits for each to stop, then closes the database.
    pub async fn shutdown(self) {
        info!("ControlPlaneRuntime shutting down...");

        for worker in &self.workers {
            worker.shutdown.notify_one();
        }
        for worker in self.workers {
            if let Err(e) = worker.handle.await {
                warn!(worker = worker.name, error = %e, "Worker task panicked");
            }
        }

        self.ctx.db().close().await;
        info!("ControlPlaneRuntime shutdown complete");
    }
}
