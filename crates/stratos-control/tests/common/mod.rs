// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for stratos-control integration tests.
//!
//! Provides TestContext: an in-memory database, in-process subsystems, and a
//! job runner tuned so retries and related-job waits resolve immediately.

#![allow(dead_code)]

use std::time::Duration;

use stratos_core::Database;
use stratos_core::models::deployment::{App, DeploymentType};
use stratos_core::models::{Gpu, GpuData, Job, JobStatus};

use stratos_control::config::{Config, HostConfig, PortRange, ZoneConfig};
use stratos_control::confirmer::{
    Confirmer, ConfirmerConfig, DeploymentConfirm, SmConfirm, VmConfirm,
};
use stratos_control::context::ControlContext;
use stratos_control::host_poller::{HostPoller, HostPollerConfig};
use stratos_control::jobs::args::{
    CreateDeploymentArgs, CreateSmArgs, CreateVmArgs, DeploymentCreateParams, VmCreateParams,
};
use stratos_control::jobs::{JobArgs, JobOutcome, JobRunner, JobRunnerConfig, JobSubmitter};
use stratos_control::subsystems::HostCapacities;
use stratos_control::subsystems::memory::MemorySubsystems;

pub const ZONE: &str = "se-1";
pub const HOST: &str = "host-1";
pub const OWNER: &str = "u1";

pub fn zone() -> ZoneConfig {
    ZoneConfig {
        name: ZONE.to_string(),
        domain: "app.example.net".to_string(),
        ingress_endpoint: "ingress.se-1.example.net".to_string(),
        deployment_namespace: "deploy".to_string(),
        port_range: PortRange {
            start: 30000,
            end: 30100,
        },
        nfs_server: "nfs.se-1.example.net".to_string(),
        nfs_base_path: "/mnt/cloud".to_string(),
        hosts: vec![
            HostConfig {
                name: HOST.to_string(),
                address: "10.0.0.1".to_string(),
            },
            HostConfig {
                name: "host-2".to_string(),
                address: "10.0.0.2".to_string(),
            },
        ],
    }
}

pub fn config() -> Config {
    Config {
        deployer_id: "stratos-test".to_string(),
        subsystem_timeout: Duration::from_secs(5),
        zones: vec![zone()],
        ..Default::default()
    }
}

/// Runner settings for tests: no backoff, short related-job waits.
pub fn runner_config() -> JobRunnerConfig {
    JobRunnerConfig {
        backoff_base: Duration::ZERO,
        vm_delete_wait: Duration::from_secs(5),
        deployment_delete_wait: Duration::from_secs(5),
        related_job_poll: Duration::from_millis(10),
        ..Default::default()
    }
}

pub fn gpu_data(bus: &str) -> GpuData {
    GpuData {
        name: "A100".to_string(),
        vendor: "NVIDIA".to_string(),
        vendor_id: "10de".to_string(),
        device_id: "20b0".to_string(),
        bus: bus.to_string(),
    }
}

pub fn vm_args(id: &str, name: &str) -> JobArgs {
    JobArgs::CreateVm(CreateVmArgs {
        id: id.to_string(),
        owner_id: OWNER.to_string(),
        zone: None,
        params: VmCreateParams {
            name: name.to_string(),
            cpu_cores: 2,
            ram: 4,
            disk_size: 20,
            ssh_public_key: "ssh-rsa X".to_string(),
            ports: Vec::new(),
        },
    })
}

pub fn app(name: &str) -> App {
    App {
        name: name.to_string(),
        image: "nginx:1.27".to_string(),
        internal_port: 8080,
        env: Vec::new(),
        volumes: Vec::new(),
        args: Vec::new(),
        replicas: 1,
    }
}

pub fn deployment_args(id: &str, name: &str, deployment_type: DeploymentType) -> JobArgs {
    JobArgs::CreateDeployment(CreateDeploymentArgs {
        id: id.to_string(),
        owner_id: OWNER.to_string(),
        zone: None,
        params: DeploymentCreateParams {
            name: name.to_string(),
            deployment_type,
            private: false,
            apps: vec![app(name)],
        },
    })
}

pub fn sm_args(id: &str, owner_id: &str) -> JobArgs {
    JobArgs::CreateSm(CreateSmArgs {
        id: id.to_string(),
        owner_id: owner_id.to_string(),
        zone: None,
    })
}

/// Test context holding the control plane and handles to its fake subsystems.
pub struct TestContext {
    pub ctx: ControlContext,
    pub memory: MemorySubsystems,
    pub runner: JobRunner,
    pub submitter: JobSubmitter,
}

impl TestContext {
    /// Create a context with two hosts whose capacities are already cached.
    pub async fn new() -> Self {
        Self::with_runner(runner_config()).await
    }

    pub async fn with_runner(runner: JobRunnerConfig) -> Self {
        let db = Database::in_memory()
            .await
            .expect("Failed to open in-memory database");
        let config = config();
        let memory = MemorySubsystems::new();
        for (host, ram_used) in [(HOST, 16), ("host-2", 64)] {
            let capacities = HostCapacities {
                ram_total: 128,
                ram_used,
                cpu_cores: 32,
                gpu_count: 1,
            };
            memory.hosts.add_host(host, capacities, Vec::new()).await;
        }
        let ctx = ControlContext::new(db, memory.bundle(&config.zones), config);

        HostPoller::new(ctx.clone(), HostPollerConfig::default())
            .poll_once()
            .await
            .expect("Failed to prime host capacities");

        Self {
            runner: JobRunner::new(ctx.clone(), runner),
            submitter: JobSubmitter::new(ctx.clone()),
            ctx,
            memory,
        }
    }

    /// Submit a job as [`OWNER`].
    pub async fn submit(&self, args: JobArgs) -> Job {
        self.submitter
            .submit(OWNER, args)
            .await
            .expect("Failed to submit job")
    }

    /// Claim and run everything runnable once.
    pub async fn run_once(&self) -> Vec<(Job, JobOutcome)> {
        self.runner.run_pending().await.expect("Failed to run jobs")
    }

    /// Run until the queue has nothing runnable left.
    pub async fn drain(&self) {
        for _ in 0..20 {
            if self.run_once().await.is_empty() {
                return;
            }
        }
        panic!("job queue did not drain");
    }

    pub async fn job(&self, id: &str) -> Job {
        self.ctx
            .jobs()
            .get(id)
            .await
            .expect("Failed to load job")
            .expect("Job not found")
    }

    pub async fn status(&self, id: &str) -> JobStatus {
        self.job(id).await.status
    }

    /// Submit `args` and run the queue dry, returning the job as stored.
    pub async fn run_job(&self, args: JobArgs) -> Job {
        let job = self.submit(args).await;
        self.drain().await;
        self.job(&job.id).await
    }

    /// Create a VM and fail the test unless the job completes.
    pub async fn create_vm(&self, id: &str, name: &str) {
        let job = self.run_job(vm_args(id, name)).await;
        assert_eq!(
            job.status,
            JobStatus::Completed,
            "createVm {} ended with {:?}",
            id,
            job.last_error()
        );
    }

    /// Register a GPU on `host` directly in the store.
    pub async fn add_gpu(&self, host: &str, bus: &str) -> Gpu {
        let gpu = Gpu::new(host, ZONE, gpu_data(bus));
        self.ctx.gpus().upsert(&gpu).await.expect("Failed to store GPU");
        gpu
    }

    pub fn vm_confirmer(&self) -> Confirmer<VmConfirm> {
        Confirmer::new(
            self.ctx.clone(),
            VmConfirm::new(self.ctx.clone()),
            ConfirmerConfig::default(),
        )
    }

    pub fn deployment_confirmer(&self) -> Confirmer<DeploymentConfirm> {
        Confirmer::new(
            self.ctx.clone(),
            DeploymentConfirm::new(self.ctx.clone()),
            ConfirmerConfig::default(),
        )
    }

    pub fn sm_confirmer(&self) -> Confirmer<SmConfirm> {
        Confirmer::new(
            self.ctx.clone(),
            SmConfirm::new(self.ctx.clone()),
            ConfirmerConfig::default(),
        )
    }
}
