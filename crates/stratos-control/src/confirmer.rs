// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background workers that confirm creation and finish deletion.
//!
//! A confirmer polls one resource family:
//! - resources with `beingCreated` lose the activity once every object the
//!   generators want is recorded and acknowledged by its subsystem
//! - resources with `beingDeleted` are hard-deleted once every recorded
//!   object is gone from its subsystem
//!
//! Confirmers are the only writers that hard-delete. Errors never mutate
//! anything; the resource is simply looked at again on the next tick.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use stratos_core::models::subsystems::Projection;
use stratos_core::models::subsystems::registry::RegistryObject;
use stratos_core::models::{
    Activity, Deployment, DeploymentKind, Resource, ResourceKind, SmKind, StorageManager, Vm,
    VmKind,
};
use stratos_core::persistence::{JobQuery, ResourceRepository};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::context::ControlContext;
use crate::error::Result;
use crate::generators::GenContext;
use crate::generators::{deployment as deployment_gen, sm as sm_gen, vm as vm_gen};
use crate::jobs::args::DetachGpuArgs;
use crate::jobs::{JobArgs, JobSubmitter};
use crate::reconcile::{Tracked, is_absent};
use crate::services::GpuService;
use crate::subsystems::ObjectApi;

/// User id on jobs the control plane submits by itself.
pub const SYSTEM_USER: &str = "system";

/// Family-specific half of a confirmer.
#[async_trait]
pub trait Confirm: Send + Sync + 'static {
    /// Resource family.
    type Kind: ResourceKind;

    /// Worker name used for liveness reports.
    const NAME: &'static str;

    /// Repository of live resources.
    fn repo(&self) -> ResourceRepository<Self::Kind>;

    /// Whether every object the generators want exists and is acknowledged.
    async fn is_created(&self, resource: &Resource<Self::Kind>) -> Result<bool>;

    /// Whether every recorded object is absent from its subsystem.
    async fn is_gone(&self, resource: &Resource<Self::Kind>) -> Result<bool>;

    /// Extra per-tick work.
    async fn sweep(&self) -> Result<()> {
        Ok(())
    }
}

/// Recorded keys equal `expected` and every recorded object is acknowledged.
fn all_created<T: Projection>(recorded: &BTreeMap<String, T>, expected: &[String]) -> bool {
    recorded.len() == expected.len()
        && expected
            .iter()
            .all(|key| recorded.get(key).is_some_and(Projection::created))
}

async fn all_absent<T, A>(api: &A, recorded: &BTreeMap<String, T>, timeout: Duration) -> Result<bool>
where
    T: Tracked,
    A: ObjectApi<T> + ?Sized,
{
    for obj in recorded.values() {
        if !is_absent(api, obj, timeout).await? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Confirms VMs and sweeps expired GPU leases.
pub struct VmConfirm {
    ctx: ControlContext,
    gpus: GpuService,
    submitter: JobSubmitter,
}

impl VmConfirm {
    /// Create the VM half.
    pub fn new(ctx: ControlContext) -> Self {
        Self {
            gpus: GpuService::new(ctx.clone()),
            submitter: JobSubmitter::new(ctx.clone()),
            ctx,
        }
    }
}

#[async_trait]
impl Confirm for VmConfirm {
    type Kind = VmKind;
    const NAME: &'static str = "vm-confirmer";

    fn repo(&self) -> ResourceRepository<VmKind> {
        self.ctx.vms()
    }

    async fn is_created(&self, vm: &Vm) -> Result<bool> {
        Ok(all_created(&vm.subsystems.cs, &vm_gen::expected_keys(vm)))
    }

    async fn is_gone(&self, vm: &Vm) -> Result<bool> {
        let hv = &self.ctx.subsystems().hypervisor;
        all_absent(
            hv.as_ref(),
            &vm.subsystems.cs,
            self.ctx.config().subsystem_timeout,
        )
        .await
    }

    /// Release expired leases and queue a `detachGpu` to unplug each device.
    async fn sweep(&self) -> Result<()> {
        for (vm_id, gpu_id) in self.gpus.release_expired().await? {
            let args = JobArgs::DetachGpu(DetachGpuArgs {
                id: vm_id.clone(),
                gpu_id: Some(gpu_id.clone()),
            });
            let job = self.submitter.submit(SYSTEM_USER, args).await?;
            debug!(vm_id = %vm_id, gpu_id = %gpu_id, job_id = %job.id, "Queued detach for expired lease");
        }
        Ok(())
    }
}

/// Confirms deployments.
pub struct DeploymentConfirm {
    ctx: ControlContext,
}

impl DeploymentConfirm {
    /// Create the deployment half.
    pub fn new(ctx: ControlContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Confirm for DeploymentConfirm {
    type Kind = DeploymentKind;
    const NAME: &'static str = "deployment-confirmer";

    fn repo(&self) -> ResourceRepository<DeploymentKind> {
        self.ctx.deployments()
    }

    async fn is_created(&self, deployment: &Deployment) -> Result<bool> {
        let zone = self.ctx.zone(&deployment.zone)?;
        let gen_ctx = GenContext::new(self.ctx.config(), zone);
        let recorded = &deployment.subsystems;

        let registry: Vec<String> = deployment_gen::registry_objects(deployment, &gen_ctx)
            .into_keys()
            .collect();
        if !all_created(&recorded.registry, &registry) {
            return Ok(false);
        }

        let robot = match recorded.registry.get(&deployment_gen::robot_key(deployment)) {
            Some(RegistryObject::Robot(robot)) if !robot.id.is_empty() => Some(robot),
            _ => None,
        };
        let k8s: Vec<String> = deployment_gen::k8s_objects(deployment, &gen_ctx, robot)?
            .into_keys()
            .collect();
        let dns: Vec<String> = deployment_gen::dns_records(deployment, &gen_ctx)
            .into_keys()
            .collect();

        Ok(all_created(&recorded.k8s, &k8s) && all_created(&recorded.dns, &dns))
    }

    async fn is_gone(&self, deployment: &Deployment) -> Result<bool> {
        let subsystems = self.ctx.subsystems();
        let timeout = self.ctx.config().subsystem_timeout;
        let recorded = &deployment.subsystems;

        if !all_absent(subsystems.dns.as_ref(), &recorded.dns, timeout).await? {
            return Ok(false);
        }
        if !recorded.k8s.is_empty() {
            let cluster = subsystems.cluster(&deployment.zone)?;
            if !all_absent(cluster.as_ref(), &recorded.k8s, timeout).await? {
                return Ok(false);
            }
        }
        all_absent(subsystems.registry.as_ref(), &recorded.registry, timeout).await
    }
}

/// Confirms storage managers.
pub struct SmConfirm {
    ctx: ControlContext,
}

impl SmConfirm {
    /// Create the storage manager half.
    pub fn new(ctx: ControlContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Confirm for SmConfirm {
    type Kind = SmKind;
    const NAME: &'static str = "sm-confirmer";

    fn repo(&self) -> ResourceRepository<SmKind> {
        self.ctx.sms()
    }

    async fn is_created(&self, sm: &StorageManager) -> Result<bool> {
        let zone = self.ctx.zone(&sm.zone)?;
        let gen_ctx = GenContext::new(self.ctx.config(), zone);
        let expected: Vec<String> = sm_gen::k8s_objects(sm, &gen_ctx).into_keys().collect();
        Ok(all_created(&sm.subsystems.k8s, &expected))
    }

    async fn is_gone(&self, sm: &StorageManager) -> Result<bool> {
        if sm.subsystems.k8s.is_empty() {
            return Ok(true);
        }
        let cluster = self.ctx.subsystems().cluster(&sm.zone)?;
        all_absent(
            cluster.as_ref(),
            &sm.subsystems.k8s,
            self.ctx.config().subsystem_timeout,
        )
        .await
    }
}

/// Configuration for a confirmer.
#[derive(Debug, Clone)]
pub struct ConfirmerConfig {
    /// How often to look at the family.
    pub poll_interval: Duration,
}

impl Default for ConfirmerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5), // Check every 5 seconds
        }
    }
}

/// What one tick changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfirmReport {
    /// Resources whose `beingCreated` was cleared.
    pub confirmed: Vec<String>,
    /// Resources removed for good.
    pub hard_deleted: Vec<String>,
}

/// Background worker driving one [`Confirm`] implementation.
pub struct Confirmer<C: Confirm> {
    ctx: ControlContext,
    confirm: C,
    config: ConfirmerConfig,
    shutdown: Arc<Notify>,
}

impl<C: Confirm> Confirmer<C> {
    /// Create a confirmer.
    pub fn new(ctx: ControlContext, confirm: C, config: ConfirmerConfig) -> Self {
        Self {
            ctx,
            confirm,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the confirmer loop until shutdown is signalled.
    pub async fn run(&self) {
        info!(
            worker = C::NAME,
            poll_interval_secs = self.config.poll_interval.as_secs(),
            "Confirmer started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!(worker = C::NAME, "Confirmer received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.ctx.worker_status().report(C::NAME).await {
                        warn!(worker = C::NAME, error = %e, "Failed to report confirmer status");
                    }
                    if let Err(e) = self.tick().await {
                        error!(worker = C::NAME, error = %e, "Confirmer tick failed");
                    }
                }
            }
        }

        info!(worker = C::NAME, "Confirmer stopped");
    }

    /// Look at every resource of the family once.
    pub async fn tick(&self) -> Result<ConfirmReport> {
        let mut report = ConfirmReport::default();
        let repo = self.confirm.repo();

        for resource in repo.list_by_activity(Activity::BeingCreated).await? {
            match self.confirm.is_created(&resource).await {
                Ok(true) => {
                    repo.remove_activity(&resource.id, Activity::BeingCreated)
                        .await?;
                    info!(worker = C::NAME, resource_id = %resource.id, "Creation confirmed");
                    report.confirmed.push(resource.id);
                }
                Ok(false) => {}
                Err(e) => {
                    debug!(worker = C::NAME, resource_id = %resource.id, error = %e, "Creation check failed");
                }
            }
        }

        let all = repo.including_deleted();
        let jobs = self.ctx.jobs();
        for resource in all.list_by_activity(Activity::BeingDeleted).await? {
            // The delete job (or whatever it waits on) is still at work.
            let pending = JobQuery::new()
                .for_resource(&resource.id)
                .non_terminal()
                .runnable_now();
            if jobs.exists(&pending).await? {
                continue;
            }

            match self.confirm.is_gone(&resource).await {
                Ok(true) => {
                    all.hard_delete(&resource.id).await?;
                    info!(worker = C::NAME, resource_id = %resource.id, "Resource removed");
                    report.hard_deleted.push(resource.id);
                }
                Ok(false) => {}
                Err(e) => {
                    debug!(worker = C::NAME, resource_id = %resource.id, error = %e, "Deletion check failed");
                }
            }
        }

        if let Err(e) = self.confirm.sweep().await {
            warn!(worker = C::NAME, error = %e, "Confirmer sweep failed");
        }

        Ok(report)
    }
}
