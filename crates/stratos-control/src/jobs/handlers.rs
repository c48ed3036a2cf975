// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job handlers: decoded arguments in, a [`JobError`] classification out.

use std::time::Duration;

use thiserror::Error;

use super::args::JobArgs;
use crate::context::ControlContext;
use crate::error::Error;
use crate::services::{DeploymentService, RelatedJobWait, SmService, VmService};

/// How a handler failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    /// Worth retrying with backoff.
    #[error("failed: {0}")]
    Failed(String),
    /// Retrying cannot help.
    #[error("terminated: {0}")]
    Terminated(String),
}

impl JobError {
    /// The stored reason.
    pub fn reason(&self) -> &str {
        match self {
            JobError::Failed(reason) | JobError::Terminated(reason) => reason,
        }
    }
}

impl From<Error> for JobError {
    fn from(err: Error) -> Self {
        if err.is_transient() {
            JobError::Failed(err.to_string())
        } else {
            JobError::Terminated(err.to_string())
        }
    }
}

/// Related-job wait windows of the delete handlers.
#[derive(Debug, Clone, Copy)]
pub struct DeleteWaits {
    /// `deleteVm`.
    pub vm: RelatedJobWait,
    /// `deleteDeployment`.
    pub deployment: RelatedJobWait,
    /// `deleteSm`.
    pub sm: RelatedJobWait,
}

/// Dispatches decoded jobs to the family services.
#[derive(Clone)]
pub struct JobHandlers {
    vms: VmService,
    deployments: DeploymentService,
    sms: SmService,
    waits: DeleteWaits,
}

impl JobHandlers {
    /// Handlers over `ctx`.
    pub fn new(ctx: ControlContext, waits: DeleteWaits) -> Self {
        Self {
            vms: VmService::new(ctx.clone()),
            deployments: DeploymentService::new(ctx.clone()),
            sms: SmService::new(ctx),
            waits,
        }
    }

    /// Run the handler for `args`.
    pub async fn handle(&self, args: JobArgs) -> Result<(), JobError> {
        match args {
            JobArgs::CreateVm(a) => {
                self.vms
                    .create(&a.id, &a.owner_id, a.zone.as_deref(), &a.params)
                    .await?
            }
            JobArgs::DeleteVm(a) => self.vms.delete(&a.id, self.waits.vm).await?,
            JobArgs::UpdateVm(a) => self.vms.update(&a.id, &a.params).await?,
            JobArgs::UpdateVmOwner(a) => {
                self.vms
                    .update_owner(&a.id, &a.params.new_owner_id)
                    .await?
            }
            JobArgs::AttachGpu(a) => {
                self.vms
                    .attach_gpu(
                        &a.id,
                        &a.gpu_ids,
                        Duration::from_secs(a.lease_duration_secs),
                    )
                    .await?
            }
            JobArgs::DetachGpu(a) => self.vms.detach_gpu(&a.id, a.gpu_id.as_deref()).await?,
            JobArgs::RepairVm(a) => self.vms.repair(&a.id).await?,
            JobArgs::CreateSystemSnapshot(a) => {
                self.vms
                    .create_snapshot(&a.id, &a.params.name, false)
                    .await?;
            }
            JobArgs::CreateUserSnapshot(a) => {
                self.vms
                    .create_snapshot(&a.id, &a.params.name, true)
                    .await?;
            }
            JobArgs::DeleteSnapshot(a) => self.vms.delete_snapshot(&a.id, &a.snapshot_id).await?,
            JobArgs::ApplySnapshot(a) => self.vms.apply_snapshot(&a.id, &a.snapshot_id).await?,
            JobArgs::DoVmAction(a) => self.vms.do_action(&a.id, a.action).await?,
            JobArgs::CreateDeployment(a) => {
                self.deployments
                    .create(&a.id, &a.owner_id, a.zone.as_deref(), &a.params)
                    .await?
            }
            JobArgs::DeleteDeployment(a) => {
                self.deployments
                    .delete(&a.id, self.waits.deployment)
                    .await?
            }
            JobArgs::UpdateDeployment(a) => self.deployments.update(&a.id, &a.params).await?,
            JobArgs::UpdateDeploymentOwner(a) => {
                self.deployments
                    .update_owner(&a.id, &a.params.new_owner_id)
                    .await?
            }
            JobArgs::RepairDeployment(a) => self.deployments.repair(&a.id).await?,
            JobArgs::BuildDeployments(a) => self.deployments.build(&a.ids, &a.build.tag).await?,
            JobArgs::CreateSm(a) => {
                self.sms
                    .create(&a.id, &a.owner_id, a.zone.as_deref())
                    .await?
            }
            JobArgs::DeleteSm(a) => self.sms.delete(&a.id, self.waits.sm).await?,
            JobArgs::RepairSm(a) => self.sms.repair(&a.id).await?,
        }
        Ok(())
    }
}
