// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Typed job arguments.
//!
//! The job store keeps `args` as JSON. Each job type has one argument record
//! here; the runner decodes into [`JobArgs`] before anything else runs, so a
//! malformed payload never reaches a handler.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use stratos_core::models::JobType;
use stratos_core::models::deployment::{App, DeploymentType};
use stratos_core::models::vm::PortSpec;

use crate::subsystems::PowerAction;

/// Arguments that only address a resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdArgs {
    /// Target resource.
    pub id: String,
}

/// Sizing and access of a new VM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmCreateParams {
    /// VM name, unique among live VMs.
    pub name: String,
    /// Virtual CPUs.
    pub cpu_cores: u32,
    /// Memory in GB.
    pub ram: u32,
    /// Root disk in GB.
    pub disk_size: u32,
    /// Owner's public key.
    pub ssh_public_key: String,
    /// Ports besides SSH.
    #[serde(default)]
    pub ports: Vec<PortSpec>,
}

/// `createVm`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateVmArgs {
    /// Id of the VM to create.
    pub id: String,
    /// Owning user.
    pub owner_id: String,
    /// Zone; the first configured zone when absent.
    #[serde(default)]
    pub zone: Option<String>,
    /// What to create.
    pub params: VmCreateParams,
}

/// Changes to an existing VM. Absent fields are left alone.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmUpdateParams {
    /// New CPU count.
    #[serde(default)]
    pub cpu_cores: Option<u32>,
    /// New memory in GB.
    #[serde(default)]
    pub ram: Option<u32>,
    /// New disk size in GB; disks only grow.
    #[serde(default)]
    pub disk_size: Option<u32>,
    /// Replacement port list, SSH excluded.
    #[serde(default)]
    pub ports: Option<Vec<PortSpec>>,
}

/// `updateVm`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateVmArgs {
    /// Target VM.
    pub id: String,
    /// Requested changes.
    pub params: VmUpdateParams,
}

/// Ownership transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerParams {
    /// The new owner.
    pub new_owner_id: String,
    /// The owner at submit time.
    pub old_owner_id: String,
}

/// `updateVmOwner` and `updateDeploymentOwner`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateOwnerArgs {
    /// Target resource.
    pub id: String,
    /// Ownership transfer.
    pub params: OwnerParams,
}

/// `attachGpu`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachGpuArgs {
    /// Target VM.
    pub id: String,
    /// GPUs to try, in order.
    pub gpu_ids: Vec<String>,
    /// Lease length in seconds.
    pub lease_duration_secs: u64,
}

/// `detachGpu`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetachGpuArgs {
    /// Target VM.
    pub id: String,
    /// GPU whose lease was already released by the lease sweep.
    #[serde(default)]
    pub gpu_id: Option<String>,
}

/// Snapshot name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotParams {
    /// Display name.
    pub name: String,
}

/// `createSystemSnapshot` and `createUserSnapshot`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateSnapshotArgs {
    /// Target VM.
    pub id: String,
    /// Snapshot to take.
    pub params: SnapshotParams,
}

/// `deleteSnapshot` and `applySnapshot`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotRefArgs {
    /// Target VM.
    pub id: String,
    /// Hypervisor snapshot id.
    pub snapshot_id: String,
}

/// `doVmAction`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmActionArgs {
    /// Target VM.
    pub id: String,
    /// Power command.
    pub action: PowerAction,
}

/// Contents of a new deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentCreateParams {
    /// Deployment name, unique among live deployments.
    pub name: String,
    /// Image source.
    #[serde(rename = "type", default)]
    pub deployment_type: DeploymentType,
    /// Keep the deployment off the public ingress.
    #[serde(default)]
    pub private: bool,
    /// Applications; the first is the main app.
    pub apps: Vec<App>,
}

/// `createDeployment`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateDeploymentArgs {
    /// Id of the deployment to create.
    pub id: String,
    /// Owning user.
    pub owner_id: String,
    /// Zone; the first configured zone when absent.
    #[serde(default)]
    pub zone: Option<String>,
    /// What to create.
    pub params: DeploymentCreateParams,
}

/// Changes to an existing deployment.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DeploymentUpdateParams {
    /// New name.
    #[serde(default)]
    pub name: Option<String>,
    /// New privacy.
    #[serde(default)]
    pub private: Option<bool>,
    /// Replacement app list.
    #[serde(default)]
    pub apps: Option<Vec<App>>,
}

/// `updateDeployment`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateDeploymentArgs {
    /// Target deployment.
    pub id: String,
    /// Requested changes.
    pub params: DeploymentUpdateParams,
}

/// Result of an image build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildParams {
    /// Image tag that was pushed.
    pub tag: String,
}

/// `buildDeployments`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildDeploymentsArgs {
    /// Deployments built from the pushed image.
    pub ids: Vec<String>,
    /// The build.
    pub build: BuildParams,
}

/// `createSm`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSmArgs {
    /// Id of the storage manager to create.
    pub id: String,
    /// Owning user; one storage manager per user.
    pub owner_id: String,
    /// Zone; the first configured zone when absent.
    #[serde(default)]
    pub zone: Option<String>,
}

/// A decoded job payload.
#[derive(Debug, Clone, PartialEq)]
pub enum JobArgs {
    /// `createVm`.
    CreateVm(CreateVmArgs),
    /// `deleteVm`.
    DeleteVm(IdArgs),
    /// `updateVm`.
    UpdateVm(UpdateVmArgs),
    /// `updateVmOwner`.
    UpdateVmOwner(UpdateOwnerArgs),
    /// `attachGpu`.
    AttachGpu(AttachGpuArgs),
    /// `detachGpu`.
    DetachGpu(DetachGpuArgs),
    /// `repairVm`.
    RepairVm(IdArgs),
    /// `createSystemSnapshot`.
    CreateSystemSnapshot(CreateSnapshotArgs),
    /// `createUserSnapshot`.
    CreateUserSnapshot(CreateSnapshotArgs),
    /// `deleteSnapshot`.
    DeleteSnapshot(SnapshotRefArgs),
    /// `applySnapshot`.
    ApplySnapshot(SnapshotRefArgs),
    /// `doVmAction`.
    DoVmAction(VmActionArgs),
    /// `createDeployment`.
    CreateDeployment(CreateDeploymentArgs),
    /// `deleteDeployment`.
    DeleteDeployment(IdArgs),
    /// `updateDeployment`.
    UpdateDeployment(UpdateDeploymentArgs),
    /// `updateDeploymentOwner`.
    UpdateDeploymentOwner(UpdateOwnerArgs),
    /// `repairDeployment`.
    RepairDeployment(IdArgs),
    /// `buildDeployments`.
    BuildDeployments(BuildDeploymentsArgs),
    /// `createSm`.
    CreateSm(CreateSmArgs),
    /// `deleteSm`.
    DeleteSm(IdArgs),
    /// `repairSm`.
    RepairSm(IdArgs),
}

fn parse<T: DeserializeOwned>(value: &Value) -> Result<T, serde_json::Error> {
    T::deserialize(value)
}

impl JobArgs {
    /// Decode the stored payload of a `job_type` job.
    pub fn decode(job_type: JobType, value: &Value) -> Result<Self, serde_json::Error> {
        Ok(match job_type {
            JobType::CreateVm => JobArgs::CreateVm(parse(value)?),
            JobType::DeleteVm => JobArgs::DeleteVm(parse(value)?),
            JobType::UpdateVm => JobArgs::UpdateVm(parse(value)?),
            JobType::UpdateVmOwner => JobArgs::UpdateVmOwner(parse(value)?),
            JobType::AttachGpu => JobArgs::AttachGpu(parse(value)?),
            JobType::DetachGpu => JobArgs::DetachGpu(parse(value)?),
            JobType::RepairVm => JobArgs::RepairVm(parse(value)?),
            JobType::CreateSystemSnapshot => JobArgs::CreateSystemSnapshot(parse(value)?),
            JobType::CreateUserSnapshot => JobArgs::CreateUserSnapshot(parse(value)?),
            JobType::DeleteSnapshot => JobArgs::DeleteSnapshot(parse(value)?),
            JobType::ApplySnapshot => JobArgs::ApplySnapshot(parse(value)?),
            JobType::DoVmAction => JobArgs::DoVmAction(parse(value)?),
            JobType::CreateDeployment => JobArgs::CreateDeployment(parse(value)?),
            JobType::DeleteDeployment => JobArgs::DeleteDeployment(parse(value)?),
            JobType::UpdateDeployment => JobArgs::UpdateDeployment(parse(value)?),
            JobType::UpdateDeploymentOwner => JobArgs::UpdateDeploymentOwner(parse(value)?),
            JobType::RepairDeployment => JobArgs::RepairDeployment(parse(value)?),
            JobType::BuildDeployments => JobArgs::BuildDeployments(parse(value)?),
            JobType::CreateSm => JobArgs::CreateSm(parse(value)?),
            JobType::DeleteSm => JobArgs::DeleteSm(parse(value)?),
            JobType::RepairSm => JobArgs::RepairSm(parse(value)?),
        })
    }

    /// The job type these arguments belong to.
    pub fn job_type(&self) -> JobType {
        match self {
            JobArgs::CreateVm(_) => JobType::CreateVm,
            JobArgs::DeleteVm(_) => JobType::DeleteVm,
            JobArgs::UpdateVm(_) => JobType::UpdateVm,
            JobArgs::UpdateVmOwner(_) => JobType::UpdateVmOwner,
            JobArgs::AttachGpu(_) => JobType::AttachGpu,
            JobArgs::DetachGpu(_) => JobType::DetachGpu,
            JobArgs::RepairVm(_) => JobType::RepairVm,
            JobArgs::CreateSystemSnapshot(_) => JobType::CreateSystemSnapshot,
            JobArgs::CreateUserSnapshot(_) => JobType::CreateUserSnapshot,
            JobArgs::DeleteSnapshot(_) => JobType::DeleteSnapshot,
            JobArgs::ApplySnapshot(_) => JobType::ApplySnapshot,
            JobArgs::DoVmAction(_) => JobType::DoVmAction,
            JobArgs::CreateDeployment(_) => JobType::CreateDeployment,
            JobArgs::DeleteDeployment(_) => JobType::DeleteDeployment,
            JobArgs::UpdateDeployment(_) => JobType::UpdateDeployment,
            JobArgs::UpdateDeploymentOwner(_) => JobType::UpdateDeploymentOwner,
            JobArgs::RepairDeployment(_) => JobType::RepairDeployment,
            JobArgs::BuildDeployments(_) => JobType::BuildDeployments,
            JobArgs::CreateSm(_) => JobType::CreateSm,
            JobArgs::DeleteSm(_) => JobType::DeleteSm,
            JobArgs::RepairSm(_) => JobType::RepairSm,
        }
    }

    /// The stored form.
    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        match self {
            JobArgs::CreateVm(a) => serde_json::to_value(a),
            JobArgs::DeleteVm(a)
            | JobArgs::RepairVm(a)
            | JobArgs::DeleteDeployment(a)
            | JobArgs::RepairDeployment(a)
            | JobArgs::DeleteSm(a)
            | JobArgs::RepairSm(a) => serde_json::to_value(a),
            JobArgs::UpdateVm(a) => serde_json::to_value(a),
            JobArgs::UpdateVmOwner(a) | JobArgs::UpdateDeploymentOwner(a) => {
                serde_json::to_value(a)
            }
            JobArgs::AttachGpu(a) => serde_json::to_value(a),
            JobArgs::DetachGpu(a) => serde_json::to_value(a),
            JobArgs::CreateSystemSnapshot(a) | JobArgs::CreateUserSnapshot(a) => {
                serde_json::to_value(a)
            }
            JobArgs::DeleteSnapshot(a) | JobArgs::ApplySnapshot(a) => serde_json::to_value(a),
            JobArgs::DoVmAction(a) => serde_json::to_value(a),
            JobArgs::CreateDeployment(a) => serde_json::to_value(a),
            JobArgs::UpdateDeployment(a) => serde_json::to_value(a),
            JobArgs::BuildDeployments(a) => serde_json::to_value(a),
            JobArgs::CreateSm(a) => serde_json::to_value(a),
        }
    }

    /// The resource the job is addressed to. `None` for batch jobs.
    pub fn resource_id(&self) -> Option<&str> {
        let id = match self {
            JobArgs::CreateVm(a) => &a.id,
            JobArgs::DeleteVm(a)
            | JobArgs::RepairVm(a)
            | JobArgs::DeleteDeployment(a)
            | JobArgs::RepairDeployment(a)
            | JobArgs::DeleteSm(a)
            | JobArgs::RepairSm(a) => &a.id,
            JobArgs::UpdateVm(a) => &a.id,
            JobArgs::UpdateVmOwner(a) | JobArgs::UpdateDeploymentOwner(a) => &a.id,
            JobArgs::AttachGpu(a) => &a.id,
            JobArgs::DetachGpu(a) => &a.id,
            JobArgs::CreateSystemSnapshot(a) | JobArgs::CreateUserSnapshot(a) => &a.id,
            JobArgs::DeleteSnapshot(a) | JobArgs::ApplySnapshot(a) => &a.id,
            JobArgs::DoVmAction(a) => &a.id,
            JobArgs::CreateDeployment(a) => &a.id,
            JobArgs::UpdateDeployment(a) => &a.id,
            JobArgs::CreateSm(a) => &a.id,
            JobArgs::BuildDeployments(_) => return None,
        };
        Some(id)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_decode_create_vm() {
        let args = JobArgs::decode(
            JobType::CreateVm,
            &json!({
                "id": "v1",
                "ownerId": "u1",
                "params": {
                    "name": "vm-a",
                    "cpuCores": 2,
                    "ram": 4,
                    "diskSize": 20,
                    "sshPublicKey": "ssh-rsa X"
                }
            }),
        )
        .unwrap();

        assert_eq!(args.job_type(), JobType::CreateVm);
        assert_eq!(args.resource_id(), Some("v1"));
        match &args {
            JobArgs::CreateVm(a) => {
                assert_eq!(a.params.name, "vm-a");
                assert!(a.zone.is_none());
                assert!(a.params.ports.is_empty());
            }
            other => panic!("unexpected args: {:?}", other),
        }
        assert_eq!(args.to_value().unwrap()["ownerId"], "u1");
    }

    #[test]
    fn test_decode_rejects_wrong_shape() {
        assert!(JobArgs::decode(JobType::AttachGpu, &json!({ "id": "v1" })).is_err());
        assert!(JobArgs::decode(JobType::DeleteVm, &json!({ "vmId": "v1" })).is_err());
        assert!(JobArgs::decode(JobType::DoVmAction, &json!({ "id": "v1", "action": "explode" })).is_err());
    }

    #[test]
    fn test_batch_jobs_have_no_resource() {
        let args = JobArgs::decode(
            JobType::BuildDeployments,
            &json!({ "ids": ["d1", "d2"], "build": { "tag": "abc123" } }),
        )
        .unwrap();
        assert_eq!(args.resource_id(), None);
    }
}
