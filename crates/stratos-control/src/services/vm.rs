// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! VM orchestration: hypervisor VM, port forwarding, snapshots, and power.

use std::collections::BTreeMap;
use std::time::Duration;

use stratos_core::CoreError;
use stratos_core::models::subsystems::Projection;
use stratos_core::models::subsystems::hypervisor::{HypervisorObject, Snapshot};
use stratos_core::models::vm::{CS_VM_KEY, PortSpec, Protocol, VmSpec, VmSpecs, port_key};
use stratos_core::models::{Activity, JobType, Vm, VmKind};
use stratos_core::persistence::{ResourceRepository, ResourceUpdate};
use tracing::{debug, info, warn};

use super::{GpuService, RelatedJobWait, mark_deleting, pick_host, wait_for_related_jobs};
use crate::context::ControlContext;
use crate::error::{Error, Result};
use crate::generators::GenContext;
use crate::generators::vm::{cs_vm, desired};
use crate::jobs::args::{VmCreateParams, VmUpdateParams};
use crate::reconcile::Reconciler;
use crate::subsystems::{PowerAction, with_timeout};

const CS: &str = "cs";

fn ssh_port() -> PortSpec {
    PortSpec {
        name: "ssh".to_string(),
        port: 22,
        protocol: Protocol::Tcp,
    }
}

/// SSH plus `ports`, keyed the way `spec.portMap` is.
fn port_map(ports: &[PortSpec]) -> BTreeMap<String, PortSpec> {
    std::iter::once(ssh_port())
        .chain(ports.iter().cloned())
        .map(|p| (port_key(p.port, p.protocol), p))
        .collect()
}

/// Orchestrates VMs.
#[derive(Clone)]
pub struct VmService {
    ctx: ControlContext,
    gpus: GpuService,
}

impl VmService {
    /// Create a VM service.
    pub fn new(ctx: ControlContext) -> Self {
        let gpus = GpuService::new(ctx.clone());
        Self { ctx, gpus }
    }

    fn repo(&self) -> ResourceRepository<VmKind> {
        self.ctx.vms()
    }

    fn timeout(&self) -> Duration {
        self.ctx.config().subsystem_timeout
    }

    fn cs_id(vm: &Vm) -> Result<String> {
        vm.subsystems
            .cs_vm()
            .map(|cs| cs.id.clone())
            .filter(|id| !id.is_empty())
            .ok_or_else(|| Error::InvalidRequest(format!("vm {} has no hypervisor vm yet", vm.id)))
    }

    /// Insert the VM and create its hypervisor objects.
    ///
    /// A second attempt for the same id resumes where the first one stopped.
    /// A name held by another VM repairs that VM and fails with
    /// [`Error::InvalidRequest`].
    pub async fn create(
        &self,
        id: &str,
        owner_id: &str,
        zone: Option<&str>,
        params: &VmCreateParams,
    ) -> Result<()> {
        let zone = match zone {
            Some(name) => self.ctx.zone(name)?,
            None => self.ctx.default_zone()?,
        };

        let spec = VmSpec {
            specs: VmSpecs {
                cpu_cores: params.cpu_cores,
                ram: params.ram,
                disk_size: params.disk_size,
            },
            ssh_public_key: params.ssh_public_key.clone(),
            port_map: port_map(&params.ports),
            host_name: pick_host(&self.ctx.cache(), zone, params.ram).await?,
            gpu_lease_id: None,
        };
        let vm = Vm::new(id, &params.name, owner_id, &zone.name, spec)
            .with_activity(Activity::BeingCreated);

        let repo = self.repo();
        match repo.create_if_unique(&vm).await {
            Ok(()) => info!(vm_id = %id, name = %vm.name, host = ?vm.spec.host_name, "VM inserted"),
            Err(CoreError::UniqueConstraintViolation { .. } | CoreError::DuplicateId { .. }) => {
                if repo.exists(id).await? {
                    debug!(vm_id = %id, "Resuming VM creation");
                } else {
                    self.repair_holder_of(&vm.name).await;
                    return Err(Error::InvalidRequest(format!(
                        "vm name {} is already taken",
                        vm.name
                    )));
                }
            }
            Err(e) => return Err(e.into()),
        }

        let vm = repo.require(id).await?;
        self.ensure(&vm).await
    }

    async fn repair_holder_of(&self, name: &str) {
        match self.repo().get_by_name(name).await {
            Ok(Some(holder)) => {
                if let Err(e) = self.repair(&holder.id).await {
                    warn!(vm_id = %holder.id, error = %e, "Repair of conflicting VM failed");
                }
            }
            Ok(None) => {}
            Err(e) => warn!(name = %name, error = %e, "Lookup of conflicting VM failed"),
        }
    }

    /// Bring the hypervisor in line with `vm`.
    async fn ensure(&self, vm: &Vm) -> Result<()> {
        let zone = self.ctx.zone(&vm.zone)?;
        let gen_ctx = GenContext::new(self.ctx.config(), zone);
        let repo = self.repo();
        let hv = self.ctx.subsystems().hypervisor.as_ref();
        let reconciler = Reconciler::new(&repo, &vm.id, CS, self.timeout());

        let observed = reconciler
            .apply_one(hv, CS_VM_KEY, &HypervisorObject::Vm(cs_vm(vm, &gen_ctx)))
            .await?;

        // Keep the public port a rule already has.
        let recorded: BTreeMap<&String, u16> = vm
            .subsystems
            .port_forwarding_rules()
            .map(|(key, rule)| (key, rule.public_port))
            .collect();
        let mut public_ports = BTreeMap::new();
        for key in vm.spec.port_map.keys() {
            let port = match recorded.get(key) {
                Some(port) => *port,
                None => {
                    with_timeout(
                        "hypervisor",
                        self.timeout(),
                        hv.free_public_port(&zone.name, zone.port_range),
                    )
                    .await?
                }
            };
            public_ports.insert(key.clone(), port);
        }

        let wanted = desired(vm, observed.id(), &public_ports, &gen_ctx)?;
        reconciler.apply(hv, &wanted, &vm.subsystems.cs).await?;
        Ok(())
    }

    /// Resize the VM or replace its ports.
    pub async fn update(&self, id: &str, params: &VmUpdateParams) -> Result<()> {
        let repo = self.repo();
        let vm = repo.require(id).await?;

        let mut specs = vm.spec.specs;
        if let Some(cpu_cores) = params.cpu_cores {
            specs.cpu_cores = cpu_cores;
        }
        if let Some(ram) = params.ram {
            specs.ram = ram;
        }
        if let Some(disk_size) = params.disk_size {
            if disk_size < specs.disk_size {
                return Err(Error::InvalidRequest(format!(
                    "disk of vm {} cannot shrink from {} to {} GB",
                    id, specs.disk_size, disk_size
                )));
            }
            specs.disk_size = disk_size;
        }

        repo.set_spec_field(id, &["specs"], &specs).await?;
        if let Some(ports) = &params.ports {
            repo.set_spec_field(id, &["portMap"], &port_map(ports))
                .await?;
        }

        // A VM deleted in the meantime is NotFound here.
        let vm = repo.require(id).await?;
        self.ensure(&vm).await?;
        repo.mark_updated(id).await?;
        info!(vm_id = %id, "VM updated");
        Ok(())
    }

    /// Hand the VM to `new_owner_id`. Any GPU lease is given up.
    pub async fn update_owner(&self, id: &str, new_owner_id: &str) -> Result<()> {
        let repo = self.repo();
        let vm = repo.require(id).await?;
        if vm.owner_id == new_owner_id {
            debug!(vm_id = %id, "Owner unchanged");
            return Ok(());
        }

        self.gpus.detach(id, None).await?;
        let update = ResourceUpdate {
            owner_id: Some(new_owner_id.to_string()),
            ..Default::default()
        };
        repo.update(id, &update).await?;

        let vm = repo.require(id).await?;
        self.ensure(&vm).await?;
        repo.mark_updated(id).await?;
        info!(vm_id = %id, owner_id = %new_owner_id, "VM owner updated");
        Ok(())
    }

    /// Tear down every hypervisor object and soft-delete the VM.
    ///
    /// Projections stay recorded; the confirmer hard-deletes once the
    /// hypervisor no longer has any of them.
    pub async fn delete(&self, id: &str, wait: RelatedJobWait) -> Result<()> {
        wait_for_related_jobs(&self.ctx.jobs(), id, JobType::DeleteVm, wait).await?;

        // Read after the wait so objects recorded by a create that finished
        // meanwhile are torn down too.
        let repo = self.repo().including_deleted();
        let Some(vm) = repo.get(id).await? else {
            debug!(vm_id = %id, "VM already gone");
            return Ok(());
        };
        mark_deleting(&repo, id).await?;
        self.gpus.detach(id, None).await?;

        let hv = self.ctx.subsystems().hypervisor.as_ref();
        for snapshot_id in vm.subsystems.snapshots.keys() {
            with_timeout("hypervisor", self.timeout(), hv.delete_snapshot(snapshot_id)).await?;
            repo.unset_subsystem(id, &["snapshots", snapshot_id.as_str()])
                .await?;
        }

        Reconciler::new(&repo, id, CS, self.timeout())
            .delete_all(hv, &vm.subsystems.cs)
            .await?;
        repo.soft_delete(id).await?;
        info!(vm_id = %id, "VM deleted");
        Ok(())
    }

    /// Reconcile the VM without changing it.
    pub async fn repair(&self, id: &str) -> Result<()> {
        let repo = self.repo();
        let vm = repo.require(id).await?;
        self.ensure(&vm).await?;
        repo.mark_repaired(id).await?;
        debug!(vm_id = %id, "VM repaired");
        Ok(())
    }

    /// Lease one of `gpu_ids` to the VM.
    pub async fn attach_gpu(&self, id: &str, gpu_ids: &[String], lease: Duration) -> Result<()> {
        self.gpus.attach(id, gpu_ids, lease).await?;
        Ok(())
    }

    /// Unplug and release the VM's GPU.
    pub async fn detach_gpu(&self, id: &str, released: Option<&str>) -> Result<()> {
        self.gpus.detach(id, released).await?;
        Ok(())
    }

    /// Take a snapshot.
    ///
    /// User snapshots are capped per VM. System snapshots beyond the
    /// retention count are deleted, oldest first.
    pub async fn create_snapshot(&self, id: &str, name: &str, user_created: bool) -> Result<Snapshot> {
        let repo = self.repo();
        let vm = repo.require(id).await?;
        let cs_id = Self::cs_id(&vm)?;
        let hv = self.ctx.subsystems().hypervisor.as_ref();
        let config = self.ctx.config();

        let existing = with_timeout("hypervisor", self.timeout(), hv.list_snapshots(&cs_id)).await?;
        if user_created
            && existing.iter().filter(|s| s.user_created).count() >= config.user_snapshot_limit
        {
            return Err(Error::InvalidRequest(format!(
                "vm {} already has {} user snapshot(s)",
                id, config.user_snapshot_limit
            )));
        }

        let snapshot = with_timeout(
            "hypervisor",
            self.timeout(),
            hv.create_snapshot(&cs_id, name, user_created),
        )
        .await?;
        repo.set_subsystem(id, &["snapshots", snapshot.id.as_str()], &snapshot)
            .await?;
        info!(vm_id = %id, snapshot_id = %snapshot.id, user_created, "Snapshot created");

        if !user_created {
            let mut system: Vec<Snapshot> = existing
                .into_iter()
                .filter(|s| !s.user_created)
                .chain(std::iter::once(snapshot.clone()))
                .collect();
            system.sort_by_key(|s| s.created_at);
            let excess = system.len().saturating_sub(config.system_snapshot_retention);
            for old in system.iter().take(excess) {
                self.delete_snapshot(id, &old.id).await?;
            }
        }
        Ok(snapshot)
    }

    /// Delete a snapshot on the hypervisor and forget it.
    pub async fn delete_snapshot(&self, id: &str, snapshot_id: &str) -> Result<()> {
        let hv = self.ctx.subsystems().hypervisor.as_ref();
        with_timeout("hypervisor", self.timeout(), hv.delete_snapshot(snapshot_id)).await?;
        self.repo()
            .unset_subsystem(id, &["snapshots", snapshot_id])
            .await?;
        debug!(vm_id = %id, snapshot_id = %snapshot_id, "Snapshot deleted");
        Ok(())
    }

    /// Restore a snapshot and re-record every snapshot of the VM.
    pub async fn apply_snapshot(&self, id: &str, snapshot_id: &str) -> Result<()> {
        let repo = self.repo();
        let vm = repo.require(id).await?;
        let cs_id = Self::cs_id(&vm)?;
        let hv = self.ctx.subsystems().hypervisor.as_ref();

        with_timeout("hypervisor", self.timeout(), hv.apply_snapshot(&cs_id, snapshot_id)).await?;
        for snapshot in with_timeout("hypervisor", self.timeout(), hv.list_snapshots(&cs_id)).await? {
            repo.set_subsystem(id, &["snapshots", snapshot.id.as_str()], &snapshot)
                .await?;
        }
        info!(vm_id = %id, snapshot_id = %snapshot_id, "Snapshot applied");
        Ok(())
    }

    /// Send a power command.
    pub async fn do_action(&self, id: &str, action: PowerAction) -> Result<()> {
        let vm = self.repo().require(id).await?;
        let cs_id = Self::cs_id(&vm)?;
        let hv = self.ctx.subsystems().hypervisor.as_ref();
        with_timeout("hypervisor", self.timeout(), hv.power(&cs_id, action)).await?;
        info!(vm_id = %id, action = %action, "VM power command sent");
        Ok(())
    }
}
