// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! GPU passthrough on top of the lease CAS in
//! [`GpuRepository`](stratos_core::persistence::GpuRepository).
//!
//! The lease is taken before the hypervisor is touched and released again if
//! the PCI attach fails, so a GPU is never passed through without a lease.

use std::time::Duration;

use chrono::Utc;
use stratos_core::CoreError;
use stratos_core::models::Gpu;
use tracing::{debug, info, warn};

use crate::context::ControlContext;
use crate::error::{Error, Result};
use crate::subsystems::with_timeout;

/// Leases GPUs to VMs and wires them through the hypervisor.
#[derive(Clone)]
pub struct GpuService {
    ctx: ControlContext,
}

impl GpuService {
    /// Create a GPU service.
    pub fn new(ctx: ControlContext) -> Self {
        Self { ctx }
    }

    fn timeout(&self) -> Duration {
        self.ctx.config().subsystem_timeout
    }

    /// Lease the first free GPU of `candidates` to `vm_id` and pass it through.
    ///
    /// A VM holding one of the candidates renews that lease. A VM holding some
    /// other GPU gives it up first. When every candidate is leased elsewhere
    /// the error is [`CoreError::GpuAlreadyAttached`].
    pub async fn attach(&self, vm_id: &str, candidates: &[String], lease: Duration) -> Result<Gpu> {
        if candidates.is_empty() {
            return Err(Error::InvalidRequest("no candidate GPUs given".to_string()));
        }
        let vm = self.ctx.vms().require(vm_id).await?;
        let cs_id = vm
            .subsystems
            .cs_vm()
            .filter(|cs| !cs.id.is_empty())
            .map(|cs| cs.id.clone())
            .ok_or_else(|| {
                Error::InvalidRequest(format!("vm {} has no hypervisor vm yet", vm_id))
            })?;

        let gpus = self.ctx.gpus();
        let mut held_id = None;
        if let Some(held) = gpus.get_by_vm(vm_id).await? {
            if candidates.contains(&held.id) {
                held_id = Some(held.id);
            } else {
                info!(vm_id = %vm_id, gpu_id = %held.id, "Releasing previously leased GPU");
                self.detach(vm_id, None).await?;
            }
        }

        let lease = chrono::Duration::from_std(lease)
            .map_err(|e| Error::InvalidRequest(format!("invalid lease duration: {}", e)))?;
        let until = Utc::now() + lease;

        let mut last_err: Option<CoreError> = None;
        let mut won = None;
        for gpu_id in candidates {
            match gpus.attach(gpu_id, vm_id, &vm.owner_id, until).await {
                Ok(true) => {
                    won = Some(gpu_id.clone());
                    break;
                }
                Ok(false) => {
                    debug!(gpu_id = %gpu_id, vm_id = %vm_id, "Lost lease race");
                    last_err = Some(CoreError::GpuAlreadyAttached {
                        gpu_id: gpu_id.clone(),
                        vm_id: String::new(),
                    });
                }
                Err(e @ (CoreError::GpuAlreadyAttached { .. } | CoreError::GpuNotFound { .. })) => {
                    debug!(gpu_id = %gpu_id, vm_id = %vm_id, error = %e, "GPU unavailable");
                    last_err = Some(e);
                }
                Err(e) => return Err(e.into()),
            }
        }

        let Some(gpu_id) = won else {
            // Prefer reporting a taken GPU over a missing one.
            return Err(last_err
                .unwrap_or_else(|| CoreError::GpuNotFound {
                    gpu_id: candidates.join(","),
                })
                .into());
        };
        let gpu = gpus.get(&gpu_id).await?.ok_or_else(|| CoreError::GpuNotFound {
            gpu_id: gpu_id.clone(),
        })?;

        // A renewed lease is already passed through.
        if held_id.as_deref() == Some(gpu.id.as_str()) {
            debug!(vm_id = %vm_id, gpu_id = %gpu.id, "GPU lease renewed");
        } else if let Err(e) = self.pass_through(vm_id, &cs_id, &gpu).await {
            warn!(vm_id = %vm_id, gpu_id = %gpu.id, error = %e, "GPU pass-through failed, releasing lease");
            gpus.detach(vm_id).await?;
            return Err(e);
        }

        self.ctx
            .vms()
            .set_spec_field(vm_id, &["gpuLeaseId"], &gpu.id)
            .await?;
        info!(vm_id = %vm_id, gpu_id = %gpu.id, host = %gpu.host, "GPU attached");
        Ok(gpu)
    }

    async fn pass_through(&self, vm_id: &str, cs_id: &str, gpu: &Gpu) -> Result<()> {
        let hv = &self.ctx.subsystems().hypervisor;
        let current = with_timeout("hypervisor", self.timeout(), hv.host_of(cs_id)).await?;
        if current.as_deref() != Some(gpu.host.as_str()) {
            with_timeout("hypervisor", self.timeout(), hv.migrate(cs_id, &gpu.host)).await?;
            self.ctx
                .vms()
                .set_spec_field(vm_id, &["hostName"], &gpu.host)
                .await?;
        }
        with_timeout("hypervisor", self.timeout(), hv.attach_pci(cs_id, &gpu.data.bus)).await?;
        Ok(())
    }

    /// Unplug and release whatever GPU `vm_id` holds.
    ///
    /// `released` names a GPU whose lease was already cleared by the lease
    /// sweep; its device is still unplugged. Returns whether anything was
    /// detached.
    pub async fn detach(&self, vm_id: &str, released: Option<&str>) -> Result<bool> {
        let gpus = self.ctx.gpus();
        let gpu = match gpus.get_by_vm(vm_id).await? {
            Some(gpu) => Some(gpu),
            None => match released {
                Some(id) => gpus.get(id).await?,
                None => None,
            },
        };

        let vms = self.ctx.vms().including_deleted();
        let Some(gpu) = gpu else {
            vms.unset_spec_field(vm_id, &["gpuLeaseId"]).await?;
            return Ok(false);
        };

        let cs_id = vms
            .get(vm_id)
            .await?
            .and_then(|vm| vm.subsystems.cs_vm().map(|cs| cs.id.clone()))
            .filter(|id| !id.is_empty());
        if let Some(cs_id) = cs_id {
            let hv = &self.ctx.subsystems().hypervisor;
            with_timeout(
                "hypervisor",
                self.timeout(),
                hv.detach_pci(&cs_id, &gpu.data.bus),
            )
            .await?;
        }

        gpus.detach(vm_id).await?;
        vms.unset_spec_field(vm_id, &["gpuLeaseId"]).await?;
        info!(vm_id = %vm_id, gpu_id = %gpu.id, "GPU detached");
        Ok(true)
    }

    /// Release every lease whose end has passed.
    ///
    /// Returns `(vm_id, gpu_id)` of each released lease; the caller follows
    /// up with a `detachGpu` job to unplug the device.
    pub async fn release_expired(&self) -> Result<Vec<(String, String)>> {
        let gpus = self.ctx.gpus();
        let now = Utc::now();
        let mut released = Vec::new();
        for gpu in gpus.list_leased().await? {
            if !gpu.is_expired(now) {
                continue;
            }
            if gpus.detach(&gpu.lease.vm_id).await? {
                info!(vm_id = %gpu.lease.vm_id, gpu_id = %gpu.id, "GPU lease expired");
                released.push((gpu.lease.vm_id, gpu.id));
            }
        }
        Ok(released)
    }
}
