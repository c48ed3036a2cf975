// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Hypervisor capability.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use stratos_core::models::subsystems::hypervisor::{HypervisorObject, Snapshot};

use super::{ObjectApi, SubsystemError};
use crate::config::PortRange;

/// Power command for a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerAction {
    /// Boot a stopped VM.
    Start,
    /// Shut a running VM down.
    Stop,
    /// Restart a running VM.
    Reboot,
}

impl fmt::Display for PowerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PowerAction::Start => f.write_str("start"),
            PowerAction::Stop => f.write_str("stop"),
            PowerAction::Reboot => f.write_str("reboot"),
        }
    }
}

impl FromStr for PowerAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(PowerAction::Start),
            "stop" => Ok(PowerAction::Stop),
            "reboot" => Ok(PowerAction::Reboot),
            other => Err(format!("unknown power action: {}", other)),
        }
    }
}

/// VM hypervisor: VMs and port-forwarding rules as objects, plus the
/// imperative operations that have no desired-state form.
///
/// `vm_id` arguments are hypervisor ids (`CsVm::id`), not resource ids.
#[async_trait]
pub trait Hypervisor: ObjectApi<HypervisorObject> {
    /// Start, stop, or reboot a VM.
    async fn power(&self, vm_id: &str, action: PowerAction) -> Result<(), SubsystemError>;

    /// Move a VM to `host`.
    async fn migrate(&self, vm_id: &str, host: &str) -> Result<(), SubsystemError>;

    /// The host a VM currently runs on.
    async fn host_of(&self, vm_id: &str) -> Result<Option<String>, SubsystemError>;

    /// Pass the PCI device at `bus` through to a VM.
    async fn attach_pci(&self, vm_id: &str, bus: &str) -> Result<(), SubsystemError>;

    /// Remove a passed-through PCI device. Detaching an absent device succeeds.
    async fn detach_pci(&self, vm_id: &str, bus: &str) -> Result<(), SubsystemError>;

    /// Snapshot a VM.
    async fn create_snapshot(
        &self,
        vm_id: &str,
        name: &str,
        user_created: bool,
    ) -> Result<Snapshot, SubsystemError>;

    /// Snapshots of a VM, oldest first.
    async fn list_snapshots(&self, vm_id: &str) -> Result<Vec<Snapshot>, SubsystemError>;

    /// Revert a VM to a snapshot.
    async fn apply_snapshot(&self, vm_id: &str, snapshot_id: &str) -> Result<(), SubsystemError>;

    /// Delete a snapshot. Deleting a missing snapshot succeeds.
    async fn delete_snapshot(&self, snapshot_id: &str) -> Result<(), SubsystemError>;

    /// Reserve an unused public port of `zone` within `range`.
    async fn free_public_port(&self, zone: &str, range: PortRange) -> Result<u16, SubsystemError>;
}
