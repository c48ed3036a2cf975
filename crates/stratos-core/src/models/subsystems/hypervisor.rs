// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Hypervisor objects: VMs, port-forwarding rules, snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Labels, Projection, delegate_projection};

/// A VM as seen by the hypervisor.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CsVm {
    /// Hypervisor id.
    #[serde(default)]
    pub id: String,
    /// VM name.
    pub name: String,
    /// Virtual CPUs.
    pub cpu_cores: u32,
    /// Memory in GB.
    pub ram: u32,
    /// Root disk in GB.
    pub disk_size: u32,
    /// Authorized keys (owner first, then administrative keys).
    pub ssh_public_keys: Vec<String>,
    /// Placement host, if pinned.
    #[serde(default)]
    pub host_name: Option<String>,
    /// Ownership tags.
    #[serde(default)]
    pub tags: Labels,
    /// Creation time reported by the hypervisor.
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl Projection for CsVm {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn clear_timestamps(&mut self) {
        self.created_at = None;
    }

    fn adopt_identity(&mut self, observed: &Self) {
        self.id = observed.id.clone();
    }
}

/// A public-to-private port mapping on the hypervisor's network.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortForwardingRule {
    /// Hypervisor id.
    #[serde(default)]
    pub id: String,
    /// Deterministic name, `priv-<port>-prot-<proto>`.
    pub name: String,
    /// Hypervisor id of the target VM.
    pub vm_id: String,
    /// Port exposed on the zone's public address.
    pub public_port: u16,
    /// Port inside the VM.
    pub private_port: u16,
    /// `tcp` or `udp`.
    pub protocol: String,
    /// Ownership tags.
    #[serde(default)]
    pub tags: Labels,
    /// Creation time reported by the hypervisor.
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl Projection for PortForwardingRule {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn clear_timestamps(&mut self) {
        self.created_at = None;
    }

    fn adopt_identity(&mut self, observed: &Self) {
        self.id = observed.id.clone();
    }
}

/// A VM snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    /// Hypervisor id.
    #[serde(default)]
    pub id: String,
    /// Hypervisor id of the VM.
    pub vm_id: String,
    /// Snapshot name.
    pub name: String,
    /// Hypervisor state (`Ready`, `Creating`, ...).
    pub state: String,
    /// Taken on a user's request, as opposed to the retention schedule.
    pub user_created: bool,
    /// Whether the VM currently runs from this snapshot.
    #[serde(default)]
    pub current: bool,
    /// Creation time reported by the hypervisor.
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl Projection for Snapshot {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn clear_timestamps(&mut self) {
        self.created_at = None;
    }

    fn adopt_identity(&mut self, observed: &Self) {
        self.id = observed.id.clone();
    }
}

/// Any object the VM family projects into the hypervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum HypervisorObject {
    /// The VM itself.
    Vm(CsVm),
    /// A port-forwarding rule.
    PortForwardingRule(PortForwardingRule),
}

delegate_projection!(HypervisorObject { Vm, PortForwardingRule });

impl HypervisorObject {
    /// Teardown order: rules before the VM they point at.
    pub fn delete_rank(&self) -> u8 {
        match self {
            HypervisorObject::PortForwardingRule(_) => 0,
            HypervisorObject::Vm(_) => 1,
        }
    }
}
