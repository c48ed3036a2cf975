// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Virtual machine family.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::activity::Activity;
use super::resource::{Resource, ResourceKind};
use super::subsystems::hypervisor::{CsVm, HypervisorObject, PortForwardingRule, Snapshot};

/// Marker for the VM family.
#[derive(Debug, Clone, Copy)]
pub struct VmKind;

/// A persisted VM.
pub type Vm = Resource<VmKind>;

impl ResourceKind for VmKind {
    const KIND: &'static str = "vm";
    const TABLE: &'static str = "vms";
    const ACTIVITIES: &'static [Activity] = &Activity::ALL;

    type Spec = VmSpec;
    type Subsystems = VmSubsystems;
}

/// Key of the hypervisor VM inside `subsystems.cs`.
pub const CS_VM_KEY: &str = "vm";

/// Desired VM state.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmSpec {
    /// Compute sizing.
    pub specs: VmSpecs,
    /// Key installed for the owner.
    pub ssh_public_key: String,
    /// Exposed ports keyed by [`port_key`].
    #[serde(default)]
    pub port_map: BTreeMap<String, PortSpec>,
    /// Compute host chosen at scheduling time.
    #[serde(default)]
    pub host_name: Option<String>,
    /// Id of the GPU whose lease currently points at this VM.
    #[serde(default)]
    pub gpu_lease_id: Option<String>,
}

/// CPU, memory, and disk sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmSpecs {
    /// Virtual CPU count.
    pub cpu_cores: u32,
    /// Memory in GB.
    pub ram: u32,
    /// Root disk in GB.
    pub disk_size: u32,
}

/// One port the VM exposes through port forwarding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortSpec {
    /// Display name.
    pub name: String,
    /// Port inside the VM.
    pub port: u16,
    /// Transport protocol.
    pub protocol: Protocol,
}

/// Transport protocol of a forwarded port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// TCP.
    Tcp,
    /// UDP.
    Udp,
}

impl Protocol {
    /// Lower-case wire name.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            other => Err(format!("unknown protocol: {}", other)),
        }
    }
}

/// Deterministic key of a port mapping: `priv-<port>-prot-<proto>`.
pub fn port_key(port: u16, protocol: Protocol) -> String {
    format!("priv-{}-prot-{}", port, protocol)
}

impl VmSpec {
    /// Insert a port, keyed by its deterministic name.
    pub fn add_port(&mut self, port: PortSpec) {
        self.port_map
            .insert(port_key(port.port, port.protocol), port);
    }
}

/// Observed hypervisor state for a VM.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmSubsystems {
    /// VM and port-forwarding rules keyed by deterministic name.
    #[serde(default)]
    pub cs: BTreeMap<String, HypervisorObject>,
    /// Snapshots keyed by snapshot id.
    #[serde(default)]
    pub snapshots: BTreeMap<String, Snapshot>,
}

impl VmSubsystems {
    /// The hypervisor VM, if one has been recorded.
    pub fn cs_vm(&self) -> Option<&CsVm> {
        match self.cs.get(CS_VM_KEY) {
            Some(HypervisorObject::Vm(vm)) => Some(vm),
            _ => None,
        }
    }

    /// Recorded port-forwarding rules keyed by port key.
    pub fn port_forwarding_rules(&self) -> impl Iterator<Item = (&String, &PortForwardingRule)> {
        self.cs.iter().filter_map(|(key, obj)| match obj {
            HypervisorObject::PortForwardingRule(rule) => Some((key, rule)),
            _ => None,
        })
    }

    /// Whether nothing remains on the hypervisor.
    pub fn is_empty(&self) -> bool {
        self.cs.is_empty() && self.snapshots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_key_format() {
        assert_eq!(port_key(22, Protocol::Tcp), "priv-22-prot-tcp");
        assert_eq!(port_key(53, Protocol::Udp), "priv-53-prot-udp");
    }

    #[test]
    fn test_spec_uses_camel_case() {
        let mut spec = VmSpec {
            specs: VmSpecs {
                cpu_cores: 2,
                ram: 4,
                disk_size: 20,
            },
            ssh_public_key: "ssh-rsa X".to_string(),
            ..Default::default()
        };
        spec.add_port(PortSpec {
            name: "ssh".to_string(),
            port: 22,
            protocol: Protocol::Tcp,
        });

        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["specs"]["cpuCores"], 2);
        assert_eq!(json["sshPublicKey"], "ssh-rsa X");
        assert!(json["portMap"].get("priv-22-prot-tcp").is_some());
    }

    #[test]
    fn test_vm_kind_accepts_every_activity() {
        for activity in Activity::ALL {
            assert!(VmKind::supports(activity));
        }
    }
}
