// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Hypervisor objects of a VM: the VM itself and one port-forwarding rule per port.

use std::collections::BTreeMap;

use stratos_core::models::Vm;
use stratos_core::models::subsystems::hypervisor::{CsVm, HypervisorObject, PortForwardingRule};
use stratos_core::models::vm::CS_VM_KEY;

use super::GenContext;
use crate::error::{Error, Result};

/// The hypervisor VM for `vm`.
pub fn cs_vm(vm: &Vm, ctx: &GenContext<'_>) -> CsVm {
    let mut ssh_public_keys = vec![vm.spec.ssh_public_key.clone()];
    ssh_public_keys.extend(
        ctx.admin_ssh_keys
            .iter()
            .filter(|k| **k != vm.spec.ssh_public_key)
            .cloned(),
    );

    CsVm {
        id: String::new(),
        name: vm.name.clone(),
        cpu_cores: vm.spec.specs.cpu_cores,
        ram: vm.spec.specs.ram,
        disk_size: vm.spec.specs.disk_size,
        ssh_public_keys,
        host_name: vm.spec.host_name.clone(),
        tags: ctx.labels(&vm.name, &vm.owner_id),
        created_at: None,
    }
}

/// One rule per entry of the port map, keyed like the port map.
///
/// `public_ports` must hold an allocated public port for every key.
pub fn port_forwarding_rules(
    vm: &Vm,
    cs_vm_id: &str,
    public_ports: &BTreeMap<String, u16>,
    ctx: &GenContext<'_>,
) -> Result<BTreeMap<String, HypervisorObject>> {
    if cs_vm_id.is_empty() {
        return Err(Error::Invariant(format!(
            "port-forwarding rules for vm {} need a hypervisor vm id",
            vm.id
        )));
    }

    vm.spec
        .port_map
        .iter()
        .map(|(key, port)| {
            let public_port = public_ports.get(key).copied().ok_or_else(|| {
                Error::Invariant(format!("no public port allocated for {} on vm {}", key, vm.id))
            })?;
            let rule = PortForwardingRule {
                id: String::new(),
                name: key.clone(),
                vm_id: cs_vm_id.to_string(),
                public_port,
                private_port: port.port,
                protocol: port.protocol.as_str().to_string(),
                tags: ctx.labels(&vm.name, &vm.owner_id),
                created_at: None,
            };
            Ok((key.clone(), HypervisorObject::PortForwardingRule(rule)))
        })
        .collect()
}

/// The complete desired `subsystems.cs` map.
pub fn desired(
    vm: &Vm,
    cs_vm_id: &str,
    public_ports: &BTreeMap<String, u16>,
    ctx: &GenContext<'_>,
) -> Result<BTreeMap<String, HypervisorObject>> {
    let mut objects = port_forwarding_rules(vm, cs_vm_id, public_ports, ctx)?;
    objects.insert(CS_VM_KEY.to_string(), HypervisorObject::Vm(cs_vm(vm, ctx)));
    Ok(objects)
}

/// Keys `subsystems.cs` holds once the VM is fully created.
pub fn expected_keys(vm: &Vm) -> Vec<String> {
    std::iter::once(CS_VM_KEY.to_string())
        .chain(vm.spec.port_map.keys().cloned())
        .collect()
}

#[cfg(test)]
mod tests {
    use stratos_core::models::vm::{PortSpec, Protocol, VmSpec, VmSpecs};
    use stratos_core::models::subsystems::{DEPLOY_NAME, MANAGED_BY};

    use super::*;
    use crate::generators::fixtures;

    fn vm() -> Vm {
        let mut spec = VmSpec {
            specs: VmSpecs {
                cpu_cores: 2,
                ram: 4,
                disk_size: 20,
            },
            ssh_public_key: "ssh-rsa X".to_string(),
            host_name: Some("host-1".to_string()),
            ..Default::default()
        };
        spec.add_port(PortSpec {
            name: "ssh".to_string(),
            port: 22,
            protocol: Protocol::Tcp,
        });
        Vm::new("v1", "vm-a", "u1", "se-1", spec)
    }

    #[test]
    fn test_cs_vm_merges_admin_keys_and_tags() {
        let zone = fixtures::zone();
        let admin = vec!["ssh-ed25519 ADMIN".to_string(), "ssh-rsa X".to_string()];
        let ctx = GenContext {
            deployer_id: "stratos-se1",
            registry_url: "registry.local",
            admin_ssh_keys: &admin,
            zone: &zone,
        };

        let cs = cs_vm(&vm(), &ctx);
        assert_eq!(cs.name, "vm-a");
        assert_eq!(cs.ssh_public_keys, vec!["ssh-rsa X", "ssh-ed25519 ADMIN"]);
        assert_eq!(cs.host_name.as_deref(), Some("host-1"));
        assert_eq!(cs.tags[MANAGED_BY], "stratos-se1");
        assert_eq!(cs.tags[DEPLOY_NAME], "vm-a");
    }

    #[test]
    fn test_rules_require_vm_id_and_ports() {
        let zone = fixtures::zone();
        let ctx = GenContext {
            deployer_id: "stratos-se1",
            registry_url: "registry.local",
            admin_ssh_keys: &[],
            zone: &zone,
        };
        let vm = vm();

        let ports = BTreeMap::from([("priv-22-prot-tcp".to_string(), 30022)]);
        assert!(matches!(
            port_forwarding_rules(&vm, "", &ports, &ctx),
            Err(Error::Invariant(_))
        ));
        assert!(matches!(
            port_forwarding_rules(&vm, "cs-1", &BTreeMap::new(), &ctx),
            Err(Error::Invariant(_))
        ));

        let all = desired(&vm, "cs-1", &ports, &ctx).unwrap();
        assert_eq!(all.len(), 2);
        match &all["priv-22-prot-tcp"] {
            HypervisorObject::PortForwardingRule(rule) => {
                assert_eq!(rule.vm_id, "cs-1");
                assert_eq!(rule.public_port, 30022);
                assert_eq!(rule.protocol, "tcp");
            }
            other => panic!("unexpected object: {:?}", other),
        }
        assert_eq!(expected_keys(&vm), vec!["vm", "priv-22-prot-tcp"]);
    }
}
