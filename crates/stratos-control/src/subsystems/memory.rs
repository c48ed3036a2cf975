// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process subsystem implementations.
//!
//! These keep every object in memory and never talk to a real system. They
//! back the simulation binary and the test suite, and support fault
//! injection so callers can exercise retry and recreate paths.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use stratos_core::models::GpuData;
use stratos_core::models::subsystems::Projection;
use stratos_core::models::subsystems::dns::DnsRecord;
use stratos_core::models::subsystems::hypervisor::{HypervisorObject, Snapshot};
use stratos_core::models::subsystems::k8s::K8sObject;
use stratos_core::models::subsystems::registry::RegistryObject;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    Cluster, Dns, HostApi, HostCapacities, HostStatus, Hypervisor, ObjectApi, PowerAction,
    Registry, Subsystems, SubsystemError,
};
use crate::config::{PortRange, ZoneConfig};

/// Switchable failure modes shared by the in-memory subsystems.
#[derive(Debug, Default)]
pub struct FaultInjector {
    unavailable: AtomicBool,
    fail_next: AtomicU32,
    panic_next: AtomicU32,
    calls: AtomicU64,
}

impl FaultInjector {
    /// Make every call fail with `Unavailable` until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Fail the next `n` calls with `Unavailable`.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Panic inside the next `n` calls, the way a buggy client library would.
    pub fn panic_next(&self, n: u32) {
        self.panic_next.store(n, Ordering::SeqCst);
    }

    /// Calls made so far.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    fn check(&self, system: &'static str) -> Result<(), SubsystemError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(unavailable(system));
        }
        let pending = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if pending.is_ok() {
            return Err(unavailable(system));
        }
        let panicking = self
            .panic_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if panicking.is_ok() {
            panic!("{} client panicked (injected)", system);
        }
        Ok(())
    }
}

fn unavailable(system: &'static str) -> SubsystemError {
    SubsystemError::Unavailable {
        system,
        reason: "injected fault".to_string(),
    }
}

/// How an object is stored and what the fake subsystem assigns to it.
trait Stored: Projection {
    const SYSTEM: &'static str;

    /// Identity the subsystem addresses the object by.
    fn store_key(&self) -> String;

    /// Stamp the subsystem-assigned id and creation time.
    fn assign(&mut self, id: String, at: DateTime<Utc>);

    /// Whether `self` can be changed into `next` in place.
    fn mutable_to(&self, _next: &Self) -> bool {
        true
    }
}

impl Stored for HypervisorObject {
    const SYSTEM: &'static str = "hypervisor";

    fn store_key(&self) -> String {
        match self {
            HypervisorObject::Vm(vm) => format!("vm/{}", vm.name),
            HypervisorObject::PortForwardingRule(rule) => {
                format!("pfr/{}/{}", rule.vm_id, rule.name)
            }
        }
    }

    fn assign(&mut self, id: String, at: DateTime<Utc>) {
        match self {
            HypervisorObject::Vm(vm) => {
                vm.id = id;
                vm.created_at = Some(at);
            }
            HypervisorObject::PortForwardingRule(rule) => {
                rule.id = id;
                rule.created_at = Some(at);
            }
        }
    }

    fn mutable_to(&self, next: &Self) -> bool {
        match (self, next) {
            // Disks only grow, and rules are immutable.
            (HypervisorObject::Vm(current), HypervisorObject::Vm(next)) => {
                next.disk_size >= current.disk_size
            }
            _ => false,
        }
    }
}

macro_rules! assign_k8s {
    ($obj:expr, $id:expr, $at:expr, $($variant:ident),+) => {
        match $obj {
            $(K8sObject::$variant(inner) => {
                inner.uid = $id;
                inner.created_at = Some($at);
            })+
        }
    };
}

impl Stored for K8sObject {
    const SYSTEM: &'static str = "cluster";

    fn store_key(&self) -> String {
        format!("{}/{}", self.namespace(), self.key())
    }

    fn assign(&mut self, id: String, at: DateTime<Utc>) {
        assign_k8s!(
            self,
            id,
            at,
            Namespace,
            Deployment,
            Service,
            Ingress,
            PersistentVolume,
            PersistentVolumeClaim,
            Secret,
            Job,
            Hpa,
            NetworkPolicy
        );
    }

    fn mutable_to(&self, next: &Self) -> bool {
        match (self, next) {
            (K8sObject::Job(_), _) => false,
            (K8sObject::PersistentVolume(current), K8sObject::PersistentVolume(next)) => {
                current.nfs_server == next.nfs_server && current.nfs_path == next.nfs_path
            }
            _ => true,
        }
    }
}

impl Stored for RegistryObject {
    const SYSTEM: &'static str = "registry";

    fn store_key(&self) -> String {
        match self {
            RegistryObject::Project(p) => format!("project/{}", p.name),
            RegistryObject::Robot(r) => format!("robot/{}/{}", r.project_name, r.name),
            RegistryObject::Repository(r) => format!("repository/{}/{}", r.project_name, r.name),
            RegistryObject::Webhook(w) => format!("webhook/{}/{}", w.project_name, w.name),
        }
    }

    fn assign(&mut self, id: String, at: DateTime<Utc>) {
        match self {
            RegistryObject::Project(p) => {
                p.id = id;
                p.created_at = Some(at);
            }
            RegistryObject::Robot(r) => {
                r.secret = Uuid::new_v4().simple().to_string();
                r.id = id;
                r.created_at = Some(at);
            }
            RegistryObject::Repository(r) => {
                r.id = id;
                r.created_at = Some(at);
            }
            RegistryObject::Webhook(w) => {
                w.id = id;
                w.created_at = Some(at);
            }
        }
    }

    fn mutable_to(&self, _next: &Self) -> bool {
        !matches!(self, RegistryObject::Robot(_))
    }
}

impl Stored for DnsRecord {
    const SYSTEM: &'static str = "dns";

    fn store_key(&self) -> String {
        format!("{}/{}/{}", self.zone, self.hostname, self.record_type)
    }

    fn assign(&mut self, id: String, at: DateTime<Utc>) {
        self.id = id;
        self.created_at = Some(at);
    }

    fn mutable_to(&self, _next: &Self) -> bool {
        false
    }
}

/// Object table with fault injection, shared by every fake subsystem.
#[derive(Debug)]
struct ObjectTable<T> {
    objects: Mutex<BTreeMap<String, T>>,
    faults: FaultInjector,
}

impl<T> Default for ObjectTable<T> {
    fn default() -> Self {
        Self {
            objects: Mutex::new(BTreeMap::new()),
            faults: FaultInjector::default(),
        }
    }
}

impl<T: Stored> ObjectTable<T> {
    async fn read(&self, desired: &T) -> Result<Option<T>, SubsystemError> {
        self.faults.check(T::SYSTEM)?;
        Ok(self.objects.lock().await.get(&desired.store_key()).cloned())
    }

    async fn create(&self, desired: &T) -> Result<T, SubsystemError> {
        self.faults.check(T::SYSTEM)?;
        let key = desired.store_key();
        let mut objects = self.objects.lock().await;
        if let Some(existing) = objects.get(&key) {
            return Ok(existing.clone());
        }
        let mut created = desired.clone();
        created.assign(Uuid::new_v4().to_string(), Utc::now());
        objects.insert(key, created.clone());
        Ok(created)
    }

    async fn update(&self, desired: &T) -> Result<T, SubsystemError> {
        self.faults.check(T::SYSTEM)?;
        let key = desired.store_key();
        let mut objects = self.objects.lock().await;
        let current = objects.get(&key).ok_or_else(|| SubsystemError::NotFound {
            system: T::SYSTEM,
            name: desired.name().to_string(),
        })?;
        if !current.mutable_to(desired) {
            return Err(SubsystemError::NotMutable {
                system: T::SYSTEM,
                name: desired.name().to_string(),
            });
        }
        let mut updated = desired.clone();
        updated.adopt_identity(current);
        objects.insert(key, updated.clone());
        Ok(updated)
    }

    async fn delete(&self, observed: &T) -> Result<(), SubsystemError> {
        self.faults.check(T::SYSTEM)?;
        self.objects.lock().await.remove(&observed.store_key());
        Ok(())
    }

    async fn all(&self) -> Vec<T> {
        self.objects.lock().await.values().cloned().collect()
    }
}

macro_rules! object_api {
    ($ty:ty, $object:ty) => {
        #[async_trait]
        impl ObjectApi<$object> for $ty {
            async fn read(&self, desired: &$object) -> Result<Option<$object>, SubsystemError> {
                self.objects.read(desired).await
            }

            async fn create(&self, desired: &$object) -> Result<$object, SubsystemError> {
                self.objects.create(desired).await
            }

            async fn update(&self, desired: &$object) -> Result<$object, SubsystemError> {
                self.objects.update(desired).await
            }

            async fn delete(&self, observed: &$object) -> Result<(), SubsystemError> {
                self.objects.delete(observed).await
            }
        }

        impl $ty {
            /// Fault switches for this subsystem.
            pub fn faults(&self) -> &FaultInjector {
                &self.objects.faults
            }

            /// Every stored object.
            pub async fn objects(&self) -> Vec<$object> {
                self.objects.all().await
            }

            /// Remove an object behind the control plane's back.
            pub async fn remove_out_of_band(&self, object: &$object) {
                self.objects
                    .objects
                    .lock()
                    .await
                    .remove(&object.store_key());
            }
        }
    };
}

/// In-memory hypervisor.
#[derive(Debug, Default)]
pub struct MemoryHypervisor {
    objects: ObjectTable<HypervisorObject>,
    power: Mutex<HashMap<String, PowerAction>>,
    placement: Mutex<HashMap<String, String>>,
    devices: Mutex<HashMap<String, BTreeSet<String>>>,
    snapshots: Mutex<BTreeMap<String, Snapshot>>,
    reserved_ports: Mutex<HashMap<String, BTreeSet<u16>>>,
    pci_faults: FaultInjector,
}

object_api!(MemoryHypervisor, HypervisorObject);

impl MemoryHypervisor {
    /// Fault switches for PCI passthrough only.
    pub fn pci_faults(&self) -> &FaultInjector {
        &self.pci_faults
    }

    /// Last power command sent to a VM.
    pub async fn power_state(&self, vm_id: &str) -> Option<PowerAction> {
        self.power.lock().await.get(vm_id).copied()
    }

    /// PCI buses passed through to a VM.
    pub async fn devices(&self, vm_id: &str) -> Vec<String> {
        self.devices
            .lock()
            .await
            .get(vm_id)
            .map(|d| d.iter().cloned().collect())
            .unwrap_or_default()
    }

    async fn vm_exists(&self, vm_id: &str) -> bool {
        self.objects
            .all()
            .await
            .iter()
            .any(|o| matches!(o, HypervisorObject::Vm(vm) if vm.id == vm_id))
    }

    async fn require_vm(&self, vm_id: &str) -> Result<(), SubsystemError> {
        if self.vm_exists(vm_id).await {
            Ok(())
        } else {
            Err(SubsystemError::NotFound {
                system: "hypervisor",
                name: vm_id.to_string(),
            })
        }
    }
}

#[async_trait]
impl Hypervisor for MemoryHypervisor {
    async fn power(&self, vm_id: &str, action: PowerAction) -> Result<(), SubsystemError> {
        self.objects.faults.check("hypervisor")?;
        self.require_vm(vm_id).await?;
        self.power.lock().await.insert(vm_id.to_string(), action);
        Ok(())
    }

    async fn migrate(&self, vm_id: &str, host: &str) -> Result<(), SubsystemError> {
        self.objects.faults.check("hypervisor")?;
        self.require_vm(vm_id).await?;
        self.placement
            .lock()
            .await
            .insert(vm_id.to_string(), host.to_string());
        Ok(())
    }

    async fn host_of(&self, vm_id: &str) -> Result<Option<String>, SubsystemError> {
        self.objects.faults.check("hypervisor")?;
        if let Some(host) = self.placement.lock().await.get(vm_id) {
            return Ok(Some(host.clone()));
        }
        Ok(self.objects.all().await.into_iter().find_map(|o| match o {
            HypervisorObject::Vm(vm) if vm.id == vm_id => vm.host_name,
            _ => None,
        }))
    }

    async fn attach_pci(&self, vm_id: &str, bus: &str) -> Result<(), SubsystemError> {
        self.pci_faults.check("hypervisor")?;
        self.require_vm(vm_id).await?;
        self.devices
            .lock()
            .await
            .entry(vm_id.to_string())
            .or_default()
            .insert(bus.to_string());
        Ok(())
    }

    async fn detach_pci(&self, vm_id: &str, bus: &str) -> Result<(), SubsystemError> {
        self.pci_faults.check("hypervisor")?;
        if let Some(devices) = self.devices.lock().await.get_mut(vm_id) {
            devices.remove(bus);
        }
        Ok(())
    }

    async fn create_snapshot(
        &self,
        vm_id: &str,
        name: &str,
        user_created: bool,
    ) -> Result<Snapshot, SubsystemError> {
        self.objects.faults.check("hypervisor")?;
        self.require_vm(vm_id).await?;
        let snapshot = Snapshot {
            id: Uuid::new_v4().to_string(),
            vm_id: vm_id.to_string(),
            name: name.to_string(),
            state: "Ready".to_string(),
            user_created,
            current: false,
            created_at: Some(Utc::now()),
        };
        self.snapshots
            .lock()
            .await
            .insert(snapshot.id.clone(), snapshot.clone());
        Ok(snapshot)
    }

    async fn list_snapshots(&self, vm_id: &str) -> Result<Vec<Snapshot>, SubsystemError> {
        self.objects.faults.check("hypervisor")?;
        let mut snapshots: Vec<Snapshot> = self
            .snapshots
            .lock()
            .await
            .values()
            .filter(|s| s.vm_id == vm_id)
            .cloned()
            .collect();
        snapshots.sort_by_key(|s| s.created_at);
        Ok(snapshots)
    }

    async fn apply_snapshot(&self, vm_id: &str, snapshot_id: &str) -> Result<(), SubsystemError> {
        self.objects.faults.check("hypervisor")?;
        let mut snapshots = self.snapshots.lock().await;
        if !snapshots.get(snapshot_id).is_some_and(|s| s.vm_id == vm_id) {
            return Err(SubsystemError::NotFound {
                system: "hypervisor",
                name: snapshot_id.to_string(),
            });
        }
        for snapshot in snapshots.values_mut().filter(|s| s.vm_id == vm_id) {
            snapshot.current = snapshot.id == snapshot_id;
        }
        Ok(())
    }

    async fn delete_snapshot(&self, snapshot_id: &str) -> Result<(), SubsystemError> {
        self.objects.faults.check("hypervisor")?;
        self.snapshots.lock().await.remove(snapshot_id);
        Ok(())
    }

    async fn free_public_port(&self, zone: &str, range: PortRange) -> Result<u16, SubsystemError> {
        self.objects.faults.check("hypervisor")?;
        let in_use: BTreeSet<u16> = self
            .objects
            .all()
            .await
            .into_iter()
            .filter_map(|o| match o {
                HypervisorObject::PortForwardingRule(rule) => Some(rule.public_port),
                _ => None,
            })
            .collect();

        let mut reserved = self.reserved_ports.lock().await;
        let zone_reserved = reserved.entry(zone.to_string()).or_default();
        let port = (range.start..=range.end)
            .find(|p| !in_use.contains(p) && !zone_reserved.contains(p))
            .ok_or_else(|| SubsystemError::NoFreePort {
                zone: zone.to_string(),
            })?;
        zone_reserved.insert(port);
        Ok(port)
    }
}

/// In-memory cluster.
#[derive(Debug, Default)]
pub struct MemoryCluster {
    objects: ObjectTable<K8sObject>,
    restarts: Mutex<Vec<String>>,
}

object_api!(MemoryCluster, K8sObject);

impl MemoryCluster {
    /// `namespace/name` of every restarted deployment, in order.
    pub async fn restarts(&self) -> Vec<String> {
        self.restarts.lock().await.clone()
    }
}

#[async_trait]
impl Cluster for MemoryCluster {
    async fn restart(&self, namespace: &str, name: &str) -> Result<(), SubsystemError> {
        self.objects.faults.check("cluster")?;
        let key = format!("{}/deployment/{}", namespace, name);
        if !self.objects.objects.lock().await.contains_key(&key) {
            return Err(SubsystemError::NotFound {
                system: "cluster",
                name: name.to_string(),
            });
        }
        self.restarts
            .lock()
            .await
            .push(format!("{}/{}", namespace, name));
        Ok(())
    }
}

/// In-memory image registry.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    objects: ObjectTable<RegistryObject>,
}

object_api!(MemoryRegistry, RegistryObject);

impl Registry for MemoryRegistry {}

/// In-memory DNS.
#[derive(Debug, Default)]
pub struct MemoryDns {
    objects: ObjectTable<DnsRecord>,
}

object_api!(MemoryDns, DnsRecord);

impl Dns for MemoryDns {}

#[derive(Debug, Clone, Default)]
struct HostEntry {
    capacities: HostCapacities,
    status: HostStatus,
    gpus: Vec<GpuData>,
}

/// In-memory host agents.
#[derive(Debug, Default)]
pub struct MemoryHosts {
    hosts: Mutex<HashMap<String, HostEntry>>,
    faults: FaultInjector,
}

impl MemoryHosts {
    /// Register or replace a host.
    pub async fn add_host(&self, name: &str, capacities: HostCapacities, gpus: Vec<GpuData>) {
        self.hosts.lock().await.insert(
            name.to_string(),
            HostEntry {
                capacities,
                status: HostStatus::default(),
                gpus,
            },
        );
    }

    /// Fault switches for host queries.
    pub fn faults(&self) -> &FaultInjector {
        &self.faults
    }

    async fn entry(&self, host: &str) -> Result<HostEntry, SubsystemError> {
        self.faults.check("host")?;
        self.hosts
            .lock()
            .await
            .get(host)
            .cloned()
            .ok_or_else(|| SubsystemError::Unavailable {
                system: "host",
                reason: format!("host {} not reachable", host),
            })
    }
}

#[async_trait]
impl HostApi for MemoryHosts {
    async fn capacities(&self, host: &str) -> Result<HostCapacities, SubsystemError> {
        Ok(self.entry(host).await?.capacities)
    }

    async fn status(&self, host: &str) -> Result<HostStatus, SubsystemError> {
        Ok(self.entry(host).await?.status)
    }

    async fn gpus(&self, host: &str) -> Result<Vec<GpuData>, SubsystemError> {
        Ok(self.entry(host).await?.gpus)
    }
}

/// Concrete handles to every in-memory subsystem, for inspection in tests.
#[derive(Debug, Clone, Default)]
pub struct MemorySubsystems {
    /// The hypervisor.
    pub hypervisor: Arc<MemoryHypervisor>,
    /// The cluster, shared by every zone.
    pub cluster: Arc<MemoryCluster>,
    /// The registry.
    pub registry: Arc<MemoryRegistry>,
    /// DNS.
    pub dns: Arc<MemoryDns>,
    /// Host agents.
    pub hosts: Arc<MemoryHosts>,
}

impl MemorySubsystems {
    /// Fresh, empty subsystems.
    pub fn new() -> Self {
        Self::default()
    }

    /// A [`Subsystems`] bundle over these handles, with the cluster serving every zone.
    pub fn bundle(&self, zones: &[ZoneConfig]) -> Subsystems {
        zones.iter().fold(
            Subsystems::new(
                self.hypervisor.clone(),
                self.registry.clone(),
                self.dns.clone(),
                self.hosts.clone(),
            ),
            |subsystems, zone| subsystems.with_cluster(zone.name.clone(), self.cluster.clone()),
        )
    }
}
