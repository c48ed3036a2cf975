// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Capability interfaces for external subsystems.
//!
//! The control plane never talks to a hypervisor, cluster, registry, or DNS
//! server directly; it drives these traits. Every object-shaped capability
//! extends [`ObjectApi`], the four-method port the repairer in
//! [`crate::reconcile`] works against. Concrete SDK drivers live outside
//! this crate; [`memory`] provides in-process implementations.

pub mod host;
pub mod hypervisor;
pub mod memory;

pub use host::{HostApi, HostCapacities, HostStatus};
pub use hypervisor::{Hypervisor, PowerAction};

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use stratos_core::models::subsystems::Projection;
use stratos_core::models::subsystems::dns::DnsRecord;
use stratos_core::models::subsystems::k8s::K8sObject;
use stratos_core::models::subsystems::registry::RegistryObject;

pub use crate::error::SubsystemError;

/// Read/create/update/delete over one kind of external object.
///
/// Objects are addressed by the deterministic identity carried in the
/// projection (name, namespace, owning VM), never by a stored handle.
#[async_trait]
pub trait ObjectApi<T: Projection>: Send + Sync {
    /// Observe the object `desired` addresses. `None` if it does not exist.
    async fn read(&self, desired: &T) -> Result<Option<T>, SubsystemError>;

    /// Create the object and return its observed projection.
    async fn create(&self, desired: &T) -> Result<T, SubsystemError>;

    /// Change the object in place. Returns [`SubsystemError::NotMutable`]
    /// when the change requires recreation.
    async fn update(&self, desired: &T) -> Result<T, SubsystemError>;

    /// Delete the object. Deleting a missing object succeeds.
    async fn delete(&self, observed: &T) -> Result<(), SubsystemError>;
}

/// Kubernetes-style cluster: namespaces, workloads, services, volumes, and friends.
#[async_trait]
pub trait Cluster: ObjectApi<K8sObject> {
    /// Roll every pod of a deployment.
    async fn restart(&self, namespace: &str, name: &str) -> Result<(), SubsystemError>;
}

/// Image registry: projects, robot accounts, repositories, webhooks.
pub trait Registry: ObjectApi<RegistryObject> {}

/// Reverse-proxy DNS layer.
pub trait Dns: ObjectApi<DnsRecord> {}

/// Every subsystem handle the control plane uses.
#[derive(Clone)]
pub struct Subsystems {
    /// The hypervisor.
    pub hypervisor: Arc<dyn Hypervisor>,
    /// The image registry.
    pub registry: Arc<dyn Registry>,
    /// The DNS layer.
    pub dns: Arc<dyn Dns>,
    /// Compute host agents.
    pub hosts: Arc<dyn HostApi>,
    clusters: HashMap<String, Arc<dyn Cluster>>,
}

impl Subsystems {
    /// Bundle the zone-independent subsystems. Add clusters with [`with_cluster`](Self::with_cluster).
    pub fn new(
        hypervisor: Arc<dyn Hypervisor>,
        registry: Arc<dyn Registry>,
        dns: Arc<dyn Dns>,
        hosts: Arc<dyn HostApi>,
    ) -> Self {
        Self {
            hypervisor,
            registry,
            dns,
            hosts,
            clusters: HashMap::new(),
        }
    }

    /// Register the cluster serving `zone`.
    pub fn with_cluster(mut self, zone: impl Into<String>, cluster: Arc<dyn Cluster>) -> Self {
        self.clusters.insert(zone.into(), cluster);
        self
    }

    /// The cluster serving `zone`.
    pub fn cluster(&self, zone: &str) -> Result<Arc<dyn Cluster>, SubsystemError> {
        self.clusters
            .get(zone)
            .cloned()
            .ok_or_else(|| SubsystemError::Unavailable {
                system: "cluster",
                reason: format!("no cluster configured for zone {}", zone),
            })
    }
}

/// Bound a subsystem call by `timeout`.
pub async fn with_timeout<T, F>(
    system: &'static str,
    timeout: Duration,
    call: F,
) -> Result<T, SubsystemError>
where
    F: Future<Output = Result<T, SubsystemError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(SubsystemError::Timeout {
            system,
            seconds: timeout.as_secs(),
        }),
    }
}
