// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Container deployment family.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::activity::Activity;
use super::resource::{Resource, ResourceKind};
use super::subsystems::dns::DnsRecord;
use super::subsystems::k8s::K8sObject;
use super::subsystems::registry::RegistryObject;

/// Marker for the deployment family.
#[derive(Debug, Clone, Copy)]
pub struct DeploymentKind;

/// A persisted deployment.
pub type Deployment = Resource<DeploymentKind>;

impl ResourceKind for DeploymentKind {
    const KIND: &'static str = "deployment";
    const TABLE: &'static str = "deployments";
    const ACTIVITIES: &'static [Activity] = &[
        Activity::BeingCreated,
        Activity::BeingDeleted,
        Activity::Updating,
        Activity::Repairing,
    ];

    type Spec = DeploymentSpec;
    type Subsystems = DeploymentSubsystems;
}

/// Where the deployment's image comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentType {
    /// Built by the user and pushed to the managed registry.
    Custom,
    /// A public image referenced directly.
    #[default]
    Prebuilt,
}

/// Desired deployment state.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentSpec {
    /// Image source.
    #[serde(rename = "type")]
    pub deployment_type: DeploymentType,
    /// Private deployments get no ingress and no public DNS.
    #[serde(default)]
    pub private: bool,
    /// Applications; the first one is the main app.
    pub apps: Vec<App>,
}

impl DeploymentSpec {
    /// The main app.
    pub fn main_app(&self) -> Option<&App> {
        self.apps.first()
    }

    /// Mutable access to the main app.
    pub fn main_app_mut(&mut self) -> Option<&mut App> {
        self.apps.first_mut()
    }
}

/// One containerized application.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct App {
    /// App name.
    pub name: String,
    /// Container image reference.
    pub image: String,
    /// Port the container listens on; exported as `PORT`.
    pub internal_port: u16,
    /// Extra environment.
    #[serde(default)]
    pub env: Vec<EnvVar>,
    /// Mounted NFS-backed volumes.
    #[serde(default)]
    pub volumes: Vec<Volume>,
    /// Container arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Desired replicas.
    #[serde(default = "default_replicas")]
    pub replicas: u32,
}

fn default_replicas() -> u32 {
    1
}

/// Environment variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    /// Variable name.
    pub name: String,
    /// Variable value.
    pub value: String,
}

/// A volume mounted into the app.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    /// Volume name, used in the claim name `<deployment>-<volume>`.
    pub name: String,
    /// Mount path inside the container.
    pub app_path: String,
    /// Path relative to the owner's storage root on the NFS server.
    pub server_path: String,
}

/// Observed external state for a deployment.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentSubsystems {
    /// Cluster objects keyed by `<kind>/<name>`.
    #[serde(default)]
    pub k8s: BTreeMap<String, K8sObject>,
    /// Registry objects (custom deployments only).
    #[serde(default)]
    pub registry: BTreeMap<String, RegistryObject>,
    /// DNS records (public deployments only).
    #[serde(default)]
    pub dns: BTreeMap<String, DnsRecord>,
}

impl DeploymentSubsystems {
    /// Whether nothing remains in any subsystem.
    pub fn is_empty(&self) -> bool {
        self.k8s.is_empty() && self.registry.is_empty() && self.dns.is_empty()
    }
}
