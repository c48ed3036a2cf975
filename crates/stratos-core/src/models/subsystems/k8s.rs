// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cluster objects. Addressed by name within a namespace; `uid` is assigned on creation.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Labels, Projection, delegate_projection};

macro_rules! uid_projection {
    ($($ty:ident),+ $(,)?) => {
        $(
            impl Projection for $ty {
                fn id(&self) -> &str {
                    &self.uid
                }

                fn name(&self) -> &str {
                    &self.name
                }

                fn clear_timestamps(&mut self) {
                    self.created_at = None;
                }

                fn adopt_identity(&mut self, observed: &Self) {
                    self.uid = observed.uid.clone();
                }
            }
        )+
    };
}

/// A namespace.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Namespace {
    /// Namespace name.
    pub name: String,
    /// Cluster-assigned uid.
    #[serde(default)]
    pub uid: String,
    /// Labels.
    #[serde(default)]
    pub labels: Labels,
    /// Creation time.
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// A volume mounted into a pod from a claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeMount {
    /// Volume name inside the pod.
    pub name: String,
    /// Claim backing the volume.
    pub claim_name: String,
    /// Mount path.
    pub mount_path: String,
}

/// A workload (cluster deployment).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workload {
    /// Object name.
    pub name: String,
    /// Namespace.
    pub namespace: String,
    /// Cluster-assigned uid.
    #[serde(default)]
    pub uid: String,
    /// Labels, also used as the pod selector.
    #[serde(default)]
    pub labels: Labels,
    /// Container image.
    pub image: String,
    /// Container arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Container port.
    pub port: u16,
    /// Replica count.
    pub replicas: u32,
    /// Mounted claims.
    #[serde(default)]
    pub volumes: Vec<VolumeMount>,
    /// Secrets used to pull the image.
    #[serde(default)]
    pub image_pull_secrets: Vec<String>,
    /// Creation time.
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// A service routing to a workload.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    /// Object name.
    pub name: String,
    /// Namespace.
    pub namespace: String,
    /// Cluster-assigned uid.
    #[serde(default)]
    pub uid: String,
    /// Labels.
    #[serde(default)]
    pub labels: Labels,
    /// Pod selector.
    pub selector: Labels,
    /// Service port.
    pub port: u16,
    /// Container port.
    pub target_port: u16,
    /// Creation time.
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// An ingress exposing a service on a host name.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ingress {
    /// Object name.
    pub name: String,
    /// Namespace.
    pub namespace: String,
    /// Cluster-assigned uid.
    #[serde(default)]
    pub uid: String,
    /// Labels.
    #[serde(default)]
    pub labels: Labels,
    /// Host names routed by this ingress.
    pub hosts: Vec<String>,
    /// Backend service.
    pub service_name: String,
    /// Backend service port.
    pub service_port: u16,
    /// Creation time.
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// A cluster-scoped NFS persistent volume.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistentVolume {
    /// Object name.
    pub name: String,
    /// Cluster-assigned uid.
    #[serde(default)]
    pub uid: String,
    /// Labels.
    #[serde(default)]
    pub labels: Labels,
    /// Capacity, e.g. `10Gi`.
    pub capacity: String,
    /// NFS server.
    pub nfs_server: String,
    /// Exported path.
    pub nfs_path: String,
    /// Creation time.
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// A claim bound to a named persistent volume.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistentVolumeClaim {
    /// Object name.
    pub name: String,
    /// Namespace.
    pub namespace: String,
    /// Cluster-assigned uid.
    #[serde(default)]
    pub uid: String,
    /// Labels.
    #[serde(default)]
    pub labels: Labels,
    /// Requested capacity.
    pub capacity: String,
    /// Volume to bind.
    pub volume_name: String,
    /// Creation time.
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// A secret.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Secret {
    /// Object name.
    pub name: String,
    /// Namespace.
    pub namespace: String,
    /// Cluster-assigned uid.
    #[serde(default)]
    pub uid: String,
    /// Labels.
    #[serde(default)]
    pub labels: Labels,
    /// Secret type, e.g. `kubernetes.io/dockerconfigjson`.
    pub secret_type: String,
    /// Secret payload.
    #[serde(default)]
    pub data: BTreeMap<String, String>,
    /// Creation time.
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// A run-to-completion job.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchJob {
    /// Object name.
    pub name: String,
    /// Namespace.
    pub namespace: String,
    /// Cluster-assigned uid.
    #[serde(default)]
    pub uid: String,
    /// Labels.
    #[serde(default)]
    pub labels: Labels,
    /// Container image.
    pub image: String,
    /// Command.
    pub command: Vec<String>,
    /// Mounted claims.
    #[serde(default)]
    pub volumes: Vec<VolumeMount>,
    /// Creation time.
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// A horizontal pod autoscaler.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hpa {
    /// Object name.
    pub name: String,
    /// Namespace.
    pub namespace: String,
    /// Cluster-assigned uid.
    #[serde(default)]
    pub uid: String,
    /// Labels.
    #[serde(default)]
    pub labels: Labels,
    /// Workload to scale.
    pub target: String,
    /// Lower bound.
    pub min_replicas: u32,
    /// Upper bound.
    pub max_replicas: u32,
    /// Target average CPU utilization in percent.
    pub cpu_average_utilization: u32,
    /// Creation time.
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// A network policy restricting ingress to pods.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkPolicy {
    /// Object name.
    pub name: String,
    /// Namespace.
    pub namespace: String,
    /// Cluster-assigned uid.
    #[serde(default)]
    pub uid: String,
    /// Labels.
    #[serde(default)]
    pub labels: Labels,
    /// Pods the policy applies to.
    pub pod_selector: Labels,
    /// Namespaces allowed to connect.
    pub allow_from_namespaces: Vec<String>,
    /// Creation time.
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

uid_projection!(
    Namespace,
    Workload,
    Service,
    Ingress,
    PersistentVolume,
    PersistentVolumeClaim,
    Secret,
    BatchJob,
    Hpa,
    NetworkPolicy,
);

/// Any object a resource projects into a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum K8sObject {
    /// Namespace.
    Namespace(Namespace),
    /// Deployment.
    Deployment(Workload),
    /// Service.
    Service(Service),
    /// Ingress.
    Ingress(Ingress),
    /// Persistent volume.
    PersistentVolume(PersistentVolume),
    /// Persistent volume claim.
    PersistentVolumeClaim(PersistentVolumeClaim),
    /// Secret.
    Secret(Secret),
    /// Job.
    Job(BatchJob),
    /// Horizontal pod autoscaler.
    Hpa(Hpa),
    /// Network policy.
    NetworkPolicy(NetworkPolicy),
}

delegate_projection!(K8sObject {
    Namespace,
    Deployment,
    Service,
    Ingress,
    PersistentVolume,
    PersistentVolumeClaim,
    Secret,
    Job,
    Hpa,
    NetworkPolicy,
});

impl K8sObject {
    /// Short kind name, used as the key prefix in `subsystems.k8s`.
    pub fn kind(&self) -> &'static str {
        match self {
            K8sObject::Namespace(_) => "namespace",
            K8sObject::Deployment(_) => "deployment",
            K8sObject::Service(_) => "service",
            K8sObject::Ingress(_) => "ingress",
            K8sObject::PersistentVolume(_) => "pv",
            K8sObject::PersistentVolumeClaim(_) => "pvc",
            K8sObject::Secret(_) => "secret",
            K8sObject::Job(_) => "job",
            K8sObject::Hpa(_) => "hpa",
            K8sObject::NetworkPolicy(_) => "networkpolicy",
        }
    }

    /// Namespace of the object; empty for cluster-scoped kinds.
    pub fn namespace(&self) -> &str {
        match self {
            K8sObject::Namespace(_) | K8sObject::PersistentVolume(_) => "",
            K8sObject::Deployment(o) => &o.namespace,
            K8sObject::Service(o) => &o.namespace,
            K8sObject::Ingress(o) => &o.namespace,
            K8sObject::PersistentVolumeClaim(o) => &o.namespace,
            K8sObject::Secret(o) => &o.namespace,
            K8sObject::Job(o) => &o.namespace,
            K8sObject::Hpa(o) => &o.namespace,
            K8sObject::NetworkPolicy(o) => &o.namespace,
        }
    }

    /// Map key of this object: `<kind>/<name>`.
    pub fn key(&self) -> String {
        format!("{}/{}", self.kind(), self.name())
    }

    /// Teardown order: routing first, storage and namespace last.
    pub fn delete_rank(&self) -> u8 {
        match self {
            K8sObject::Ingress(_) | K8sObject::NetworkPolicy(_) => 0,
            K8sObject::Service(_) | K8sObject::Hpa(_) => 1,
            K8sObject::Deployment(_) | K8sObject::Job(_) => 2,
            K8sObject::Secret(_) => 3,
            K8sObject::PersistentVolumeClaim(_) => 4,
            K8sObject::PersistentVolume(_) => 5,
            K8sObject::Namespace(_) => 6,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_and_namespace() {
        let pv = K8sObject::PersistentVolume(PersistentVolume {
            name: "web-data".to_string(),
            capacity: "10Gi".to_string(),
            ..Default::default()
        });
        assert_eq!(pv.key(), "pv/web-data");
        assert_eq!(pv.namespace(), "");

        let svc = K8sObject::Service(Service {
            name: "web".to_string(),
            namespace: "deploy".to_string(),
            ..Default::default()
        });
        assert_eq!(svc.key(), "service/web");
        assert_eq!(svc.namespace(), "deploy");
        assert!(svc.delete_rank() < pv.delete_rank());
    }

    #[test]
    fn test_adopt_identity_across_variants_is_noop() {
        let mut ns = K8sObject::Namespace(Namespace {
            name: "a".to_string(),
            ..Default::default()
        });
        let observed = K8sObject::Secret(Secret {
            name: "a".to_string(),
            uid: "uid-1".to_string(),
            ..Default::default()
        });
        ns.adopt_identity(&observed);
        assert_eq!(ns.id(), "");
    }

    #[test]
    fn test_kind_tag() {
        let job = K8sObject::Job(BatchJob {
            name: "sm-u1-init".to_string(),
            namespace: "sm-u1".to_string(),
            image: "busybox".to_string(),
            command: vec!["sh".to_string()],
            ..Default::default()
        });
        let json = serde_json::to_value(&job).unwrap();
        assert_eq!(json["kind"], "job");
        let back: K8sObject = serde_json::from_value(json).unwrap();
        assert_eq!(back, job);
    }
}
