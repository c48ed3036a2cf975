// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cluster objects of a storage manager.

use std::collections::BTreeMap;

use stratos_core::models::StorageManager;
use stratos_core::models::subsystems::Labels;
use stratos_core::models::subsystems::k8s::{
    BatchJob, Ingress, K8sObject, Namespace, PersistentVolume, PersistentVolumeClaim, Service,
    VolumeMount, Workload,
};

use super::GenContext;

const IMAGE: &str = "filebrowser/filebrowser:v2";
const INIT_IMAGE: &str = "busybox:1.36";
const PORT: u16 = 80;
const CAPACITY: &str = "50Gi";
const DATA_MOUNT: &str = "/srv";

/// Public hostname of the owner's storage manager.
pub fn public_host(sm: &StorageManager, ctx: &GenContext<'_>) -> String {
    ctx.public_host(&format!("storage-{}", sm.owner_id.to_ascii_lowercase()))
}

/// Desired `subsystems.k8s` map. Everything lives in a namespace named after the SM.
pub fn k8s_objects(sm: &StorageManager, ctx: &GenContext<'_>) -> BTreeMap<String, K8sObject> {
    let ns = sm.name.clone();
    let labels = ctx.labels(&sm.name, &sm.owner_id);
    let data = format!("{}-data", sm.name);
    let selector = Labels::from([("app".to_string(), sm.name.clone())]);
    let owner_path = format!("{}/{}", ctx.zone.nfs_base_path, sm.owner_id);
    let mount = VolumeMount {
        name: "data".to_string(),
        claim_name: data.clone(),
        mount_path: DATA_MOUNT.to_string(),
    };

    let mut workload_labels = labels.clone();
    workload_labels.extend(selector.clone());

    let objects = [
        K8sObject::Namespace(Namespace {
            name: ns.clone(),
            uid: String::new(),
            labels: labels.clone(),
            created_at: None,
        }),
        K8sObject::PersistentVolume(PersistentVolume {
            name: data.clone(),
            uid: String::new(),
            labels: labels.clone(),
            capacity: CAPACITY.to_string(),
            nfs_server: ctx.zone.nfs_server.clone(),
            nfs_path: owner_path.clone(),
            created_at: None,
        }),
        K8sObject::PersistentVolumeClaim(PersistentVolumeClaim {
            name: data.clone(),
            namespace: ns.clone(),
            uid: String::new(),
            labels: labels.clone(),
            capacity: CAPACITY.to_string(),
            volume_name: data.clone(),
            created_at: None,
        }),
        K8sObject::Job(BatchJob {
            name: format!("{}-init", sm.name),
            namespace: ns.clone(),
            uid: String::new(),
            labels: labels.clone(),
            image: INIT_IMAGE.to_string(),
            command: vec![
                "mkdir".to_string(),
                "-p".to_string(),
                format!("{}/user", DATA_MOUNT),
                format!("{}/vms", DATA_MOUNT),
            ],
            volumes: vec![mount.clone()],
            created_at: None,
        }),
        K8sObject::Deployment(Workload {
            name: sm.name.clone(),
            namespace: ns.clone(),
            uid: String::new(),
            labels: workload_labels,
            image: IMAGE.to_string(),
            args: vec!["--root".to_string(), DATA_MOUNT.to_string()],
            env: BTreeMap::new(),
            port: PORT,
            replicas: 1,
            volumes: vec![mount],
            image_pull_secrets: Vec::new(),
            created_at: None,
        }),
        K8sObject::Service(Service {
            name: sm.name.clone(),
            namespace: ns.clone(),
            uid: String::new(),
            labels: labels.clone(),
            selector,
            port: PORT,
            target_port: PORT,
            created_at: None,
        }),
        K8sObject::Ingress(Ingress {
            name: sm.name.clone(),
            namespace: ns,
            uid: String::new(),
            labels,
            hosts: vec![public_host(sm, ctx)],
            service_name: sm.name.clone(),
            service_port: PORT,
            created_at: None,
        }),
    ];

    objects.into_iter().map(|o| (o.key(), o)).collect()
}
