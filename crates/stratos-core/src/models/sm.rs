// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Storage manager family: one per owner, giving file access to the owner's volumes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::activity::Activity;
use super::resource::{Resource, ResourceKind};
use super::subsystems::k8s::K8sObject;

/// Marker for the storage manager family.
#[derive(Debug, Clone, Copy)]
pub struct SmKind;

/// A persisted storage manager.
pub type StorageManager = Resource<SmKind>;

impl ResourceKind for SmKind {
    const KIND: &'static str = "storageManager";
    const TABLE: &'static str = "storage_managers";
    const ACTIVITIES: &'static [Activity] = &[
        Activity::BeingCreated,
        Activity::BeingDeleted,
        Activity::Repairing,
    ];

    type Spec = SmSpec;
    type Subsystems = SmSubsystems;
}

/// Desired storage manager state. Everything is derived from the owner and zone.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SmSpec {}

/// Observed cluster state for a storage manager.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SmSubsystems {
    /// Cluster objects keyed by `<kind>/<name>`.
    #[serde(default)]
    pub k8s: BTreeMap<String, K8sObject>,
}

impl SmSubsystems {
    /// Whether nothing remains in the cluster.
    pub fn is_empty(&self) -> bool {
        self.k8s.is_empty()
    }
}

/// Deterministic storage manager name for an owner.
pub fn sm_name(owner_id: &str) -> String {
    let short: String = owner_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(12)
        .collect::<String>()
        .to_ascii_lowercase();
    format!("sm-{}", short)
}
