// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The abstract resource document shared by VMs, deployments, and storage managers.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::activity::{Activity, ActivityRecord};

/// Compile-time description of a resource family.
///
/// The repository is generic over this trait: the table, the accepted
/// activities, and the typed `spec`/`subsystems` documents all come from here.
pub trait ResourceKind: Send + Sync + 'static {
    /// Family name used in errors and logs.
    const KIND: &'static str;
    /// Backing table.
    const TABLE: &'static str;
    /// Activities this family accepts.
    const ACTIVITIES: &'static [Activity];

    /// Family-specific desired state.
    type Spec: Serialize + DeserializeOwned + Clone + fmt::Debug + PartialEq + Send + Sync + 'static;

    /// Last observed projections of every external object the family owns.
    type Subsystems: Serialize
        + DeserializeOwned
        + Clone
        + fmt::Debug
        + Default
        + PartialEq
        + Send
        + Sync
        + 'static;

    /// Whether `activity` belongs to this family's vocabulary.
    fn supports(activity: Activity) -> bool {
        Self::ACTIVITIES.contains(&activity)
    }
}

/// A persisted resource document.
#[derive(Debug, Clone)]
pub struct Resource<K: ResourceKind> {
    /// Stable identifier (UUID).
    pub id: String,
    /// User-visible name, unique among live resources of the family.
    pub name: String,
    /// Owning user.
    pub owner_id: String,
    /// Zone key into the zone catalog.
    pub zone: String,
    /// When the document was inserted.
    pub created_at: DateTime<Utc>,
    /// Last successful update.
    pub updated_at: Option<DateTime<Utc>>,
    /// Last successful repair.
    pub repaired_at: Option<DateTime<Utc>>,
    /// Set once the resource is soft-deleted.
    pub deleted_at: Option<DateTime<Utc>>,
    /// Current activities keyed by name.
    pub activities: BTreeMap<String, ActivityRecord>,
    /// Desired state.
    pub spec: K::Spec,
    /// Observed state of external objects.
    pub subsystems: K::Subsystems,
}

impl<K: ResourceKind> Resource<K> {
    /// Build a fresh live document with no activities and empty subsystems.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        owner_id: impl Into<String>,
        zone: impl Into<String>,
        spec: K::Spec,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            owner_id: owner_id.into(),
            zone: zone.into(),
            created_at: Utc::now(),
            updated_at: None,
            repaired_at: None,
            deleted_at: None,
            activities: BTreeMap::new(),
            spec,
            subsystems: K::Subsystems::default(),
        }
    }

    /// Add `activity` to the in-memory document (used before the first insert).
    pub fn with_activity(mut self, activity: Activity) -> Self {
        self.activities
            .insert(activity.as_str().to_string(), ActivityRecord::now(activity));
        self
    }

    /// Whether `activity` is currently set.
    pub fn doing(&self, activity: Activity) -> bool {
        self.activities.contains_key(activity.as_str())
    }

    /// Whether the resource is free of any transient state.
    pub fn is_idle(&self) -> bool {
        self.activities.is_empty()
    }

    /// Whether the resource has been soft-deleted.
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Soft-deleted or on its way there.
    pub fn is_being_removed(&self) -> bool {
        self.is_deleted() || self.doing(Activity::BeingDeleted)
    }
}
