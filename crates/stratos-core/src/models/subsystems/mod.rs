// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Public projections of external subsystem objects.
//!
//! A projection is what the control plane records under a resource's
//! `subsystems` document after reading an object back from its subsystem.
//! Desired projections are produced by generators and compared against the
//! observed ones with [`Projection::matches`], which ignores timestamps.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Tag naming the control plane instance that manages an object.
pub const MANAGED_BY: &str = "managedBy";
/// Tag naming the resource an object belongs to.
pub const DEPLOY_NAME: &str = "deployName";
/// Tag naming the owner of the resource.
pub const OWNER_ID: &str = "ownerId";

/// String labels or tags attached to an external object.
pub type Labels = BTreeMap<String, String>;

/// Ownership labels for objects created on behalf of `resource_name`.
pub fn managed_labels(deployer_id: &str, resource_name: &str, owner_id: &str) -> Labels {
    Labels::from([
        (MANAGED_BY.to_string(), deployer_id.to_string()),
        (DEPLOY_NAME.to_string(), resource_name.to_string()),
        (OWNER_ID.to_string(), owner_id.to_string()),
    ])
}

/// An object is ours iff it carries both the `managedBy` and `deployName` tags.
pub fn is_managed(labels: &Labels, deployer_id: &str) -> bool {
    labels.get(MANAGED_BY).is_some_and(|v| v == deployer_id) && labels.contains_key(DEPLOY_NAME)
}

/// Common behaviour of subsystem projections.
pub trait Projection:
    Clone + fmt::Debug + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Identifier assigned by the subsystem; empty until the object exists.
    fn id(&self) -> &str;

    /// Name the object is addressed by.
    fn name(&self) -> &str;

    /// Whether the subsystem has acknowledged the object.
    fn created(&self) -> bool {
        !self.id().is_empty()
    }

    /// Zero every informational timestamp.
    fn clear_timestamps(&mut self);

    /// Copy subsystem-assigned fields (id, generated secrets) from an observed object.
    fn adopt_identity(&mut self, observed: &Self);

    /// Structural equality with timestamps normalized away.
    fn matches(&self, other: &Self) -> bool {
        let mut a = self.clone();
        let mut b = other.clone();
        a.clear_timestamps();
        b.clear_timestamps();
        a == b
    }
}

/// Implements [`Projection`] for an enum whose variants each wrap a projection.
macro_rules! delegate_projection {
    ($name:ident { $($variant:ident),+ $(,)? }) => {
        impl $crate::models::subsystems::Projection for $name {
            fn id(&self) -> &str {
                match self {
                    $($name::$variant(inner) => inner.id(),)+
                }
            }

            fn name(&self) -> &str {
                match self {
                    $($name::$variant(inner) => inner.name(),)+
                }
            }

            fn clear_timestamps(&mut self) {
                match self {
                    $($name::$variant(inner) => inner.clear_timestamps(),)+
                }
            }

            fn adopt_identity(&mut self, observed: &Self) {
                match (self, observed) {
                    $(($name::$variant(desired), $name::$variant(seen)) => desired.adopt_identity(seen),)+
                    _ => {}
                }
            }
        }
    };
}

pub(crate) use delegate_projection;

pub mod dns;
pub mod hypervisor;
pub mod k8s;
pub mod registry;
