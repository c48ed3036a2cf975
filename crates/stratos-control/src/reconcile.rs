// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Drive subsystem objects toward their desired projections.
//!
//! [`repair_object`] is the four-method repairer: read, then create, leave
//! alone, update, or delete-and-recreate. [`Reconciler`] applies it to a
//! whole `subsystems.<system>` map of one resource, recording every observed
//! projection as it goes and pruning objects that are no longer wanted.

use std::collections::BTreeMap;
use std::time::Duration;

use stratos_core::CoreError;
use stratos_core::models::ResourceKind;
use stratos_core::models::subsystems::Projection;
use stratos_core::models::subsystems::dns::DnsRecord;
use stratos_core::models::subsystems::hypervisor::HypervisorObject;
use stratos_core::models::subsystems::k8s::K8sObject;
use stratos_core::models::subsystems::registry::RegistryObject;
use stratos_core::persistence::ResourceRepository;
use tracing::{debug, info};

use crate::error::Result;
use crate::subsystems::{ObjectApi, SubsystemError, with_timeout};

/// A projection the reconciler knows how to order and attribute.
pub trait Tracked: Projection {
    /// Subsystem name used in errors and logs.
    const SYSTEM: &'static str;

    /// Teardown position. Lower ranks are deleted first and created last.
    fn delete_rank(&self) -> u8;
}

impl Tracked for HypervisorObject {
    const SYSTEM: &'static str = "hypervisor";

    fn delete_rank(&self) -> u8 {
        HypervisorObject::delete_rank(self)
    }
}

impl Tracked for K8sObject {
    const SYSTEM: &'static str = "cluster";

    fn delete_rank(&self) -> u8 {
        K8sObject::delete_rank(self)
    }
}

impl Tracked for RegistryObject {
    const SYSTEM: &'static str = "registry";

    fn delete_rank(&self) -> u8 {
        RegistryObject::delete_rank(self)
    }
}

impl Tracked for DnsRecord {
    const SYSTEM: &'static str = "dns";

    fn delete_rank(&self) -> u8 {
        0
    }
}

/// What [`repair_object`] had to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairOutcome {
    /// The object was missing and has been created.
    Created,
    /// The object already matched.
    Unchanged,
    /// The object was changed in place.
    Updated,
    /// The object could not be changed in place and was recreated.
    Recreated,
}

/// Bring one object in line with `desired` and return what was observed afterwards.
pub async fn repair_object<T, A>(
    api: &A,
    desired: &T,
    timeout: Duration,
) -> std::result::Result<(T, RepairOutcome), SubsystemError>
where
    T: Tracked,
    A: ObjectApi<T> + ?Sized,
{
    let Some(observed) = with_timeout(T::SYSTEM, timeout, api.read(desired)).await? else {
        let created = with_timeout(T::SYSTEM, timeout, api.create(desired)).await?;
        return Ok((created, RepairOutcome::Created));
    };

    let mut candidate = desired.clone();
    candidate.adopt_identity(&observed);
    if candidate.matches(&observed) {
        return Ok((observed, RepairOutcome::Unchanged));
    }

    match with_timeout(T::SYSTEM, timeout, api.update(&candidate)).await {
        Ok(updated) => Ok((updated, RepairOutcome::Updated)),
        Err(SubsystemError::NotMutable { .. }) => {
            with_timeout(T::SYSTEM, timeout, api.delete(&observed)).await?;
            let created = with_timeout(T::SYSTEM, timeout, api.create(desired)).await?;
            Ok((created, RepairOutcome::Recreated))
        }
        Err(e) => Err(e),
    }
}

/// Whether the subsystem no longer has the object.
pub async fn is_absent<T, A>(api: &A, recorded: &T, timeout: Duration) -> Result<bool>
where
    T: Tracked,
    A: ObjectApi<T> + ?Sized,
{
    Ok(with_timeout(T::SYSTEM, timeout, api.read(recorded))
        .await?
        .is_none())
}

/// Reconciles one `subsystems.<path>` map of one resource.
pub struct Reconciler<'a, K: ResourceKind> {
    repo: &'a ResourceRepository<K>,
    resource_id: &'a str,
    path: &'static str,
    timeout: Duration,
}

impl<'a, K: ResourceKind> Reconciler<'a, K> {
    /// Reconcile `subsystems.<path>` of `resource_id`.
    pub fn new(
        repo: &'a ResourceRepository<K>,
        resource_id: &'a str,
        path: &'static str,
        timeout: Duration,
    ) -> Self {
        Self {
            repo,
            resource_id,
            path,
            timeout,
        }
    }

    async fn record<T: Tracked>(&self, key: &str, observed: &T) -> Result<()> {
        let recorded = self
            .repo
            .set_subsystem(self.resource_id, &[self.path, key], observed)
            .await?;
        if !recorded {
            // The resource went away underneath us; the object is left for the delete path.
            return Err(CoreError::NotFound {
                kind: K::KIND,
                id: self.resource_id.to_string(),
            }
            .into());
        }
        Ok(())
    }

    /// Repair a single object and record it under `key`.
    pub async fn apply_one<T, A>(&self, api: &A, key: &str, desired: &T) -> Result<T>
    where
        T: Tracked,
        A: ObjectApi<T> + ?Sized,
    {
        let (observed, outcome) = repair_object(api, desired, self.timeout).await?;
        self.record(key, &observed).await?;
        if outcome != RepairOutcome::Unchanged {
            info!(
                resource_id = %self.resource_id,
                system = T::SYSTEM,
                key = %key,
                outcome = ?outcome,
                "Subsystem object repaired"
            );
        }
        Ok(observed)
    }

    /// Make the recorded map equal `desired`.
    ///
    /// Objects are repaired parents first, then every recorded key missing
    /// from `desired` is deleted and forgotten. Returns the observed map.
    pub async fn apply<T, A>(
        &self,
        api: &A,
        desired: &BTreeMap<String, T>,
        recorded: &BTreeMap<String, T>,
    ) -> Result<BTreeMap<String, T>>
    where
        T: Tracked,
        A: ObjectApi<T> + ?Sized,
    {
        let mut ordered: Vec<(&String, &T)> = desired.iter().collect();
        ordered.sort_by_key(|(_, obj)| std::cmp::Reverse(obj.delete_rank()));

        let mut observed = BTreeMap::new();
        for (key, obj) in ordered {
            let seen = self.apply_one(api, key, obj).await?;
            observed.insert(key.clone(), seen);
        }

        let mut stale: Vec<(&String, &T)> = recorded
            .iter()
            .filter(|(key, _)| !desired.contains_key(*key))
            .collect();
        stale.sort_by_key(|(_, obj)| obj.delete_rank());
        for (key, obj) in stale {
            with_timeout(T::SYSTEM, self.timeout, api.delete(obj)).await?;
            self.repo
                .unset_subsystem(self.resource_id, &[self.path, key])
                .await?;
            info!(
                resource_id = %self.resource_id,
                system = T::SYSTEM,
                key = %key,
                "Pruned subsystem object"
            );
        }

        Ok(observed)
    }

    /// Delete every object in `objects`, children first.
    ///
    /// Projections stay recorded so the confirmer can verify the objects are gone.
    pub async fn delete_all<T, A>(&self, api: &A, objects: &BTreeMap<String, T>) -> Result<()>
    where
        T: Tracked,
        A: ObjectApi<T> + ?Sized,
    {
        let mut ordered: Vec<(&String, &T)> = objects.iter().collect();
        ordered.sort_by_key(|(_, obj)| obj.delete_rank());
        for (key, obj) in ordered {
            with_timeout(T::SYSTEM, self.timeout, api.delete(obj)).await?;
            debug!(
                resource_id = %self.resource_id,
                system = T::SYSTEM,
                key = %key,
                "Deleted subsystem object"
            );
        }
        Ok(())
    }
}
