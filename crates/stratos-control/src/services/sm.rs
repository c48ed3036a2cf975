// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Storage manager orchestration. One per user, entirely in the cluster.

use std::time::Duration;

use stratos_core::CoreError;
use stratos_core::models::sm::{SmSpec, sm_name};
use stratos_core::models::{Activity, JobType, SmKind, StorageManager};
use stratos_core::persistence::ResourceRepository;
use tracing::{debug, info, warn};

use super::{RelatedJobWait, mark_deleting, wait_for_related_jobs};
use crate::context::ControlContext;
use crate::error::{Error, Result};
use crate::generators::GenContext;
use crate::generators::sm::k8s_objects;
use crate::reconcile::Reconciler;

const K8S: &str = "k8s";

/// Orchestrates storage managers.
#[derive(Clone)]
pub struct SmService {
    ctx: ControlContext,
}

impl SmService {
    /// Create a storage manager service.
    pub fn new(ctx: ControlContext) -> Self {
        Self { ctx }
    }

    fn repo(&self) -> ResourceRepository<SmKind> {
        self.ctx.sms()
    }

    fn timeout(&self) -> Duration {
        self.ctx.config().subsystem_timeout
    }

    /// Insert the storage manager of `owner_id` and create its cluster objects.
    pub async fn create(&self, id: &str, owner_id: &str, zone: Option<&str>) -> Result<()> {
        let zone = match zone {
            Some(name) => self.ctx.zone(name)?,
            None => self.ctx.default_zone()?,
        };
        let sm = StorageManager::new(id, sm_name(owner_id), owner_id, &zone.name, SmSpec {})
            .with_activity(Activity::BeingCreated);

        let repo = self.repo();
        match repo.create_if_unique(&sm).await {
            Ok(()) => info!(sm_id = %id, owner_id = %owner_id, "Storage manager inserted"),
            Err(CoreError::UniqueConstraintViolation { .. } | CoreError::DuplicateId { .. }) => {
                if repo.exists(id).await? {
                    debug!(sm_id = %id, "Resuming storage manager creation");
                } else {
                    if let Some(holder) = repo.get_by_name(&sm.name).await?
                        && let Err(e) = self.repair(&holder.id).await
                    {
                        warn!(sm_id = %holder.id, error = %e, "Repair of existing storage manager failed");
                    }
                    return Err(Error::InvalidRequest(format!(
                        "user {} already has a storage manager",
                        owner_id
                    )));
                }
            }
            Err(e) => return Err(e.into()),
        }

        let sm = repo.require(id).await?;
        self.ensure(&sm).await
    }

    async fn ensure(&self, sm: &StorageManager) -> Result<()> {
        let zone = self.ctx.zone(&sm.zone)?;
        let gen_ctx = GenContext::new(self.ctx.config(), zone);
        let cluster = self.ctx.subsystems().cluster(&sm.zone)?;
        let repo = self.repo();

        Reconciler::new(&repo, &sm.id, K8S, self.timeout())
            .apply(cluster.as_ref(), &k8s_objects(sm, &gen_ctx), &sm.subsystems.k8s)
            .await?;
        Ok(())
    }

    /// Tear down the cluster objects and soft-delete the storage manager.
    pub async fn delete(&self, id: &str, wait: RelatedJobWait) -> Result<()> {
        wait_for_related_jobs(&self.ctx.jobs(), id, JobType::DeleteSm, wait).await?;

        let repo = self.repo().including_deleted();
        let Some(sm) = repo.get(id).await? else {
            debug!(sm_id = %id, "Storage manager already gone");
            return Ok(());
        };
        mark_deleting(&repo, id).await?;
        let cluster = self.ctx.subsystems().cluster(&sm.zone)?;
        Reconciler::new(&repo, id, K8S, self.timeout())
            .delete_all(cluster.as_ref(), &sm.subsystems.k8s)
            .await?;
        repo.soft_delete(id).await?;
        info!(sm_id = %id, "Storage manager deleted");
        Ok(())
    }

    /// Reconcile the storage manager.
    pub async fn repair(&self, id: &str) -> Result<()> {
        let repo = self.repo();
        let sm = repo.require(id).await?;
        self.ensure(&sm).await?;
        repo.mark_repaired(id).await?;
        debug!(sm_id = %id, "Storage manager repaired");
        Ok(())
    }
}
