// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Deployment orchestration across the registry, the zone's cluster, and DNS.
//!
//! The registry is reconciled first because the cluster's image pull secret
//! is rendered from the robot account the registry hands back.

use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::{Map, Value};
use stratos_core::CoreError;
use stratos_core::models::deployment::{App, DeploymentSpec, DeploymentType};
use stratos_core::models::subsystems::registry::{RegistryObject, RegistryRobot};
use stratos_core::models::{Activity, Deployment, DeploymentKind, JobType};
use stratos_core::persistence::{ResourceRepository, ResourceUpdate};
use tracing::{debug, info, warn};

use super::{RelatedJobWait, mark_deleting, wait_for_related_jobs};
use crate::context::ControlContext;
use crate::error::{Error, Result};
use crate::generators::GenContext;
use crate::generators::deployment::{
    ci_config, custom_image, dns_records, k8s_objects, registry_objects, robot_key,
};
use crate::jobs::args::{DeploymentCreateParams, DeploymentUpdateParams};
use crate::reconcile::Reconciler;
use crate::subsystems::with_timeout;

const K8S: &str = "k8s";
const REGISTRY: &str = "registry";
const DNS: &str = "dns";

/// Tag a custom deployment points at before its first build.
const INITIAL_TAG: &str = "latest";

fn recorded_robot<'a>(
    deployment: &Deployment,
    registry: &'a BTreeMap<String, RegistryObject>,
) -> Option<&'a RegistryRobot> {
    match registry.get(&robot_key(deployment)) {
        Some(RegistryObject::Robot(robot)) if !robot.id.is_empty() => Some(robot),
        _ => None,
    }
}

/// Orchestrates deployments.
#[derive(Clone)]
pub struct DeploymentService {
    ctx: ControlContext,
}

impl DeploymentService {
    /// Create a deployment service.
    pub fn new(ctx: ControlContext) -> Self {
        Self { ctx }
    }

    fn repo(&self) -> ResourceRepository<DeploymentKind> {
        self.ctx.deployments()
    }

    fn timeout(&self) -> Duration {
        self.ctx.config().subsystem_timeout
    }

    /// Insert the deployment and create its registry, cluster, and DNS objects.
    pub async fn create(
        &self,
        id: &str,
        owner_id: &str,
        zone: Option<&str>,
        params: &DeploymentCreateParams,
    ) -> Result<()> {
        if params.apps.is_empty() {
            return Err(Error::InvalidRequest(format!(
                "deployment {} needs at least one app",
                params.name
            )));
        }
        let zone = match zone {
            Some(name) => self.ctx.zone(name)?,
            None => self.ctx.default_zone()?,
        };

        let spec = DeploymentSpec {
            deployment_type: params.deployment_type,
            private: params.private,
            apps: params.apps.clone(),
        };
        let mut deployment = Deployment::new(id, &params.name, owner_id, &zone.name, spec)
            .with_activity(Activity::BeingCreated);
        if params.deployment_type == DeploymentType::Custom {
            let image = custom_image(&deployment, &self.ctx.config().registry_url, INITIAL_TAG);
            if let Some(app) = deployment.spec.main_app_mut() {
                app.image = image;
            }
        }

        let repo = self.repo();
        match repo.create_if_unique(&deployment).await {
            Ok(()) => info!(deployment_id = %id, name = %deployment.name, "Deployment inserted"),
            Err(CoreError::UniqueConstraintViolation { .. } | CoreError::DuplicateId { .. }) => {
                if repo.exists(id).await? {
                    debug!(deployment_id = %id, "Resuming deployment creation");
                } else {
                    if let Some(holder) = repo.get_by_name(&deployment.name).await?
                        && let Err(e) = self.repair(&holder.id).await
                    {
                        warn!(deployment_id = %holder.id, error = %e, "Repair of conflicting deployment failed");
                    }
                    return Err(Error::InvalidRequest(format!(
                        "deployment name {} is already taken",
                        deployment.name
                    )));
                }
            }
            Err(e) => return Err(e.into()),
        }

        let deployment = repo.require(id).await?;
        self.ensure(&deployment).await
    }

    async fn ensure(&self, deployment: &Deployment) -> Result<()> {
        let zone = self.ctx.zone(&deployment.zone)?;
        let gen_ctx = GenContext::new(self.ctx.config(), zone);
        let subsystems = self.ctx.subsystems();
        let cluster = subsystems.cluster(&deployment.zone)?;
        let repo = self.repo();
        let id = deployment.id.as_str();

        let registry = Reconciler::new(&repo, id, REGISTRY, self.timeout())
            .apply(
                subsystems.registry.as_ref(),
                &registry_objects(deployment, &gen_ctx),
                &deployment.subsystems.registry,
            )
            .await?;

        let robot = recorded_robot(deployment, &registry);
        Reconciler::new(&repo, id, K8S, self.timeout())
            .apply(
                cluster.as_ref(),
                &k8s_objects(deployment, &gen_ctx, robot)?,
                &deployment.subsystems.k8s,
            )
            .await?;

        Reconciler::new(&repo, id, DNS, self.timeout())
            .apply(
                subsystems.dns.as_ref(),
                &dns_records(deployment, &gen_ctx),
                &deployment.subsystems.dns,
            )
            .await?;
        Ok(())
    }

    /// Rename the deployment, change its privacy, or replace its apps.
    ///
    /// A custom deployment keeps the image of its last build.
    pub async fn update(&self, id: &str, params: &DeploymentUpdateParams) -> Result<()> {
        let repo = self.repo();
        let current = repo.require(id).await?;

        let mut patch = Map::new();
        if let Some(private) = params.private {
            patch.insert("private".to_string(), Value::Bool(private));
        }
        if let Some(apps) = &params.apps {
            let mut apps: Vec<App> = apps.clone();
            let Some(main) = apps.first_mut() else {
                return Err(Error::InvalidRequest(format!(
                    "deployment {} needs at least one app",
                    id
                )));
            };
            if current.spec.deployment_type == DeploymentType::Custom
                && let Some(built) = current.spec.main_app()
            {
                main.image = built.image.clone();
            }
            patch.insert("apps".to_string(), serde_json::to_value(&apps)?);
        }

        let update = ResourceUpdate {
            name: params.name.clone(),
            owner_id: None,
            spec_patch: (!patch.is_empty()).then_some(Value::Object(patch)),
        };
        repo.update(id, &update).await?;

        let deployment = repo.require(id).await?;
        self.ensure(&deployment).await?;
        repo.mark_updated(id).await?;
        info!(deployment_id = %id, "Deployment updated");
        Ok(())
    }

    /// Hand the deployment to `new_owner_id` and relabel its objects.
    pub async fn update_owner(&self, id: &str, new_owner_id: &str) -> Result<()> {
        let repo = self.repo();
        let update = ResourceUpdate {
            owner_id: Some(new_owner_id.to_string()),
            ..Default::default()
        };
        repo.update(id, &update).await?;

        let deployment = repo.require(id).await?;
        self.ensure(&deployment).await?;
        repo.mark_updated(id).await?;
        info!(deployment_id = %id, owner_id = %new_owner_id, "Deployment owner updated");
        Ok(())
    }

    /// Tear down DNS, cluster, and registry objects, then soft-delete.
    pub async fn delete(&self, id: &str, wait: RelatedJobWait) -> Result<()> {
        wait_for_related_jobs(&self.ctx.jobs(), id, JobType::DeleteDeployment, wait).await?;

        let repo = self.repo().including_deleted();
        let Some(deployment) = repo.get(id).await? else {
            debug!(deployment_id = %id, "Deployment already gone");
            return Ok(());
        };
        mark_deleting(&repo, id).await?;

        let subsystems = self.ctx.subsystems();
        let cluster = subsystems.cluster(&deployment.zone)?;
        Reconciler::new(&repo, id, DNS, self.timeout())
            .delete_all(subsystems.dns.as_ref(), &deployment.subsystems.dns)
            .await?;
        Reconciler::new(&repo, id, K8S, self.timeout())
            .delete_all(cluster.as_ref(), &deployment.subsystems.k8s)
            .await?;
        Reconciler::new(&repo, id, REGISTRY, self.timeout())
            .delete_all(subsystems.registry.as_ref(), &deployment.subsystems.registry)
            .await?;

        repo.soft_delete(id).await?;
        info!(deployment_id = %id, "Deployment deleted");
        Ok(())
    }

    /// Reconcile the deployment.
    pub async fn repair(&self, id: &str) -> Result<()> {
        let repo = self.repo();
        let deployment = repo.require(id).await?;
        self.ensure(&deployment).await?;
        repo.mark_repaired(id).await?;
        debug!(deployment_id = %id, "Deployment repaired");
        Ok(())
    }

    /// Point every custom deployment in `ids` at the image tagged `tag`.
    ///
    /// Missing, deleted, and prebuilt deployments are skipped. Every
    /// deployment is attempted; the first error is returned afterwards.
    pub async fn build(&self, ids: &[String], tag: &str) -> Result<()> {
        let mut first_err = None;
        for id in ids {
            if let Err(e) = self.build_one(id, tag).await {
                warn!(deployment_id = %id, error = %e, "Build rollout failed");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn build_one(&self, id: &str, tag: &str) -> Result<()> {
        let repo = self.repo();
        let Some(deployment) = repo.get(id).await? else {
            debug!(deployment_id = %id, "Skipping build of missing deployment");
            return Ok(());
        };
        if deployment.spec.deployment_type != DeploymentType::Custom
            || deployment.is_being_removed()
        {
            debug!(deployment_id = %id, "Skipping build");
            return Ok(());
        }

        let image = custom_image(&deployment, &self.ctx.config().registry_url, tag);
        let mut apps = deployment.spec.apps.clone();
        if let Some(main) = apps.first_mut() {
            main.image = image.clone();
        }
        repo.set_spec_field(id, &["apps"], &apps).await?;

        let deployment = repo.require(id).await?;
        self.ensure(&deployment).await?;
        info!(deployment_id = %id, image = %image, "Deployment rolled to new build");
        Ok(())
    }

    /// CI workflow that builds and pushes the deployment's image.
    pub async fn ci_config(&self, id: &str) -> Result<Value> {
        let deployment = self.repo().require(id).await?;
        if deployment.spec.deployment_type != DeploymentType::Custom {
            return Err(Error::InvalidRequest(format!(
                "deployment {} is not built from source",
                id
            )));
        }
        let robot = recorded_robot(&deployment, &deployment.subsystems.registry).ok_or_else(|| {
            Error::InvalidRequest(format!("deployment {} has no registry robot yet", id))
        })?;
        let zone = self.ctx.zone(&deployment.zone)?;
        let gen_ctx = GenContext::new(self.ctx.config(), zone);
        Ok(ci_config(&deployment, &gen_ctx, robot))
    }

    /// Roll the deployment's pods.
    pub async fn restart(&self, id: &str) -> Result<()> {
        let deployment = self.repo().require(id).await?;
        let zone = self.ctx.zone(&deployment.zone)?;
        let cluster = self.ctx.subsystems().cluster(&deployment.zone)?;
        with_timeout(
            "cluster",
            self.timeout(),
            cluster.restart(&zone.deployment_namespace, &deployment.name),
        )
        .await?;
        info!(deployment_id = %id, "Deployment restarted");
        Ok(())
    }
}
