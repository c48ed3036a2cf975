// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Deployment and storage manager job tests.

mod common;

use stratos_core::models::deployment::DeploymentType;
use stratos_core::models::{Activity, JobStatus};

use common::{TestContext, deployment_args, sm_args};
use stratos_control::jobs::JobArgs;
use stratos_control::jobs::args::{
    BuildDeploymentsArgs, BuildParams, DeploymentUpdateParams, IdArgs, UpdateDeploymentArgs,
};
use stratos_control::services::DeploymentService;

#[tokio::test]
async fn test_create_prebuilt_deployment() {
    let t = TestContext::new().await;

    let job = t
        .run_job(deployment_args("d1", "web", DeploymentType::Prebuilt))
        .await;
    assert_eq!(job.status, JobStatus::Completed);

    let d = t.ctx.deployments().require("d1").await.unwrap();
    assert!(d.activities.is_empty());
    assert!(d.subsystems.registry.is_empty());
    assert!(d.subsystems.k8s.contains_key("deployment/web"));
    assert!(d.subsystems.k8s.contains_key("ingress/web"));
    assert!(!d.subsystems.k8s.contains_key("secret/web-image-pull-secret"));
    assert_eq!(d.subsystems.dns.len(), 1);
    assert_eq!(t.memory.dns.objects().await.len(), 1);
}

#[tokio::test]
async fn test_create_custom_deployment_provisions_registry() {
    let t = TestContext::new().await;

    let job = t
        .run_job(deployment_args("d1", "web", DeploymentType::Custom))
        .await;
    assert_eq!(job.status, JobStatus::Completed);

    let d = t.ctx.deployments().require("d1").await.unwrap();
    assert_eq!(d.subsystems.registry.len(), 4);
    assert!(d.subsystems.k8s.contains_key("secret/web-image-pull-secret"));
    assert!(d.spec.apps[0].image.starts_with("registry.local/"));

    let ci = DeploymentService::new(t.ctx.clone())
        .ci_config("d1")
        .await
        .unwrap();
    let login = &ci["jobs"]["build"]["steps"][0]["with"];
    assert_eq!(login["username"], "web");
    assert!(!login["password"].as_str().unwrap().is_empty());
}

#[tokio::test]
async fn test_ci_config_rejects_prebuilt() {
    let t = TestContext::new().await;
    t.run_job(deployment_args("d1", "web", DeploymentType::Prebuilt))
        .await;

    let result = DeploymentService::new(t.ctx.clone()).ci_config("d1").await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_deployment_confirmer() {
    let t = TestContext::new().await;
    t.run_job(deployment_args("d1", "web", DeploymentType::Custom))
        .await;
    t.ctx
        .deployments()
        .add_activity("d1", Activity::BeingCreated)
        .await
        .unwrap();

    let confirmer = t.deployment_confirmer();
    let report = confirmer.tick().await.unwrap();
    assert_eq!(report.confirmed, vec!["d1".to_string()]);

    let job = t
        .run_job(JobArgs::DeleteDeployment(IdArgs {
            id: "d1".to_string(),
        }))
        .await;
    assert_eq!(job.status, JobStatus::Completed);
    assert!(t.memory.registry.objects().await.is_empty());
    assert!(t.memory.dns.objects().await.is_empty());

    let report = confirmer.tick().await.unwrap();
    assert_eq!(report.hard_deleted, vec!["d1".to_string()]);
    assert!(!t.ctx.deployments().including_deleted().exists("d1").await.unwrap());
}

#[tokio::test]
async fn test_confirmer_skips_resource_with_due_delete_retry() {
    let t = TestContext::new().await;
    t.run_job(deployment_args("d1", "web", DeploymentType::Prebuilt))
        .await;

    // DNS teardown fails, so the delete is retried.
    t.memory.dns.faults().set_unavailable(true);
    let job = t
        .submit(JobArgs::DeleteDeployment(IdArgs {
            id: "d1".to_string(),
        }))
        .await;
    t.run_once().await;
    assert_eq!(t.status(&job.id).await, JobStatus::Failed);

    t.memory.dns.faults().set_unavailable(false);
    // The failed delete is due again, so the confirmer keeps its hands off.
    let report = t.deployment_confirmer().tick().await.unwrap();
    assert!(report.hard_deleted.is_empty());

    t.drain().await;
    assert_eq!(t.status(&job.id).await, JobStatus::Completed);
    let report = t.deployment_confirmer().tick().await.unwrap();
    assert_eq!(report.hard_deleted, vec!["d1".to_string()]);
}

#[tokio::test]
async fn test_delete_submitted_with_create_removes_deployment() {
    let t = TestContext::new().await;

    let create = t
        .submit(deployment_args("d1", "web", DeploymentType::Prebuilt))
        .await;
    let delete = t
        .submit(JobArgs::DeleteDeployment(IdArgs {
            id: "d1".to_string(),
        }))
        .await;
    t.drain().await;

    assert_eq!(t.status(&create.id).await, JobStatus::Completed);
    assert_eq!(t.status(&delete.id).await, JobStatus::Completed);
    assert!(t.memory.dns.objects().await.is_empty());

    let report = t.deployment_confirmer().tick().await.unwrap();
    assert_eq!(report.hard_deleted, vec!["d1".to_string()]);
    assert!(!t.ctx.deployments().including_deleted().exists("d1").await.unwrap());
}

#[tokio::test]
async fn test_duplicate_deployment_name_is_terminated() {
    let t = TestContext::new().await;
    t.run_job(deployment_args("d1", "web", DeploymentType::Prebuilt))
        .await;

    let job = t
        .run_job(deployment_args("d2", "web", DeploymentType::Prebuilt))
        .await;
    assert_eq!(job.status, JobStatus::Terminated);
    assert!(!t.ctx.deployments().exists("d2").await.unwrap());
}

#[tokio::test]
async fn test_deployment_without_apps_is_terminated() {
    let t = TestContext::new().await;
    let mut args = deployment_args("d1", "web", DeploymentType::Prebuilt);
    if let JobArgs::CreateDeployment(create) = &mut args {
        create.params.apps.clear();
    }

    let job = t.run_job(args).await;
    assert_eq!(job.status, JobStatus::Terminated);
    assert!(job.last_error().unwrap().contains("at least one app"));
}

#[tokio::test]
async fn test_update_deployment_to_private() {
    let t = TestContext::new().await;
    t.run_job(deployment_args("d1", "web", DeploymentType::Prebuilt))
        .await;

    let job = t
        .run_job(JobArgs::UpdateDeployment(UpdateDeploymentArgs {
            id: "d1".to_string(),
            params: DeploymentUpdateParams {
                private: Some(true),
                ..Default::default()
            },
        }))
        .await;
    assert_eq!(job.status, JobStatus::Completed);

    let d = t.ctx.deployments().require("d1").await.unwrap();
    assert!(d.spec.private);
    assert!(d.updated_at.is_some());
    assert!(d.subsystems.k8s.contains_key("networkpolicy/web"));
    assert!(!d.subsystems.k8s.contains_key("ingress/web"));
    assert!(d.subsystems.dns.is_empty());
    assert!(t.memory.dns.objects().await.is_empty());
}

#[tokio::test]
async fn test_build_rolls_custom_deployments_only() {
    let t = TestContext::new().await;
    t.run_job(deployment_args("d1", "web", DeploymentType::Custom))
        .await;
    t.run_job(deployment_args("d2", "shop", DeploymentType::Prebuilt))
        .await;

    let job = t
        .run_job(JobArgs::BuildDeployments(BuildDeploymentsArgs {
            ids: vec!["d1".to_string(), "d2".to_string(), "missing".to_string()],
            build: BuildParams {
                tag: "abc123".to_string(),
            },
        }))
        .await;
    assert_eq!(job.status, JobStatus::Completed);

    let custom = t.ctx.deployments().require("d1").await.unwrap();
    assert!(custom.spec.apps[0].image.ends_with("/web:abc123"));
    let prebuilt = t.ctx.deployments().require("d2").await.unwrap();
    assert_eq!(prebuilt.spec.apps[0].image, "nginx:1.27");
}

#[tokio::test]
async fn test_restart_deployment() {
    let t = TestContext::new().await;
    t.run_job(deployment_args("d1", "web", DeploymentType::Prebuilt))
        .await;

    DeploymentService::new(t.ctx.clone())
        .restart("d1")
        .await
        .unwrap();
    assert_eq!(t.memory.cluster.restarts().await, vec!["deploy/web".to_string()]);
}

#[tokio::test]
async fn test_storage_manager_lifecycle() {
    let t = TestContext::new().await;

    let job = t.run_job(sm_args("s1", "u1")).await;
    assert_eq!(job.status, JobStatus::Completed);
    let sm = t.ctx.sms().require("s1").await.unwrap();
    assert!(!sm.subsystems.k8s.is_empty());

    // One storage manager per user.
    let second = t.run_job(sm_args("s2", "u1")).await;
    assert_eq!(second.status, JobStatus::Terminated);
    assert!(second.last_error().unwrap().contains("already has a storage manager"));
    assert!(t.ctx.sms().require("s1").await.unwrap().repaired_at.is_some());

    let repair = t
        .run_job(JobArgs::RepairSm(IdArgs {
            id: "s1".to_string(),
        }))
        .await;
    assert_eq!(repair.status, JobStatus::Completed);

    let delete = t
        .run_job(JobArgs::DeleteSm(IdArgs {
            id: "s1".to_string(),
        }))
        .await;
    assert_eq!(delete.status, JobStatus::Completed);

    let report = t.sm_confirmer().tick().await.unwrap();
    assert_eq!(report.hard_deleted, vec!["s1".to_string()]);
    assert!(t.memory.cluster.objects().await.is_empty());
}
