// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! VM job lifecycle tests: create, duplicate names, retries, updates,
//! deletes racing other jobs, snapshots, and power commands.

mod common;

use std::time::Duration;

use serde_json::json;
use stratos_core::models::{Activity, JobStatus, JobType, NewJob};
use stratos_core::models::job::MAX_ATTEMPTS;
use stratos_core::persistence::ClaimOrder;

use common::{OWNER, TestContext, vm_args};
use stratos_control::jobs::args::{
    CreateSnapshotArgs, IdArgs, OwnerParams, SnapshotParams, SnapshotRefArgs, UpdateOwnerArgs,
    UpdateVmArgs, VmActionArgs, VmUpdateParams,
};
use stratos_control::jobs::runner::GRACEFUL_TERMINATION;
use stratos_control::jobs::{JobArgs, JobOutcome, JobRunnerConfig};
use stratos_control::subsystems::PowerAction;

fn update_ram(id: &str, ram: u32) -> JobArgs {
    JobArgs::UpdateVm(UpdateVmArgs {
        id: id.to_string(),
        params: VmUpdateParams {
            ram: Some(ram),
            ..Default::default()
        },
    })
}

fn snapshot(id: &str, name: &str) -> CreateSnapshotArgs {
    CreateSnapshotArgs {
        id: id.to_string(),
        params: SnapshotParams {
            name: name.to_string(),
        },
    }
}

#[tokio::test]
async fn test_create_vm_happy_path() {
    let t = TestContext::new().await;

    let job = t.run_job(vm_args("v1", "vm-a")).await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.attempts, 0);
    assert!(job.finished_at.is_some());

    let vm = t.ctx.vms().require("v1").await.unwrap();
    assert_eq!(vm.name, "vm-a");
    assert_eq!(vm.owner_id, OWNER);
    assert!(!vm.doing(Activity::BeingCreated));
    // host-1 has the most free memory.
    assert_eq!(vm.spec.host_name.as_deref(), Some("host-1"));

    let cs_vm = vm.subsystems.cs_vm().expect("hypervisor VM recorded");
    assert!(!cs_vm.id.is_empty());
    assert_eq!(cs_vm.cpu_cores, 2);
    assert_eq!(cs_vm.ram, 4);
    assert_eq!(cs_vm.ssh_public_keys.first().map(String::as_str), Some("ssh-rsa X"));
    assert!(!t.memory.hypervisor.objects().await.is_empty());
}

#[tokio::test]
async fn test_confirmer_clears_being_created_once_subsystems_exist() {
    let t = TestContext::new().await;
    t.create_vm("v1", "vm-a").await;

    // A create that crashed after provisioning leaves the activity behind.
    assert!(t.ctx.vms().add_activity("v1", Activity::BeingCreated).await.unwrap());

    let report = t.vm_confirmer().tick().await.unwrap();
    assert_eq!(report.confirmed, vec!["v1".to_string()]);
    assert!(report.hard_deleted.is_empty());

    let vm = t.ctx.vms().require("v1").await.unwrap();
    assert!(!vm.doing(Activity::BeingCreated));
}

#[tokio::test]
async fn test_confirmer_waits_for_missing_subsystems() {
    let t = TestContext::new().await;
    t.memory.hypervisor.faults().set_unavailable(true);

    let job = t.submit(vm_args("v1", "vm-a")).await;
    t.run_once().await;
    assert_eq!(t.status(&job.id).await, JobStatus::Failed);
    t.ctx.vms().add_activity("v1", Activity::BeingCreated).await.unwrap();

    let report = t.vm_confirmer().tick().await.unwrap();
    assert!(report.confirmed.is_empty());
    assert!(t.ctx.vms().require("v1").await.unwrap().doing(Activity::BeingCreated));
}

#[tokio::test]
async fn test_duplicate_name_is_terminated_and_repairs_holder() {
    let t = TestContext::new().await;
    t.create_vm("v1", "vm-a").await;
    assert!(t.ctx.vms().require("v1").await.unwrap().repaired_at.is_none());

    let job = t.run_job(vm_args("v2", "vm-a")).await;
    assert_eq!(job.status, JobStatus::Terminated);
    assert!(job.last_error().unwrap().contains("already taken"));

    assert!(t.ctx.vms().including_deleted().get("v2").await.unwrap().is_none());
    assert!(t.ctx.vms().require("v1").await.unwrap().repaired_at.is_some());
}

#[tokio::test]
async fn test_create_retry_resumes_existing_document() {
    let t = TestContext::new().await;
    t.memory.hypervisor.faults().fail_next(1);

    let job = t.submit(vm_args("v1", "vm-a")).await;
    let outcomes = t.run_once().await;
    assert!(matches!(outcomes[0].1, JobOutcome::Failed { attempts: 1, .. }));
    assert!(t.ctx.vms().exists("v1").await.unwrap());

    t.drain().await;
    let job = t.job(&job.id).await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.attempts, 1);
    assert_eq!(job.error_logs.len(), 1);
}

#[tokio::test]
async fn test_transient_failure_schedules_backoff() {
    let t = TestContext::with_runner(JobRunnerConfig {
        backoff_base: Duration::from_secs(30),
        ..common::runner_config()
    })
    .await;
    t.memory.hypervisor.faults().set_unavailable(true);

    let job = t.submit(vm_args("v1", "vm-a")).await;
    let outcomes = t.run_once().await;
    assert_eq!(outcomes.len(), 1);

    let job = t.job(&job.id).await;
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 1);
    assert!(job.last_error().unwrap().contains("unavailable"));
    let claimed_at = job.last_run_at.expect("claim time recorded");
    assert!(job.run_after - claimed_at >= chrono::Duration::seconds(30));

    // Not due yet.
    assert!(t.run_once().await.is_empty());
}

#[tokio::test]
async fn test_fifth_transient_failure_terminates() {
    let t = TestContext::new().await;
    t.memory.hypervisor.faults().set_unavailable(true);

    let job = t.submit(vm_args("v1", "vm-a")).await;
    for attempt in 1..MAX_ATTEMPTS {
        let outcomes = t.run_once().await;
        assert_eq!(outcomes.len(), 1);
        match &outcomes[0].1 {
            JobOutcome::Failed { attempts, .. } => assert_eq!(*attempts, attempt),
            other => panic!("attempt {} ended with {:?}", attempt, other),
        }
        assert_eq!(t.status(&job.id).await, JobStatus::Failed);
    }

    let outcomes = t.run_once().await;
    assert!(matches!(outcomes[0].1, JobOutcome::Terminated(_)));

    let job = t.job(&job.id).await;
    assert_eq!(job.status, JobStatus::Terminated);
    assert_eq!(job.error_logs.len(), MAX_ATTEMPTS as usize);
    assert!(t.run_once().await.is_empty());

    // The exit hook ran on every attempt.
    let vm = t.ctx.vms().require("v1").await.unwrap();
    assert!(vm.activities.is_empty());
}

#[tokio::test]
async fn test_delete_during_update_terminates_update() {
    let t = TestContext::new().await;
    t.create_vm("v1", "vm-a").await;

    let update = t.submit(update_ram("v1", 8)).await;
    let delete = t
        .submit(JobArgs::DeleteVm(IdArgs {
            id: "v1".to_string(),
        }))
        .await;

    // Queued delete marks the VM right away.
    assert!(
        t.ctx
            .vms()
            .require("v1")
            .await
            .unwrap()
            .doing(Activity::BeingDeleted)
    );

    t.drain().await;

    let update = t.job(&update.id).await;
    assert_eq!(update.status, JobStatus::Terminated);
    assert_eq!(update.last_error(), Some(GRACEFUL_TERMINATION));
    assert_eq!(t.status(&delete.id).await, JobStatus::Completed);

    assert!(t.ctx.vms().get("v1").await.unwrap().is_none());
    let deleted = t.ctx.vms().including_deleted().require("v1").await.unwrap();
    assert!(deleted.deleted_at.is_some());
    assert!(t.memory.hypervisor.objects().await.is_empty());

    let report = t.vm_confirmer().tick().await.unwrap();
    assert_eq!(report.hard_deleted, vec!["v1".to_string()]);
    assert!(t.ctx.vms().including_deleted().get("v1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_confirmer_keeps_resource_while_delete_is_queued() {
    let t = TestContext::new().await;
    t.create_vm("v1", "vm-a").await;

    t.submit(JobArgs::DeleteVm(IdArgs {
        id: "v1".to_string(),
    }))
    .await;

    let report = t.vm_confirmer().tick().await.unwrap();
    assert!(report.hard_deleted.is_empty());
    assert!(t.ctx.vms().including_deleted().exists("v1").await.unwrap());
}

#[tokio::test]
async fn test_delete_submitted_with_create_removes_vm() {
    let t = TestContext::new().await;

    let create = t.submit(vm_args("v1", "vm-a")).await;
    let delete = t
        .submit(JobArgs::DeleteVm(IdArgs {
            id: "v1".to_string(),
        }))
        .await;
    t.drain().await;

    assert_eq!(t.status(&create.id).await, JobStatus::Completed);
    assert_eq!(t.status(&delete.id).await, JobStatus::Completed);
    assert!(t.ctx.vms().get("v1").await.unwrap().is_none());
    assert!(t.memory.hypervisor.objects().await.is_empty());

    let deleted = t.ctx.vms().including_deleted().require("v1").await.unwrap();
    assert!(deleted.doing(Activity::BeingDeleted));
    assert!(!deleted.doing(Activity::BeingCreated));

    let report = t.vm_confirmer().tick().await.unwrap();
    assert_eq!(report.hard_deleted, vec!["v1".to_string()]);
    assert!(!t.ctx.vms().including_deleted().exists("v1").await.unwrap());
}

#[tokio::test]
async fn test_panicking_handler_is_terminated_and_clears_activities() {
    let t = TestContext::new().await;
    t.create_vm("v1", "vm-a").await;

    t.memory.hypervisor.faults().panic_next(1);
    let job = t.run_job(update_ram("v1", 8)).await;
    assert_eq!(job.status, JobStatus::Terminated);
    assert_eq!(job.last_error(), Some("handler panicked"));
    assert!(job.finished_at.is_some());

    let vm = t.ctx.vms().require("v1").await.unwrap();
    assert!(!vm.doing(Activity::Updating));
    assert!(vm.activities.is_empty());

    // The runner survives and keeps serving jobs.
    let job = t.run_job(update_ram("v1", 8)).await;
    assert_eq!(job.status, JobStatus::Completed);
}

#[tokio::test]
async fn test_update_vm_resizes_and_stamps() {
    let t = TestContext::new().await;
    t.create_vm("v1", "vm-a").await;

    let job = t.run_job(update_ram("v1", 8)).await;
    assert_eq!(job.status, JobStatus::Completed);

    let vm = t.ctx.vms().require("v1").await.unwrap();
    assert_eq!(vm.spec.specs.ram, 8);
    assert_eq!(vm.subsystems.cs_vm().unwrap().ram, 8);
    assert!(vm.updated_at.is_some());
    assert!(vm.activities.is_empty());
}

#[tokio::test]
async fn test_disk_cannot_shrink() {
    let t = TestContext::new().await;
    t.create_vm("v1", "vm-a").await;

    let job = t
        .run_job(JobArgs::UpdateVm(UpdateVmArgs {
            id: "v1".to_string(),
            params: VmUpdateParams {
                disk_size: Some(10),
                ..Default::default()
            },
        }))
        .await;
    assert_eq!(job.status, JobStatus::Terminated);
    assert!(job.last_error().unwrap().contains("cannot shrink"));
    assert_eq!(t.ctx.vms().require("v1").await.unwrap().spec.specs.disk_size, 20);
}

#[tokio::test]
async fn test_owner_update_preempts_queued_leaf_jobs() {
    let t = TestContext::new().await;
    t.create_vm("v1", "vm-a").await;

    t.submit(JobArgs::UpdateVmOwner(UpdateOwnerArgs {
        id: "v1".to_string(),
        params: OwnerParams {
            new_owner_id: "u2".to_string(),
            old_owner_id: OWNER.to_string(),
        },
    }))
    .await;
    // Hold the owner update in the running state.
    let owner = t
        .ctx
        .jobs()
        .claim_next(ClaimOrder::NewestFirst)
        .await
        .unwrap()
        .expect("owner update claimed");

    let update = t.submit(update_ram("v1", 8)).await;
    t.drain().await;

    let update = t.job(&update.id).await;
    assert_eq!(update.status, JobStatus::Terminated);
    assert_eq!(update.last_error(), Some(GRACEFUL_TERMINATION));

    assert_eq!(t.runner.execute(owner.clone()).await, JobOutcome::Completed);
    assert_eq!(t.status(&owner.id).await, JobStatus::Completed);

    let vm = t.ctx.vms().require("v1").await.unwrap();
    assert_eq!(vm.owner_id, "u2");
    assert_eq!(vm.spec.specs.ram, 4);
}

#[tokio::test]
async fn test_system_snapshots_are_pruned_to_retention() {
    let t = TestContext::new().await;
    t.create_vm("v1", "vm-a").await;
    let retention = t.ctx.config().system_snapshot_retention;

    for i in 0..retention + 1 {
        let job = t
            .run_job(JobArgs::CreateSystemSnapshot(snapshot("v1", &format!("nightly-{}", i))))
            .await;
        assert_eq!(job.status, JobStatus::Completed);
    }

    let vm = t.ctx.vms().require("v1").await.unwrap();
    assert_eq!(vm.subsystems.snapshots.len(), retention);
    assert!(vm.subsystems.snapshots.values().all(|s| s.name != "nightly-0"));
    assert!(!vm.doing(Activity::CreatingSnapshot));
}

#[tokio::test]
async fn test_user_snapshot_limit() {
    let t = TestContext::new().await;
    t.create_vm("v1", "vm-a").await;

    let first = t
        .run_job(JobArgs::CreateUserSnapshot(snapshot("v1", "mine")))
        .await;
    assert_eq!(first.status, JobStatus::Completed);

    let second = t
        .run_job(JobArgs::CreateUserSnapshot(snapshot("v1", "mine-again")))
        .await;
    assert_eq!(second.status, JobStatus::Terminated);
    assert!(second.last_error().unwrap().contains("user snapshot"));
}

#[tokio::test]
async fn test_one_user_snapshot_job_per_user() {
    let t = TestContext::new().await;
    t.create_vm("v1", "vm-a").await;
    t.create_vm("v2", "vm-b").await;

    t.submit(JobArgs::CreateUserSnapshot(snapshot("v1", "mine")))
        .await;
    let held = t
        .ctx
        .jobs()
        .claim_next(ClaimOrder::NewestFirst)
        .await
        .unwrap()
        .expect("snapshot claimed");

    // Same user, different VM: still skipped while the first one runs.
    let other = t
        .run_job(JobArgs::CreateUserSnapshot(snapshot("v2", "theirs")))
        .await;
    assert_eq!(other.status, JobStatus::Terminated);
    assert_eq!(other.last_error(), Some(GRACEFUL_TERMINATION));

    // System snapshots are not limited.
    let system = t
        .run_job(JobArgs::CreateSystemSnapshot(snapshot("v2", "nightly")))
        .await;
    assert_eq!(system.status, JobStatus::Completed);

    assert_eq!(t.runner.execute(held).await, JobOutcome::Completed);
}

#[tokio::test]
async fn test_apply_and_delete_snapshot() {
    let t = TestContext::new().await;
    t.create_vm("v1", "vm-a").await;
    t.run_job(JobArgs::CreateSystemSnapshot(snapshot("v1", "base")))
        .await;

    let vm = t.ctx.vms().require("v1").await.unwrap();
    let snapshot_id = vm.subsystems.snapshots.keys().next().unwrap().clone();
    let target = SnapshotRefArgs {
        id: "v1".to_string(),
        snapshot_id: snapshot_id.clone(),
    };

    let applied = t.run_job(JobArgs::ApplySnapshot(target.clone())).await;
    assert_eq!(applied.status, JobStatus::Completed);
    let vm = t.ctx.vms().require("v1").await.unwrap();
    assert!(vm.subsystems.snapshots[&snapshot_id].current);
    assert!(!vm.doing(Activity::ApplyingSnapshot));

    let deleted = t.run_job(JobArgs::DeleteSnapshot(target)).await;
    assert_eq!(deleted.status, JobStatus::Completed);
    let vm = t.ctx.vms().require("v1").await.unwrap();
    assert!(vm.subsystems.snapshots.is_empty());
}

#[tokio::test]
async fn test_power_action() {
    let t = TestContext::new().await;
    t.create_vm("v1", "vm-a").await;

    let job = t
        .run_job(JobArgs::DoVmAction(VmActionArgs {
            id: "v1".to_string(),
            action: PowerAction::Stop,
        }))
        .await;
    assert_eq!(job.status, JobStatus::Completed);

    let cs_id = t
        .ctx
        .vms()
        .require("v1")
        .await
        .unwrap()
        .subsystems
        .cs_vm()
        .unwrap()
        .id
        .clone();
    assert_eq!(
        t.memory.hypervisor.power_state(&cs_id).await,
        Some(PowerAction::Stop)
    );
}

#[tokio::test]
async fn test_malformed_and_unknown_jobs_terminate() {
    let t = TestContext::new().await;

    let malformed = t
        .ctx
        .jobs()
        .create(&NewJob::new(OWNER, JobType::CreateVm, json!({ "id": "v1" })))
        .await
        .unwrap();
    let unknown = t
        .ctx
        .jobs()
        .create(&NewJob {
            job_type: "frobnicateVm".to_string(),
            ..NewJob::new(OWNER, JobType::RepairVm, json!({ "id": "v1" }))
        })
        .await
        .unwrap();

    t.drain().await;

    let malformed = t.job(&malformed.id).await;
    assert_eq!(malformed.status, JobStatus::Terminated);
    assert!(malformed.last_error().unwrap().starts_with("invalid arguments"));

    let unknown = t.job(&unknown.id).await;
    assert_eq!(unknown.status, JobStatus::Terminated);
    assert!(unknown.last_error().unwrap().contains("unknown job type"));
}
