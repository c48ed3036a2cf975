// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for GPU leasing: attach races, candidate fallback, pass-through
//! failures, and the lease-expiry sweep.

mod common;

use std::time::Duration;

use stratos_core::models::{JobStatus, JobType};
use stratos_core::persistence::JobQuery;

use common::{HOST, OWNER, TestContext};
use stratos_control::confirmer::SYSTEM_USER;
use stratos_control::jobs::args::{AttachGpuArgs, DetachGpuArgs, OwnerParams, UpdateOwnerArgs};
use stratos_control::jobs::{JobArgs, JobOutcome};

const BUS_A: &str = "0000:01:00.0";
const BUS_B: &str = "0000:02:00.0";

fn attach(vm_id: &str, gpu_ids: &[&str], lease_secs: u64) -> JobArgs {
    JobArgs::AttachGpu(AttachGpuArgs {
        id: vm_id.to_string(),
        gpu_ids: gpu_ids.iter().map(|id| id.to_string()).collect(),
        lease_duration_secs: lease_secs,
    })
}

async fn cs_id(t: &TestContext, vm_id: &str) -> String {
    t.ctx
        .vms()
        .require(vm_id)
        .await
        .unwrap()
        .subsystems
        .cs_vm()
        .unwrap()
        .id
        .clone()
}

#[tokio::test]
async fn test_concurrent_attach_has_one_winner() {
    let t = TestContext::new().await;
    t.create_vm("v1", "vm-a").await;
    t.create_vm("v2", "vm-b").await;
    let gpu = t.add_gpu(HOST, BUS_A).await;

    let first = t.submit(attach("v1", &[&gpu.id], 3600)).await;
    let second = t.submit(attach("v2", &[&gpu.id], 3600)).await;

    let outcomes = t.run_once().await;
    assert_eq!(outcomes.len(), 2);
    let completed = outcomes
        .iter()
        .filter(|(_, o)| *o == JobOutcome::Completed)
        .count();
    assert_eq!(completed, 1);

    let loser = outcomes
        .iter()
        .find(|(_, o)| *o != JobOutcome::Completed)
        .map(|(job, _)| job.id.clone())
        .unwrap();
    let loser = t.job(&loser).await;
    assert_eq!(loser.status, JobStatus::Terminated);
    assert!(loser.last_error().unwrap().contains("already attached"));

    let leased = t.ctx.gpus().get(&gpu.id).await.unwrap().unwrap();
    let winner = if leased.lease.vm_id == "v1" { &first } else { &second };
    assert_eq!(t.status(&winner.id).await, JobStatus::Completed);
    assert_eq!(leased.lease.user_id, OWNER);

    let vm = t.ctx.vms().require(&leased.lease.vm_id).await.unwrap();
    assert_eq!(vm.spec.gpu_lease_id.as_deref(), Some(gpu.id.as_str()));
    assert_eq!(
        t.memory.hypervisor.devices(&cs_id(&t, &vm.id).await).await,
        vec![BUS_A.to_string()]
    );
}

#[tokio::test]
async fn test_attach_falls_back_to_next_candidate() {
    let t = TestContext::new().await;
    t.create_vm("v1", "vm-a").await;
    t.create_vm("v2", "vm-b").await;
    let a = t.add_gpu(HOST, BUS_A).await;
    let b = t.add_gpu(HOST, BUS_B).await;

    assert_eq!(
        t.run_job(attach("v1", &[&a.id], 3600)).await.status,
        JobStatus::Completed
    );
    assert_eq!(
        t.run_job(attach("v2", &[&a.id, &b.id], 3600)).await.status,
        JobStatus::Completed
    );

    let held = t.ctx.gpus().get_by_vm("v2").await.unwrap().unwrap();
    assert_eq!(held.id, b.id);
}

#[tokio::test]
async fn test_attach_moves_vm_to_gpu_host() {
    let t = TestContext::new().await;
    t.create_vm("v1", "vm-a").await;
    let gpu = t.add_gpu("host-2", BUS_A).await;

    let job = t.run_job(attach("v1", &[&gpu.id], 3600)).await;
    assert_eq!(job.status, JobStatus::Completed);

    let vm = t.ctx.vms().require("v1").await.unwrap();
    assert_eq!(vm.spec.host_name.as_deref(), Some("host-2"));
    assert!(vm.activities.is_empty());
}

#[tokio::test]
async fn test_attaching_held_gpu_skips_pass_through() {
    let t = TestContext::new().await;
    t.create_vm("v1", "vm-a").await;
    let gpu = t.add_gpu(HOST, BUS_A).await;

    assert_eq!(
        t.run_job(attach("v1", &[&gpu.id], 60)).await.status,
        JobStatus::Completed
    );
    let pci_calls = t.memory.hypervisor.pci_faults().calls();
    let first = t.ctx.gpus().get(&gpu.id).await.unwrap().unwrap();

    assert_eq!(
        t.run_job(attach("v1", &[&gpu.id], 3600)).await.status,
        JobStatus::Completed
    );
    assert_eq!(t.memory.hypervisor.pci_faults().calls(), pci_calls);
    assert_eq!(
        t.memory.hypervisor.devices(&cs_id(&t, "v1").await).await,
        vec![BUS_A.to_string()]
    );

    // An unexpired lease is kept as it was.
    let held = t.ctx.gpus().get(&gpu.id).await.unwrap().unwrap();
    assert_eq!(held.lease.vm_id, "v1");
    assert_eq!(held.lease.end, first.lease.end);
}

#[tokio::test]
async fn test_failed_pass_through_releases_lease() {
    let t = TestContext::new().await;
    t.create_vm("v1", "vm-a").await;
    let gpu = t.add_gpu(HOST, BUS_A).await;
    t.memory.hypervisor.pci_faults().set_unavailable(true);

    let job = t.submit(attach("v1", &[&gpu.id], 3600)).await;
    let outcomes = t.run_once().await;
    assert!(matches!(outcomes[0].1, JobOutcome::Failed { .. }));
    assert_eq!(t.status(&job.id).await, JobStatus::Failed);

    let gpu = t.ctx.gpus().get(&gpu.id).await.unwrap().unwrap();
    assert!(!gpu.is_attached());
    assert!(t.ctx.vms().require("v1").await.unwrap().spec.gpu_lease_id.is_none());

    t.memory.hypervisor.pci_faults().set_unavailable(false);
    t.drain().await;
    assert_eq!(t.status(&job.id).await, JobStatus::Completed);
}

#[tokio::test]
async fn test_detach_gpu_job() {
    let t = TestContext::new().await;
    t.create_vm("v1", "vm-a").await;
    let gpu = t.add_gpu(HOST, BUS_A).await;
    t.run_job(attach("v1", &[&gpu.id], 3600)).await;

    let job = t
        .run_job(JobArgs::DetachGpu(DetachGpuArgs {
            id: "v1".to_string(),
            gpu_id: None,
        }))
        .await;
    assert_eq!(job.status, JobStatus::Completed);

    assert!(!t.ctx.gpus().get(&gpu.id).await.unwrap().unwrap().is_attached());
    assert!(t.memory.hypervisor.devices(&cs_id(&t, "v1").await).await.is_empty());
    assert!(t.ctx.vms().require("v1").await.unwrap().spec.gpu_lease_id.is_none());
}

#[tokio::test]
async fn test_owner_update_releases_gpu() {
    let t = TestContext::new().await;
    t.create_vm("v1", "vm-a").await;
    let gpu = t.add_gpu(HOST, BUS_A).await;
    t.run_job(attach("v1", &[&gpu.id], 3600)).await;

    let job = t
        .run_job(JobArgs::UpdateVmOwner(UpdateOwnerArgs {
            id: "v1".to_string(),
            params: OwnerParams {
                new_owner_id: "u2".to_string(),
                old_owner_id: OWNER.to_string(),
            },
        }))
        .await;
    assert_eq!(job.status, JobStatus::Completed);
    assert!(t.ctx.gpus().get_by_vm("v1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_expired_lease_is_swept_and_detached() {
    let t = TestContext::new().await;
    t.create_vm("v1", "vm-a").await;
    let gpu = t.add_gpu(HOST, BUS_A).await;
    assert_eq!(
        t.run_job(attach("v1", &[&gpu.id], 1)).await.status,
        JobStatus::Completed
    );

    // Nothing to sweep while the lease runs.
    t.vm_confirmer().tick().await.unwrap();
    assert!(t.ctx.gpus().get(&gpu.id).await.unwrap().unwrap().is_attached());

    tokio::time::sleep(Duration::from_millis(1100)).await;
    t.vm_confirmer().tick().await.unwrap();

    let swept = t.ctx.gpus().get(&gpu.id).await.unwrap().unwrap();
    assert_eq!(swept.lease.vm_id, "");

    let detach = JobQuery::new()
        .of_types(&[JobType::DetachGpu])
        .for_resource("v1");
    let queued = t.ctx.jobs().list(&detach).await.unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].user_id, SYSTEM_USER);

    t.drain().await;
    assert_eq!(t.status(&queued[0].id).await, JobStatus::Completed);
    assert!(t.memory.hypervisor.devices(&cs_id(&t, "v1").await).await.is_empty());
    assert!(t.ctx.vms().require("v1").await.unwrap().spec.gpu_lease_id.is_none());
}
