// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Static job definitions: which family a job touches, the activities its
//! entry and exit hooks manage, and the checks that skip it.

use stratos_core::models::{Activity, JobType};

/// Resource family a job addresses through `args.id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    /// Virtual machines.
    Vm,
    /// Deployments.
    Deployment,
    /// Storage managers.
    Sm,
}

/// A primitive of the terminate predicate. Checks are OR'd.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateCheck {
    /// The target resource is soft-deleted or has `beingDeleted`.
    TargetResourceDeleted,
    /// Another non-terminal owner update targets the same resource.
    OwnerUpdateInFlight,
    /// The submitting user has another non-terminal `createUserSnapshot` job.
    UserHasSnapshotJob,
}

/// How the runner wraps one job type.
#[derive(Debug, Clone, Copy)]
pub struct JobDefinition {
    /// The job type.
    pub job_type: JobType,
    /// Family of the target resource; `None` for batch jobs.
    pub family: Option<Family>,
    /// Activities added before the handler runs.
    pub entry: &'static [Activity],
    /// Activities removed after the handler, whatever its outcome.
    pub exit: &'static [Activity],
    /// Terminate predicate primitives.
    pub checks: &'static [TerminateCheck],
}

use Activity::*;
use TerminateCheck::*;

const CORE: &[TerminateCheck] = &[TargetResourceDeleted];
const LEAF: &[TerminateCheck] = &[TargetResourceDeleted, OwnerUpdateInFlight];
const USER_SNAPSHOT: &[TerminateCheck] =
    &[TargetResourceDeleted, OwnerUpdateInFlight, UserHasSnapshotJob];

const fn def(
    job_type: JobType,
    family: Option<Family>,
    entry: &'static [Activity],
    exit: &'static [Activity],
    checks: &'static [TerminateCheck],
) -> JobDefinition {
    JobDefinition {
        job_type,
        family,
        entry,
        exit,
        checks,
    }
}

const VM: Option<Family> = Some(Family::Vm);
const DEPLOYMENT: Option<Family> = Some(Family::Deployment);
const SM: Option<Family> = Some(Family::Sm);

/// The definition of `job_type`.
pub fn definition(job_type: JobType) -> JobDefinition {
    match job_type {
        JobType::CreateVm => def(job_type, VM, &[BeingCreated], &[BeingCreated], CORE),
        // Deletes keep beingDeleted until the confirmer hard-deletes.
        JobType::DeleteVm => def(job_type, VM, &[BeingDeleted], &[], &[]),
        JobType::UpdateVm => def(job_type, VM, &[Updating], &[Updating], LEAF),
        JobType::UpdateVmOwner => def(job_type, VM, &[Updating], &[Updating], CORE),
        JobType::AttachGpu => def(
            job_type,
            VM,
            &[AttachingGpu, Updating],
            &[AttachingGpu, Updating],
            LEAF,
        ),
        JobType::DetachGpu => def(
            job_type,
            VM,
            &[DetachingGpu, Updating],
            &[DetachingGpu, Updating],
            LEAF,
        ),
        JobType::RepairVm => def(job_type, VM, &[Repairing], &[Repairing], LEAF),
        JobType::CreateSystemSnapshot | JobType::DeleteSnapshot => def(
            job_type,
            VM,
            &[CreatingSnapshot],
            &[CreatingSnapshot],
            LEAF,
        ),
        JobType::CreateUserSnapshot => def(
            job_type,
            VM,
            &[CreatingSnapshot],
            &[CreatingSnapshot],
            USER_SNAPSHOT,
        ),
        JobType::ApplySnapshot => def(
            job_type,
            VM,
            &[ApplyingSnapshot],
            &[ApplyingSnapshot],
            LEAF,
        ),
        JobType::DoVmAction => def(job_type, VM, &[], &[], LEAF),
        JobType::CreateDeployment => {
            def(job_type, DEPLOYMENT, &[BeingCreated], &[BeingCreated], CORE)
        }
        JobType::DeleteDeployment => def(job_type, DEPLOYMENT, &[BeingDeleted], &[], &[]),
        JobType::UpdateDeployment => def(job_type, DEPLOYMENT, &[Updating], &[Updating], LEAF),
        JobType::UpdateDeploymentOwner => {
            def(job_type, DEPLOYMENT, &[Updating], &[Updating], CORE)
        }
        JobType::RepairDeployment => def(job_type, DEPLOYMENT, &[Repairing], &[Repairing], LEAF),
        JobType::BuildDeployments => def(job_type, None, &[], &[], &[]),
        JobType::CreateSm => def(job_type, SM, &[BeingCreated], &[BeingCreated], CORE),
        JobType::DeleteSm => def(job_type, SM, &[BeingDeleted], &[], &[]),
        JobType::RepairSm => def(job_type, SM, &[Repairing], &[Repairing], CORE),
    }
}
