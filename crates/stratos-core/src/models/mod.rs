// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Typed documents persisted by the stores.

pub mod activity;
pub mod deployment;
pub mod gpu;
pub mod job;
pub mod resource;
pub mod sm;
pub mod subsystems;
pub mod vm;

pub use activity::{Activity, ActivityRecord};
pub use deployment::{Deployment, DeploymentKind};
pub use gpu::{Gpu, GpuData, GpuLease};
pub use job::{Job, JobStatus, JobType, NewJob};
pub use resource::{Resource, ResourceKind};
pub use sm::{SmKind, StorageManager};
pub use vm::{Vm, VmKind};
