// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Family orchestrators.
//!
//! Every operation follows the same shape: load the resource, render the
//! desired projections with a generator, and hand them to a
//! [`Reconciler`](crate::reconcile::Reconciler). Services return
//! [`crate::error::Error`]; the job layer decides whether that means retry.

pub mod deployment;
pub mod gpu;
pub mod sm;
pub mod vm;

pub use deployment::DeploymentService;
pub use gpu::GpuService;
pub use sm::SmService;
pub use vm::VmService;

use std::time::Duration;

use stratos_core::models::{Activity, JobType, ResourceKind};
use stratos_core::persistence::{JobQuery, JobRepository, KeyValueCache, ResourceRepository};
use tracing::debug;

use crate::config::ZoneConfig;
use crate::error::{Error, Result};
use crate::subsystems::HostCapacities;

/// Cache key of the capacities the host poller last saw for `host`.
pub fn host_capacities_key(host: &str) -> String {
    format!("host-capacities:{}", host)
}

/// Cache key of the telemetry the host poller last saw for `host`.
pub fn host_status_key(host: &str) -> String {
    format!("host-status:{}", host)
}

/// How a delete waits for other jobs on the same resource.
#[derive(Debug, Clone, Copy)]
pub struct RelatedJobWait {
    /// Give up after this long.
    pub window: Duration,
    /// Re-check this often.
    pub poll_interval: Duration,
}

/// Wait until no other job addressed to `resource_id` is runnable.
///
/// Jobs of `own_type` are ignored so duplicate deletes do not wait on each
/// other, and retries scheduled for later do not block. Running out of
/// `wait.window` is a transient error.
pub(crate) async fn wait_for_related_jobs(
    jobs: &JobRepository,
    resource_id: &str,
    own_type: JobType,
    wait: RelatedJobWait,
) -> Result<()> {
    let query = JobQuery::new()
        .for_resource(resource_id)
        .excluding_types(&[own_type])
        .non_terminal()
        .runnable_now();

    let waited = tokio::time::timeout(wait.window, async {
        loop {
            if !jobs.exists(&query).await? {
                return Ok::<(), Error>(());
            }
            debug!(resource_id = %resource_id, "Waiting for related jobs");
            tokio::time::sleep(wait.poll_interval).await;
        }
    })
    .await;

    match waited {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout(format!(
            "related jobs of {} still running after {}s",
            resource_id,
            wait.window.as_secs()
        ))),
    }
}

/// Flag a resource that a delete is about to tear down.
///
/// A create that was accepted before the delete never saw `beingDeleted`,
/// so it is set again here and `beingCreated` is dropped.
pub(crate) async fn mark_deleting<K: ResourceKind>(
    repo: &ResourceRepository<K>,
    id: &str,
) -> Result<()> {
    repo.add_activity(id, Activity::BeingDeleted).await?;
    repo.remove_activity(id, Activity::BeingCreated).await?;
    Ok(())
}

/// The zone host with the most free memory that fits `ram` GB, going by the
/// capacities the host poller cached. `None` when nothing is known or fits.
pub(crate) async fn pick_host(
    cache: &KeyValueCache,
    zone: &ZoneConfig,
    ram: u32,
) -> Result<Option<String>> {
    let mut best: Option<(u32, &str)> = None;
    for host in &zone.hosts {
        let Some(caps) = cache
            .get_json::<HostCapacities>(&host_capacities_key(&host.name))
            .await?
        else {
            continue;
        };
        let free = caps.ram_free();
        if free >= ram && best.is_none_or(|(most, _)| free > most) {
            best = Some((free, &host.name));
        }
    }
    Ok(best.map(|(_, name)| name.to_string()))
}
