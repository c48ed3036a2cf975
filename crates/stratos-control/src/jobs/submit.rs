// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Enqueueing jobs.

use stratos_core::models::{Activity, Job, JobType, NewJob};
use tracing::{debug, info};

use super::args::JobArgs;
use super::definitions::{Family, definition};
use crate::context::ControlContext;
use crate::error::Result;

/// Writes typed jobs to the durable queue.
#[derive(Clone)]
pub struct JobSubmitter {
    ctx: ControlContext,
}

impl JobSubmitter {
    /// Create a submitter.
    pub fn new(ctx: ControlContext) -> Self {
        Self { ctx }
    }

    /// Enqueue `args` on behalf of `user_id` under a fresh job id.
    pub async fn submit(&self, user_id: &str, args: JobArgs) -> Result<Job> {
        self.enqueue(NewJob::new(user_id, args.job_type(), args.to_value()?), &args)
            .await
    }

    /// Enqueue `args` under a caller-chosen job id.
    pub async fn submit_with_id(&self, job_id: &str, user_id: &str, args: JobArgs) -> Result<Job> {
        self.enqueue(
            NewJob::new(user_id, args.job_type(), args.to_value()?).with_id(job_id),
            &args,
        )
        .await
    }

    async fn enqueue(&self, new_job: NewJob, args: &JobArgs) -> Result<Job> {
        let job_type = args.job_type();

        // Deletes mark the resource as soon as they are accepted so that jobs
        // already queued against it terminate instead of racing the teardown.
        if is_delete(job_type)
            && let (Some(family), Some(id)) = (definition(job_type).family, args.resource_id())
        {
            let marked = match family {
                Family::Vm => self.ctx.vms().add_activity(id, Activity::BeingDeleted).await?,
                Family::Deployment => {
                    self.ctx
                        .deployments()
                        .add_activity(id, Activity::BeingDeleted)
                        .await?
                }
                Family::Sm => self.ctx.sms().add_activity(id, Activity::BeingDeleted).await?,
            };
            if !marked {
                debug!(resource_id = %id, job_type = %job_type, "Delete target not live");
            }
        }

        let job = self.ctx.jobs().create(&new_job).await?;
        info!(job_id = %job.id, job_type = %job.job_type, user_id = %job.user_id, "Job submitted");
        Ok(job)
    }
}

fn is_delete(job_type: JobType) -> bool {
    matches!(
        job_type,
        JobType::DeleteVm | JobType::DeleteDeployment | JobType::DeleteSm
    )
}
