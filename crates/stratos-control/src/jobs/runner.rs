// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The job runner: claims jobs and drives them through their lifecycle.
//!
//! For each claimed job the runner:
//! 1. Decodes the typed arguments (malformed ones terminate the job)
//! 2. Evaluates the terminate predicate, skipping the handler if it holds
//! 3. Adds the entry activities to the target resource
//! 4. Runs the handler
//! 5. Removes the exit activities, whatever the handler returned
//! 6. Records `completed`, `failed` (with backoff), or `terminated`
//!
//! There is no liveness lease on `running` jobs. Jobs left running by a
//! crashed process are requeued by [`JobRepository::reset_running`] when the
//! next runner starts.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use stratos_core::CoreError;
use stratos_core::models::job::MAX_ATTEMPTS;
use stratos_core::models::{Activity, Job, JobType, ResourceKind};
use stratos_core::persistence::{ClaimOrder, JobQuery, JobRepository, ResourceRepository};
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::args::JobArgs;
use super::definitions::{Family, JobDefinition, TerminateCheck, definition};
use super::handlers::{DeleteWaits, JobError, JobHandlers};
use crate::context::ControlContext;
use crate::error::{Error, Result};
use crate::services::RelatedJobWait;

/// Name the runner reports liveness under.
pub const WORKER_NAME: &str = "job-runner";

/// Reason stored on jobs skipped by their terminate predicate.
pub const GRACEFUL_TERMINATION: &str = "gracefully terminated by system";

/// Configuration for the job runner.
#[derive(Debug, Clone)]
pub struct JobRunnerConfig {
    /// How often to claim pending jobs.
    pub fetch_interval: Duration,
    /// How often to claim failed jobs whose retry time has passed.
    pub failed_fetch_interval: Duration,
    /// How often to report liveness.
    pub status_interval: Duration,
    /// Which end of the queue to claim from.
    pub claim_order: ClaimOrder,
    /// Delay before the first retry; doubles with every further attempt.
    pub backoff_base: Duration,
    /// How long `deleteVm` waits for other jobs on the VM.
    pub vm_delete_wait: Duration,
    /// How long `deleteDeployment` and `deleteSm` wait for other jobs.
    pub deployment_delete_wait: Duration,
    /// Poll period while waiting for related jobs.
    pub related_job_poll: Duration,
    /// How long shutdown waits for in-flight jobs before abandoning them.
    pub shutdown_grace: Duration,
}

impl Default for JobRunnerConfig {
    fn default() -> Self {
        Self {
            fetch_interval: Duration::from_millis(100),
            failed_fetch_interval: Duration::from_secs(30),
            status_interval: Duration::from_secs(1),
            claim_order: ClaimOrder::NewestFirst,
            backoff_base: Duration::from_secs(30),
            vm_delete_wait: Duration::from_secs(300), // 5 minutes
            deployment_delete_wait: Duration::from_secs(30),
            related_job_poll: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

impl JobRunnerConfig {
    fn delete_waits(&self) -> DeleteWaits {
        let wait = |window| RelatedJobWait {
            window,
            poll_interval: self.related_job_poll,
        };
        DeleteWaits {
            vm: wait(self.vm_delete_wait),
            deployment: wait(self.deployment_delete_wait),
            sm: wait(self.deployment_delete_wait),
        }
    }
}

/// Delay before retry number `attempts` (1-based): `base * 2^(attempts - 1)`.
pub fn backoff_delay(base: Duration, attempts: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempts.saturating_sub(1));
    base.saturating_mul(factor)
}

fn retry_at(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// What happened to one job execution.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    /// The handler succeeded.
    Completed,
    /// The handler failed transiently; the job will be retried.
    Failed {
        /// Failed attempts including this one.
        attempts: u32,
        /// When the retry becomes claimable.
        run_after: DateTime<Utc>,
        /// Handler error.
        reason: String,
    },
    /// The job will never run again.
    Terminated(String),
}

/// Claims jobs and runs them concurrently.
#[derive(Clone)]
pub struct JobRunner {
    ctx: ControlContext,
    config: Arc<JobRunnerConfig>,
    handlers: Arc<JobHandlers>,
    shutdown: Arc<Notify>,
}

impl JobRunner {
    /// Create a runner over `ctx`.
    pub fn new(ctx: ControlContext, config: JobRunnerConfig) -> Self {
        let handlers = JobHandlers::new(ctx.clone(), config.delete_waits());
        Self {
            ctx,
            config: Arc::new(config),
            handlers: Arc::new(handlers),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    fn jobs(&self) -> JobRepository {
        self.ctx.jobs()
    }

    /// Run the fetch loops until shutdown is signalled.
    pub async fn run(&self) {
        info!(
            fetch_interval_ms = self.config.fetch_interval.as_millis() as u64,
            failed_fetch_interval_secs = self.config.failed_fetch_interval.as_secs(),
            claim_order = ?self.config.claim_order,
            "Job runner started"
        );

        if let Err(e) = self.jobs().reset_running().await {
            error!(error = %e, "Failed to requeue jobs left running");
        }

        let mut fetch = tokio::time::interval(self.config.fetch_interval);
        fetch.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut failed_fetch = tokio::time::interval(self.config.failed_fetch_interval);
        failed_fetch.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut status = tokio::time::interval(self.config.status_interval);
        status.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut in_flight: JoinSet<()> = JoinSet::new();

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Job runner received shutdown signal");
                    break;
                }

                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Job task aborted");
                    }
                }

                _ = status.tick() => {
                    if let Err(e) = self.ctx.worker_status().report(WORKER_NAME).await {
                        warn!(error = %e, "Failed to report job runner status");
                    }
                }

                _ = fetch.tick() => {
                    self.claim_into(&mut in_flight, false).await;
                }

                _ = failed_fetch.tick() => {
                    self.claim_into(&mut in_flight, true).await;
                }
            }
        }

        if !in_flight.is_empty() {
            info!(in_flight = in_flight.len(), "Waiting for in-flight jobs");
            let drain = async { while in_flight.join_next().await.is_some() {} };
            if tokio::time::timeout(self.config.shutdown_grace, drain)
                .await
                .is_err()
            {
                // Abandoned jobs stay running and are requeued on next start.
                warn!(remaining = in_flight.len(), "Abandoning in-flight jobs");
                in_flight.abort_all();
            }
        }

        info!("Job runner stopped");
    }

    async fn claim_into(&self, in_flight: &mut JoinSet<()>, failed: bool) {
        let jobs = self.jobs();
        loop {
            let claimed = if failed {
                jobs.claim_next_failed(self.config.claim_order).await
            } else {
                jobs.claim_next(self.config.claim_order).await
            };
            match claimed {
                Ok(Some(job)) => {
                    debug!(job_id = %job.id, job_type = %job.job_type, retry = failed, "Claimed job");
                    let runner = self.clone();
                    in_flight.spawn(async move {
                        runner.execute(job).await;
                    });
                }
                Ok(None) => break,
                Err(e) => {
                    error!(error = %e, retry = failed, "Failed to claim job");
                    break;
                }
            }
        }
    }

    /// Claim every job runnable right now, pending and due retries alike, run
    /// them concurrently, and return their outcomes once all have finished.
    pub async fn run_pending(&self) -> Result<Vec<(Job, JobOutcome)>> {
        let jobs = self.jobs();
        let mut claimed = Vec::new();
        while let Some(job) = jobs.claim_next(self.config.claim_order).await? {
            claimed.push(job);
        }
        while let Some(job) = jobs.claim_next_failed(self.config.claim_order).await? {
            claimed.push(job);
        }

        let mut set = JoinSet::new();
        for job in claimed {
            let runner = self.clone();
            set.spawn(async move {
                let outcome = runner.execute(job.clone()).await;
                (job, outcome)
            });
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = set.join_next().await {
            let done = joined.map_err(|e| Error::Other(format!("job task failed: {}", e)))?;
            outcomes.push(done);
        }
        Ok(outcomes)
    }

    /// Run one claimed job to its next status and record it.
    pub async fn execute(&self, job: Job) -> JobOutcome {
        let outcome = self.process(&job).await;
        if let Err(e) = self.record(&job, &outcome).await {
            // The job stays running until the next process start requeues it.
            error!(job_id = %job.id, error = %e, "Failed to record job outcome");
        }
        outcome
    }

    async fn process(&self, job: &Job) -> JobOutcome {
        let Some(job_type) = job.kind() else {
            return JobOutcome::Terminated(format!("unknown job type: {}", job.job_type));
        };
        let args = match JobArgs::decode(job_type, &job.args) {
            Ok(args) => args,
            Err(e) => return JobOutcome::Terminated(format!("invalid arguments: {}", e)),
        };
        let def = definition(job_type);
        let target = args.resource_id().map(str::to_string);

        match self.should_terminate(job, &def, target.as_deref()).await {
            Ok(true) => return JobOutcome::Terminated(GRACEFUL_TERMINATION.to_string()),
            Ok(false) => {}
            Err(e) => return self.classify(job, e.into()),
        }

        let result = match self.enter(&def, target.as_deref()).await {
            Ok(()) => self.invoke(args).await,
            Err(e) => Err(e.into()),
        };

        if let Err(e) = self.exit(&def, target.as_deref()).await {
            warn!(job_id = %job.id, error = %e, "Exit hook failed");
        }

        match result {
            Ok(()) => JobOutcome::Completed,
            Err(e) => self.classify(job, e),
        }
    }

    async fn invoke(&self, args: JobArgs) -> std::result::Result<(), JobError> {
        match AssertUnwindSafe(self.handlers.handle(args))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(_) => Err(JobError::Terminated("handler panicked".to_string())),
        }
    }

    fn classify(&self, job: &Job, err: JobError) -> JobOutcome {
        match err {
            JobError::Terminated(reason) => JobOutcome::Terminated(reason),
            JobError::Failed(reason) => {
                let attempts = job.attempts + 1;
                if attempts >= MAX_ATTEMPTS {
                    JobOutcome::Terminated(reason)
                } else {
                    let delay = backoff_delay(self.config.backoff_base, attempts);
                    JobOutcome::Failed {
                        attempts,
                        run_after: retry_at(Utc::now(), delay),
                        reason,
                    }
                }
            }
        }
    }

    async fn record(&self, job: &Job, outcome: &JobOutcome) -> Result<()> {
        let jobs = self.jobs();
        match outcome {
            JobOutcome::Completed => {
                jobs.mark_completed(&job.id).await?;
                info!(job_id = %job.id, job_type = %job.job_type, "Job completed");
            }
            JobOutcome::Failed {
                attempts,
                run_after,
                reason,
            } => {
                jobs.mark_failed(&job.id, *run_after, *attempts, reason)
                    .await?;
                warn!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    attempts = attempts,
                    run_after = %run_after,
                    reason = %reason,
                    "Job failed, retry scheduled"
                );
            }
            JobOutcome::Terminated(reason) => {
                jobs.mark_terminated(&job.id, reason).await?;
                warn!(job_id = %job.id, job_type = %job.job_type, reason = %reason, "Job terminated");
            }
        }
        Ok(())
    }

    async fn should_terminate(
        &self,
        job: &Job,
        def: &JobDefinition,
        target: Option<&str>,
    ) -> Result<bool> {
        let jobs = self.jobs();
        for check in def.checks {
            let hit = match check {
                TerminateCheck::TargetResourceDeleted => match (def.family, target) {
                    (Some(family), Some(id)) => self.target_removed(family, id).await?,
                    _ => false,
                },
                TerminateCheck::OwnerUpdateInFlight => match target {
                    Some(id) => {
                        let query = JobQuery::new()
                            .of_types(JobType::OWNER_UPDATES)
                            .for_resource(id)
                            .non_terminal()
                            .excluding_id(&job.id);
                        jobs.exists(&query).await?
                    }
                    None => false,
                },
                TerminateCheck::UserHasSnapshotJob => {
                    let query = JobQuery::new()
                        .of_types(&[JobType::CreateUserSnapshot])
                        .for_user(&job.user_id)
                        .non_terminal()
                        .excluding_id(&job.id);
                    jobs.exists(&query).await?
                }
            };
            if hit {
                info!(job_id = %job.id, job_type = %job.job_type, check = ?check, "Terminate predicate matched");
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn target_removed(&self, family: Family, id: &str) -> Result<bool> {
        async fn removed<K: ResourceKind>(
            repo: ResourceRepository<K>,
            id: &str,
        ) -> std::result::Result<bool, CoreError> {
            Ok(repo
                .including_deleted()
                .get(id)
                .await?
                .is_some_and(|r| r.is_being_removed()))
        }

        let removed = match family {
            Family::Vm => removed(self.ctx.vms(), id).await?,
            Family::Deployment => removed(self.ctx.deployments(), id).await?,
            Family::Sm => removed(self.ctx.sms(), id).await?,
        };
        Ok(removed)
    }

    async fn enter(&self, def: &JobDefinition, target: Option<&str>) -> Result<()> {
        self.change_activities(def.family, target, def.entry, true)
            .await
    }

    async fn exit(&self, def: &JobDefinition, target: Option<&str>) -> Result<()> {
        self.change_activities(def.family, target, def.exit, false)
            .await
    }

    async fn change_activities(
        &self,
        family: Option<Family>,
        target: Option<&str>,
        activities: &[Activity],
        add: bool,
    ) -> Result<()> {
        async fn apply<K: ResourceKind>(
            repo: ResourceRepository<K>,
            id: &str,
            activities: &[Activity],
            add: bool,
        ) -> std::result::Result<(), CoreError> {
            for activity in activities {
                if add {
                    // A resource that does not exist yet (create jobs) is fine.
                    repo.add_activity(id, *activity).await?;
                } else {
                    repo.remove_activity(id, *activity).await?;
                }
            }
            Ok(())
        }

        let (Some(family), Some(id)) = (family, target) else {
            return Ok(());
        };
        if activities.is_empty() {
            return Ok(());
        }
        match family {
            Family::Vm => apply(self.ctx.vms(), id, activities, add).await?,
            Family::Deployment => apply(self.ctx.deployments(), id, activities, add).await?,
            Family::Sm => apply(self.ctx.sms(), id, activities, add).await?,
        }
        Ok(())
    }
}
