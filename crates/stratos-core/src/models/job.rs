// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Durable job records.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Attempts after which a further failure terminates the job.
pub const MAX_ATTEMPTS: u32 = 5;

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting to be claimed.
    Pending,
    /// Claimed by the runner.
    Running,
    /// Finished successfully.
    Completed,
    /// Failed; re-claimed once `run_after` passes.
    Failed,
    /// Given up on.
    Terminated,
}

impl JobStatus {
    /// Stored name.
    pub const fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Terminated => "terminated",
        }
    }

    /// Completed and terminated never change again.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Terminated)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "terminated" => Ok(JobStatus::Terminated),
            other => Err(format!("unknown job status: {}", other)),
        }
    }
}

macro_rules! job_types {
    ($($(#[$doc:meta])* $variant:ident => $name:literal,)+) => {
        /// Closed vocabulary of job types.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum JobType {
            $(
                $(#[$doc])*
                #[serde(rename = $name)]
                $variant,
            )+
        }

        impl JobType {
            /// Every job type.
            pub const ALL: &'static [JobType] = &[$(JobType::$variant,)+];

            /// Stored name.
            pub const fn as_str(&self) -> &'static str {
                match self {
                    $(JobType::$variant => $name,)+
                }
            }
        }

        impl FromStr for JobType {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($name => Ok(JobType::$variant),)+
                    other => Err(format!("unknown job type: {}", other)),
                }
            }
        }
    };
}

job_types! {
    /// Create a VM and its hypervisor objects.
    CreateVm => "createVm",
    /// Tear down a VM.
    DeleteVm => "deleteVm",
    /// Change VM sizing or ports.
    UpdateVm => "updateVm",
    /// Move a VM to another owner.
    UpdateVmOwner => "updateVmOwner",
    /// Lease a GPU to a VM.
    AttachGpu => "attachGpu",
    /// Release a VM's GPU.
    DetachGpu => "detachGpu",
    /// Reconcile a VM.
    RepairVm => "repairVm",
    /// Take a retained system snapshot.
    CreateSystemSnapshot => "createSystemSnapshot",
    /// Take a user snapshot.
    CreateUserSnapshot => "createUserSnapshot",
    /// Remove a snapshot.
    DeleteSnapshot => "deleteSnapshot",
    /// Restore a snapshot.
    ApplySnapshot => "applySnapshot",
    /// Start, stop, or reboot a VM.
    DoVmAction => "doVmAction",
    /// Create a deployment.
    CreateDeployment => "createDeployment",
    /// Tear down a deployment.
    DeleteDeployment => "deleteDeployment",
    /// Change a deployment.
    UpdateDeployment => "updateDeployment",
    /// Move a deployment to another owner.
    UpdateDeploymentOwner => "updateDeploymentOwner",
    /// Reconcile a deployment.
    RepairDeployment => "repairDeployment",
    /// Point custom deployments at a freshly built image.
    BuildDeployments => "buildDeployments",
    /// Create a storage manager.
    CreateSm => "createSm",
    /// Tear down a storage manager.
    DeleteSm => "deleteSm",
    /// Reconcile a storage manager.
    RepairSm => "repairSm",
}

impl JobType {
    /// Job types that change resource ownership.
    pub const OWNER_UPDATES: &'static [JobType] =
        &[JobType::UpdateVmOwner, JobType::UpdateDeploymentOwner];
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted job.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    /// Job id.
    pub id: String,
    /// Submitting user.
    pub user_id: String,
    /// Raw type name; may be outside [`JobType`] if written by a newer process.
    pub job_type: String,
    /// Serialized typed arguments.
    pub args: serde_json::Value,
    /// Current status.
    pub status: JobStatus,
    /// Insert time.
    pub created_at: DateTime<Utc>,
    /// Earliest time the job may be claimed.
    pub run_after: DateTime<Utc>,
    /// Last claim time.
    pub last_run_at: Option<DateTime<Utc>>,
    /// Time of the last completed, failed, or terminated transition.
    pub finished_at: Option<DateTime<Utc>>,
    /// Failed attempts so far.
    pub attempts: u32,
    /// One entry per failed or terminated attempt.
    pub error_logs: Vec<String>,
}

impl Job {
    /// Typed job type, if known.
    pub fn kind(&self) -> Option<JobType> {
        self.job_type.parse().ok()
    }

    /// The `args.id` the job is addressed to, if any.
    pub fn arg_id(&self) -> Option<&str> {
        self.args.get("id").and_then(|v| v.as_str())
    }

    /// The most recent error entry.
    pub fn last_error(&self) -> Option<&str> {
        self.error_logs.last().map(String::as_str)
    }
}

/// Input for [`JobRepository::create`](crate::persistence::JobRepository::create).
#[derive(Debug, Clone)]
pub struct NewJob {
    /// Job id.
    pub id: String,
    /// Submitting user.
    pub user_id: String,
    /// Type name.
    pub job_type: String,
    /// Serialized arguments.
    pub args: serde_json::Value,
    /// Defaults to now.
    pub run_after: Option<DateTime<Utc>>,
}

impl NewJob {
    /// A job runnable immediately, with a fresh id.
    pub fn new(user_id: impl Into<String>, job_type: JobType, args: serde_json::Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            job_type: job_type.as_str().to_string(),
            args,
            run_after: None,
        }
    }

    /// Override the generated id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Delay the first run.
    pub fn run_after(mut self, at: DateTime<Utc>) -> Self {
        self.run_after = Some(at);
        self
    }
}
