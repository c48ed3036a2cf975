// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Durable job queue.
//!
//! Claims are atomic: one `UPDATE ... WHERE id = (SELECT ...) RETURNING`
//! statement selects the next eligible job, flips it to `running`, and
//! returns it, so concurrent fetchers never receive the same job.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use tracing::info;

use crate::error::{CoreError, is_unique_violation};
use crate::models::{Job, JobStatus, JobType, NewJob};

const COLUMNS: &str = "id, user_id, type, args, status, created_at, run_after, last_run_at, finished_at, attempts, error_logs";

/// Which end of the queue a claim takes from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ClaimOrder {
    /// Most recently created job first. Fresh user actions preempt catch-up work.
    #[default]
    NewestFirst,
    /// Oldest job first.
    OldestFirst,
}

impl ClaimOrder {
    fn sql(&self) -> &'static str {
        match self {
            ClaimOrder::NewestFirst => "DESC",
            ClaimOrder::OldestFirst => "ASC",
        }
    }
}

impl std::str::FromStr for ClaimOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "newest" | "newest-first" => Ok(ClaimOrder::NewestFirst),
            "oldest" | "oldest-first" => Ok(ClaimOrder::OldestFirst),
            other => Err(format!("unknown claim order: {}", other)),
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    id: String,
    user_id: String,
    #[sqlx(rename = "type")]
    job_type: String,
    args: String,
    status: String,
    created_at: DateTime<Utc>,
    run_after: DateTime<Utc>,
    last_run_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    attempts: i64,
    error_logs: String,
}

impl TryFrom<JobRow> for Job {
    type Error = CoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse::<JobStatus>()
            .map_err(|details| CoreError::Serialization {
                context: format!("job '{}' status", row.id),
                details,
            })?;
        let args = serde_json::from_str(&row.args)
            .map_err(|e| CoreError::serialization(format!("job '{}' args", row.id), e))?;
        let error_logs = serde_json::from_str(&row.error_logs)
            .map_err(|e| CoreError::serialization(format!("job '{}' error logs", row.id), e))?;

        Ok(Job {
            id: row.id,
            user_id: row.user_id,
            job_type: row.job_type,
            args,
            status,
            created_at: row.created_at,
            run_after: row.run_after,
            last_run_at: row.last_run_at,
            finished_at: row.finished_at,
            attempts: u32::try_from(row.attempts).unwrap_or(0),
            error_logs,
        })
    }
}

/// Filter for job lookups, used by terminate predicates and delete waits.
#[derive(Debug, Clone, Default)]
pub struct JobQuery {
    /// Only these types.
    pub types: Vec<JobType>,
    /// Never these types.
    pub exclude_types: Vec<JobType>,
    /// Only jobs whose `args.id` equals this.
    pub arg_id: Option<String>,
    /// Only jobs of this user.
    pub user_id: Option<String>,
    /// Only these statuses.
    pub statuses: Vec<JobStatus>,
    /// Never these job ids.
    pub exclude_ids: Vec<String>,
    /// Skip jobs whose `run_after` lies in the future.
    pub exclude_scheduled: bool,
}

impl JobQuery {
    /// An empty query.
    pub fn new() -> Self {
        Self::default()
    }

    /// Only these types.
    pub fn of_types(mut self, types: &[JobType]) -> Self {
        self.types.extend_from_slice(types);
        self
    }

    /// Never these types.
    pub fn excluding_types(mut self, types: &[JobType]) -> Self {
        self.exclude_types.extend_from_slice(types);
        self
    }

    /// Only jobs addressed to resource `id`.
    pub fn for_resource(mut self, id: impl Into<String>) -> Self {
        self.arg_id = Some(id.into());
        self
    }

    /// Only jobs of `user_id`.
    pub fn for_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Skip job `id`.
    pub fn excluding_id(mut self, id: impl Into<String>) -> Self {
        self.exclude_ids.push(id.into());
        self
    }

    /// Only pending, running, or failed jobs.
    pub fn non_terminal(mut self) -> Self {
        self.statuses = vec![JobStatus::Pending, JobStatus::Running, JobStatus::Failed];
        self
    }

    /// Only these statuses.
    pub fn with_statuses(mut self, statuses: &[JobStatus]) -> Self {
        self.statuses = statuses.to_vec();
        self
    }

    /// Skip jobs scheduled for later.
    pub fn runnable_now(mut self) -> Self {
        self.exclude_scheduled = true;
        self
    }

    fn push_conditions(&self, qb: &mut QueryBuilder<'_, Sqlite>) {
        qb.push(" WHERE 1 = 1");
        if !self.types.is_empty() {
            qb.push(" AND type IN (");
            let mut separated = qb.separated(", ");
            for t in &self.types {
                separated.push_bind(t.as_str());
            }
            separated.push_unseparated(")");
        }
        if !self.exclude_types.is_empty() {
            qb.push(" AND type NOT IN (");
            let mut separated = qb.separated(", ");
            for t in &self.exclude_types {
                separated.push_bind(t.as_str());
            }
            separated.push_unseparated(")");
        }
        if let Some(arg_id) = &self.arg_id {
            qb.push(" AND json_extract(args, '$.id') = ")
                .push_bind(arg_id.clone());
        }
        if let Some(user_id) = &self.user_id {
            qb.push(" AND user_id = ").push_bind(user_id.clone());
        }
        if !self.statuses.is_empty() {
            qb.push(" AND status IN (");
            let mut separated = qb.separated(", ");
            for s in &self.statuses {
                separated.push_bind(s.as_str());
            }
            separated.push_unseparated(")");
        }
        if !self.exclude_ids.is_empty() {
            qb.push(" AND id NOT IN (");
            let mut separated = qb.separated(", ");
            for id in &self.exclude_ids {
                separated.push_bind(id.clone());
            }
            separated.push_unseparated(")");
        }
        if self.exclude_scheduled {
            qb.push(" AND run_after <= ").push_bind(Utc::now());
        }
    }
}

/// The job store.
#[derive(Clone)]
pub struct JobRepository {
    pool: SqlitePool,
}

impl JobRepository {
    /// Create a repository over `pool`.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a pending job. Fails with `DuplicateId` if the id exists.
    pub async fn create(&self, job: &NewJob) -> Result<Job, CoreError> {
        let now = Utc::now();
        let run_after = job.run_after.unwrap_or(now);
        let sql = format!(
            r#"
            INSERT INTO jobs (id, user_id, type, args, status, created_at, run_after, attempts, error_logs)
            VALUES (?, ?, ?, ?, 'pending', ?, ?, 0, '[]')
            RETURNING {}
            "#,
            COLUMNS
        );
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(&job.id)
            .bind(&job.user_id)
            .bind(&job.job_type)
            .bind(serde_json::to_string(&job.args)?)
            .bind(now)
            .bind(run_after)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    CoreError::DuplicateId {
                        kind: "job",
                        id: job.id.clone(),
                    }
                } else {
                    e.into()
                }
            })?;
        row.try_into()
    }

    /// Fetch one job.
    pub async fn get(&self, id: &str) -> Result<Option<Job>, CoreError> {
        let sql = format!("SELECT {} FROM jobs WHERE id = ?", COLUMNS);
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Job::try_from).transpose()
    }

    async fn claim(&self, status: JobStatus, order: ClaimOrder) -> Result<Option<Job>, CoreError> {
        let now = Utc::now();
        let sql = format!(
            r#"
            UPDATE jobs SET status = 'running', last_run_at = ?
            WHERE status = ? AND id = (
                SELECT id FROM jobs
                WHERE status = ? AND run_after <= ?
                ORDER BY created_at {order}, rowid {order}
                LIMIT 1
            )
            RETURNING {columns}
            "#,
            order = order.sql(),
            columns = COLUMNS
        );
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(now)
            .bind(status.as_str())
            .bind(status.as_str())
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Job::try_from).transpose()
    }

    /// Atomically claim the next pending job whose `run_after` has passed.
    pub async fn claim_next(&self, order: ClaimOrder) -> Result<Option<Job>, CoreError> {
        self.claim(JobStatus::Pending, order).await
    }

    /// Atomically claim the next failed job whose retry time has passed.
    pub async fn claim_next_failed(&self, order: ClaimOrder) -> Result<Option<Job>, CoreError> {
        self.claim(JobStatus::Failed, order).await
    }

    /// Transition to `completed`.
    pub async fn mark_completed(&self, id: &str) -> Result<(), CoreError> {
        sqlx::query("UPDATE jobs SET status = 'completed', finished_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Transition to `failed` with a new retry time and attempt count.
    ///
    /// `failed` is not terminal, so `finished_at` stays unset.
    pub async fn mark_failed(
        &self,
        id: &str,
        run_after: DateTime<Utc>,
        attempts: u32,
        reason: &str,
    ) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'failed', run_after = ?, attempts = ?,
                error_logs = json_insert(error_logs, '$[#]', ?)
            WHERE id = ?
            "#,
        )
        .bind(run_after)
        .bind(i64::from(attempts))
        .bind(reason)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Transition to `terminated`, recording why.
    pub async fn mark_terminated(&self, id: &str, reason: &str) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'terminated', finished_at = ?,
                error_logs = json_insert(error_logs, '$[#]', ?)
            WHERE id = ?
            "#,
        )
        .bind(Utc::now())
        .bind(reason)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Requeue every `running` job. Called once at process start.
    pub async fn reset_running(&self) -> Result<u64, CoreError> {
        sqlx::query("UPDATE jobs SET error_logs = '[]' WHERE json_valid(error_logs) = 0")
            .execute(&self.pool)
            .await?;

        let result = sqlx::query("UPDATE jobs SET status = 'pending' WHERE status = 'running'")
            .execute(&self.pool)
            .await?;

        let reset = result.rows_affected();
        if reset > 0 {
            info!(count = reset, "Requeued jobs left running by a previous process");
        }
        Ok(reset)
    }

    /// List jobs matching `query`, oldest first.
    pub async fn list(&self, query: &JobQuery) -> Result<Vec<Job>, CoreError> {
        let mut qb = QueryBuilder::new(format!("SELECT {} FROM jobs", COLUMNS));
        query.push_conditions(&mut qb);
        qb.push(" ORDER BY created_at ASC, rowid ASC");
        let rows = qb.build_query_as::<JobRow>().fetch_all(&self.pool).await?;
        rows.into_iter().map(Job::try_from).collect()
    }

    /// Whether any job matches `query`.
    pub async fn exists(&self, query: &JobQuery) -> Result<bool, CoreError> {
        let mut qb = QueryBuilder::new("SELECT EXISTS (SELECT 1 FROM jobs");
        query.push_conditions(&mut qb);
        qb.push(")");
        let exists = qb
            .build_query_scalar::<bool>()
            .fetch_one(&self.pool)
            .await?;
        Ok(exists)
    }

    /// Number of jobs in each status.
    pub async fn count_by_status(&self) -> Result<HashMap<JobStatus, u64>, CoreError> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM jobs GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut counts = HashMap::new();
        for (status, count) in rows {
            if let Ok(status) = status.parse::<JobStatus>() {
                counts.insert(status, count.max(0) as u64);
            }
        }
        Ok(counts)
    }
}
