// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker liveness, stored as short-lived cache entries.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::KeyValueCache;
use crate::error::CoreError;

const KEY_PREFIX: &str = "worker-status:";

/// How long a report stays visible without being refreshed.
pub const WORKER_STATUS_TTL: Duration = Duration::from_secs(10);

/// Last heartbeat of a background worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStatus {
    /// Worker name, e.g. `job-runner`.
    pub name: String,
    /// Time of the last report.
    pub reported_at: DateTime<Utc>,
}

/// Heartbeat records for background workers.
#[derive(Clone)]
pub struct WorkerStatusRepository {
    cache: KeyValueCache,
}

impl WorkerStatusRepository {
    /// Wrap a cache.
    pub fn new(cache: KeyValueCache) -> Self {
        Self { cache }
    }

    /// Record that `name` is alive.
    pub async fn report(&self, name: &str) -> Result<(), CoreError> {
        let status = WorkerStatus {
            name: name.to_string(),
            reported_at: Utc::now(),
        };
        self.cache
            .set_json(&format!("{}{}", KEY_PREFIX, name), &status, Some(WORKER_STATUS_TTL))
            .await
    }

    /// Every worker that reported within the TTL.
    pub async fn list(&self) -> Result<Vec<WorkerStatus>, CoreError> {
        let mut statuses = Vec::new();
        for (key, raw) in self.cache.list_prefix(KEY_PREFIX).await? {
            let status = serde_json::from_str(&raw)
                .map_err(|e| CoreError::serialization(format!("cache key '{}'", key), e))?;
            statuses.push(status);
        }
        Ok(statuses)
    }

    /// Whether `name` reported within the TTL.
    pub async fn is_alive(&self, name: &str) -> Result<bool, CoreError> {
        Ok(self
            .cache
            .get(&format!("{}{}", KEY_PREFIX, name))
            .await?
            .is_some())
    }
}
