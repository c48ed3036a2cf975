// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed stores.
//!
//! [`Database`] owns the connection pool and hands out cheap, cloneable
//! repositories. Every repository method is a single statement (or a
//! read followed by a conditional write for the GPU lease), so concurrent
//! tasks never need an application-level lock.

pub mod gpus;
pub mod jobs;
pub mod key_value;
pub mod resources;
pub mod workers;

pub use gpus::GpuRepository;
pub use jobs::{ClaimOrder, JobQuery, JobRepository};
pub use key_value::KeyValueCache;
pub use resources::{Pagination, ResourceFilter, ResourceRepository, ResourceUpdate};
pub use workers::{WorkerStatus, WorkerStatusRepository};

use std::path::Path;
use std::str::FromStr;

use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};

use crate::config::DatabaseConfig;
use crate::error::CoreError;
use crate::models::ResourceKind;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

/// Handle to the control plane database.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Wrap an existing pool. Migrations are not run.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create and initialize a database from a file path.
    ///
    /// This convenience constructor handles all setup:
    /// - Creates parent directories if they don't exist
    /// - Creates the database file if it doesn't exist
    /// - Enables WAL journaling and a busy timeout
    /// - Runs all migrations
    pub async fn from_path(
        path: impl AsRef<Path>,
        config: &DatabaseConfig,
    ) -> Result<Self, CoreError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| CoreError::DatabaseError {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        Self::connect(&url, config).await
    }

    /// Connect to a `sqlite:` URL and run migrations.
    pub async fn connect(url: &str, config: &DatabaseConfig) -> Result<Self, CoreError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| CoreError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("Invalid database URL {}: {}", url, e),
            })?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(config.busy_timeout);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at {}: {}", url, e),
            })?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    /// A private in-memory database on a single pinned connection.
    pub async fn in_memory() -> Result<Self, CoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("Failed to open in-memory database: {}", e),
            })?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<(), CoreError> {
        MIGRATOR
            .run(&self.pool)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "migrate".to_string(),
                details: format!("Failed to run migrations: {}", e),
            })
    }

    /// The underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Repository for one resource family.
    pub fn resources<K: ResourceKind>(&self) -> ResourceRepository<K> {
        ResourceRepository::new(self.pool.clone())
    }

    /// The job store.
    pub fn jobs(&self) -> JobRepository {
        JobRepository::new(self.pool.clone())
    }

    /// GPUs and their leases.
    pub fn gpus(&self) -> GpuRepository {
        GpuRepository::new(self.pool.clone())
    }

    /// The key/value cache.
    pub fn cache(&self) -> KeyValueCache {
        KeyValueCache::new(self.pool.clone())
    }

    /// Worker liveness records.
    pub fn worker_status(&self) -> WorkerStatusRepository {
        WorkerStatusRepository::new(self.cache())
    }

    /// Close every pooled connection. Idempotent.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Build a quoted JSON path (`$."a"."b"`) from raw keys.
pub(crate) fn json_path(segments: &[&str]) -> String {
    let mut path = String::from("$");
    for segment in segments {
        path.push_str(".\"");
        path.push_str(&segment.replace('"', "\\\""));
        path.push('"');
    }
    path
}
