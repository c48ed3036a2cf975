// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared handles threaded through services, handlers, and workers.

use std::sync::Arc;

use stratos_core::Database;
use stratos_core::models::{DeploymentKind, SmKind, VmKind};
use stratos_core::persistence::{
    GpuRepository, JobRepository, KeyValueCache, ResourceRepository, WorkerStatusRepository,
};

use crate::config::{Config, ZoneConfig};
use crate::error::{Error, Result};
use crate::subsystems::Subsystems;

/// Database, subsystem handles, and configuration. Cheap to clone.
#[derive(Clone)]
pub struct ControlContext {
    db: Database,
    subsystems: Subsystems,
    config: Arc<Config>,
}

impl ControlContext {
    /// Bundle the process-wide handles.
    pub fn new(db: Database, subsystems: Subsystems, config: Config) -> Self {
        Self {
            db,
            subsystems,
            config: Arc::new(config),
        }
    }

    /// The database handle.
    pub fn db(&self) -> &Database {
        &self.db
    }

    /// Subsystem handles.
    pub fn subsystems(&self) -> &Subsystems {
        &self.subsystems
    }

    /// Process configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// VM repository.
    pub fn vms(&self) -> ResourceRepository<VmKind> {
        self.db.resources()
    }

    /// Deployment repository.
    pub fn deployments(&self) -> ResourceRepository<DeploymentKind> {
        self.db.resources()
    }

    /// Storage manager repository.
    pub fn sms(&self) -> ResourceRepository<SmKind> {
        self.db.resources()
    }

    /// Job store.
    pub fn jobs(&self) -> JobRepository {
        self.db.jobs()
    }

    /// GPU store.
    pub fn gpus(&self) -> GpuRepository {
        self.db.gpus()
    }

    /// Key/value cache.
    pub fn cache(&self) -> KeyValueCache {
        self.db.cache()
    }

    /// Worker liveness records.
    pub fn worker_status(&self) -> WorkerStatusRepository {
        self.db.worker_status()
    }

    /// Zone settings by name. Unknown zones are an input error.
    pub fn zone(&self, name: &str) -> Result<&ZoneConfig> {
        self.config
            .zone(name)
            .ok_or_else(|| Error::InvalidRequest(format!("unknown zone: {}", name)))
    }

    /// Zone used when a request names none.
    pub fn default_zone(&self) -> Result<&ZoneConfig> {
        self.config
            .default_zone()
            .ok_or_else(|| Error::InvalidRequest("no zones configured".to_string()))
    }
}
