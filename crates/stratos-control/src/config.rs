// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for stratos-control.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use stratos_core::persistence::ClaimOrder;

/// Control plane configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite database file.
    pub database_path: PathBuf,
    /// Value of the `managedBy` tag on every object this instance creates.
    pub deployer_id: String,
    /// Image registry host, e.g. `registry.example.com`.
    pub registry_url: String,
    /// Keys added to every VM next to the owner's key.
    pub admin_ssh_keys: Vec<String>,
    /// Upper bound on a single subsystem call.
    pub subsystem_timeout: Duration,
    /// Confirmer tick period.
    pub confirmer_interval: Duration,
    /// How often the host poller queries compute hosts.
    pub host_poll_interval: Duration,
    /// Resources not repaired for this long get a repair job.
    pub repair_interval: Duration,
    /// Queue claim policy.
    pub claim_order: ClaimOrder,
    /// System snapshots kept per VM.
    pub system_snapshot_retention: usize,
    /// User snapshots allowed per VM.
    pub user_snapshot_limit: usize,
    /// Zone catalog.
    pub zones: Vec<ZoneConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from(".data/stratos.db"),
            deployer_id: "stratos".to_string(),
            registry_url: "registry.local".to_string(),
            admin_ssh_keys: Vec::new(),
            subsystem_timeout: Duration::from_secs(30),
            confirmer_interval: Duration::from_secs(5),
            host_poll_interval: Duration::from_secs(30),
            repair_interval: Duration::from_secs(6 * 3600), // 6 hours
            claim_order: ClaimOrder::NewestFirst,
            system_snapshot_retention: 3,
            user_snapshot_limit: 1,
            zones: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let database_path = std::env::var("STRATOS_DATABASE_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.database_path);

        let deployer_id = std::env::var("STRATOS_DEPLOYER_ID")
            .map_err(|_| ConfigError::MissingEnvVar("STRATOS_DEPLOYER_ID"))?;

        let registry_url =
            std::env::var("STRATOS_REGISTRY_URL").unwrap_or(defaults.registry_url);

        let admin_ssh_keys = std::env::var("STRATOS_ADMIN_SSH_KEYS")
            .map(|v| {
                v.split(';')
                    .map(str::trim)
                    .filter(|k| !k.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        let subsystem_timeout =
            secs_var("STRATOS_SUBSYSTEM_TIMEOUT_SECS", defaults.subsystem_timeout)?;
        let confirmer_interval =
            secs_var("STRATOS_CONFIRMER_INTERVAL_SECS", defaults.confirmer_interval)?;
        let host_poll_interval =
            secs_var("STRATOS_HOST_POLL_INTERVAL_SECS", defaults.host_poll_interval)?;
        let repair_interval = secs_var("STRATOS_REPAIR_INTERVAL_SECS", defaults.repair_interval)?;

        let claim_order = match std::env::var("STRATOS_CLAIM_ORDER") {
            Ok(v) => v.parse().map_err(|reason| ConfigError::Invalid {
                var: "STRATOS_CLAIM_ORDER",
                reason,
            })?,
            Err(_) => defaults.claim_order,
        };

        let zones_path = std::env::var("STRATOS_ZONES_FILE")
            .map_err(|_| ConfigError::MissingEnvVar("STRATOS_ZONES_FILE"))?;
        let zones = load_zones(Path::new(&zones_path))?;

        Ok(Self {
            database_path,
            deployer_id,
            registry_url,
            admin_ssh_keys,
            subsystem_timeout,
            confirmer_interval,
            host_poll_interval,
            repair_interval,
            claim_order,
            system_snapshot_retention: defaults.system_snapshot_retention,
            user_snapshot_limit: defaults.user_snapshot_limit,
            zones,
        })
    }

    /// Look up a zone by name.
    pub fn zone(&self, name: &str) -> Option<&ZoneConfig> {
        self.zones.iter().find(|z| z.name == name)
    }

    /// The zone used when a request names none.
    pub fn default_zone(&self) -> Option<&ZoneConfig> {
        self.zones.first()
    }
}

fn secs_var(var: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    match std::env::var(var) {
        Ok(v) => v
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|e| ConfigError::Invalid {
                var,
                reason: e.to_string(),
            }),
        Err(_) => Ok(default),
    }
}

/// Read the zone catalog from a JSON file.
pub fn load_zones(path: &Path) -> Result<Vec<ZoneConfig>, ConfigError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::ZoneCatalog(format!("{}: {}", path.display(), e)))?;
    let zones: Vec<ZoneConfig> = serde_json::from_str(&raw)
        .map_err(|e| ConfigError::ZoneCatalog(format!("{}: {}", path.display(), e)))?;
    if zones.is_empty() {
        return Err(ConfigError::ZoneCatalog(format!(
            "{}: no zones defined",
            path.display()
        )));
    }
    Ok(zones)
}

/// One entry of the zone catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZoneConfig {
    /// Zone key stored on resources.
    pub name: String,
    /// Parent domain for public hostnames.
    pub domain: String,
    /// Hostname DNS records for public deployments point at.
    pub ingress_endpoint: String,
    /// Namespace deployments are placed in.
    pub deployment_namespace: String,
    /// Public ports handed out to port-forwarding rules.
    pub port_range: PortRange,
    /// NFS server backing volumes.
    pub nfs_server: String,
    /// Base export path on the NFS server.
    pub nfs_base_path: String,
    /// Compute hosts in the zone.
    #[serde(default)]
    pub hosts: Vec<HostConfig>,
}

/// Inclusive range of public ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    /// First port.
    pub start: u16,
    /// Last port.
    pub end: u16,
}

impl PortRange {
    /// Whether `port` falls in the range.
    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }
}

/// A compute host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostConfig {
    /// Host name as known to the hypervisor.
    pub name: String,
    /// Address of the host's API.
    pub address: String,
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// A variable has an unusable value.
    #[error("Invalid value for {var}: {reason}")]
    Invalid {
        /// The variable.
        var: &'static str,
        /// Why it was rejected.
        reason: String,
    },
    /// The zone catalog could not be loaded.
    #[error("Invalid zone catalog: {0}")]
    ZoneCatalog(String),
}
