// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Pure functions from resource fields to desired subsystem projections.
//!
//! Generators never perform I/O. Subsystem-assigned values they depend on
//! (the hypervisor VM id, allocated public ports, a robot secret) are passed
//! in by the caller after it has observed them.

pub mod deployment;
pub mod sm;
pub mod vm;

use stratos_core::models::subsystems::{Labels, managed_labels};

use crate::config::{Config, ZoneConfig};

/// Process settings and zone a generator renders against.
#[derive(Debug, Clone, Copy)]
pub struct GenContext<'a> {
    /// Value of the `managedBy` tag.
    pub deployer_id: &'a str,
    /// Registry host images are pushed to.
    pub registry_url: &'a str,
    /// Keys installed on every VM next to the owner's.
    pub admin_ssh_keys: &'a [String],
    /// Zone the resource lives in.
    pub zone: &'a ZoneConfig,
}

impl<'a> GenContext<'a> {
    /// Render against `zone` with the process settings from `config`.
    pub fn new(config: &'a Config, zone: &'a ZoneConfig) -> Self {
        Self {
            deployer_id: &config.deployer_id,
            registry_url: &config.registry_url,
            admin_ssh_keys: &config.admin_ssh_keys,
            zone,
        }
    }

    /// Ownership labels for objects of `resource_name`.
    pub fn labels(&self, resource_name: &str, owner_id: &str) -> Labels {
        managed_labels(self.deployer_id, resource_name, owner_id)
    }

    /// Public hostname under the zone's domain.
    pub fn public_host(&self, prefix: &str) -> String {
        format!("{}.{}", prefix, self.zone.domain)
    }
}
