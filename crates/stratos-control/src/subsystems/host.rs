// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-host agent capability.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use stratos_core::models::GpuData;

use super::SubsystemError;

/// Static capacity of a compute host and what is allocated on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostCapacities {
    /// Installed memory in GB.
    pub ram_total: u32,
    /// Memory allocated to VMs in GB.
    pub ram_used: u32,
    /// Physical CPU cores.
    pub cpu_cores: u32,
    /// Installed passthrough GPUs.
    pub gpu_count: u32,
}

impl HostCapacities {
    /// Unallocated memory in GB.
    pub fn ram_free(&self) -> u32 {
        self.ram_total.saturating_sub(self.ram_used)
    }
}

/// Live telemetry of a compute host.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostStatus {
    /// CPU load, 0-100.
    pub cpu_load: f64,
    /// Memory in use, 0-100.
    pub ram_load: f64,
    /// Bytes received per second.
    pub network_rx: u64,
    /// Bytes sent per second.
    pub network_tx: u64,
}

/// Agent running on each compute host.
#[async_trait]
pub trait HostApi: Send + Sync {
    /// Capacity and allocation of `host`.
    async fn capacities(&self, host: &str) -> Result<HostCapacities, SubsystemError>;

    /// Current telemetry of `host`.
    async fn status(&self, host: &str) -> Result<HostStatus, SubsystemError>;

    /// GPUs installed in `host`.
    async fn gpus(&self, host: &str) -> Result<Vec<GpuData>, SubsystemError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ram_free_saturates() {
        let caps = HostCapacities {
            ram_total: 64,
            ram_used: 70,
            ..Default::default()
        };
        assert_eq!(caps.ram_free(), 0);
    }
}
