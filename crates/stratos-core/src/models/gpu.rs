// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! GPUs and their embedded lease.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A passthrough-capable GPU installed in a compute host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Gpu {
    /// Stable id, `<host>-<bus>`.
    pub id: String,
    /// Host the card is installed in.
    pub host: String,
    /// Zone of the host.
    pub zone: String,
    /// Hardware description.
    pub data: GpuData,
    /// Current lease; an empty `vm_id` means free.
    pub lease: GpuLease,
}

/// Hardware description of a GPU.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GpuData {
    /// Marketing name.
    pub name: String,
    /// Vendor name.
    pub vendor: String,
    /// PCI vendor id.
    pub vendor_id: String,
    /// PCI device id.
    pub device_id: String,
    /// PCI bus address used for passthrough.
    pub bus: String,
}

/// Lease embedded in a GPU.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GpuLease {
    /// VM holding the GPU, empty when free.
    pub vm_id: String,
    /// User the lease was granted to.
    pub user_id: String,
    /// When the lease runs out.
    pub end: Option<DateTime<Utc>>,
}

impl Gpu {
    /// Build an unleased GPU.
    pub fn new(host: impl Into<String>, zone: impl Into<String>, data: GpuData) -> Self {
        let host = host.into();
        Self {
            id: Self::make_id(&host, &data.bus),
            host,
            zone: zone.into(),
            data,
            lease: GpuLease::default(),
        }
    }

    /// Deterministic id from host and bus address.
    pub fn make_id(host: &str, bus: &str) -> String {
        format!("{}-{}", host, bus)
    }

    /// Whether some VM holds the lease.
    pub fn is_attached(&self) -> bool {
        !self.lease.vm_id.is_empty()
    }

    /// Whether the lease has run out. A free GPU is never expired.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.is_attached() && self.lease.end.is_some_and(|end| end < now)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn gpu() -> Gpu {
        Gpu::new(
            "host-1",
            "se-1",
            GpuData {
                name: "A100".to_string(),
                vendor: "NVIDIA".to_string(),
                vendor_id: "10de".to_string(),
                device_id: "20b0".to_string(),
                bus: "0000:01:00.0".to_string(),
            },
        )
    }

    #[test]
    fn test_id_combines_host_and_bus() {
        assert_eq!(gpu().id, "host-1-0000:01:00.0");
    }

    #[test]
    fn test_expiry_requires_attachment() {
        let now = Utc::now();
        let mut gpu = gpu();
        assert!(!gpu.is_attached());
        assert!(!gpu.is_expired(now));

        gpu.lease = GpuLease {
            vm_id: "v1".to_string(),
            user_id: "u1".to_string(),
            end: Some(now - Duration::seconds(1)),
        };
        assert!(gpu.is_attached());
        assert!(gpu.is_expired(now));

        gpu.lease.end = Some(now + Duration::hours(1));
        assert!(!gpu.is_expired(now));
    }
}
