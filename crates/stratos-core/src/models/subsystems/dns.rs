// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! DNS records.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Projection;

/// Supported record types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DnsRecordType {
    /// Address record.
    A,
    /// Alias record.
    #[default]
    Cname,
}

impl fmt::Display for DnsRecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DnsRecordType::A => f.write_str("A"),
            DnsRecordType::Cname => f.write_str("CNAME"),
        }
    }
}

/// A record addressed by (zone, hostname, type).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DnsRecord {
    /// Provider id.
    #[serde(default)]
    pub id: String,
    /// DNS zone.
    pub zone: String,
    /// Fully qualified host name.
    pub hostname: String,
    /// Record type.
    pub record_type: DnsRecordType,
    /// Target address or name.
    pub content: String,
    /// Time to live in seconds.
    pub ttl: u32,
    /// Creation time.
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl Projection for DnsRecord {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.hostname
    }

    fn clear_timestamps(&mut self) {
        self.created_at = None;
    }

    fn adopt_identity(&mut self, observed: &Self) {
        self.id = observed.id.clone();
    }
}
