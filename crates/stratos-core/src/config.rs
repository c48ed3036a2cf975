// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Database connection settings.

use std::time::Duration;

/// Settings used when opening the SQLite database.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Maximum pooled connections.
    pub max_connections: u32,
    /// How long a writer waits on a locked database before giving up.
    pub busy_timeout: Duration,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            max_connections: 8,
            busy_timeout: Duration::from_secs(5),
        }
    }
}
