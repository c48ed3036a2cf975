// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for stratos-control.

use stratos_core::CoreError;
use thiserror::Error;

/// Errors reported by subsystem capability implementations.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum SubsystemError {
    /// The addressed object does not exist.
    #[error("{system} object not found: {name}")]
    NotFound {
        /// Subsystem name.
        system: &'static str,
        /// Object name or id.
        name: String,
    },

    /// The object cannot be changed in place; delete and recreate it.
    #[error("{system} object {name} cannot be updated in place")]
    NotMutable {
        /// Subsystem name.
        system: &'static str,
        /// Object name.
        name: String,
    },

    /// The subsystem refused the request.
    #[error("{system} rejected request: {reason}")]
    Rejected {
        /// Subsystem name.
        system: &'static str,
        /// Reason given.
        reason: String,
    },

    /// The subsystem could not be reached.
    #[error("{system} unavailable: {reason}")]
    Unavailable {
        /// Subsystem name.
        system: &'static str,
        /// Transport error.
        reason: String,
    },

    /// The call did not finish in time.
    #[error("{system} call timed out after {seconds}s")]
    Timeout {
        /// Subsystem name.
        system: &'static str,
        /// Timeout that elapsed.
        seconds: u64,
    },

    /// Every public port in the zone range is in use.
    #[error("no free public port in zone {zone}")]
    NoFreePort {
        /// Zone name.
        zone: String,
    },
}

impl SubsystemError {
    /// Whether retrying later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SubsystemError::Unavailable { .. } | SubsystemError::Timeout { .. }
        )
    }
}

/// Control plane errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Persistence operation failed.
    #[error("Core error: {0}")]
    Core(#[from] CoreError),

    /// A subsystem call failed.
    #[error("Subsystem error: {0}")]
    Subsystem(#[from] SubsystemError),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal state that should be impossible, e.g. a missing parent id.
    #[error("Invariant violated: {0}")]
    Invariant(String),

    /// The request cannot be satisfied as given.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Waiting on other work did not finish in time.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether the operation should be retried later.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Core(e) => e.is_transient(),
            Error::Subsystem(e) => e.is_transient(),
            Error::Timeout(_) => true,
            _ => false,
        }
    }
}

/// Result type using control plane Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let unavailable = Error::from(SubsystemError::Unavailable {
            system: "hypervisor",
            reason: "connection refused".to_string(),
        });
        assert!(unavailable.is_transient());

        let rejected = Error::from(SubsystemError::Rejected {
            system: "cluster",
            reason: "quota exceeded".to_string(),
        });
        assert!(!rejected.is_transient());

        let taken = Error::from(CoreError::GpuAlreadyAttached {
            gpu_id: "g1".to_string(),
            vm_id: "v1".to_string(),
        });
        assert!(!taken.is_transient());

        let db = Error::from(CoreError::DatabaseError {
            operation: "query".to_string(),
            details: "database is locked".to_string(),
        });
        assert!(db.is_transient());

        assert!(Error::Timeout("related jobs".to_string()).is_transient());
        assert!(!Error::Invariant("missing vm id".to_string()).is_transient());
    }

    #[test]
    fn test_display() {
        let err = Error::from(SubsystemError::NoFreePort {
            zone: "se-1".to_string(),
        });
        assert_eq!(err.to_string(), "Subsystem error: no free public port in zone se-1");
    }
}
