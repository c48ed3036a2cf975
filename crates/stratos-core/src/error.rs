// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for stratos-core.
//!
//! Every store returns [`CoreError`]. The control plane classifies these into
//! retryable and terminal job outcomes, so variants are kept coarse and each
//! carries a stable [`error_code`](CoreError::error_code).

use std::fmt;

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors raised by the persistence layer.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum CoreError {
    /// A document addressed by id does not exist (or is soft-deleted).
    NotFound {
        /// Resource family or collection.
        kind: &'static str,
        /// The id that was looked up.
        id: String,
    },

    /// A document with the same primary id already exists.
    DuplicateId {
        /// Resource family or collection.
        kind: &'static str,
        /// The conflicting id.
        id: String,
    },

    /// A unique index rejected the write (e.g. a live resource with the same name).
    UniqueConstraintViolation {
        /// Resource family or collection.
        kind: &'static str,
        /// Human readable description of the conflicting key.
        key: String,
    },

    /// The activity name is not part of the family's vocabulary.
    InvalidActivity {
        /// Resource family.
        kind: &'static str,
        /// The rejected activity.
        activity: String,
    },

    /// The GPU does not exist.
    GpuNotFound {
        /// The GPU id.
        gpu_id: String,
    },

    /// The GPU is leased to a different VM.
    GpuAlreadyAttached {
        /// The GPU id.
        gpu_id: String,
        /// The VM currently holding the lease.
        vm_id: String,
    },

    /// A stored document could not be decoded into its typed form.
    Serialization {
        /// What was being decoded.
        context: String,
        /// Decoder message.
        details: String,
    },

    /// Database operation failed.
    DatabaseError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl CoreError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "NOT_FOUND",
            Self::DuplicateId { .. } => "DUPLICATE_ID",
            Self::UniqueConstraintViolation { .. } => "UNIQUE_CONSTRAINT_VIOLATION",
            Self::InvalidActivity { .. } => "INVALID_ACTIVITY",
            Self::GpuNotFound { .. } => "GPU_NOT_FOUND",
            Self::GpuAlreadyAttached { .. } => "GPU_ALREADY_ATTACHED",
            Self::Serialization { .. } => "SERIALIZATION_ERROR",
            Self::DatabaseError { .. } => "DATABASE_ERROR",
        }
    }

    /// Whether retrying the same operation later could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::DatabaseError { .. })
    }

    pub(crate) fn serialization(context: impl Into<String>, err: serde_json::Error) -> Self {
        Self::Serialization {
            context: context.into(),
            details: err.to_string(),
        }
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { kind, id } => write!(f, "{} '{}' not found", kind, id),
            Self::DuplicateId { kind, id } => write!(f, "{} '{}' already exists", kind, id),
            Self::UniqueConstraintViolation { kind, key } => {
                write!(f, "{} with {} already exists", kind, key)
            }
            Self::InvalidActivity { kind, activity } => {
                write!(f, "activity '{}' is not valid for {}", activity, kind)
            }
            Self::GpuNotFound { gpu_id } => write!(f, "gpu '{}' not found", gpu_id),
            Self::GpuAlreadyAttached { gpu_id, vm_id } => {
                write!(f, "gpu '{}' is already attached to vm '{}'", gpu_id, vm_id)
            }
            Self::Serialization { context, details } => {
                write!(f, "failed to decode {}: {}", context, details)
            }
            Self::DatabaseError { operation, details } => {
                write!(f, "Database error during '{}': {}", operation, details)
            }
        }
    }
}

impl std::error::Error for CoreError {}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::DatabaseError {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Serialization {
            context: "json".to_string(),
            details: err.to_string(),
        }
    }
}

/// True when the database rejected a write because of a unique or primary key index.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.is_unique_violation(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let test_cases = vec![
            (
                CoreError::NotFound {
                    kind: "vm",
                    id: "v1".to_string(),
                },
                "NOT_FOUND",
            ),
            (
                CoreError::DuplicateId {
                    kind: "job",
                    id: "j1".to_string(),
                },
                "DUPLICATE_ID",
            ),
            (
                CoreError::UniqueConstraintViolation {
                    kind: "vm",
                    key: "name 'vm-a'".to_string(),
                },
                "UNIQUE_CONSTRAINT_VIOLATION",
            ),
            (
                CoreError::GpuAlreadyAttached {
                    gpu_id: "g1".to_string(),
                    vm_id: "v2".to_string(),
                },
                "GPU_ALREADY_ATTACHED",
            ),
            (
                CoreError::DatabaseError {
                    operation: "insert".to_string(),
                    details: "disk I/O error".to_string(),
                },
                "DATABASE_ERROR",
            ),
        ];

        for (error, expected_code) in test_cases {
            assert_eq!(error.error_code(), expected_code, "for {:?}", error);
        }
    }

    #[test]
    fn test_display_messages() {
        let err = CoreError::UniqueConstraintViolation {
            kind: "deployment",
            key: "name 'web'".to_string(),
        };
        assert_eq!(err.to_string(), "deployment with name 'web' already exists");

        let err = CoreError::GpuNotFound {
            gpu_id: "host-1-0000:01:00.0".to_string(),
        };
        assert_eq!(err.to_string(), "gpu 'host-1-0000:01:00.0' not found");
    }

    #[test]
    fn test_only_database_errors_are_transient() {
        assert!(
            CoreError::DatabaseError {
                operation: "query".to_string(),
                details: "locked".to_string(),
            }
            .is_transient()
        );
        assert!(
            !CoreError::NotFound {
                kind: "vm",
                id: "x".to_string(),
            }
            .is_transient()
        );
    }
}
