// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Stratos Core - Resource Model and Durable Stores
//!
//! This crate holds everything the control plane persists: resource documents
//! (VMs, deployments, storage managers), the job queue, GPU leases, and a small
//! key/value cache. All state lives in SQLite and every state transition the
//! engine relies on is a single atomic statement.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        stratos-control                          │
//! │   job runner · resource services · confirmers · subsystem ports │
//! └─────────────────────────────────────────────────────────────────┘
//!                                 │
//!                                 ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                   stratos-core (this crate)                     │
//! │  ResourceRepository<K> · JobRepository · GpuRepository · KV     │
//! └─────────────────────────────────────────────────────────────────┘
//!                                 │
//!                                 ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    SQLite (WAL, JSON1)                          │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Activities
//!
//! A resource carries a set of *activities* (`beingCreated`, `beingDeleted`,
//! `updating`, ...). Membership is the synchronization signal between
//! overlapping operations. Activities are stored as a JSON object keyed by
//! name, so adding and removing one is a single idempotent field update.
//!
//! # Jobs
//!
//! | Status       | Terminal | Next                                   |
//! |--------------|----------|----------------------------------------|
//! | `pending`    | no       | `running` (claimed)                    |
//! | `running`    | no       | `completed`, `failed`, `terminated`    |
//! | `failed`     | no       | `running` once `run_after` has passed  |
//! | `completed`  | yes      |                                        |
//! | `terminated` | yes      |                                        |
//!
//! Claims are a single `UPDATE ... WHERE id = (SELECT ...) RETURNING` so two
//! fetchers can never receive the same job.

#![deny(missing_docs)]

/// Database connection configuration.
pub mod config;

/// Error types for persistence operations.
pub mod error;

/// Resource, job, GPU, and subsystem projection types.
pub mod models;

/// SQLite-backed stores.
pub mod persistence;

pub use error::{CoreError, Result};
pub use persistence::Database;
