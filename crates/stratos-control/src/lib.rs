// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Stratos Control - Cloud Orchestration Control Plane
//!
//! This crate turns user requests into durable jobs and drives VMs,
//! deployments, and storage managers toward their desired state across a
//! hypervisor, a Kubernetes-style cluster, an image registry, and DNS.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       API layer (out of tree)                           │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │ JobSubmitter
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                   stratos-control (This Crate)                          │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐     │
//! │  │  Job        │  │  Resource   │  │ Confirmers  │  │ Host poller │     │
//! │  │  Runner     │─▶│  Services   │  │ + repairs   │  │             │     │
//! │  └─────────────┘  └──────┬──────┘  └─────────────┘  └─────────────┘     │
//! └──────────────────────────┼──────────────────────────────────────────────┘
//!                            │ Reconcile (read / create / update / delete)
//!                            ▼
//! ┌──────────────┐ ┌──────────────┐ ┌──────────────┐ ┌──────────────┐
//! │  Hypervisor  │ │   Cluster    │ │   Registry   │ │     DNS      │
//! └──────────────┘ └──────────────┘ └──────────────┘ └──────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                stratos-core (resources, jobs, GPUs, KV)                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Job lifecycle
//!
//! A job is claimed, checked against its terminate predicates, wrapped in
//! its entry and exit activity hooks, and run. Transient failures are
//! retried with exponential backoff up to
//! [`MAX_ATTEMPTS`](stratos_core::models::job::MAX_ATTEMPTS); anything else
//! terminates the job.
//!
//! # Configuration
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `STRATOS_DEPLOYER_ID` | Yes | - | Identity stamped on created objects |
//! | `STRATOS_ZONES_FILE` | Yes | - | JSON zone catalog |
//! | `STRATOS_DATABASE_PATH` | No | `.data/stratos.db` | SQLite file |
//! | `STRATOS_REGISTRY_URL` | No | `registry.local` | Image registry host |
//! | `STRATOS_CLAIM_ORDER` | No | `newest` | `newest` or `oldest` first |
//!
//! See [`config::Config`] for the full list.

#![deny(missing_docs)]

/// Process configuration loaded from environment variables.
pub mod config;

/// Shared handles for services and workers.
pub mod context;

/// Error types for control plane operations.
pub mod error;

/// Desired-state generators for each resource family.
pub mod generators;

/// Generic reconciliation of desired against observed objects.
pub mod reconcile;

/// Capability traits for external subsystems and in-memory implementations.
pub mod subsystems;

/// Resource services: VMs, deployments, storage managers, and GPUs.
pub mod services;

/// The durable job engine.
pub mod jobs;

/// Background workers that confirm creation and deletion.
pub mod confirmer;

/// Background worker that queues periodic repairs.
pub mod repair_scheduler;

/// Background worker that polls compute hosts.
pub mod host_poller;

/// Embeddable runtime owning every background worker.
pub mod runtime;

pub use context::ControlContext;
pub use error::{Error, Result};
pub use runtime::ControlPlaneRuntime;
