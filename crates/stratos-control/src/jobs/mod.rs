// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The job engine: typed arguments, static definitions, handlers, submission,
//! and the runner.

pub mod args;
pub mod definitions;
pub mod handlers;
pub mod runner;
pub mod submit;

pub use args::JobArgs;
pub use definitions::{Family, JobDefinition, TerminateCheck, definition};
pub use handlers::{DeleteWaits, JobError, JobHandlers};
pub use runner::{JobOutcome, JobRunner, JobRunnerConfig, backoff_delay};
pub use submit::JobSubmitter;
