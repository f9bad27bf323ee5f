// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Conduit Core
//!
//! In-process message bus (publish/subscribe, request/reply, sticky replay)
//! and the job orchestrator built on top of it.
//!
//! # Architecture
//!
//! - **domain:** envelopes, replies, jobs, lifecycle events, history contract, configuration
//! - **infrastructure:** the `MessageBus`, the process-wide default bus, history stores
//! - **application:** `JobManager`, `TimeoutWatcher`, the history writer, bus endpoints

pub mod domain;
pub mod application;
pub mod infrastructure;

pub use domain::*;
pub use application::{
    blocking_work, register_job_endpoints, work_fn, CancelOutcome, JobContext, JobFilter,
    JobManager, JobSpec, JobWork,
};
pub use infrastructure::history::{InMemoryJobHistory, JsonFileJobHistory};
pub use infrastructure::message_bus::{BusError, BusReport, MessageBus, SubscriptionId};
