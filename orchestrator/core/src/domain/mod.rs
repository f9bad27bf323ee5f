// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Domain types shared by the bus and the job subsystem.

pub mod config;
pub mod envelope;
pub mod events;
pub mod history;
pub mod job;
pub mod reply;
pub mod topics;

pub use config::{BusConfig, ConduitConfig, ConfigError, JobConfig};
pub use envelope::{Envelope, MessageId};
pub use history::{HistoryError, JobHistoryStore, JobRecord};
pub use job::{Job, JobError, JobId, JobOutcome, JobStatus, TransitionError};
pub use reply::Reply;
