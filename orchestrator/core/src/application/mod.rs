// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod endpoints;
pub mod history_writer;
pub mod job_manager;
pub mod timeout_watcher;
pub mod work;

pub use endpoints::register_job_endpoints;
pub use history_writer::{HistorySender, HistoryWriter};
pub use job_manager::{CancelOutcome, JobFactory, JobFilter, JobManager, JobSpec, DEFAULT_JOB_SOURCE};
pub use timeout_watcher::{Deadline, DeadlineKind, TimeoutWatcher};
pub use work::{blocking_work, work_fn, BlockingWork, FnWork, JobContext, JobWork};
