// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Job aggregate and its lifecycle state machine.
//!
//! ```text
//! Pending ──start()──▶ Running ──finish()──▶ Succeeded | Failed | TimedOut | Cancelled
//!    └──────────────finish(Cancelled)─────────▶ Cancelled
//! ```
//!
//! Once terminal, every further transition is rejected with
//! [`TransitionError::AlreadyTerminal`]; callers treat that as a no-op.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::history::{HistoryError, JobRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(value: &str) -> Option<Self> {
        Uuid::parse_str(value).ok().map(Self)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::TimedOut | JobStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::TimedOut => "timed_out",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a job ended.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Succeeded(Value),
    Failed(String),
    TimedOut(String),
    Cancelled(Option<String>),
}

impl JobOutcome {
    pub fn status(&self) -> JobStatus {
        match self {
            JobOutcome::Succeeded(_) => JobStatus::Succeeded,
            JobOutcome::Failed(_) => JobStatus::Failed,
            JobOutcome::TimedOut(_) => JobStatus::TimedOut,
            JobOutcome::Cancelled(_) => JobStatus::Cancelled,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("job already finished with status {0}")]
    AlreadyTerminal(JobStatus),

    #[error("job is {0}, expected pending")]
    NotPending(JobStatus),

    #[error("job never started; only cancellation may finish a pending job")]
    NotStarted,
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error("Job {0} not found")]
    NotFound(JobId),

    #[error("Unknown job kind: {0}")]
    UnknownKind(String),

    #[error("Job manager requires a running tokio runtime")]
    NoRuntime,

    #[error("Invalid job payload: {0}")]
    InvalidPayload(String),

    #[error("Job history error: {0}")]
    History(#[from] HistoryError),
}

/// Snapshot of a job. `JobManager::get_job` hands out clones of this.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub kind: String,
    pub source: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub progress: Option<Value>,
    pub result: Option<Value>,
    pub error: Option<String>,
    #[serde(default, with = "humantime_serde")]
    pub timeout_budget: Option<Duration>,
    #[serde(default)]
    pub cancel_requested: bool,
}

impl Job {
    pub fn new(kind: impl Into<String>, source: impl Into<String>, timeout_budget: Option<Duration>) -> Self {
        Self {
            id: JobId::new(),
            kind: kind.into(),
            source: source.into(),
            status: JobStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            progress: None,
            result: None,
            error: None,
            timeout_budget,
            cancel_requested: false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn start(&mut self) -> Result<(), TransitionError> {
        match self.status {
            JobStatus::Pending => {
                self.status = JobStatus::Running;
                self.started_at = Some(Utc::now());
                Ok(())
            }
            status if status.is_terminal() => Err(TransitionError::AlreadyTerminal(status)),
            status => Err(TransitionError::NotPending(status)),
        }
    }

    /// Move to a terminal state. Exactly one call per job succeeds.
    pub fn finish(&mut self, outcome: JobOutcome) -> Result<(), TransitionError> {
        if self.status.is_terminal() {
            return Err(TransitionError::AlreadyTerminal(self.status));
        }
        if self.status == JobStatus::Pending && !matches!(outcome, JobOutcome::Cancelled(_)) {
            return Err(TransitionError::NotStarted);
        }

        self.status = outcome.status();
        self.completed_at = Some(Utc::now());
        match outcome {
            JobOutcome::Succeeded(result) => self.result = Some(result),
            JobOutcome::Failed(error) | JobOutcome::TimedOut(error) => {
                self.error = Some(non_empty_error(error, self.status));
            }
            JobOutcome::Cancelled(error) => self.error = error,
        }
        Ok(())
    }

    /// Store the latest progress snapshot. Ignored once the job is terminal.
    pub fn record_progress(&mut self, progress: Value) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.progress = Some(progress);
        true
    }

    pub fn elapsed(&self) -> Option<chrono::Duration> {
        let started = self.started_at?;
        let end = self.completed_at.unwrap_or_else(Utc::now);
        Some(end - started)
    }

    pub fn to_record(&self) -> JobRecord {
        JobRecord::from_job(self)
    }
}

fn non_empty_error(error: String, status: JobStatus) -> String {
    if error.trim().is_empty() {
        format!("job {} without an error message", status)
    } else {
        error
    }
}
