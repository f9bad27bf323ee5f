// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Typed payloads for the job lifecycle topics.
//!
//! The bus carries them as JSON; subscribers recover the typed form with
//! `Envelope::payload_as::<JobCompletedEvent>()`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::job::{Job, JobId, JobStatus};

/// Payload of `job.started`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStartedEvent {
    pub job_id: JobId,
    pub kind: String,
    pub started_at: DateTime<Utc>,
}

/// Payload of `job.progress`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobProgressEvent {
    pub job_id: JobId,
    pub kind: String,
    pub progress: Value,
}

/// Payload of `job.completed`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobCompletedEvent {
    pub job_id: JobId,
    pub kind: String,
    pub status: JobStatus,
    pub ok: bool,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobStartedEvent {
    pub fn from_job(job: &Job) -> Self {
        Self {
            job_id: job.id,
            kind: job.kind.clone(),
            started_at: job.started_at.unwrap_or(job.created_at),
        }
    }
}

impl JobCompletedEvent {
    pub fn from_job(job: &Job) -> Self {
        Self {
            job_id: job.id,
            kind: job.kind.clone(),
            status: job.status,
            ok: job.status == JobStatus::Succeeded,
            result: job.result.clone(),
            error: job.error.clone(),
            completed_at: job.completed_at,
        }
    }
}
