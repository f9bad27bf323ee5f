// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Job history contract.
//!
//! Terminal jobs are archived as [`JobRecord`]s through a [`JobHistoryStore`].
//! The storage format belongs to the store implementation, see
//! `crate::infrastructure::history`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::job::{Job, JobId, JobStatus};

/// Maximum length of the result summary kept in history
pub const RESULT_SUMMARY_LIMIT: usize = 200;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: JobId,
    pub kind: String,
    pub source: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub ok: Option<bool>,
    pub error: Option<String>,
    pub result_summary: Option<String>,
}

impl JobRecord {
    pub fn from_job(job: &Job) -> Self {
        let ok = job
            .status
            .is_terminal()
            .then_some(job.status == JobStatus::Succeeded);
        Self {
            job_id: job.id,
            kind: job.kind.clone(),
            source: job.source.clone(),
            status: job.status,
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
            ok,
            error: job.error.clone(),
            result_summary: job.result.as_ref().and_then(summarize_result),
        }
    }
}

/// Pull a short summary out of a job result.
///
/// Uses the `summary` string when the result carries one, otherwise a plain
/// string result. Truncated on a char boundary to [`RESULT_SUMMARY_LIMIT`].
pub fn summarize_result(result: &Value) -> Option<String> {
    let text = match result {
        Value::Object(map) => map.get("summary")?.as_str()?,
        Value::String(text) => text.as_str(),
        _ => return None,
    };
    Some(text.chars().take(RESULT_SUMMARY_LIMIT).collect())
}

#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("History I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("History serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("History writer is closed")]
    WriterClosed,
}

/// Append + read-all persistence for terminal jobs.
#[async_trait]
pub trait JobHistoryStore: Send + Sync {
    /// Append one terminal record
    async fn append(&self, record: JobRecord) -> Result<(), HistoryError>;

    /// All stored records, newest first
    async fn read_all(&self) -> Result<Vec<JobRecord>, HistoryError>;

    /// Find one record by job id
    async fn find(&self, job_id: JobId) -> Result<Option<JobRecord>, HistoryError> {
        Ok(self
            .read_all()
            .await?
            .into_iter()
            .find(|record| record.job_id == job_id))
    }
}
