// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Job history stores.
//!
//! Both stores keep records newest first and drop the oldest beyond
//! `limit`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::domain::history::{HistoryError, JobHistoryStore, JobRecord};

/// In-memory history for tests and hosts without a data directory
pub struct InMemoryJobHistory {
    records: RwLock<Vec<JobRecord>>,
    limit: usize,
}

impl InMemoryJobHistory {
    pub fn new(limit: usize) -> Self {
        Self {
            records: RwLock::new(Vec::new()),
            limit: limit.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[async_trait]
impl JobHistoryStore for InMemoryJobHistory {
    async fn append(&self, record: JobRecord) -> Result<(), HistoryError> {
        let mut records = self.records.write();
        records.insert(0, record);
        records.truncate(self.limit);
        Ok(())
    }

    async fn read_all(&self) -> Result<Vec<JobRecord>, HistoryError> {
        Ok(self.records.read().clone())
    }
}

/// History persisted as a pretty-printed JSON array, newest first.
///
/// Every append rewrites the file through a temp file and rename, so a
/// crash never leaves a half-written history behind.
pub struct JsonFileJobHistory {
    path: PathBuf,
    limit: usize,
    write_lock: Mutex<()>,
}

impl JsonFileJobHistory {
    pub fn new(path: impl Into<PathBuf>, limit: usize) -> Self {
        Self {
            path: path.into(),
            limit: limit.max(1),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing and unreadable files both read as an empty history.
    async fn load(&self) -> Result<Vec<JobRecord>, HistoryError> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        match serde_json::from_str::<Vec<JobRecord>>(&content) {
            Ok(records) => Ok(records),
            Err(e) => {
                warn!(path = ?self.path, error = %e, "Malformed job history file, starting empty");
                Ok(Vec::new())
            }
        }
    }

    async fn store(&self, records: &[JobRecord]) -> Result<(), HistoryError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let json = serde_json::to_string_pretty(records)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl JobHistoryStore for JsonFileJobHistory {
    async fn append(&self, record: JobRecord) -> Result<(), HistoryError> {
        let _guard = self.write_lock.lock().await;
        let mut records = self.load().await?;
        records.insert(0, record);
        records.truncate(self.limit);
        self.store(&records).await?;
        debug!(path = ?self.path, entries = records.len(), "Job history written");
        Ok(())
    }

    async fn read_all(&self) -> Result<Vec<JobRecord>, HistoryError> {
        self.load().await
    }
}
