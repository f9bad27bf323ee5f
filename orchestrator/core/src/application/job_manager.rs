// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Job Manager Application Service
//!
//! Runs background work as tracked jobs:
//!
//! ```text
//! create_job ──▶ Pending ──(permit)──▶ Running ──▶ work.run(ctx)
//!                   │                     │
//!                cancel_job         TimeoutWatcher / reaper
//!                   ▼                     ▼
//!               Cancelled    Succeeded | Failed | TimedOut | Cancelled
//!                                         │
//!                          job.completed (sticky) + history record
//! ```
//!
//! Every terminal transition goes through [`JobManager::complete`], which
//! compare-and-sets the status under the job's mutex. Whoever loses the race
//! (late worker result, second timeout, cancel after finish) is a no-op.
//!
//! A running job's concurrency permit is released by that transition, not
//! when the work returns, so timed-out work that ignores its token cannot
//! starve the queue. At most `history_limit` finished jobs stay in memory;
//! older ones are served from the history store.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::runtime::Handle;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::application::history_writer::{HistorySender, HistoryWriter};
use crate::application::timeout_watcher::{Deadline, TimeoutWatcher};
use crate::application::work::{JobContext, JobWork};
use crate::domain::config::JobConfig;
use crate::domain::events::{JobCompletedEvent, JobStartedEvent};
use crate::domain::history::{HistoryError, JobHistoryStore, JobRecord};
use crate::domain::job::{Job, JobError, JobId, JobOutcome, JobStatus};
use crate::domain::topics;
use crate::infrastructure::message_bus::MessageBus;
use crate::infrastructure::panic::panic_message;

/// Source used when a job is created without one
pub const DEFAULT_JOB_SOURCE: &str = "core";

/// Builds job work from a submit payload
pub type JobFactory = dyn Fn(Value) -> anyhow::Result<Arc<dyn JobWork>> + Send + Sync;

#[derive(Debug, Clone, PartialEq)]
pub struct JobSpec {
    pub kind: String,
    pub source: String,
    pub timeout_budget: Option<Duration>,
}

impl JobSpec {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            source: DEFAULT_JOB_SOURCE.to_string(),
            timeout_budget: None,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn with_timeout(mut self, timeout_budget: Duration) -> Self {
        self.timeout_budget = Some(timeout_budget);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// Job was still pending and will never run
    Cancelled,
    /// Job is running; the cancellation token was signalled
    Requested,
    /// Job had already reached a terminal state
    AlreadyFinished,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobFilter {
    pub kind: Option<String>,
    pub status: Option<JobStatus>,
    pub limit: Option<usize>,
}

impl JobFilter {
    fn matches(&self, record: &JobRecord) -> bool {
        self.kind.as_deref().is_none_or(|kind| record.kind == kind)
            && self.status.is_none_or(|status| record.status == status)
    }
}

pub(crate) struct JobEntry {
    pub(crate) state: Mutex<Job>,
    pub(crate) cancel: CancellationToken,
    /// Held from `start()` until the terminal transition
    permit: Mutex<Option<OwnedSemaphorePermit>>,
}

impl JobEntry {
    fn new(job: Job) -> Self {
        Self {
            state: Mutex::new(job),
            cancel: CancellationToken::new(),
            permit: Mutex::new(None),
        }
    }

    fn release_permit(&self) {
        drop(self.permit.lock().take());
    }
}

/// Everything announced for a job that just became terminal
struct Finished {
    event: JobCompletedEvent,
    record: JobRecord,
    source: String,
}

pub struct JobManager {
    bus: Arc<MessageBus>,
    config: JobConfig,
    jobs: DashMap<JobId, Arc<JobEntry>>,
    kinds: RwLock<HashMap<String, Arc<JobFactory>>>,
    store: Arc<dyn JobHistoryStore>,
    history: HistorySender,
    permits: Option<Arc<Semaphore>>,
    runtime: Handle,
    writer: Mutex<Option<JoinHandle<()>>>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl JobManager {
    /// Create the manager and spawn its history writer and reaper.
    ///
    /// Must be called from inside a tokio runtime; jobs are spawned on it.
    pub fn new(
        bus: Arc<MessageBus>,
        store: Arc<dyn JobHistoryStore>,
        config: JobConfig,
    ) -> Result<Arc<Self>, JobError> {
        let runtime = Handle::try_current().map_err(|_| JobError::NoRuntime)?;
        let (writer, history) = HistoryWriter::new(store.clone());
        let writer_handle = writer.start(&runtime);
        let permits = config
            .max_concurrent_jobs
            .map(|limit| Arc::new(Semaphore::new(limit)));

        let manager = Arc::new(Self {
            bus,
            config,
            jobs: DashMap::new(),
            kinds: RwLock::new(HashMap::new()),
            store,
            history,
            permits,
            runtime,
            writer: Mutex::new(Some(writer_handle)),
            reaper: Mutex::new(None),
        });

        if let Some(interval) = manager.config.reaper_interval {
            let reaper =
                TimeoutWatcher::spawn_reaper(Arc::downgrade(&manager), interval, &manager.runtime);
            *manager.reaper.lock() = Some(reaper);
        }

        info!(
            hard_ceiling = ?manager.config.hard_ceiling,
            default_timeout = ?manager.config.default_timeout,
            max_concurrent_jobs = ?manager.config.max_concurrent_jobs,
            "Job manager started"
        );
        Ok(manager)
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    pub fn config(&self) -> &JobConfig {
        &self.config
    }

    pub(crate) fn runtime(&self) -> &Handle {
        &self.runtime
    }

    // ------------------------------------------------------------------
    // Creation
    // ------------------------------------------------------------------

    pub fn create_job(
        self: &Arc<Self>,
        kind: impl Into<String>,
        work: Arc<dyn JobWork>,
        timeout_budget: Option<Duration>,
    ) -> Result<JobId, JobError> {
        let mut spec = JobSpec::new(kind);
        spec.timeout_budget = timeout_budget;
        self.create_job_with(spec, work)
    }

    /// Register the job as pending and spawn its task. Never waits for the
    /// work to start.
    pub fn create_job_with(self: &Arc<Self>, spec: JobSpec, work: Arc<dyn JobWork>) -> Result<JobId, JobError> {
        let job = Job::new(spec.kind, spec.source, spec.timeout_budget);
        let job_id = job.id;
        debug!(job_id = %job_id, kind = %job.kind, budget = ?job.timeout_budget, "Job created");

        let entry = Arc::new(JobEntry::new(job));
        self.jobs.insert(job_id, entry.clone());

        let manager = self.clone();
        self.runtime.spawn(async move { manager.run_job(entry, work).await });
        Ok(job_id)
    }

    /// Bind a job kind to a factory used by [`submit`](Self::submit).
    pub fn register_kind<F>(&self, kind: impl Into<String>, factory: F)
    where
        F: Fn(Value) -> anyhow::Result<Arc<dyn JobWork>> + Send + Sync + 'static,
    {
        let kind = kind.into();
        if self.kinds.write().insert(kind.clone(), Arc::new(factory)).is_some() {
            warn!(kind = %kind, "Replacing existing job kind");
        }
    }

    pub fn known_kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.kinds.read().keys().cloned().collect();
        kinds.sort();
        kinds
    }

    /// Create a job of a registered kind from a JSON payload.
    pub fn submit(
        self: &Arc<Self>,
        kind: &str,
        payload: Value,
        source: &str,
        timeout_budget: Option<Duration>,
    ) -> Result<JobId, JobError> {
        let factory = self
            .kinds
            .read()
            .get(kind)
            .cloned()
            .ok_or_else(|| JobError::UnknownKind(kind.to_string()))?;
        let payload = if payload.is_null() { json!({}) } else { payload };
        let work = factory(payload).map_err(|e| JobError::InvalidPayload(format!("{e:#}")))?;

        let spec = JobSpec {
            kind: kind.to_string(),
            source: source.to_string(),
            timeout_budget,
        };
        self.create_job_with(spec, work)
    }

    // ------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------

    async fn run_job(self: Arc<Self>, entry: Arc<JobEntry>, work: Arc<dyn JobWork>) {
        // Queued jobs stay pending; a cancel while queued ends the wait.
        let permit = match &self.permits {
            Some(permits) => {
                tokio::select! {
                    permit = permits.clone().acquire_owned() => match permit {
                        Ok(permit) => Some(permit),
                        Err(_) => return,
                    },
                    _ = entry.cancel.cancelled() => return,
                }
            }
            None => None,
        };

        let (job_id, kind, source, budget, started) = {
            let mut job = entry.state.lock();
            if let Err(e) = job.start() {
                debug!(job_id = %job.id, reason = %e, "Job not started");
                return;
            }
            // stored before Running is observable to the watcher or reaper
            *entry.permit.lock() = permit;
            (
                job.id,
                job.kind.clone(),
                job.source.clone(),
                job.timeout_budget,
                JobStartedEvent::from_job(&job),
            )
        };

        info!(job_id = %job_id, kind = %kind, "Job started");
        match serde_json::to_value(&started) {
            Ok(payload) => {
                if let Err(e) = self.bus.publish(topics::JOB_STARTED, payload, &source, None) {
                    warn!(job_id = %job_id, error = %e, "Failed to publish job.started");
                }
            }
            Err(e) => error!(job_id = %job_id, error = %e, "Failed to serialize job.started"),
        }

        let deadline = Deadline::effective(budget, self.config.default_timeout, self.config.hard_ceiling);
        let watcher = TimeoutWatcher::arm(Arc::downgrade(&self), entry.clone(), deadline, &self.runtime);

        let ctx = JobContext::new(job_id, kind, source, self.bus.clone(), entry.clone());
        let task = self.runtime.spawn(async move { work.run(ctx).await });

        let outcome = match task.await {
            Ok(Ok(result)) => JobOutcome::Succeeded(result),
            Ok(Err(e)) => {
                let message = format!("{e:#}");
                if entry.state.lock().cancel_requested {
                    JobOutcome::Cancelled(Some(message))
                } else {
                    JobOutcome::Failed(message)
                }
            }
            Err(join_error) if join_error.is_panic() => JobOutcome::Failed(format!(
                "work panicked: {}",
                panic_message(join_error.into_panic().as_ref())
            )),
            Err(join_error) => JobOutcome::Failed(format!("work aborted: {join_error}")),
        };

        watcher.abort();
        self.complete(&entry, outcome);
    }

    /// The single terminal transition. Returns `false` if the job was
    /// already terminal (or still pending for a non-cancel outcome).
    pub(crate) fn complete(&self, entry: &JobEntry, outcome: JobOutcome) -> bool {
        let finished = {
            let mut job = entry.state.lock();
            finish_locked(&mut job, outcome)
        };
        match finished {
            Some(finished) => {
                entry.release_permit();
                self.announce(finished);
                self.evict_finished();
                true
            }
            None => false,
        }
    }

    pub(crate) fn force_timeout(&self, entry: &JobEntry, message: String) -> bool {
        let timed_out = self.complete(entry, JobOutcome::TimedOut(message));
        if timed_out {
            entry.cancel.cancel();
        }
        timed_out
    }

    fn announce(&self, finished: Finished) {
        let Finished {
            event,
            record,
            source,
        } = finished;

        match event.status {
            JobStatus::Succeeded => info!(job_id = %event.job_id, kind = %event.kind, "Job succeeded"),
            JobStatus::Cancelled => info!(job_id = %event.job_id, kind = %event.kind, "Job cancelled"),
            status => warn!(
                job_id = %event.job_id,
                kind = %event.kind,
                status = %status,
                error = ?event.error,
                "Job did not succeed"
            ),
        }
        metrics::counter!("conduit_jobs_completed_total", "status" => event.status.as_str()).increment(1);

        if let Err(e) = self.history.submit(record) {
            error!(job_id = %event.job_id, error = %e, "Failed to queue job history record");
        }

        match serde_json::to_value(&event) {
            Ok(payload) => {
                if let Err(e) = self.bus.publish_sticky(topics::JOB_COMPLETED, payload, &source, None) {
                    warn!(job_id = %event.job_id, error = %e, "Failed to publish job.completed");
                }
            }
            Err(e) => error!(job_id = %event.job_id, error = %e, "Failed to serialize job.completed"),
        }
    }

    /// Drop the oldest finished jobs beyond `history_limit` from the live
    /// table. Their records were queued to the history writer first.
    fn evict_finished(&self) {
        let mut finished: Vec<(JobId, chrono::DateTime<Utc>)> = self
            .jobs
            .iter()
            .filter_map(|entry| {
                let job = entry.state.lock();
                job.is_terminal()
                    .then(|| (job.id, job.completed_at.unwrap_or(job.created_at)))
            })
            .collect();
        if finished.len() <= self.config.history_limit {
            return;
        }

        finished.sort_by_key(|(_, completed_at)| *completed_at);
        let excess = finished.len() - self.config.history_limit;
        for (job_id, _) in finished.into_iter().take(excess) {
            self.jobs.remove(&job_id);
            debug!(job_id = %job_id, "Finished job evicted from live table");
        }
    }

    /// Make every queued record visible to store reads.
    async fn sync_history(&self) {
        match self.history.flush().await {
            Ok(()) | Err(HistoryError::WriterClosed) => {}
            Err(e) => warn!(error = %e, "Failed to flush job history"),
        }
    }

    // ------------------------------------------------------------------
    // Control
    // ------------------------------------------------------------------

    pub fn cancel_job(&self, job_id: JobId) -> Result<CancelOutcome, JobError> {
        let entry = self
            .jobs
            .get(&job_id)
            .map(|entry| entry.value().clone())
            .ok_or(JobError::NotFound(job_id))?;

        let (outcome, finished) = {
            let mut job = entry.state.lock();
            match job.status {
                JobStatus::Pending => (
                    CancelOutcome::Cancelled,
                    finish_locked(&mut job, JobOutcome::Cancelled(None)),
                ),
                JobStatus::Running => {
                    job.cancel_requested = true;
                    (CancelOutcome::Requested, None)
                }
                _ => (CancelOutcome::AlreadyFinished, None),
            }
        };

        if outcome != CancelOutcome::AlreadyFinished {
            entry.cancel.cancel();
        }
        if let Some(finished) = finished {
            self.announce(finished);
            self.evict_finished();
        }
        debug!(job_id = %job_id, outcome = ?outcome, "Cancel requested");
        Ok(outcome)
    }

    /// Time out every running job older than the hard ceiling.
    pub fn sweep_expired(&self) -> Vec<JobId> {
        let ceiling = chrono::Duration::from_std(self.config.hard_ceiling).unwrap_or(chrono::Duration::MAX);
        let now = Utc::now();

        let expired: Vec<Arc<JobEntry>> = self
            .jobs
            .iter()
            .filter(|entry| {
                let job = entry.state.lock();
                job.status == JobStatus::Running
                    && job.started_at.is_some_and(|started| now - started >= ceiling)
            })
            .map(|entry| entry.value().clone())
            .collect();

        let message = format!(
            "timeout: exceeded hard lifetime ceiling of {:?}",
            self.config.hard_ceiling
        );
        let mut reaped = Vec::new();
        for entry in expired {
            let job_id = entry.state.lock().id;
            if self.force_timeout(&entry, message.clone()) {
                reaped.push(job_id);
            }
        }
        reaped
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn get_job(&self, job_id: JobId) -> Option<Job> {
        self.jobs.get(&job_id).map(|entry| entry.state.lock().clone())
    }

    /// Live record if the job belongs to this run, otherwise the archived one
    pub async fn job_record(&self, job_id: JobId) -> Result<Option<JobRecord>, JobError> {
        if let Some(job) = self.get_job(job_id) {
            return Ok(Some(job.to_record()));
        }
        self.sync_history().await;
        Ok(self.store.find(job_id).await?)
    }

    /// Jobs of this run plus archived ones from earlier runs, newest first
    pub async fn list_jobs(&self, filter: JobFilter) -> Result<Vec<JobRecord>, JobError> {
        let mut records: Vec<JobRecord> = self
            .jobs
            .iter()
            .map(|entry| entry.state.lock().to_record())
            .collect();
        let live: HashSet<JobId> = records.iter().map(|record| record.job_id).collect();

        self.sync_history().await;
        let archived = self.store.read_all().await?;
        records.extend(
            archived
                .into_iter()
                .filter(|record| !live.contains(&record.job_id)),
        );

        records.retain(|record| filter.matches(record));
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = filter.limit {
            records.truncate(limit);
        }
        Ok(records)
    }

    pub fn active_jobs(&self) -> Vec<Job> {
        self.jobs
            .iter()
            .filter_map(|entry| {
                let job = entry.state.lock();
                (!job.is_terminal()).then(|| job.clone())
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Wait until every record queued so far is stored.
    pub async fn flush_history(&self) -> Result<(), JobError> {
        Ok(self.history.flush().await?)
    }

    /// Stop the reaper, then drain and stop the history writer. Running
    /// jobs are left alone.
    pub async fn shutdown(&self) {
        if let Some(reaper) = self.reaper.lock().take() {
            reaper.abort();
        }
        self.sync_history().await;
        self.history.close();

        let writer = self.writer.lock().take();
        if let Some(writer) = writer {
            if let Err(e) = writer.await {
                error!(error = %e, "Job history writer task failed");
            }
        }
        info!("Job manager shut down");
    }
}

impl Drop for JobManager {
    fn drop(&mut self) {
        if let Some(reaper) = self.reaper.get_mut().take() {
            reaper.abort();
        }
    }
}

fn finish_locked(job: &mut Job, outcome: JobOutcome) -> Option<Finished> {
    if let Err(e) = job.finish(outcome) {
        debug!(job_id = %job.id, reason = %e, "Late result discarded");
        return None;
    }
    Some(Finished {
        event: JobCompletedEvent::from_job(job),
        record: job.to_record(),
        source: job.source.clone(),
    })
}
