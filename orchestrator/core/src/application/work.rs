// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Job work contract and the context handed to running work.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::application::job_manager::JobEntry;
use crate::domain::events::JobProgressEvent;
use crate::domain::job::JobId;
use crate::domain::topics;
use crate::infrastructure::message_bus::MessageBus;

/// A unit of background work run by the `JobManager`.
///
/// `Ok` finishes the job as succeeded with the returned value as result,
/// `Err` finishes it as failed.
#[async_trait]
pub trait JobWork: Send + Sync + 'static {
    async fn run(&self, ctx: JobContext) -> anyhow::Result<Value>;
}

/// Handle given to running work: progress reporting, bus access and the
/// cooperative cancellation signal.
#[derive(Clone)]
pub struct JobContext {
    job_id: JobId,
    kind: String,
    source: String,
    bus: Arc<MessageBus>,
    entry: Arc<JobEntry>,
}

impl JobContext {
    pub(crate) fn new(
        job_id: JobId,
        kind: String,
        source: String,
        bus: Arc<MessageBus>,
        entry: Arc<JobEntry>,
    ) -> Self {
        Self {
            job_id,
            kind,
            source,
            bus,
            entry,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    /// Store a progress snapshot and publish `job.progress`.
    ///
    /// Dropped once the job is terminal, e.g. after a timeout. The status is
    /// checked again right before publishing; a terminal transition landing
    /// between that check and delivery can still order this event after
    /// `job.completed`, so consumers should ignore progress for a job they
    /// have already seen complete.
    pub fn progress(&self, progress: Value) {
        if !self.entry.state.lock().record_progress(progress.clone()) {
            debug!(job_id = %self.job_id, "Progress after terminal state dropped");
            return;
        }
        if self.entry.state.lock().is_terminal() {
            debug!(job_id = %self.job_id, "Job finished before progress was published");
            return;
        }
        let event = JobProgressEvent {
            job_id: self.job_id,
            kind: self.kind.clone(),
            progress,
        };
        if let Err(e) = self.bus.publish_event(topics::JOB_PROGRESS, &event, &self.source) {
            warn!(job_id = %self.job_id, error = %e, "Failed to publish job progress");
        }
    }

    pub fn progress_percent(&self, percent: f64, stage: &str) {
        self.progress(json!({ "percent": percent, "stage": stage }));
    }

    /// Publish on behalf of the job; object payloads get a `job_id` field
    /// unless they already carry one.
    pub fn publish(&self, topic: &str, payload: Value) {
        let payload = match payload {
            Value::Object(mut map) => {
                map.entry("job_id")
                    .or_insert_with(|| Value::String(self.job_id.to_string()));
                Value::Object(map)
            }
            Value::Null => {
                let mut map = Map::new();
                map.insert("job_id".to_string(), Value::String(self.job_id.to_string()));
                Value::Object(map)
            }
            other => other,
        };
        if let Err(e) = self.bus.publish(topic, payload, &self.source, None) {
            warn!(job_id = %self.job_id, topic = %topic, error = %e, "Job publish failed");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.entry.cancel.is_cancelled()
    }

    /// Resolves once cancellation was requested or the job timed out.
    pub async fn cancelled(&self) {
        self.entry.cancel.cancelled().await
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.entry.cancel.clone()
    }
}

/// Adapter for async closures, see [`work_fn`].
pub struct FnWork<F>(F);

#[async_trait]
impl<F, Fut> JobWork for FnWork<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn run(&self, ctx: JobContext) -> anyhow::Result<Value> {
        (self.0)(ctx).await
    }
}

/// Build job work from an async closure.
pub fn work_fn<F, Fut>(f: F) -> Arc<dyn JobWork>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Arc::new(FnWork(f))
}

/// Adapter for synchronous closures run on the blocking pool, see
/// [`blocking_work`].
pub struct BlockingWork<F>(Arc<F>);

#[async_trait]
impl<F> JobWork for BlockingWork<F>
where
    F: Fn(JobContext) -> anyhow::Result<Value> + Send + Sync + 'static,
{
    async fn run(&self, ctx: JobContext) -> anyhow::Result<Value> {
        let f = self.0.clone();
        match tokio::task::spawn_blocking(move || f(ctx)).await {
            Ok(result) => result,
            // surface the panic to the job task so it is reported like any other
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(e) => Err(anyhow::anyhow!("blocking work was cancelled: {e}")),
        }
    }
}

/// Build job work from a synchronous closure, e.g. file system or CPU bound
/// work that must not stall the async workers.
pub fn blocking_work<F>(f: F) -> Arc<dyn JobWork>
where
    F: Fn(JobContext) -> anyhow::Result<Value> + Send + Sync + 'static,
{
    Arc::new(BlockingWork(Arc::new(f)))
}
