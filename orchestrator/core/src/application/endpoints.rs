// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Request/reply endpoints exposing the job manager on the bus.
//!
//! | topic                        | payload                          | reply                 |
//! |------------------------------|----------------------------------|-----------------------|
//! | `job.submit.request`         | `{kind, payload?, timeout_ms?}`  | `{ok, job_id}`        |
//! | `job.status.request`         | `{job_id}`                       | `{ok, job}`           |
//! | `job.list.request`           | `{kind?, status?, limit?}`       | `{ok, jobs}`          |
//! | `job.cancel.request`         | `{job_id}`                       | `{ok, outcome}`       |
//! | `runtime.bus.report.request` | `{}`                             | `{ok, report}`        |
//!
//! Handlers hold weak references, so registering them never keeps the
//! manager or the bus alive.

use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::application::job_manager::{JobFilter, JobManager};
use crate::domain::envelope::Envelope;
use crate::domain::job::{JobError, JobId};
use crate::domain::reply::Reply;
use crate::domain::topics;
use crate::infrastructure::message_bus::{BusError, MessageBus};

const UNKNOWN_JOB: &str = "unknown_job";
const NOT_FOUND: &str = "not_found";
const MANAGER_UNAVAILABLE: &str = "job_manager_unavailable";

#[derive(Debug, Deserialize)]
struct SubmitRequest {
    kind: String,
    #[serde(default)]
    payload: Value,
    timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct JobIdRequest {
    job_id: String,
}

/// Bind the job and diagnostics endpoints. A second call on the same bus
/// is a no-op.
pub fn register_job_endpoints(bus: &Arc<MessageBus>, manager: &Arc<JobManager>) -> Result<(), BusError> {
    if bus.has_handler(topics::JOB_SUBMIT_REQUEST) {
        debug!("Job endpoints already registered");
        return Ok(());
    }
    bus.mark_sticky(topics::JOB_COMPLETED)?;

    let weak = Arc::downgrade(manager);
    bus.register_handler(topics::JOB_SUBMIT_REQUEST, move |envelope| {
        with_manager(&weak, |manager| handle_submit(manager, envelope))
    })?;

    let weak = Arc::downgrade(manager);
    bus.register_handler(topics::JOB_STATUS_REQUEST, move |envelope| {
        with_manager(&weak, |manager| handle_status(manager, envelope))
    })?;

    let weak = Arc::downgrade(manager);
    bus.register_handler(topics::JOB_LIST_REQUEST, move |envelope| {
        with_manager(&weak, |manager| handle_list(manager, envelope))
    })?;

    let weak = Arc::downgrade(manager);
    bus.register_handler(topics::JOB_CANCEL_REQUEST, move |envelope| {
        with_manager(&weak, |manager| handle_cancel(manager, envelope))
    })?;

    let weak_bus = Arc::downgrade(bus);
    bus.register_handler(topics::RUNTIME_BUS_REPORT_REQUEST, move |_envelope| {
        match weak_bus.upgrade() {
            Some(bus) => Ok(Reply::ok().with("report", serde_json::to_value(bus.report())?)),
            None => Ok(Reply::error("bus_unavailable")),
        }
    })?;

    info!("Job endpoints registered");
    Ok(())
}

fn with_manager<F>(weak: &Weak<JobManager>, f: F) -> anyhow::Result<Reply>
where
    F: FnOnce(&Arc<JobManager>) -> anyhow::Result<Reply>,
{
    match weak.upgrade() {
        Some(manager) => f(&manager),
        None => Ok(Reply::error(MANAGER_UNAVAILABLE)),
    }
}

fn parse<T: serde::de::DeserializeOwned>(envelope: &Envelope) -> Result<T, Reply> {
    envelope
        .payload_as::<T>()
        .map_err(|e| Reply::error(format!("invalid_payload: {e}")))
}

fn parse_job_id(envelope: &Envelope) -> Result<JobId, Reply> {
    let request: JobIdRequest = parse(envelope)?;
    JobId::parse(&request.job_id)
        .ok_or_else(|| Reply::error(format!("invalid_payload: bad job_id '{}'", request.job_id)))
}

fn handle_submit(manager: &Arc<JobManager>, envelope: &Envelope) -> anyhow::Result<Reply> {
    let request: SubmitRequest = match parse(envelope) {
        Ok(request) => request,
        Err(reply) => return Ok(reply),
    };
    let budget = request.timeout_ms.map(Duration::from_millis);

    let reply = match manager.submit(&request.kind, request.payload, envelope.source(), budget) {
        Ok(job_id) => Reply::ok().with("job_id", job_id.to_string()),
        Err(JobError::UnknownKind(_)) => Reply::error(UNKNOWN_JOB),
        Err(JobError::InvalidPayload(message)) => Reply::error(format!("invalid_payload: {message}")),
        Err(e) => Reply::error(e.to_string()),
    };
    Ok(reply)
}

fn handle_status(manager: &Arc<JobManager>, envelope: &Envelope) -> anyhow::Result<Reply> {
    let job_id = match parse_job_id(envelope) {
        Ok(job_id) => job_id,
        Err(reply) => return Ok(reply),
    };

    if let Some(job) = manager.get_job(job_id) {
        return Ok(Reply::ok().with("job", serde_json::to_value(job)?));
    }

    // handlers run on the blocking pool, so waiting on the store is allowed
    let record = manager.runtime().block_on(manager.job_record(job_id))?;
    Ok(match record {
        Some(record) => Reply::ok().with("job", serde_json::to_value(record)?),
        None => Reply::error(NOT_FOUND),
    })
}

fn handle_list(manager: &Arc<JobManager>, envelope: &Envelope) -> anyhow::Result<Reply> {
    let filter: JobFilter = match parse(envelope) {
        Ok(filter) => filter,
        Err(reply) => return Ok(reply),
    };
    let jobs = manager.runtime().block_on(manager.list_jobs(filter))?;
    Ok(Reply::ok().with("jobs", serde_json::to_value(jobs)?))
}

fn handle_cancel(manager: &Arc<JobManager>, envelope: &Envelope) -> anyhow::Result<Reply> {
    let job_id = match parse_job_id(envelope) {
        Ok(job_id) => job_id,
        Err(reply) => return Ok(reply),
    };
    Ok(match manager.cancel_job(job_id) {
        Ok(outcome) => Reply::ok().with("outcome", serde_json::to_value(outcome)?),
        Err(JobError::NotFound(_)) => Reply::error(NOT_FOUND),
        Err(e) => Reply::error(e.to_string()),
    })
}
