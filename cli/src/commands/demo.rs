// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Smoke tests for the bus and the job lifecycle
//!
//! Commands: bus, jobs

use anyhow::{ensure, Context, Result};
use clap::Subcommand;
use colored::Colorize;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use conduit_core::application::{work_fn, JobManager};
use conduit_core::domain::config::{BusConfig, ConduitConfig};
use conduit_core::domain::job::{JobId, JobStatus};
use conduit_core::domain::reply::Reply;
use conduit_core::domain::topics;
use conduit_core::infrastructure::history::InMemoryJobHistory;
use conduit_core::infrastructure::message_bus::MessageBus;

#[derive(Subcommand)]
pub enum DemoCommand {
    /// Exercise publish/subscribe and request/reply
    Bus,

    /// Run a succeeding, failing, timing-out and cancelled job
    Jobs {
        /// Budget of the job that never finishes, in milliseconds
        #[arg(long, default_value_t = 200)]
        timeout_ms: u64,
    },
}

pub async fn handle_command(command: DemoCommand, config_override: Option<PathBuf>) -> Result<()> {
    let config = ConduitConfig::load_or_default(config_override).context("Failed to load configuration")?;
    match command {
        DemoCommand::Bus => run_bus_demo(config.bus).await,
        DemoCommand::Jobs { timeout_ms } => run_jobs_demo(config, Duration::from_millis(timeout_ms)).await,
    }
}

/// Handler that answers slower than the demo's request timeout
const SLOW_REQUEST: &str = "demo.slow.request";

fn step(message: &str) {
    println!("{} {}", "[demo]".cyan(), message);
}

pub async fn run_bus_demo(config: BusConfig) -> Result<()> {
    let bus = Arc::new(MessageBus::new(config));
    exercise_bus(&bus).await?;
    step("runtime bus demo complete");
    Ok(())
}

async fn exercise_bus(bus: &MessageBus) -> Result<()> {
    step("testing pub/sub");
    let received = Arc::new(AtomicU64::new(0));
    let sink = received.clone();
    let subscription = bus.subscribe(topics::LAB_TELEMETRY, move |envelope| {
        let value = envelope
            .get("value")
            .and_then(Value::as_u64)
            .context("telemetry without value")?;
        sink.store(value, Ordering::SeqCst);
        Ok(())
    })?;
    bus.publish(topics::LAB_TELEMETRY, json!({"value": 42}), "demo", None)?;
    ensure!(
        received.load(Ordering::SeqCst) == 42,
        "pub/sub test failed: no message received"
    );
    bus.unsubscribe(subscription);
    step(&"pub/sub ok".green().to_string());

    step("testing request/reply");
    bus.register_handler(topics::CORE_STORAGE_REPORT_REQUEST, |envelope| {
        let mut data = envelope.payload().clone();
        if let Some(map) = data.as_object_mut() {
            map.insert("handled".to_string(), Value::Bool(true));
        }
        Ok(Reply::ok().with("data", data))
    })?;
    let reply = bus
        .request(
            topics::CORE_STORAGE_REPORT_REQUEST,
            json!({"report": "now"}),
            "demo",
            Duration::from_millis(500),
        )
        .await;
    ensure!(
        reply.ok && reply.get("data").map(|data| &data["report"]) == Some(&json!("now")),
        "request/reply test failed: {:?}",
        reply
    );
    step(&"request/reply ok".green().to_string());

    step("testing timeout");
    bus.register_handler(SLOW_REQUEST, |_| {
        std::thread::sleep(Duration::from_millis(200));
        Ok(Reply::ok())
    })?;
    let reply = bus
        .request(
            SLOW_REQUEST,
            json!({"report": "slow"}),
            "demo",
            Duration::from_millis(50),
        )
        .await;
    ensure!(reply.is_timeout(), "timeout test failed: {:?}", reply);

    let reply = bus
        .request("non.existing.topic", json!({"payload": 1}), "demo", Duration::from_millis(100))
        .await;
    ensure!(
        !reply.ok && reply.error_message() == Some(Reply::NO_HANDLER),
        "no-handler test failed: {:?}",
        reply
    );
    step(&"timeout/absence handling ok".green().to_string());
    Ok(())
}

pub async fn run_jobs_demo(config: ConduitConfig, timeout: Duration) -> Result<()> {
    let bus = Arc::new(MessageBus::new(config.bus));
    let store = Arc::new(InMemoryJobHistory::new(config.jobs.history_limit));
    let manager = JobManager::new(bus.clone(), store, config.jobs)?;

    bus.subscribe(topics::JOB_COMPLETED, |envelope| {
        tracing::info!(
            job_id = %envelope.get("job_id").cloned().unwrap_or_default(),
            status = %envelope.get("status").cloned().unwrap_or_default(),
            "job.completed"
        );
        Ok(())
    })?;

    let succeeding = manager.create_job(
        "demo.succeed",
        work_fn(|ctx| async move {
            ctx.progress_percent(50.0, "halfway");
            Ok(json!({"summary": "finished the happy path"}))
        }),
        None,
    )?;
    let failing = manager.create_job(
        "demo.fail",
        work_fn(|_ctx| async { anyhow::bail!("bad input") }),
        None,
    )?;
    let timing_out = manager.create_job(
        "demo.timeout",
        work_fn(|_ctx| async { std::future::pending::<Result<Value>>().await }),
        Some(timeout),
    )?;

    let started = Arc::new(Notify::new());
    let signal = started.clone();
    let cancelled = manager.create_job(
        "demo.cancel",
        work_fn(move |ctx| {
            let signal = signal.clone();
            async move {
                signal.notify_one();
                ctx.cancelled().await;
                anyhow::bail!("stopped on request")
            }
        }),
        None,
    )?;
    started.notified().await;
    manager.cancel_job(cancelled)?;

    let expected = [
        (succeeding, JobStatus::Succeeded),
        (failing, JobStatus::Failed),
        (timing_out, JobStatus::TimedOut),
        (cancelled, JobStatus::Cancelled),
    ];
    let finished = futures::future::join_all(
        expected
            .iter()
            .map(|(job_id, _)| wait_for_terminal(&manager, *job_id, timeout * 10)),
    )
    .await;

    let mut failures = 0;
    for ((job_id, want), got) in expected.iter().zip(finished) {
        let job = manager.get_job(*job_id).context("job vanished")?;
        let line = format!(
            "{:<14} {:<10} {}",
            job.kind,
            got.as_str(),
            job.error.as_deref().unwrap_or("")
        );
        if got == *want {
            println!("  {} {}", "✓".green(), line);
        } else {
            failures += 1;
            println!("  {} {} (expected {})", "✗".red(), line, want);
        }
    }

    manager.shutdown().await;
    ensure!(failures == 0, "{} job(s) ended in an unexpected state", failures);
    step("job lifecycle demo complete");
    Ok(())
}

async fn wait_for_terminal(manager: &JobManager, job_id: JobId, limit: Duration) -> JobStatus {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        let status = manager
            .get_job(job_id)
            .map_or(JobStatus::Pending, |job| job.status);
        if status.is_terminal() || tokio::time::Instant::now() >= deadline {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
