// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use conduit_core::application::{blocking_work, work_fn, CancelOutcome, JobFilter, JobManager, JobSpec};
use conduit_core::domain::config::JobConfig;
use conduit_core::domain::events::{JobCompletedEvent, JobProgressEvent};
use conduit_core::domain::history::JobHistoryStore;
use conduit_core::domain::job::{Job, JobError, JobId, JobStatus};
use conduit_core::domain::topics;
use conduit_core::infrastructure::history::{InMemoryJobHistory, JsonFileJobHistory};
use conduit_core::infrastructure::message_bus::MessageBus;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

struct Harness {
    bus: Arc<MessageBus>,
    store: Arc<InMemoryJobHistory>,
    manager: Arc<JobManager>,
    completed: Arc<Mutex<Vec<JobCompletedEvent>>>,
}

fn harness(config: JobConfig) -> Harness {
    let bus = Arc::new(MessageBus::with_defaults());
    let store = Arc::new(InMemoryJobHistory::new(config.history_limit));
    let manager = JobManager::new(bus.clone(), store.clone(), config).unwrap();

    let completed = Arc::new(Mutex::new(Vec::new()));
    let sink = completed.clone();
    bus.subscribe(topics::JOB_COMPLETED, move |envelope| {
        sink.lock().push(envelope.payload_as::<JobCompletedEvent>()?);
        Ok(())
    })
    .unwrap();

    Harness {
        bus,
        store,
        manager,
        completed,
    }
}

fn quiet_config() -> JobConfig {
    JobConfig {
        reaper_interval: None,
        ..JobConfig::default()
    }
}

impl Harness {
    fn completions_of(&self, job_id: JobId) -> usize {
        self.completed
            .lock()
            .iter()
            .filter(|event| event.job_id == job_id)
            .count()
    }
}

async fn wait_for_terminal(manager: &JobManager, job_id: JobId) -> Job {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(job) = manager.get_job(job_id) {
                if job.is_terminal() {
                    return job;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("job did not finish in time")
}

async fn wait_for_running(manager: &JobManager, job_id: JobId) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while manager.get_job(job_id).map(|job| job.status) != Some(JobStatus::Running) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("job did not start in time")
}

#[tokio::test]
async fn test_succeeding_job_publishes_lifecycle() {
    let h = harness(quiet_config());
    let started = Arc::new(Mutex::new(Vec::new()));
    let sink = started.clone();
    h.bus
        .subscribe(topics::JOB_STARTED, move |envelope| {
            sink.lock().push(envelope.source().to_string());
            Ok(())
        })
        .unwrap();

    let job_id = h
        .manager
        .create_job_with(
            JobSpec::new("core.report.generate").with_source("ui"),
            work_fn(|_ctx| async { Ok(json!({"summary": "3 modules", "json": {"modules": 3}})) }),
        )
        .unwrap();

    let job = wait_for_terminal(&h.manager, job_id).await;
    assert_eq!(job.status, JobStatus::Succeeded);
    assert_eq!(job.result, Some(json!({"summary": "3 modules", "json": {"modules": 3}})));
    assert!(job.started_at.is_some() && job.completed_at.is_some());
    assert_eq!(*started.lock(), vec!["ui".to_string()]);

    let completed = h.completed.lock().clone();
    assert_eq!(completed.len(), 1);
    assert!(completed[0].ok);
    assert_eq!(completed[0].kind, "core.report.generate");

    h.manager.flush_history().await.unwrap();
    let record = h.store.find(job_id).await.unwrap().unwrap();
    assert_eq!(record.result_summary.as_deref(), Some("3 modules"));
    assert_eq!(record.source, "ui");
}

#[tokio::test]
async fn test_failing_job_ends_failed_with_error() {
    let h = harness(quiet_config());
    let job_id = h
        .manager
        .create_job("noop", work_fn(|_ctx| async { anyhow::bail!("bad") }), None)
        .unwrap();

    let job = wait_for_terminal(&h.manager, job_id).await;
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error.as_deref().unwrap().contains("bad"));

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(h.completions_of(job_id), 1);
    let event = h.completed.lock()[0].clone();
    assert!(!event.ok);
    assert_eq!(event.status, JobStatus::Failed);
}

#[tokio::test]
async fn test_panicking_job_is_contained() {
    let h = harness(quiet_config());
    let job_id = h
        .manager
        .create_job(
            "explodes",
            work_fn(|_ctx| async {
                if true {
                    panic!("index out of range");
                }
                Ok(Value::Null)
            }),
            None,
        )
        .unwrap();

    let job = wait_for_terminal(&h.manager, job_id).await;
    assert_eq!(job.status, JobStatus::Failed);
    let error = job.error.unwrap();
    assert!(error.starts_with("work panicked"), "{error}");
    assert!(error.contains("index out of range"));

    // the manager keeps working after a panic
    let next = h
        .manager
        .create_job("quick", work_fn(|_ctx| async { Ok(json!(1)) }), None)
        .unwrap();
    assert_eq!(wait_for_terminal(&h.manager, next).await.status, JobStatus::Succeeded);
}

#[tokio::test]
async fn test_never_returning_job_times_out_once() {
    let h = harness(quiet_config());
    let begin = Instant::now();
    let job_id = h
        .manager
        .create_job(
            "slow",
            work_fn(|_ctx| async { std::future::pending::<anyhow::Result<Value>>().await }),
            Some(Duration::from_millis(100)),
        )
        .unwrap();

    let job = wait_for_terminal(&h.manager, job_id).await;
    let elapsed = begin.elapsed();
    assert_eq!(job.status, JobStatus::TimedOut);
    assert!(elapsed >= Duration::from_millis(100), "timed out early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(1), "timed out late: {elapsed:?}");
    assert!(job.error.unwrap().contains("timeout"));
    assert_eq!(h.completions_of(job_id), 1);
}

#[tokio::test]
async fn test_late_worker_result_is_discarded() {
    let h = harness(quiet_config());
    let finished_work = Arc::new(AtomicBool::new(false));
    let flag = finished_work.clone();

    let job_id = h
        .manager
        .create_job(
            "stubborn",
            work_fn(move |_ctx| {
                let flag = flag.clone();
                async move {
                    // ignores the cancellation hint
                    tokio::time::sleep(Duration::from_millis(250)).await;
                    flag.store(true, Ordering::SeqCst);
                    Ok(json!({"late": true}))
                }
            }),
            Some(Duration::from_millis(50)),
        )
        .unwrap();

    let job = wait_for_terminal(&h.manager, job_id).await;
    assert_eq!(job.status, JobStatus::TimedOut);

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(finished_work.load(Ordering::SeqCst));
    let job = h.manager.get_job(job_id).unwrap();
    assert_eq!(job.status, JobStatus::TimedOut);
    assert!(job.result.is_none());
    assert_eq!(h.completions_of(job_id), 1);
}

#[tokio::test]
async fn test_budget_above_hard_ceiling_is_capped() {
    let h = harness(JobConfig {
        hard_ceiling: Duration::from_millis(80),
        reaper_interval: None,
        ..JobConfig::default()
    });
    let job_id = h
        .manager
        .create_job(
            "forever",
            work_fn(|_ctx| async { std::future::pending::<anyhow::Result<Value>>().await }),
            Some(Duration::from_secs(3600)),
        )
        .unwrap();

    let job = wait_for_terminal(&h.manager, job_id).await;
    assert_eq!(job.status, JobStatus::TimedOut);
    assert!(job.error.unwrap().contains("hard lifetime ceiling"));
}

#[tokio::test]
async fn test_default_timeout_applies_without_budget() {
    let h = harness(JobConfig {
        default_timeout: Some(Duration::from_millis(60)),
        reaper_interval: None,
        ..JobConfig::default()
    });
    let job_id = h
        .manager
        .create_job(
            "forever",
            work_fn(|_ctx| async { std::future::pending::<anyhow::Result<Value>>().await }),
            None,
        )
        .unwrap();

    let job = wait_for_terminal(&h.manager, job_id).await;
    assert_eq!(job.status, JobStatus::TimedOut);
    assert!(job.error.unwrap().contains("budget"));
}

#[tokio::test]
async fn test_timeout_signals_cancellation_token() {
    let h = harness(quiet_config());
    let observed = Arc::new(AtomicBool::new(false));
    let flag = observed.clone();

    let job_id = h
        .manager
        .create_job(
            "cooperative",
            work_fn(move |ctx| {
                let flag = flag.clone();
                async move {
                    ctx.cancelled().await;
                    flag.store(true, Ordering::SeqCst);
                    Ok(Value::Null)
                }
            }),
            Some(Duration::from_millis(40)),
        )
        .unwrap();

    assert_eq!(wait_for_terminal(&h.manager, job_id).await.status, JobStatus::TimedOut);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(observed.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_cancel_pending_job_never_runs_work() {
    let h = harness(quiet_config());
    let invoked = Arc::new(AtomicBool::new(false));
    let flag = invoked.clone();

    let job_id = h
        .manager
        .create_job(
            "never",
            work_fn(move |_ctx| {
                let flag = flag.clone();
                async move {
                    flag.store(true, Ordering::SeqCst);
                    Ok(Value::Null)
                }
            }),
            None,
        )
        .unwrap();

    // the job task has not been polled yet on this single-threaded runtime
    assert_eq!(h.manager.cancel_job(job_id).unwrap(), CancelOutcome::Cancelled);
    assert_eq!(h.manager.get_job(job_id).unwrap().status, JobStatus::Cancelled);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!invoked.load(Ordering::SeqCst));
    assert_eq!(h.completions_of(job_id), 1);
    assert_eq!(h.manager.cancel_job(job_id).unwrap(), CancelOutcome::AlreadyFinished);
}

#[tokio::test]
async fn test_cancel_running_job_is_cooperative() {
    let h = harness(quiet_config());
    let job_id = h
        .manager
        .create_job(
            "listener",
            work_fn(|ctx| async move {
                ctx.cancelled().await;
                anyhow::bail!("stopped on request")
            }),
            None,
        )
        .unwrap();
    wait_for_running(&h.manager, job_id).await;

    assert_eq!(h.manager.cancel_job(job_id).unwrap(), CancelOutcome::Requested);
    let job = wait_for_terminal(&h.manager, job_id).await;
    assert_eq!(job.status, JobStatus::Cancelled);
    assert!(job.cancel_requested);
    assert!(job.error.unwrap().contains("stopped on request"));
}

#[tokio::test]
async fn test_cancel_unknown_job() {
    let h = harness(quiet_config());
    let missing = JobId::new();
    assert!(matches!(h.manager.cancel_job(missing), Err(JobError::NotFound(id)) if id == missing));
}

#[tokio::test]
async fn test_progress_is_published_and_stored() {
    let h = harness(quiet_config());
    let progress = Arc::new(Mutex::new(Vec::new()));
    let sink = progress.clone();
    h.bus
        .subscribe(topics::JOB_PROGRESS, move |envelope| {
            sink.lock().push(envelope.payload_as::<JobProgressEvent>()?);
            Ok(())
        })
        .unwrap();
    let cleanup_events = Arc::new(Mutex::new(Vec::new()));
    let sink = cleanup_events.clone();
    h.bus
        .subscribe(topics::CORE_CLEANUP_COMPLETED, move |envelope| {
            sink.lock().push(envelope.payload().clone());
            Ok(())
        })
        .unwrap();

    let job_id = h
        .manager
        .create_job(
            "cleanup.cache",
            work_fn(|ctx| async move {
                ctx.progress_percent(10.0, "scan");
                ctx.progress_percent(100.0, "done");
                ctx.publish(topics::CORE_CLEANUP_COMPLETED, json!({"freed_bytes": 42}));
                Ok(json!({"summary": "freed 42 bytes"}))
            }),
            None,
        )
        .unwrap();

    let job = wait_for_terminal(&h.manager, job_id).await;
    assert_eq!(job.progress, Some(json!({"percent": 100.0, "stage": "done"})));

    let progress = progress.lock();
    assert_eq!(progress.len(), 2);
    assert!(progress.iter().all(|event| event.job_id == job_id));
    assert_eq!(progress[0].progress["stage"], json!("scan"));

    let cleanup_events = cleanup_events.lock();
    assert_eq!(
        cleanup_events[0],
        json!({"freed_bytes": 42, "job_id": job_id.to_string()})
    );
}

#[tokio::test]
async fn test_progress_after_timeout_is_not_published() {
    let h = harness(quiet_config());
    let progress = Arc::new(Mutex::new(Vec::new()));
    let sink = progress.clone();
    h.bus
        .subscribe(topics::JOB_PROGRESS, move |envelope| {
            sink.lock().push(envelope.payload_as::<JobProgressEvent>()?);
            Ok(())
        })
        .unwrap();

    let reported = Arc::new(AtomicBool::new(false));
    let flag = reported.clone();
    let job_id = h
        .manager
        .create_job(
            "late.progress",
            work_fn(move |ctx| {
                let flag = flag.clone();
                async move {
                    ctx.cancelled().await;
                    ctx.progress(json!({"stage": "after timeout"}));
                    flag.store(true, Ordering::SeqCst);
                    std::future::pending::<anyhow::Result<Value>>().await
                }
            }),
            Some(Duration::from_millis(30)),
        )
        .unwrap();

    assert_eq!(wait_for_terminal(&h.manager, job_id).await.status, JobStatus::TimedOut);
    tokio::time::timeout(Duration::from_secs(2), async {
        while !reported.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    assert!(progress.lock().is_empty());
    assert!(h.manager.get_job(job_id).unwrap().progress.is_none());
}

#[tokio::test]
async fn test_blocking_work_runs_on_blocking_pool() {
    let h = harness(quiet_config());
    let job_id = h
        .manager
        .create_job(
            "hash.files",
            blocking_work(|ctx| {
                std::thread::sleep(Duration::from_millis(20));
                ctx.progress(json!({"files": 3}));
                Ok(json!({"summary": "hashed 3 files"}))
            }),
            None,
        )
        .unwrap();

    let job = wait_for_terminal(&h.manager, job_id).await;
    assert_eq!(job.status, JobStatus::Succeeded);
    assert_eq!(job.progress, Some(json!({"files": 3})));
}

#[tokio::test]
async fn test_blocking_work_panic_is_reported() {
    let h = harness(quiet_config());
    let job_id = h
        .manager
        .create_job("bad.blocking", blocking_work(|_ctx| panic!("sync boom")), None)
        .unwrap();

    let job = wait_for_terminal(&h.manager, job_id).await;
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error.unwrap().contains("sync boom"));
}

#[tokio::test]
async fn test_concurrency_limit_keeps_jobs_pending() {
    let h = harness(JobConfig {
        max_concurrent_jobs: Some(1),
        reaper_interval: None,
        ..JobConfig::default()
    });

    let gate = Arc::new(tokio::sync::Notify::new());
    let release = gate.clone();
    let first = h
        .manager
        .create_job(
            "first",
            work_fn(move |_ctx| {
                let gate = gate.clone();
                async move {
                    gate.notified().await;
                    Ok(Value::Null)
                }
            }),
            None,
        )
        .unwrap();
    let second = h
        .manager
        .create_job("second", work_fn(|_ctx| async { Ok(json!("second")) }), None)
        .unwrap();

    wait_for_running(&h.manager, first).await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(h.manager.get_job(second).unwrap().status, JobStatus::Pending);
    assert_eq!(h.manager.active_jobs().len(), 2);

    release.notify_one();
    assert_eq!(wait_for_terminal(&h.manager, second).await.status, JobStatus::Succeeded);
    assert!(h.manager.active_jobs().is_empty());
}

#[tokio::test]
async fn test_cancel_while_queued_for_permit() {
    let h = harness(JobConfig {
        max_concurrent_jobs: Some(1),
        reaper_interval: None,
        ..JobConfig::default()
    });
    let blocker = h
        .manager
        .create_job(
            "blocker",
            work_fn(|ctx| async move {
                ctx.cancelled().await;
                Ok(Value::Null)
            }),
            None,
        )
        .unwrap();
    let queued = h
        .manager
        .create_job("queued", work_fn(|_ctx| async { Ok(Value::Null) }), None)
        .unwrap();
    wait_for_running(&h.manager, blocker).await;

    assert_eq!(h.manager.cancel_job(queued).unwrap(), CancelOutcome::Cancelled);
    assert_eq!(h.manager.cancel_job(blocker).unwrap(), CancelOutcome::Requested);

    // ctx.cancelled() returned Ok, so the blocker still counts as succeeded
    assert_eq!(wait_for_terminal(&h.manager, blocker).await.status, JobStatus::Succeeded);
    assert_eq!(h.manager.get_job(queued).unwrap().status, JobStatus::Cancelled);
}

#[tokio::test]
async fn test_timed_out_job_frees_its_slot_for_queued_jobs() {
    let h = harness(JobConfig {
        max_concurrent_jobs: Some(1),
        reaper_interval: None,
        ..JobConfig::default()
    });
    let stuck = h
        .manager
        .create_job(
            "stuck",
            work_fn(|_ctx| async { std::future::pending::<anyhow::Result<Value>>().await }),
            Some(Duration::from_millis(50)),
        )
        .unwrap();
    let next = h
        .manager
        .create_job("quick", work_fn(|_ctx| async { Ok(json!({})) }), None)
        .unwrap();

    assert_eq!(wait_for_terminal(&h.manager, stuck).await.status, JobStatus::TimedOut);
    assert_eq!(wait_for_terminal(&h.manager, next).await.status, JobStatus::Succeeded);
}

#[tokio::test]
async fn test_cancel_ignored_by_work_frees_slot_at_timeout() {
    let h = harness(JobConfig {
        max_concurrent_jobs: Some(1),
        reaper_interval: None,
        ..JobConfig::default()
    });
    let stubborn = h
        .manager
        .create_job(
            "stubborn",
            work_fn(|_ctx| async { std::future::pending::<anyhow::Result<Value>>().await }),
            Some(Duration::from_millis(80)),
        )
        .unwrap();
    let queued = h
        .manager
        .create_job("queued", work_fn(|_ctx| async { Ok(json!("ran")) }), None)
        .unwrap();
    wait_for_running(&h.manager, stubborn).await;

    assert_eq!(h.manager.cancel_job(stubborn).unwrap(), CancelOutcome::Requested);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(h.manager.get_job(queued).unwrap().status, JobStatus::Pending);

    assert_eq!(wait_for_terminal(&h.manager, stubborn).await.status, JobStatus::TimedOut);
    let job = wait_for_terminal(&h.manager, queued).await;
    assert_eq!(job.status, JobStatus::Succeeded);
    assert_eq!(job.result, Some(json!("ran")));
}

#[tokio::test]
async fn test_job_completed_is_replayed_to_late_subscribers() {
    let h = harness(quiet_config());
    let job_id = h
        .manager
        .create_job("quick", work_fn(|_ctx| async { Ok(json!(1)) }), None)
        .unwrap();
    wait_for_terminal(&h.manager, job_id).await;

    let replayed = Arc::new(Mutex::new(Vec::new()));
    let sink = replayed.clone();
    h.bus
        .subscribe_with_replay(topics::JOB_COMPLETED, move |envelope| {
            sink.lock().push(envelope.payload_as::<JobCompletedEvent>()?.job_id);
            Ok(())
        })
        .unwrap();
    assert_eq!(*replayed.lock(), vec![job_id]);
}

#[tokio::test]
async fn test_history_survives_manager_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("jobs.json");
    let bus = Arc::new(MessageBus::with_defaults());

    let first_run = JobManager::new(bus.clone(), Arc::new(JsonFileJobHistory::new(&path, 50)), quiet_config())
        .unwrap();
    let mut ids = Vec::new();
    for n in 0..3 {
        let id = first_run
            .create_job(
                format!("report.{n}"),
                work_fn(move |_ctx| async move { Ok(json!({ "summary": format!("run {n}") })) }),
                None,
            )
            .unwrap();
        wait_for_terminal(&first_run, id).await;
        ids.push(id);
    }
    first_run.shutdown().await;

    let store = Arc::new(JsonFileJobHistory::new(&path, 50));
    let stored = store.read_all().await.unwrap();
    let stored_ids: Vec<_> = stored.iter().map(|record| record.job_id).collect();
    // completion order, newest first
    assert_eq!(stored_ids, vec![ids[2], ids[1], ids[0]]);

    let second_run = JobManager::new(bus, store, quiet_config()).unwrap();
    let live = second_run
        .create_job("report.live", work_fn(|_ctx| async { Ok(json!(null)) }), None)
        .unwrap();
    wait_for_terminal(&second_run, live).await;

    let all = second_run.list_jobs(JobFilter::default()).await.unwrap();
    assert_eq!(all.len(), 4);
    assert_eq!(all[0].job_id, live);

    let filtered = second_run
        .list_jobs(JobFilter {
            kind: Some("report.1".into()),
            ..JobFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(filtered.len(), 1);
    assert_eq!(filtered[0].result_summary.as_deref(), Some("run 1"));

    let limited = second_run
        .list_jobs(JobFilter {
            limit: Some(2),
            ..JobFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(limited.len(), 2);

    assert!(second_run.get_job(ids[0]).is_none());
    let archived = second_run.job_record(ids[0]).await.unwrap().unwrap();
    assert_eq!(archived.status, JobStatus::Succeeded);
}
