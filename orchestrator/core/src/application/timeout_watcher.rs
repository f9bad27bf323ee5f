// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Timeout supervision for running jobs.
//!
//! Two independent mechanisms end overdue jobs as `TimedOut`:
//!
//! - a per-job watcher task armed when the job starts, sleeping until the
//!   job's effective deadline;
//! - a periodic reaper sweeping every running job against the hard
//!   ceiling using wall-clock time, covering a watcher that never fired.
//!
//! Neither aborts the work. The cancellation token is signalled and any
//! later result is discarded.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::application::job_manager::{JobEntry, JobManager};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadlineKind {
    Budget,
    HardCeiling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    pub duration: Duration,
    pub kind: DeadlineKind,
}

impl Deadline {
    /// `min(budget or default, ceiling)`
    pub fn effective(budget: Option<Duration>, default: Option<Duration>, ceiling: Duration) -> Self {
        match budget.or(default) {
            Some(duration) if duration < ceiling => Self {
                duration,
                kind: DeadlineKind::Budget,
            },
            _ => Self {
                duration: ceiling,
                kind: DeadlineKind::HardCeiling,
            },
        }
    }

    pub fn timeout_message(&self) -> String {
        match self.kind {
            DeadlineKind::Budget => format!("timeout: exceeded budget of {:?}", self.duration),
            DeadlineKind::HardCeiling => {
                format!("timeout: exceeded hard lifetime ceiling of {:?}", self.duration)
            }
        }
    }
}

pub struct TimeoutWatcher;

impl TimeoutWatcher {
    /// Spawn the watcher for one running job. Aborted by the job task once
    /// the work returns.
    pub(crate) fn arm(
        manager: Weak<JobManager>,
        entry: Arc<JobEntry>,
        deadline: Deadline,
        runtime: &Handle,
    ) -> JoinHandle<()> {
        runtime.spawn(async move {
            tokio::time::sleep(deadline.duration).await;
            let Some(manager) = manager.upgrade() else {
                return;
            };
            let job_id = entry.state.lock().id;
            if manager.force_timeout(&entry, deadline.timeout_message()) {
                warn!(
                    job_id = %job_id,
                    deadline = ?deadline.duration,
                    kind = ?deadline.kind,
                    "Job exceeded its deadline"
                );
            }
        })
    }

    /// Spawn the hard-ceiling reaper. Stops once the manager is dropped.
    pub(crate) fn spawn_reaper(
        manager: Weak<JobManager>,
        interval: Duration,
        runtime: &Handle,
    ) -> JoinHandle<()> {
        runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                let reaped = manager.sweep_expired();
                if !reaped.is_empty() {
                    warn!(count = reaped.len(), "Reaper timed out jobs past the hard ceiling");
                }
            }

            debug!("Job reaper stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_deadline() {
        let hour = Duration::from_secs(3600);

        let budget = Deadline::effective(Some(Duration::from_millis(100)), None, hour);
        assert_eq!(budget.kind, DeadlineKind::Budget);
        assert_eq!(budget.duration, Duration::from_millis(100));

        let defaulted = Deadline::effective(None, Some(Duration::from_secs(60)), hour);
        assert_eq!(defaulted.duration, Duration::from_secs(60));

        let capped = Deadline::effective(Some(Duration::from_secs(7200)), None, hour);
        assert_eq!(capped.kind, DeadlineKind::HardCeiling);
        assert_eq!(capped.duration, hour);

        let unbounded = Deadline::effective(None, None, hour);
        assert_eq!(unbounded.kind, DeadlineKind::HardCeiling);
    }

    #[test]
    fn test_timeout_message_names_timeout() {
        let deadline = Deadline::effective(Some(Duration::from_millis(100)), None, Duration::from_secs(1));
        assert_eq!(deadline.timeout_message(), "timeout: exceeded budget of 100ms");
    }
}
