// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Topic constants for the bus.
//!
//! Topics are dot-delimited strings. The bus treats them as opaque keys;
//! only the job subsystem attaches meaning to the `job.*` family.

/// Job started
pub const JOB_STARTED: &str = "job.started";
/// Job progress snapshot
pub const JOB_PROGRESS: &str = "job.progress";
/// Job reached a terminal state (sticky)
pub const JOB_COMPLETED: &str = "job.completed";

/// Submit a job of a registered kind
pub const JOB_SUBMIT_REQUEST: &str = "job.submit.request";
/// Query one job
pub const JOB_STATUS_REQUEST: &str = "job.status.request";
/// List live and archived jobs
pub const JOB_LIST_REQUEST: &str = "job.list.request";
/// Request cooperative cancellation
pub const JOB_CANCEL_REQUEST: &str = "job.cancel.request";

/// Bus diagnostics report
pub const RUNTIME_BUS_REPORT_REQUEST: &str = "runtime.bus.report.request";

/// UI profile changed
pub const UI_PROFILE_CHANGED: &str = "ui.profile.changed";

/// Storage report request
pub const CORE_STORAGE_REPORT_REQUEST: &str = "core.storage.report.request";
/// Cleanup completed
pub const CORE_CLEANUP_COMPLETED: &str = "core.cleanup.completed";
/// Lab telemetry sample
pub const LAB_TELEMETRY: &str = "lab.telemetry";

/// A topic must be non-empty, contain no whitespace, and have no empty
/// dot-separated segment.
pub fn is_valid_topic(topic: &str) -> bool {
    !topic.is_empty()
        && !topic.chars().any(char::is_whitespace)
        && topic.split('.').all(|segment| !segment.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_validation() {
        assert!(is_valid_topic(JOB_COMPLETED));
        assert!(is_valid_topic("core.storage.report.request"));
        assert!(is_valid_topic("single"));

        assert!(!is_valid_topic(""));
        assert!(!is_valid_topic("job. progress"));
        assert!(!is_valid_topic(".job"));
        assert!(!is_valid_topic("job..progress"));
        assert!(!is_valid_topic("job."));
    }
}
