// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Runtime configuration.
//!
//! YAML with human-readable durations:
//!
//! ```yaml
//! bus:
//!   trace: false
//!   default_request_timeout: 5s
//!   sticky_topics: [job.completed]
//!   reject_duplicate_handlers: false
//! jobs:
//!   default_timeout: 10m
//!   hard_ceiling: 1h
//!   reaper_interval: 30s
//!   max_concurrent_jobs: 4
//!   history_limit: 50
//!   history_path: data/roaming/jobs.json
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::domain::topics;

/// Enables trace logging of all bus traffic
pub const BUS_TRACE_ENV: &str = "CONDUIT_BUS_TRACE";
/// Explicit configuration file location
pub const CONFIG_PATH_ENV: &str = "CONDUIT_CONFIG_PATH";
/// Overrides `jobs.history_path`
pub const HISTORY_PATH_ENV: &str = "CONDUIT_HISTORY_PATH";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConduitConfig {
    pub bus: BusConfig,
    pub jobs: JobConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Log every publish/subscribe/request/reply
    pub trace: bool,

    #[serde(with = "humantime_serde")]
    pub default_request_timeout: Duration,

    /// Topics whose latest envelope is cached for replay
    pub sticky_topics: Vec<String>,

    /// Fail `register_handler` on a topic that already has a handler
    /// instead of replacing it
    pub reject_duplicate_handlers: bool,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            trace: false,
            default_request_timeout: Duration::from_secs(5),
            sticky_topics: vec![topics::JOB_COMPLETED.to_string()],
            reject_duplicate_handlers: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    /// Budget for jobs created without one
    #[serde(with = "humantime_serde")]
    pub default_timeout: Option<Duration>,

    /// No job may stay running longer than this
    #[serde(with = "humantime_serde")]
    pub hard_ceiling: Duration,

    /// Period of the hard-ceiling sweep; `None` disables the reaper task
    #[serde(with = "humantime_serde")]
    pub reaper_interval: Option<Duration>,

    pub max_concurrent_jobs: Option<usize>,

    /// Archived records kept, and finished jobs kept in the live table
    pub history_limit: usize,

    /// JSON history file; in-memory history when unset
    pub history_path: Option<PathBuf>,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            default_timeout: None,
            hard_ceiling: Duration::from_secs(60 * 60),
            reaper_interval: Some(Duration::from_secs(30)),
            max_concurrent_jobs: None,
            history_limit: 50,
            history_path: None,
        }
    }
}

impl ConduitConfig {
    /// Parse configuration from a YAML string
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Load configuration from a YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&content)
    }

    pub fn to_yaml_string(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Discover a configuration file using precedence order
    /// 1. CONDUIT_CONFIG_PATH environment variable
    /// 2. ./conduit.yaml (working directory)
    /// 3. ~/.conduit/config.yaml (user home)
    pub fn discover_config() -> Option<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        let cwd = PathBuf::from("./conduit.yaml");
        if cwd.exists() {
            return Some(cwd);
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".conduit").join("config.yaml");
            if user_config.exists() {
                return Some(user_config);
            }
        }

        None
    }

    /// Load configuration with discovery, falling back to defaults.
    ///
    /// An explicit path must exist and parse. Environment overrides are
    /// applied last, then the result is validated.
    pub fn load_or_default(cli_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let mut config = if let Some(path) = cli_path {
            tracing::info!("Loading configuration from explicit path: {:?}", path);
            Self::from_yaml_file(&path)?
        } else if let Some(path) = Self::discover_config() {
            tracing::info!("Loading configuration from discovered path: {:?}", path);
            Self::from_yaml_file(&path)?
        } else {
            tracing::debug!("No configuration file found, using defaults");
            Self::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        if let Some(trace) = env_flag(BUS_TRACE_ENV) {
            tracing::info!("Environment override: {}={}", BUS_TRACE_ENV, trace);
            self.bus.trace = trace;
        }

        if let Ok(path) = std::env::var(HISTORY_PATH_ENV) {
            if !path.trim().is_empty() {
                tracing::info!("Environment override: {}={}", HISTORY_PATH_ENV, path);
                self.jobs.history_path = Some(PathBuf::from(path));
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bus.default_request_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "bus.default_request_timeout must be greater than zero".to_string(),
            ));
        }
        if let Some(topic) = self
            .bus
            .sticky_topics
            .iter()
            .find(|topic| !topics::is_valid_topic(topic))
        {
            return Err(ConfigError::Invalid(format!("invalid sticky topic '{}'", topic)));
        }
        if self.jobs.hard_ceiling.is_zero() {
            return Err(ConfigError::Invalid(
                "jobs.hard_ceiling must be greater than zero".to_string(),
            ));
        }
        if let Some(timeout) = self.jobs.default_timeout {
            if timeout.is_zero() {
                return Err(ConfigError::Invalid(
                    "jobs.default_timeout must be greater than zero".to_string(),
                ));
            }
            if timeout > self.jobs.hard_ceiling {
                return Err(ConfigError::Invalid(format!(
                    "jobs.default_timeout ({:?}) exceeds jobs.hard_ceiling ({:?})",
                    timeout, self.jobs.hard_ceiling
                )));
            }
        }
        if matches!(self.jobs.reaper_interval, Some(interval) if interval.is_zero()) {
            return Err(ConfigError::Invalid(
                "jobs.reaper_interval must be greater than zero".to_string(),
            ));
        }
        if self.jobs.max_concurrent_jobs == Some(0) {
            return Err(ConfigError::Invalid(
                "jobs.max_concurrent_jobs must be at least 1".to_string(),
            ));
        }
        if self.jobs.history_limit == 0 {
            return Err(ConfigError::Invalid(
                "jobs.history_limit must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Read a boolean environment toggle. Unset or unrecognised values yield `None`.
pub fn env_flag(name: &str) -> Option<bool> {
    let value = std::env::var(name).ok()?;
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" | "" => Some(false),
        _ => {
            tracing::warn!(
                "Invalid value for {}: '{}'. Expected true/false. Ignoring.",
                name,
                value
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ConduitConfig::default();
        config.validate().unwrap();
        assert_eq!(config.jobs.history_limit, 50);
        assert_eq!(config.bus.sticky_topics, vec![topics::JOB_COMPLETED.to_string()]);
        assert!(!config.bus.reject_duplicate_handlers);
    }

    #[test]
    fn test_parse_yaml_with_durations() {
        let yaml = r#"
bus:
  trace: true
  default_request_timeout: 250ms
jobs:
  default_timeout: 2m
  hard_ceiling: 1h
  reaper_interval: 5s
  max_concurrent_jobs: 2
  history_path: /tmp/jobs.json
"#;
        let config = ConduitConfig::from_yaml_str(yaml).unwrap();
        assert!(config.bus.trace);
        assert_eq!(config.bus.default_request_timeout, Duration::from_millis(250));
        // unspecified fields keep their defaults
        assert_eq!(config.bus.sticky_topics, vec![topics::JOB_COMPLETED.to_string()]);
        assert_eq!(config.jobs.default_timeout, Some(Duration::from_secs(120)));
        assert_eq!(config.jobs.reaper_interval, Some(Duration::from_secs(5)));
        assert_eq!(config.jobs.max_concurrent_jobs, Some(2));
        assert_eq!(config.jobs.history_limit, 50);
        assert_eq!(config.jobs.history_path, Some(PathBuf::from("/tmp/jobs.json")));
        config.validate().unwrap();
    }

    #[test]
    fn test_yaml_roundtrip_preserves_config() {
        let mut config = ConduitConfig::default();
        config.jobs.default_timeout = Some(Duration::from_secs(30));
        let yaml = config.to_yaml_string().unwrap();
        assert_eq!(ConduitConfig::from_yaml_str(&yaml).unwrap(), config);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = ConduitConfig::default();
        config.jobs.default_timeout = Some(Duration::from_secs(7200));
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = ConduitConfig::default();
        config.jobs.history_limit = 0;
        assert!(config.validate().is_err());

        let mut config = ConduitConfig::default();
        config.bus.sticky_topics.push("bad topic".to_string());
        assert!(config.validate().is_err());

        let mut config = ConduitConfig::default();
        config.jobs.max_concurrent_jobs = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let result = ConduitConfig::load_or_default(Some(PathBuf::from(
            "/definitely/not/here/conduit.yaml",
        )));
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }
}
