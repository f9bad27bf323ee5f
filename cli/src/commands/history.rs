// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Job history commands
//!
//! Commands: list

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::PathBuf;

use conduit_core::domain::config::{ConduitConfig, HISTORY_PATH_ENV};
use conduit_core::domain::history::{JobHistoryStore, JobRecord};
use conduit_core::domain::job::JobStatus;
use conduit_core::infrastructure::history::JsonFileJobHistory;

#[derive(Subcommand)]
pub enum HistoryCommand {
    /// List archived jobs, newest first
    List {
        /// Maximum number of records to show
        #[arg(short, long, default_value_t = 20)]
        limit: usize,

        /// History file (default: jobs.history_path from the configuration)
        #[arg(long, value_name = "FILE")]
        file: Option<PathBuf>,
    },
}

pub async fn handle_command(command: HistoryCommand, config_override: Option<PathBuf>) -> Result<()> {
    match command {
        HistoryCommand::List { limit, file } => {
            let path = match file {
                Some(path) => path,
                None => {
                    let config = ConduitConfig::load_or_default(config_override)
                        .context("Failed to load configuration")?;
                    config.jobs.history_path.with_context(|| {
                        format!(
                            "No history file configured; set jobs.history_path or {}",
                            HISTORY_PATH_ENV
                        )
                    })?
                }
            };
            list(path, limit).await
        }
    }
}

pub async fn load_records(path: PathBuf, limit: usize) -> Result<Vec<JobRecord>> {
    let store = JsonFileJobHistory::new(&path, usize::MAX);
    let mut records = store
        .read_all()
        .await
        .with_context(|| format!("Failed to read job history at {:?}", path))?;
    records.truncate(limit);
    Ok(records)
}

async fn list(path: PathBuf, limit: usize) -> Result<()> {
    let records = load_records(path.clone(), limit).await?;
    if records.is_empty() {
        println!("{}", format!("No jobs recorded in {}", path.display()).dimmed());
        return Ok(());
    }

    println!(
        "{}",
        format!("{:<36}  {:<24}  {:<10}  {:<20}  {}", "JOB ID", "KIND", "STATUS", "COMPLETED", "SUMMARY").bold()
    );
    for record in &records {
        let completed = record
            .completed_at
            .map(|at| at.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string());
        let detail = record
            .result_summary
            .as_deref()
            .or(record.error.as_deref())
            .unwrap_or("");
        let status = format!("{:<10}", record.status.as_str());
        let status = match record.status {
            JobStatus::Succeeded => status.green(),
            JobStatus::Failed | JobStatus::TimedOut => status.red(),
            JobStatus::Cancelled => status.yellow(),
            JobStatus::Pending | JobStatus::Running => status.normal(),
        };
        println!(
            "{:<36}  {:<24}  {}  {:<20}  {}",
            record.job_id, record.kind, status, completed, detail
        );
    }

    Ok(())
}
