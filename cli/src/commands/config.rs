// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Configuration management commands
//!
//! Commands: show, validate, generate

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::{Path, PathBuf};

use conduit_core::domain::config::{ConduitConfig, CONFIG_PATH_ENV};

const GENERATED_HEADER: &str = "\
# Conduit configuration
#
# Durations accept human readable values such as 250ms, 5s, 10m or 1h.
# Set jobs.history_path to persist job history as JSON.
";

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Show config file paths checked
        #[arg(long)]
        paths: bool,
    },

    /// Validate configuration file
    Validate {
        /// Path to config file (default: discover)
        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,
    },

    /// Generate sample configuration
    Generate {
        /// Output path
        #[arg(short, long, default_value = "./conduit.yaml")]
        output: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

pub async fn handle_command(command: ConfigCommand, config_override: Option<PathBuf>) -> Result<()> {
    match command {
        ConfigCommand::Show { paths } => show(config_override, paths).await,
        ConfigCommand::Validate { file } => validate(file.or(config_override)).await,
        ConfigCommand::Generate { output, force } => generate(&output, force).await,
    }
}

async fn show(config_override: Option<PathBuf>, show_paths: bool) -> Result<()> {
    let config = ConduitConfig::load_or_default(config_override.clone())
        .context("Failed to load configuration")?;

    if show_paths {
        println!("{}", "Configuration discovery paths:".bold());
        if let Some(path) = &config_override {
            println!("  1. --config flag: {}", path.display());
        } else {
            println!("  1. --config flag: {}", "(not set)".dimmed());
        }
        println!(
            "  2. {}: {}",
            CONFIG_PATH_ENV,
            std::env::var(CONFIG_PATH_ENV)
                .unwrap_or_else(|_| "(not set)".to_string())
                .dimmed()
        );
        println!("  3. ./conduit.yaml");
        println!("  4. ~/.conduit/config.yaml");
        println!();
    }

    println!("{}", "Current configuration:".bold());
    println!();

    println!("{}", "Bus:".bold());
    println!("  Trace: {}", config.bus.trace);
    println!("  Default request timeout: {:?}", config.bus.default_request_timeout);
    println!("  Sticky topics: {}", config.bus.sticky_topics.join(", "));
    println!(
        "  Duplicate handlers: {}",
        if config.bus.reject_duplicate_handlers { "rejected" } else { "replaced" }
    );
    println!();

    println!("{}", "Jobs:".bold());
    match config.jobs.default_timeout {
        Some(timeout) => println!("  Default timeout: {:?}", timeout),
        None => println!("  Default timeout: {}", "(hard ceiling only)".dimmed()),
    }
    println!("  Hard ceiling: {:?}", config.jobs.hard_ceiling);
    match config.jobs.reaper_interval {
        Some(interval) => println!("  Reaper interval: {:?}", interval),
        None => println!("  Reaper interval: {}", "(disabled)".dimmed()),
    }
    match config.jobs.max_concurrent_jobs {
        Some(limit) => println!("  Max concurrent jobs: {}", limit),
        None => println!("  Max concurrent jobs: {}", "(unlimited)".dimmed()),
    }
    println!("  History limit: {}", config.jobs.history_limit);
    match &config.jobs.history_path {
        Some(path) => println!("  History file: {}", path.display()),
        None => println!("  History file: {}", "(in memory)".dimmed()),
    }
    println!();

    Ok(())
}

async fn validate(config_path: Option<PathBuf>) -> Result<()> {
    println!("Validating configuration...");

    // load_or_default validates after applying overrides
    ConduitConfig::load_or_default(config_path).context("Configuration validation failed")?;

    println!("{}", "✓ Configuration is valid".green());

    Ok(())
}

/// Render the default configuration as commented YAML.
pub fn sample_config() -> Result<String> {
    let yaml = ConduitConfig::default()
        .to_yaml_string()
        .context("Failed to render default configuration")?;
    Ok(format!("{GENERATED_HEADER}{yaml}"))
}

async fn generate(output: &Path, force: bool) -> Result<()> {
    if output.exists() && !force {
        anyhow::bail!(
            "{} already exists (use --force to overwrite)",
            output.display()
        );
    }

    std::fs::write(output, sample_config()?)
        .with_context(|| format!("Failed to write config to {:?}", output))?;

    println!(
        "{}",
        format!("✓ Configuration generated: {}", output.display()).green()
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_config_parses_back_to_defaults() {
        let sample = sample_config().unwrap();
        assert!(sample.starts_with("# Conduit configuration"));
        let parsed = ConduitConfig::from_yaml_str(&sample).unwrap();
        assert_eq!(parsed, ConduitConfig::default());
    }

    #[tokio::test]
    async fn test_generate_refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("conduit.yaml");

        generate(&output, false).await.unwrap();
        assert!(generate(&output, false).await.is_err());
        generate(&output, true).await.unwrap();

        validate(Some(output)).await.unwrap();
    }
}
