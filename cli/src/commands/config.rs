// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Configuration management commands
//!
//! Commands: show, validate, generate

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::PathBuf;

use buildgate_core::domain::GateConfigManifest;

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

    /// Write the default configuration to a file
    Generate {
        /// Output path
        #[arg(short, long, default_value = "./buildgate.yaml")]
        output: PathBuf,
    },
}

pub async fn handle_command(command: ConfigCommand, config_override: Option<PathBuf>) -> Result<()> {
    match command {
        ConfigCommand::Show { paths } => show(config_override, paths),
        ConfigCommand::Validate { file } => validate(file.or(config_override)),
        ConfigCommand::Generate { output } => generate(output),
    }
}

fn show(config_override: Option<PathBuf>, show_paths: bool) -> Result<()> {
    let config = GateConfigManifest::load_or_default(config_override.clone()).context("Failed to load configuration")?;

    if show_paths {
        println!("{}", "Configuration discovery paths:".bold());
        match &config_override {
            Some(path) => println!("  1. --config flag: {}", path.display()),
            None => println!("  1. --config flag: {}", "(not set)".dimmed()),
        }
        println!(
            "  2. BUILDGATE_CONFIG_PATH: {}",
            std::env::var("BUILDGATE_CONFIG_PATH")
                .unwrap_or_else(|_| "(not set)".to_string())
                .dimmed()
        );
        println!("  3. ./buildgate.yaml");
        println!("  4. ~/.buildgate/config.yaml");
        println!("  5. /etc/buildgate/config.yaml");
        println!();
    }

    let spec = &config.spec;
    println!("{} {}", "Configuration:".bold(), config.metadata.name);
    println!();

    println!("{}", "Proxy:".bold());
    println!("  Bind address: {}", spec.proxy.bind_address);
    println!("  Shutdown grace: {}ms", spec.proxy.shutdown_grace_ms);
    println!();

    println!("{}", "Builder readiness:".bold());
    println!(
        "  {} attempts every {}ms",
        spec.builder.readiness_attempts, spec.builder.readiness_interval_ms
    );
    println!();

    println!("{}", "Retry:".bold());
    if spec.retry.max_retries == 0 {
        println!("  {}", "disabled".yellow());
    } else {
        println!("  Max retries: {}", spec.retry.max_retries);
        println!("  Backoff: {}ms", spec.retry.backoff_ms);
    }
    println!();

    println!("{}", "Fast load:".bold());
    if spec.fast_load.enabled {
        println!("  Relay image: {}", spec.fast_load.relay_image);
        println!(
            "  Registry readiness: {} attempts every {}ms",
            spec.fast_load.readiness_attempts, spec.fast_load.readiness_interval_ms
        );
    } else {
        println!("  {}", "disabled".yellow());
    }
    println!();

    println!("{}", "Telemetry:".bold());
    println!("  Flush interval: {}ms", spec.telemetry.flush_interval_ms);

    Ok(())
}

fn validate(config_path: Option<PathBuf>) -> Result<()> {
    println!("Validating configuration...");

    let config = GateConfigManifest::load_or_default(config_path).context("Failed to load configuration")?;

    config.validate().context("Configuration validation failed")?;

    println!("{}", "✓ Configuration is valid".green());

    Ok(())
}

fn generate(output: PathBuf) -> Result<()> {
    GateConfigManifest::default()
        .to_yaml_file(&output)
        .with_context(|| format!("Failed to write config to {:?}", output))?;

    println!("{}", format!("✓ Configuration generated: {}", output.display()).green());

    Ok(())
}
