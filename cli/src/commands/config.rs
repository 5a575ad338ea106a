// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Configuration management commands
//!
//! Commands: show, validate, generate

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::{Path, PathBuf};

use stork_core::domain::controller_config::{ControllerConfigManifest, PersistenceConfig};
use stork_core::domain::number_pool::PoolRange;

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

    /// Generate a configuration file with every default spelled out
    Generate {
        /// Output path (default: ./stork-config.yaml)
        #[arg(short, long, default_value = "./stork-config.yaml")]
        output: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

pub async fn handle_command(
    command: ConfigCommand,
    config_override: Option<PathBuf>,
) -> Result<()> {
    match command {
        ConfigCommand::Show { paths } => show(config_override, paths).await,
        ConfigCommand::Validate { file } => validate(file.or(config_override)).await,
        ConfigCommand::Generate { output, force } => generate(&output, force).await,
    }
}

async fn show(config_override: Option<PathBuf>, show_paths: bool) -> Result<()> {
    let config = ControllerConfigManifest::load_or_default(config_override.clone())
        .context("Failed to load configuration")?;

    if show_paths {
        println!("{}", "Configuration discovery paths:".bold());
        if let Some(path) = &config_override {
            println!("  1. --config flag: {}", path.display());
        } else {
            println!("  1. --config flag: {}", "(not set)".dimmed());
        }
        println!(
            "  2. STORK_CONFIG_PATH: {}",
            std::env::var("STORK_CONFIG_PATH")
                .unwrap_or_else(|_| "(not set)".to_string())
                .dimmed()
        );
        println!("  3. ./stork-config.yaml");
        println!("  4. ~/.stork/config.yaml");
        println!("  5. /etc/stork/config.yaml");
        println!();
    }

    let spec = &config.spec;
    println!("{}", "Current configuration:".bold());
    println!("  Name: {}", config.metadata.name);
    println!();

    println!("{}", "Satellites:".bold());
    println!("  Round-trip timeout: {}s", spec.satellite_timeout_secs);
    println!("  Concurrent operations: {}", spec.max_concurrent_operations);
    println!();

    println!("{}", "Number pools:".bold());
    println!("  TCP ports: {}", range(&spec.number_pools.tcp_ports));
    println!("  Minor numbers: {}", range(&spec.number_pools.minor_numbers));
    println!("  Shipping ports: {}", range(&spec.number_pools.shipping_ports));
    println!();

    println!("{}", "Persistence:".bold());
    match &spec.persistence {
        PersistenceConfig::InMemory => println!("  Backend: in-memory {}", "(state is lost on exit)".dimmed()),
        PersistenceConfig::Postgres { url } => {
            println!("  Backend: postgres");
            println!("  Server: {}", redact(url));
        }
    }
    println!();

    println!("{}", "Observability:".bold());
    println!("  Event bus capacity: {}", spec.observability.event_bus_capacity);
    println!(
        "  Metrics: {}",
        spec.observability
            .metrics_listen
            .as_deref()
            .unwrap_or("(disabled)")
    );
    println!();

    Ok(())
}

async fn validate(config_path: Option<PathBuf>) -> Result<()> {
    println!("Validating configuration...");

    let config = ControllerConfigManifest::load_or_default(config_path)
        .context("Failed to load configuration")?;

    config
        .validate()
        .context("Configuration validation failed")?;

    println!("{}", "✓ Configuration is valid".green());

    Ok(())
}

async fn generate(output: &Path, force: bool) -> Result<()> {
    if output.exists() && !force {
        anyhow::bail!("{} already exists, pass --force to overwrite it", output.display());
    }

    ControllerConfigManifest::default()
        .to_yaml_file(output)
        .with_context(|| format!("Failed to write config to {:?}", output))?;

    println!(
        "{}",
        format!("✓ Configuration generated: {}", output.display()).green()
    );

    Ok(())
}

fn range(range: &PoolRange) -> String {
    format!("{}-{}", range.min, range.max)
}

/// Connection URL without its credentials
fn redact(url: &str) -> &str {
    url.rsplit_once('@').map_or(url, |(_, server)| server)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_generated_config_validates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stork-config.yaml");

        generate(&path, false).await.unwrap();
        validate(Some(path.clone())).await.unwrap();

        assert!(generate(&path, false).await.is_err());
        generate(&path, true).await.unwrap();
    }

    #[test]
    fn test_redact_strips_credentials() {
        assert_eq!(redact("postgres://stork:secret@db:5432/stork"), "db:5432/stork");
        assert_eq!(redact("postgres://db/stork"), "postgres://db/stork");
    }
}
