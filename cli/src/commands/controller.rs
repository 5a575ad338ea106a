// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Controller commands
//!
//! Commands: run, inspect

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use serde::Serialize;
use std::path::PathBuf;
use tokio::signal;
use tracing::{info, warn};

use stork_core::application::Controller;
use stork_core::domain::controller_config::ControllerConfigManifest;
use stork_core::infrastructure::StoreState;

use crate::logging::install_metrics_exporter;

#[derive(Subcommand)]
pub enum ControllerCommand {
    /// Load the stored state and run until interrupted
    Run,

    /// Load the stored state and print a summary of it
    Inspect {
        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },
}

pub async fn handle_command(command: ControllerCommand, config_override: Option<PathBuf>) -> Result<()> {
    let config = ControllerConfigManifest::load_or_default(config_override)
        .context("Failed to load configuration")?;
    config
        .validate()
        .context("Configuration validation failed")?;

    match command {
        ControllerCommand::Run => run(config).await,
        ControllerCommand::Inspect { json } => inspect(config, json).await,
    }
}

async fn run(config: ControllerConfigManifest) -> Result<()> {
    if let Some(listen) = &config.spec.observability.metrics_listen {
        install_metrics_exporter(listen)?;
    }

    let controller = Controller::bootstrap(&config.spec).await?;
    controller.start();

    let summary = Summary::of(&controller.ctx.store.snapshot());
    info!(
        name = %config.metadata.name,
        nodes = summary.nodes,
        resource_definitions = summary.resource_definitions,
        "Controller running"
    );

    shutdown_signal().await;
    controller.shutdown().await;
    Ok(())
}

async fn inspect(config: ControllerConfigManifest, json: bool) -> Result<()> {
    let controller = Controller::bootstrap(&config.spec).await?;
    let summary = Summary::of(&controller.ctx.store.snapshot());
    controller.shutdown().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!("{}", format!("Controller '{}'", config.metadata.name).bold());
    for (label, count) in summary.rows() {
        println!("  {:<24} {}", label, count);
    }
    if summary.deleting > 0 {
        println!(
            "{}",
            format!("  {} object(s) wait for satellites to confirm deletion", summary.deleting).yellow()
        );
    }
    Ok(())
}

/// Object counts of a loaded store
#[derive(Debug, Default, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub nodes: usize,
    pub node_connections: usize,
    pub storage_pool_definitions: usize,
    pub storage_pools: usize,
    pub resource_groups: usize,
    pub resource_definitions: usize,
    pub resources: usize,
    pub snapshot_definitions: usize,
    pub remotes: usize,
    pub schedules: usize,
    pub external_files: usize,
    /// Nodes and resource definitions still marked for deletion
    pub deleting: usize,
}

impl Summary {
    pub fn of(state: &StoreState) -> Self {
        let nodes = state.nodes.nodes.values();
        let dfns = state.rsc_dfns.values();
        Self {
            nodes: state.nodes.nodes.len(),
            node_connections: state.nodes.connections.len(),
            storage_pool_definitions: state.stor_pool_dfns.len(),
            storage_pools: nodes.clone().map(|n| n.stor_pools.len()).sum(),
            resource_groups: state.rsc_grps.len(),
            resource_definitions: state.rsc_dfns.len(),
            resources: dfns.clone().map(|d| d.resources.len()).sum(),
            snapshot_definitions: dfns.clone().map(|d| d.snapshot_dfns.len()).sum(),
            remotes: state.remotes.len(),
            schedules: state.schedules.len(),
            external_files: state.ext_files.len(),
            deleting: nodes.filter(|n| n.is_deleting()).count() + dfns.filter(|d| d.is_deleting()).count(),
        }
    }

    fn rows(&self) -> [(&'static str, usize); 11] {
        [
            ("Nodes", self.nodes),
            ("Node connections", self.node_connections),
            ("Storage pool definitions", self.storage_pool_definitions),
            ("Storage pools", self.storage_pools),
            ("Resource groups", self.resource_groups),
            ("Resource definitions", self.resource_definitions),
            ("Resources", self.resources),
            ("Snapshot definitions", self.snapshot_definitions),
            ("Remotes", self.remotes),
            ("Schedules", self.schedules),
            ("External files", self.external_files),
        ]
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stork_core::domain::controller_config::ControllerConfigSpec;

    #[tokio::test]
    async fn test_fresh_store_holds_only_the_default_group() {
        let controller = Controller::bootstrap(&ControllerConfigSpec::default()).await.unwrap();
        let summary = Summary::of(&controller.ctx.store.snapshot());
        controller.shutdown().await;

        assert_eq!(
            summary,
            Summary {
                resource_groups: 1,
                ..Summary::default()
            }
        );
    }
}
