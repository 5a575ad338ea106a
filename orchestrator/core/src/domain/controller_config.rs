// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Controller Configuration Types
//
// Defines the configuration schema of a Stork controller:
// - Kubernetes-style manifest format (apiVersion/kind/metadata/spec)
// - Satellite round-trip timeout and worker pool size
// - Number pool ranges (TCP ports, minor numbers, shipping ports)
// - Persistence backend selection
// - Observability settings

use crate::domain::number_pool::PoolRange;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const API_VERSION: &str = "stork.io/v1";
pub const KIND: &str = "ControllerConfig";

/// Top-level Kubernetes-style controller configuration manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfigManifest {
    /// API version (must be "stork.io/v1")
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Resource kind (must be "ControllerConfig")
    pub kind: String,

    pub metadata: ManifestMetadata,

    pub spec: ControllerConfigSpec,
}

/// Manifest metadata (Kubernetes-style)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMetadata {
    /// Controller name, used in logs
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

/// Controller configuration specification (content under spec:)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfigSpec {
    /// Seconds to wait for one satellite round-trip before treating the
    /// satellite as not connected
    #[serde(default = "default_satellite_timeout_secs")]
    pub satellite_timeout_secs: u64,

    /// Upper bound on follow-up operations running concurrently
    #[serde(default = "default_max_concurrent_operations")]
    pub max_concurrent_operations: usize,

    #[serde(default)]
    pub number_pools: NumberPoolsConfig,

    #[serde(default)]
    pub persistence: PersistenceConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NumberPoolsConfig {
    #[serde(default = "default_tcp_ports")]
    pub tcp_ports: PoolRange,

    #[serde(default = "default_minor_numbers")]
    pub minor_numbers: PoolRange,

    #[serde(default = "default_shipping_ports")]
    pub shipping_ports: PoolRange,
}

/// Persistence backend
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum PersistenceConfig {
    InMemory,
    Postgres { url: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Capacity of the domain event bus
    #[serde(default = "default_event_bus_capacity")]
    pub event_bus_capacity: usize,

    /// Prometheus exporter listen address (e.g. "0.0.0.0:9100"); disabled when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics_listen: Option<String>,
}

fn default_satellite_timeout_secs() -> u64 {
    30
}

fn default_max_concurrent_operations() -> usize {
    32
}

fn default_tcp_ports() -> PoolRange {
    PoolRange::new(7000, 7999)
}

fn default_minor_numbers() -> PoolRange {
    PoolRange::new(1000, 49999)
}

fn default_shipping_ports() -> PoolRange {
    PoolRange::new(12000, 12999)
}

fn default_event_bus_capacity() -> usize {
    1000
}

impl Default for NumberPoolsConfig {
    fn default() -> Self {
        Self {
            tcp_ports: default_tcp_ports(),
            minor_numbers: default_minor_numbers(),
            shipping_ports: default_shipping_ports(),
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        PersistenceConfig::InMemory
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            event_bus_capacity: default_event_bus_capacity(),
            metrics_listen: None,
        }
    }
}

impl Default for ControllerConfigSpec {
    fn default() -> Self {
        Self {
            satellite_timeout_secs: default_satellite_timeout_secs(),
            max_concurrent_operations: default_max_concurrent_operations(),
            number_pools: NumberPoolsConfig::default(),
            persistence: PersistenceConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

impl Default for ControllerConfigManifest {
    fn default() -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: ManifestMetadata {
                name: "stork-controller".to_string(),
                version: Some("1.0.0".to_string()),
                labels: None,
            },
            spec: ControllerConfigSpec::default(),
        }
    }
}

impl ControllerConfigSpec {
    pub fn satellite_timeout(&self) -> Duration {
        Duration::from_secs(self.satellite_timeout_secs)
    }
}

impl ControllerConfigManifest {
    /// Load configuration from YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to YAML file
    pub fn to_yaml_file(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Discover configuration file using precedence order
    /// 1. STORK_CONFIG_PATH environment variable
    /// 2. ./stork-config.yaml (working directory)
    /// 3. ~/.stork/config.yaml (user home)
    /// 4. /etc/stork/config.yaml
    pub fn discover_config() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("STORK_CONFIG_PATH") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        let cwd = PathBuf::from("./stork-config.yaml");
        if cwd.exists() {
            return Some(cwd);
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".stork").join("config.yaml");
            if user_config.exists() {
                return Some(user_config);
            }
        }

        let system_config = PathBuf::from("/etc/stork/config.yaml");
        if system_config.exists() {
            return Some(system_config);
        }

        None
    }

    /// Load configuration with discovery, fallback to default
    pub fn load_or_default(cli_path: Option<PathBuf>) -> anyhow::Result<Self> {
        // Explicit CLI path fails hard when missing or invalid
        if let Some(path) = cli_path {
            tracing::info!("Loading configuration from explicit path: {:?}", path);
            let mut config = Self::from_yaml_file(&path)
                .map_err(|e| anyhow::anyhow!("Failed to load config at {:?}: {}", path, e))?;
            config.apply_env_overrides();
            return Ok(config);
        }

        if let Some(config_path) = Self::discover_config() {
            tracing::info!("Loading configuration from discovered path: {:?}", config_path);
            let mut config = Self::from_yaml_file(config_path)?;
            config.apply_env_overrides();
            Ok(config)
        } else {
            tracing::warn!("No configuration file found in standard locations. Using defaults.");
            let mut config = Self::default();
            config.apply_env_overrides();
            Ok(config)
        }
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("STORK_SATELLITE_TIMEOUT_SECS") {
            match val.parse::<u64>() {
                Ok(secs) => {
                    tracing::info!("Environment override: STORK_SATELLITE_TIMEOUT_SECS={}", secs);
                    self.spec.satellite_timeout_secs = secs;
                }
                Err(_) => tracing::warn!(
                    "Invalid value for STORK_SATELLITE_TIMEOUT_SECS: '{}'. Expected seconds. Ignoring.",
                    val
                ),
            }
        }

        if let Ok(val) = std::env::var("STORK_MAX_CONCURRENT_OPERATIONS") {
            match val.parse::<usize>() {
                Ok(n) => {
                    tracing::info!("Environment override: STORK_MAX_CONCURRENT_OPERATIONS={}", n);
                    self.spec.max_concurrent_operations = n;
                }
                Err(_) => tracing::warn!(
                    "Invalid value for STORK_MAX_CONCURRENT_OPERATIONS: '{}'. Ignoring.",
                    val
                ),
            }
        }

        if let Ok(url) = std::env::var("STORK_DATABASE_URL") {
            if url.is_empty() {
                tracing::warn!("STORK_DATABASE_URL is empty. Ignoring.");
            } else {
                tracing::info!("Environment override: STORK_DATABASE_URL (postgres backend)");
                self.spec.persistence = PersistenceConfig::Postgres { url };
            }
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api_version != API_VERSION {
            anyhow::bail!(
                "Invalid apiVersion: '{}'. Must be '{}'",
                self.api_version,
                API_VERSION
            );
        }

        if self.kind != KIND {
            anyhow::bail!("Invalid kind: '{}'. Must be '{}'", self.kind, KIND);
        }

        if self.metadata.name.is_empty() {
            anyhow::bail!("metadata.name cannot be empty");
        }

        if self.spec.satellite_timeout_secs == 0 {
            anyhow::bail!("spec.satellite_timeout_secs must be greater than 0");
        }

        if self.spec.max_concurrent_operations == 0 {
            anyhow::bail!("spec.max_concurrent_operations must be greater than 0");
        }

        if self.spec.observability.event_bus_capacity == 0 {
            anyhow::bail!("spec.observability.event_bus_capacity must be greater than 0");
        }

        let pools = &self.spec.number_pools;
        for (name, range, ceiling) in [
            ("tcp_ports", pools.tcp_ports, u16::MAX as u32),
            ("minor_numbers", pools.minor_numbers, (1 << 20) - 1),
            ("shipping_ports", pools.shipping_ports, u16::MAX as u32),
        ] {
            if range.min > range.max {
                anyhow::bail!(
                    "spec.number_pools.{}: min {} is greater than max {}",
                    name,
                    range.min,
                    range.max
                );
            }
            if range.max > ceiling {
                anyhow::bail!(
                    "spec.number_pools.{}: max {} exceeds {}",
                    name,
                    range.max,
                    ceiling
                );
            }
        }

        let tcp = pools.tcp_ports;
        let ship = pools.shipping_ports;
        if tcp.min <= ship.max && ship.min <= tcp.max {
            anyhow::bail!("spec.number_pools: tcp_ports and shipping_ports overlap");
        }

        if let PersistenceConfig::Postgres { url } = &self.spec.persistence {
            if !url.starts_with("postgres://") && !url.starts_with("postgresql://") {
                anyhow::bail!("spec.persistence.url must be a postgres:// URL");
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_manifest() {
        let manifest = ControllerConfigManifest::default();
        assert_eq!(manifest.api_version, API_VERSION);
        assert_eq!(manifest.kind, KIND);
        assert_eq!(manifest.spec.satellite_timeout(), Duration::from_secs(30));
        assert_eq!(manifest.spec.persistence, PersistenceConfig::InMemory);
        assert!(manifest.validate().is_ok());
    }

    #[test]
    fn test_yaml_with_defaults() {
        let yaml = r#"
apiVersion: stork.io/v1
kind: ControllerConfig
metadata:
  name: ctrl-a
spec:
  satellite_timeout_secs: 5
  number_pools:
    tcp_ports:
      min: 7100
      max: 7200
  persistence:
    backend: postgres
    url: postgres://stork@localhost/stork
"#;
        let manifest = ControllerConfigManifest::from_yaml_str(yaml).unwrap();
        assert_eq!(manifest.metadata.name, "ctrl-a");
        assert_eq!(manifest.spec.satellite_timeout_secs, 5);
        assert_eq!(manifest.spec.number_pools.tcp_ports, PoolRange::new(7100, 7200));
        assert_eq!(manifest.spec.number_pools.minor_numbers, default_minor_numbers());
        assert_eq!(manifest.spec.max_concurrent_operations, 32);
        assert!(matches!(
            manifest.spec.persistence,
            PersistenceConfig::Postgres { .. }
        ));
        assert!(manifest.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        let mut manifest = ControllerConfigManifest::default();

        manifest.api_version = "wrong/v1".to_string();
        assert!(manifest.validate().is_err());
        manifest.api_version = API_VERSION.to_string();

        manifest.spec.satellite_timeout_secs = 0;
        assert!(manifest.validate().is_err());
        manifest.spec.satellite_timeout_secs = 30;

        manifest.spec.number_pools.tcp_ports = PoolRange::new(8000, 7000);
        assert!(manifest.validate().is_err());

        manifest.spec.number_pools.tcp_ports = PoolRange::new(12500, 12600);
        assert!(manifest.validate().is_err());

        manifest.spec.number_pools.tcp_ports = default_tcp_ports();
        manifest.spec.persistence = PersistenceConfig::Postgres {
            url: "mysql://x".into(),
        };
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stork-config.yaml");
        let manifest = ControllerConfigManifest::default();
        manifest.to_yaml_file(&path).unwrap();
        let loaded = ControllerConfigManifest::load_or_default(Some(path)).unwrap();
        assert_eq!(loaded.metadata.name, manifest.metadata.name);
    }
}
