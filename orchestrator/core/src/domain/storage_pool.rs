// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Storage Pools
//!
//! A storage pool definition names a pool cluster-wide; a storage pool is its
//! instance on one node, backed by one device provider.

use crate::domain::names::{NodeName, StorPoolName};
use crate::domain::props::Props;
use crate::domain::repository::{EntityKind, Persistable, PersistedRow, RepositoryError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Pool used for diskful resources when none is requested
pub const DEFAULT_STOR_POOL: &str = "DfltStorPool";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceProviderKind {
    Diskless,
    Lvm,
    LvmThin,
    Zfs,
    ZfsThin,
    File,
    FileThin,
}

impl DeviceProviderKind {
    pub fn has_disk(self) -> bool {
        !matches!(self, DeviceProviderKind::Diskless)
    }

    /// Providers whose snapshots depend on the pool holding the origin volume
    pub fn supports_snapshots(self) -> bool {
        matches!(
            self,
            DeviceProviderKind::LvmThin
                | DeviceProviderKind::Zfs
                | DeviceProviderKind::ZfsThin
                | DeviceProviderKind::FileThin
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorPoolDefinition {
    pub uuid: Uuid,
    pub name: StorPoolName,
    pub props: Props,
    pub created_at: DateTime<Utc>,
}

impl StorPoolDefinition {
    pub fn new(name: StorPoolName) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            name,
            props: Props::new(),
            created_at: Utc::now(),
        }
    }
}

impl Persistable for StorPoolDefinition {
    fn collect_rows(&self, rows: &mut Vec<PersistedRow>) -> Result<(), RepositoryError> {
        rows.push(PersistedRow::encode(
            self.uuid,
            EntityKind::StorPoolDefinition,
            self.name.as_str(),
            0,
            &self.props,
            self,
            &[],
        )?);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorPool {
    pub uuid: Uuid,
    pub node_name: NodeName,
    pub name: StorPoolName,
    pub provider: DeviceProviderKind,
    pub props: Props,
    /// Last capacity reported by the satellite, in KiB
    #[serde(default)]
    pub free_capacity_kib: Option<u64>,
    #[serde(default)]
    pub total_capacity_kib: Option<u64>,
}

impl StorPool {
    pub fn new(node_name: NodeName, name: StorPoolName, provider: DeviceProviderKind) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            node_name,
            name,
            provider,
            props: Props::new(),
            free_capacity_kib: None,
            total_capacity_kib: None,
        }
    }

    pub fn key(&self) -> String {
        format!("{}/{}", self.node_name, self.name)
    }

    pub fn api_view(&self) -> StorPoolApi {
        StorPoolApi {
            uuid: self.uuid,
            node_name: self.node_name.to_string(),
            name: self.name.to_string(),
            provider: self.provider,
            props: self.props.to_map(),
            free_capacity_kib: self.free_capacity_kib,
            total_capacity_kib: self.total_capacity_kib,
        }
    }
}

impl Persistable for StorPool {
    fn collect_rows(&self, rows: &mut Vec<PersistedRow>) -> Result<(), RepositoryError> {
        rows.push(PersistedRow::encode(
            self.uuid,
            EntityKind::StorPool,
            self.key(),
            0,
            &self.props,
            self,
            &[],
        )?);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorPoolApi {
    pub uuid: Uuid,
    pub node_name: String,
    pub name: String,
    pub provider: DeviceProviderKind,
    pub props: BTreeMap<String, String>,
    pub free_capacity_kib: Option<u64>,
    pub total_capacity_kib: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_capabilities() {
        assert!(!DeviceProviderKind::Diskless.has_disk());
        assert!(DeviceProviderKind::Lvm.has_disk());
        assert!(DeviceProviderKind::LvmThin.supports_snapshots());
        assert!(!DeviceProviderKind::Lvm.supports_snapshots());
    }

    #[test]
    fn test_stor_pool_row_round_trip() {
        let sp = StorPool::new(
            NodeName::new("alpha").unwrap(),
            StorPoolName::new("thin1").unwrap(),
            DeviceProviderKind::LvmThin,
        );
        let mut rows = Vec::new();
        sp.collect_rows(&mut rows).unwrap();
        assert_eq!(rows[0].key, "alpha/thin1");
        let back: StorPool = rows[0].decode().unwrap();
        assert_eq!(back, sp);
    }
}
