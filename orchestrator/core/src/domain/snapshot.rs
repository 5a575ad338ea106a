// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Snapshots
//!
//! A snapshot definition captures a resource definition at one point in time;
//! each participating node holds one snapshot. Backups are snapshot
//! definitions flagged `BACKUP` whose data is shipped to a remote.

use crate::domain::flags::{lifecycle_flags, StateFlags};
use crate::domain::names::{NodeName, ResourceName, SnapshotName, VolumeNumber};
use crate::domain::props::Props;
use crate::domain::repository::{EntityKind, Persistable, PersistedRow, RepositoryError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

lifecycle_flags! {
    pub enum SnapshotDefinitionFlag {
        Successful(0) "SUCCESSFUL" requires [] forbids [Failed] sticky false,
        Failed(1) "FAILED" requires [] forbids [Successful] sticky false,
        Delete(2) "DELETE" requires [] forbids [] sticky true,
        Shipping(3) "SHIPPING" requires [] forbids [Delete, Shipped] sticky false,
        ShippingAbort(4) "SHIPPING_ABORT" requires [Shipping] forbids [] sticky false,
        Shipped(5) "SHIPPED" requires [] forbids [ShippingAbort] sticky false,
        Backup(6) "BACKUP" requires [] forbids [] sticky false,
        AutoSnapshot(7) "AUTO_SNAPSHOT" requires [] forbids [] sticky false,
    }
}

lifecycle_flags! {
    pub enum SnapshotFlag {
        Delete(0) "DELETE" requires [] forbids [] sticky true,
        ShippingSource(1) "SHIPPING_SOURCE" requires [] forbids [ShippingTarget] sticky false,
        ShippingTarget(2) "SHIPPING_TARGET" requires [] forbids [ShippingSource] sticky false,
        BackupSource(3) "BACKUP_SOURCE" requires [] forbids [BackupTarget] sticky false,
        BackupTarget(4) "BACKUP_TARGET" requires [] forbids [BackupSource] sticky false,
    }
}

/// Size of one volume at the time the snapshot was taken
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotVolumeDefinition {
    pub number: VolumeNumber,
    pub size_kib: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotDefinition {
    pub uuid: Uuid,
    pub rsc_name: ResourceName,
    pub name: SnapshotName,
    pub flags: StateFlags<SnapshotDefinitionFlag>,
    pub props: Props,
    pub created_at: DateTime<Utc>,
    pub volumes: Vec<SnapshotVolumeDefinition>,
    #[serde(
        default,
        serialize_with = "crate::domain::serialize_values",
        skip_deserializing
    )]
    pub snapshots: BTreeMap<NodeName, Snapshot>,
}

impl SnapshotDefinition {
    pub fn new(
        rsc_name: ResourceName,
        name: SnapshotName,
        flags: StateFlags<SnapshotDefinitionFlag>,
        volumes: Vec<SnapshotVolumeDefinition>,
    ) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            rsc_name,
            name,
            flags,
            props: Props::new(),
            created_at: Utc::now(),
            volumes,
            snapshots: BTreeMap::new(),
        }
    }

    pub fn key(&self) -> String {
        format!("{}/{}", self.rsc_name, self.name)
    }

    pub fn is_deleting(&self) -> bool {
        self.flags.is_set(SnapshotDefinitionFlag::Delete)
    }

    pub fn is_shipping(&self) -> bool {
        self.flags.is_set(SnapshotDefinitionFlag::Shipping)
    }

    pub fn is_backup(&self) -> bool {
        self.flags.is_set(SnapshotDefinitionFlag::Backup)
    }

    pub fn api_view(&self) -> SnapshotDefinitionApi {
        SnapshotDefinitionApi {
            uuid: self.uuid,
            rsc_name: self.rsc_name.to_string(),
            name: self.name.to_string(),
            flags: self.flags.names(),
            props: self.props.to_map(),
            created_at: self.created_at,
            nodes: self
                .snapshots
                .values()
                .map(|s| SnapshotApi {
                    node_name: s.node_name.to_string(),
                    flags: s.flags.names(),
                })
                .collect(),
        }
    }
}

impl Persistable for SnapshotDefinition {
    fn collect_rows(&self, rows: &mut Vec<PersistedRow>) -> Result<(), RepositoryError> {
        rows.push(PersistedRow::encode(
            self.uuid,
            EntityKind::SnapshotDefinition,
            self.key(),
            self.flags.bits(),
            &self.props,
            self,
            &["snapshots"],
        )?);
        for snap in self.snapshots.values() {
            snap.collect_rows(rows)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub uuid: Uuid,
    pub node_name: NodeName,
    pub rsc_name: ResourceName,
    pub snapshot_name: SnapshotName,
    pub flags: StateFlags<SnapshotFlag>,
    pub props: Props,
}

impl Snapshot {
    pub fn new(
        node_name: NodeName,
        rsc_name: ResourceName,
        snapshot_name: SnapshotName,
        flags: StateFlags<SnapshotFlag>,
    ) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            node_name,
            rsc_name,
            snapshot_name,
            flags,
            props: Props::new(),
        }
    }

    pub fn key(&self) -> String {
        format!("{}/{}/{}", self.node_name, self.rsc_name, self.snapshot_name)
    }

    pub fn is_deleting(&self) -> bool {
        self.flags.is_set(SnapshotFlag::Delete)
    }
}

impl Persistable for Snapshot {
    fn collect_rows(&self, rows: &mut Vec<PersistedRow>) -> Result<(), RepositoryError> {
        rows.push(PersistedRow::encode(
            self.uuid,
            EntityKind::Snapshot,
            self.key(),
            self.flags.bits(),
            &self.props,
            self,
            &[],
        )?);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotApi {
    pub node_name: String,
    pub flags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotDefinitionApi {
    pub uuid: Uuid,
    pub rsc_name: String,
    pub name: String,
    pub flags: Vec<String>,
    pub props: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub nodes: Vec<SnapshotApi>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::flags::FlagError;

    #[test]
    fn test_shipping_abort_requires_shipping() {
        let mut flags = StateFlags::<SnapshotDefinitionFlag>::with(&[SnapshotDefinitionFlag::Backup]);
        assert!(matches!(
            flags.enable(SnapshotDefinitionFlag::ShippingAbort),
            Err(FlagError::MissingPrerequisite { .. })
        ));
        flags.enable(SnapshotDefinitionFlag::Shipping).unwrap();
        flags.enable(SnapshotDefinitionFlag::ShippingAbort).unwrap();
    }

    #[test]
    fn test_shipped_snapshot_cannot_ship_again() {
        let mut flags = StateFlags::with(&[SnapshotDefinitionFlag::Shipped]);
        assert!(flags.enable(SnapshotDefinitionFlag::Shipping).is_err());
    }

    #[test]
    fn test_source_and_target_exclusive() {
        let mut flags = StateFlags::with(&[SnapshotFlag::BackupSource]);
        assert!(flags.enable(SnapshotFlag::BackupTarget).is_err());
    }
}
