// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Resource Definition
//!
//! The resource definition aggregate owns everything that shares its name:
//! volume definitions, the resources deployed on nodes, snapshot definitions
//! and resource connections. All of it lives in the `RESOURCE_DEFINITIONS`
//! lock domain.

use crate::domain::connection::ResourceConnection;
use crate::domain::flags::{lifecycle_flags, DeleteFlag, StateFlags};
use crate::domain::names::{NodeName, ResourceGroupName, ResourceName, SnapshotName, VolumeNumber};
use crate::domain::props::Props;
use crate::domain::repository::{EntityKind, Persistable, PersistedRow, RepositoryError};
use crate::domain::resource::{Resource, ResourceFlag};
use crate::domain::snapshot::SnapshotDefinition;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

pub const DEFAULT_RESOURCE_GROUP: &str = "DfltRscGrp";

lifecycle_flags! {
    pub enum VolumeDefinitionFlag {
        Delete(0) "DELETE" requires [] forbids [] sticky true,
        Resize(1) "RESIZE" requires [] forbids [Delete] sticky false,
        ResizeShrink(2) "RESIZE_SHRINK" requires [Resize] forbids [Delete] sticky false,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDefinition {
    pub uuid: Uuid,
    pub name: ResourceName,
    pub resource_group: ResourceGroupName,
    pub tcp_port: u32,
    pub flags: StateFlags<DeleteFlag>,
    pub props: Props,
    pub created_at: DateTime<Utc>,
    #[serde(
        default,
        serialize_with = "crate::domain::serialize_values",
        skip_deserializing
    )]
    pub volume_dfns: BTreeMap<VolumeNumber, VolumeDefinition>,
    #[serde(
        default,
        serialize_with = "crate::domain::serialize_values",
        skip_deserializing
    )]
    pub resources: BTreeMap<NodeName, Resource>,
    #[serde(
        default,
        serialize_with = "crate::domain::serialize_values",
        skip_deserializing
    )]
    pub snapshot_dfns: BTreeMap<SnapshotName, SnapshotDefinition>,
    #[serde(
        default,
        serialize_with = "crate::domain::serialize_values",
        skip_deserializing
    )]
    pub connections: BTreeMap<(NodeName, NodeName), ResourceConnection>,
}

impl ResourceDefinition {
    pub fn new(name: ResourceName, resource_group: ResourceGroupName, tcp_port: u32) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            name,
            resource_group,
            tcp_port,
            flags: StateFlags::empty(),
            props: Props::new(),
            created_at: Utc::now(),
            volume_dfns: BTreeMap::new(),
            resources: BTreeMap::new(),
            snapshot_dfns: BTreeMap::new(),
            connections: BTreeMap::new(),
        }
    }

    pub fn is_deleting(&self) -> bool {
        self.flags.is_set(DeleteFlag::Delete)
    }

    /// Nodes holding a resource, including resources flagged for deletion
    pub fn resource_nodes(&self) -> Vec<NodeName> {
        self.resources.keys().cloned().collect()
    }

    pub fn diskful_count(&self) -> usize {
        self.resources.values().filter(|r| r.is_active_diskful()).count()
    }

    /// Diskless resources that are not being deleted, tie-breakers included
    pub fn active_diskless(&self) -> impl Iterator<Item = &Resource> {
        self.resources
            .values()
            .filter(|r| r.is_diskless() && !r.is_deleting())
    }

    pub fn tie_breaker(&self) -> Option<&Resource> {
        self.resources
            .values()
            .find(|r| r.flags.is_set(ResourceFlag::TieBreaker) && !r.is_deleting())
    }

    pub fn api_view(&self) -> ResourceDefinitionApi {
        ResourceDefinitionApi {
            uuid: self.uuid,
            name: self.name.to_string(),
            resource_group: self.resource_group.to_string(),
            tcp_port: self.tcp_port,
            flags: self.flags.names(),
            props: self.props.to_map(),
            volume_dfns: self
                .volume_dfns
                .values()
                .map(|v| VolumeDefinitionApi {
                    number: v.number.value(),
                    size_kib: v.size_kib,
                    minor: v.minor,
                    flags: v.flags.names(),
                })
                .collect(),
            resource_count: self.resources.len(),
            snapshot_count: self.snapshot_dfns.len(),
        }
    }
}

impl Persistable for ResourceDefinition {
    fn collect_rows(&self, rows: &mut Vec<PersistedRow>) -> Result<(), RepositoryError> {
        rows.push(PersistedRow::encode(
            self.uuid,
            EntityKind::ResourceDefinition,
            self.name.as_str(),
            self.flags.bits(),
            &self.props,
            self,
            &["volume_dfns", "resources", "snapshot_dfns", "connections"],
        )?);
        for vlm_dfn in self.volume_dfns.values() {
            vlm_dfn.collect_rows(rows)?;
        }
        for rsc in self.resources.values() {
            rsc.collect_rows(rows)?;
        }
        for snap_dfn in self.snapshot_dfns.values() {
            snap_dfn.collect_rows(rows)?;
        }
        for conn in self.connections.values() {
            conn.collect_rows(rows)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeDefinition {
    pub uuid: Uuid,
    pub rsc_name: ResourceName,
    pub number: VolumeNumber,
    pub size_kib: u64,
    pub minor: u32,
    pub flags: StateFlags<VolumeDefinitionFlag>,
    pub props: Props,
}

impl VolumeDefinition {
    pub fn new(rsc_name: ResourceName, number: VolumeNumber, size_kib: u64, minor: u32) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            rsc_name,
            number,
            size_kib,
            minor,
            flags: StateFlags::empty(),
            props: Props::new(),
        }
    }

    pub fn key(&self) -> String {
        format!("{}/{}", self.rsc_name, self.number)
    }

    pub fn is_deleting(&self) -> bool {
        self.flags.is_set(VolumeDefinitionFlag::Delete)
    }
}

impl Persistable for VolumeDefinition {
    fn collect_rows(&self, rows: &mut Vec<PersistedRow>) -> Result<(), RepositoryError> {
        rows.push(PersistedRow::encode(
            self.uuid,
            EntityKind::VolumeDefinition,
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
pub struct VolumeDefinitionApi {
    pub number: u32,
    pub size_kib: u64,
    pub minor: u32,
    pub flags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDefinitionApi {
    pub uuid: Uuid,
    pub name: String,
    pub resource_group: String,
    pub tcp_port: u32,
    pub flags: Vec<String>,
    pub props: BTreeMap<String, String>,
    pub volume_dfns: Vec<VolumeDefinitionApi>,
    pub resource_count: usize,
    pub snapshot_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rsc_dfn() -> ResourceDefinition {
        ResourceDefinition::new(
            ResourceName::new("r1").unwrap(),
            ResourceGroupName::new(DEFAULT_RESOURCE_GROUP).unwrap(),
            7000,
        )
    }

    fn add_rsc(dfn: &mut ResourceDefinition, node: &str, flags: &[ResourceFlag]) {
        let node = NodeName::new(node).unwrap();
        dfn.resources.insert(
            node.clone(),
            Resource::new(node, dfn.name.clone(), StateFlags::with(flags)),
        );
    }

    #[test]
    fn test_replica_counting() {
        let mut dfn = rsc_dfn();
        add_rsc(&mut dfn, "a", &[]);
        add_rsc(&mut dfn, "b", &[]);
        add_rsc(&mut dfn, "c", &[ResourceFlag::Diskless, ResourceFlag::TieBreaker]);
        add_rsc(&mut dfn, "d", &[ResourceFlag::Delete]);
        assert_eq!(dfn.diskful_count(), 2);
        assert_eq!(dfn.active_diskless().count(), 1);
        assert_eq!(dfn.tie_breaker().unwrap().node_name.as_str(), "c");
        assert_eq!(dfn.resource_nodes().len(), 4);
    }

    #[test]
    fn test_resize_shrink_requires_resize() {
        let mut vlm_dfn = VolumeDefinition::new(
            ResourceName::new("r1").unwrap(),
            VolumeNumber::new(0).unwrap(),
            1024,
            1000,
        );
        assert!(vlm_dfn.flags.enable(VolumeDefinitionFlag::ResizeShrink).is_err());
        vlm_dfn.flags.enable(VolumeDefinitionFlag::Resize).unwrap();
        vlm_dfn.flags.enable(VolumeDefinitionFlag::ResizeShrink).unwrap();
    }

    #[test]
    fn test_rows_cover_children() {
        let mut dfn = rsc_dfn();
        let nr = VolumeNumber::new(0).unwrap();
        dfn.volume_dfns
            .insert(nr, VolumeDefinition::new(dfn.name.clone(), nr, 1024, 1000));
        add_rsc(&mut dfn, "a", &[]);
        let mut rows = Vec::new();
        dfn.collect_rows(&mut rows).unwrap();
        let kinds: Vec<EntityKind> = rows.iter().map(|r| r.kind).collect();
        assert_eq!(
            kinds,
            vec![
                EntityKind::ResourceDefinition,
                EntityKind::VolumeDefinition,
                EntityKind::Resource
            ]
        );
        let decoded: ResourceDefinition = rows[0].decode().unwrap();
        assert_eq!(decoded.tcp_port, 7000);
        assert!(decoded.resources.is_empty());
    }
}
