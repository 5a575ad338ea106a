// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Persistence Contracts
//!
//! The object store persists through a single [`PersistenceDriver`]. Every
//! entity is rendered into one [`PersistedRow`] keyed by UUID, with a
//! `(kind, key)` pair that is unique per namespace, its flags as an integer
//! and its properties as separate key/value rows.
//!
//! | Driver | Backend |
//! |--------|---------|
//! | `InMemoryPersistence` | process memory, records every commit |
//! | `PostgresPersistence` | `stork_objects` + `stork_props` tables |
//!
//! The driver is selected at controller startup from `stork-config.yaml`.

use crate::domain::props::Props;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Entity kinds in load order: parents always precede their children
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    CtrlProps,
    Node,
    StorPool,
    NodeConnection,
    StorPoolDefinition,
    ResourceGroup,
    ResourceDefinition,
    VolumeDefinition,
    Resource,
    Volume,
    ResourceConnection,
    VolumeConnection,
    SnapshotDefinition,
    Snapshot,
    Remote,
    Schedule,
    ExternalFile,
}

impl EntityKind {
    pub const ALL: [EntityKind; 17] = [
        EntityKind::CtrlProps,
        EntityKind::Node,
        EntityKind::StorPool,
        EntityKind::NodeConnection,
        EntityKind::StorPoolDefinition,
        EntityKind::ResourceGroup,
        EntityKind::ResourceDefinition,
        EntityKind::VolumeDefinition,
        EntityKind::Resource,
        EntityKind::Volume,
        EntityKind::ResourceConnection,
        EntityKind::VolumeConnection,
        EntityKind::SnapshotDefinition,
        EntityKind::Snapshot,
        EntityKind::Remote,
        EntityKind::Schedule,
        EntityKind::ExternalFile,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::CtrlProps => "ctrl_props",
            EntityKind::Node => "node",
            EntityKind::StorPool => "stor_pool",
            EntityKind::NodeConnection => "node_connection",
            EntityKind::StorPoolDefinition => "stor_pool_definition",
            EntityKind::ResourceGroup => "resource_group",
            EntityKind::ResourceDefinition => "resource_definition",
            EntityKind::VolumeDefinition => "volume_definition",
            EntityKind::Resource => "resource",
            EntityKind::Volume => "volume",
            EntityKind::ResourceConnection => "resource_connection",
            EntityKind::VolumeConnection => "volume_connection",
            EntityKind::SnapshotDefinition => "snapshot_definition",
            EntityKind::Snapshot => "snapshot",
            EntityKind::Remote => "remote",
            EntityKind::Schedule => "schedule",
            EntityKind::ExternalFile => "external_file",
        }
    }

    pub fn parse(value: &str) -> Option<EntityKind> {
        EntityKind::ALL.into_iter().find(|k| k.as_str() == value)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One persisted entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedRow {
    pub uuid: Uuid,
    pub kind: EntityKind,
    /// Name-derived key, unique per kind
    pub key: String,
    pub flags: u64,
    pub props: BTreeMap<String, String>,
    /// Remaining entity fields
    pub data: serde_json::Value,
}

impl PersistedRow {
    /// Renders an entity, moving `props` and `flags` into their own columns and
    /// dropping child collections, which are persisted as rows of their own.
    pub fn encode<T: Serialize>(
        uuid: Uuid,
        kind: EntityKind,
        key: impl Into<String>,
        flags: u64,
        props: &Props,
        entity: &T,
        children: &[&str],
    ) -> Result<Self, RepositoryError> {
        let mut data = serde_json::to_value(entity)
            .map_err(|e| RepositoryError::Serialization(e.to_string()))?;
        if let Some(obj) = data.as_object_mut() {
            obj.remove("props");
            obj.remove("flags");
            for child in children {
                obj.remove(*child);
            }
        }
        Ok(Self {
            uuid,
            kind,
            key: key.into(),
            flags,
            props: props.to_map(),
            data,
        })
    }

    /// Rebuilds an entity from its row
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, RepositoryError> {
        let mut data = self.data.clone();
        let obj = data.as_object_mut().ok_or_else(|| {
            RepositoryError::Serialization(format!("{} row {} is not an object", self.kind, self.key))
        })?;
        obj.insert(
            "props".to_string(),
            serde_json::to_value(&self.props)
                .map_err(|e| RepositoryError::Serialization(e.to_string()))?,
        );
        obj.insert("flags".to_string(), serde_json::Value::from(self.flags));
        serde_json::from_value(data).map_err(|e| {
            RepositoryError::Serialization(format!("{} row {}: {}", self.kind, self.key, e))
        })
    }

    pub fn decode_props(&self) -> Result<Props, RepositoryError> {
        Props::from_pairs(self.props.clone())
            .map_err(|e| RepositoryError::Serialization(e.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PersistOp {
    Upsert(PersistedRow),
    Delete { uuid: Uuid, kind: EntityKind },
}

impl PersistOp {
    pub fn uuid(&self) -> Uuid {
        match self {
            PersistOp::Upsert(row) => row.uuid,
            PersistOp::Delete { uuid, .. } => *uuid,
        }
    }
}

/// Entities that render into persisted rows, their children included
pub trait Persistable {
    fn collect_rows(&self, rows: &mut Vec<PersistedRow>) -> Result<(), RepositoryError>;
}

/// Durable backend of the object store
#[async_trait]
pub trait PersistenceDriver: Send + Sync {
    /// Every persisted row, in any order
    async fn load_all(&self) -> Result<Vec<PersistedRow>, RepositoryError>;

    /// Applies all operations atomically or none of them
    async fn commit(&self, ops: &[PersistOp]) -> Result<(), RepositoryError>;
}

/// Repository errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum RepositoryError {
    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        flags: u64,
        props: Props,
        #[serde(default, skip_deserializing)]
        children: Vec<u32>,
    }

    #[test]
    fn test_encode_strips_columns_and_children() {
        let sample = Sample {
            name: "alpha".into(),
            flags: 3,
            props: Props::from_pairs([("a/b", "c")]).unwrap(),
            children: vec![1, 2],
        };
        let row = PersistedRow::encode(
            Uuid::new_v4(),
            EntityKind::Node,
            "alpha",
            sample.flags,
            &sample.props,
            &sample,
            &["children"],
        )
        .unwrap();
        assert_eq!(row.data, serde_json::json!({ "name": "alpha" }));
        assert_eq!(row.props.get("a/b").map(String::as_str), Some("c"));

        let decoded: Sample = row.decode().unwrap();
        assert_eq!(decoded.flags, 3);
        assert_eq!(decoded.props, sample.props);
        assert!(decoded.children.is_empty());
    }

    #[test]
    fn test_kind_order_puts_parents_first() {
        assert!(EntityKind::Node < EntityKind::StorPool);
        assert!(EntityKind::ResourceDefinition < EntityKind::Resource);
        assert!(EntityKind::Resource < EntityKind::Volume);
        assert!(EntityKind::SnapshotDefinition < EntityKind::Snapshot);
        assert_eq!(EntityKind::parse("volume_connection"), Some(EntityKind::VolumeConnection));
    }
}
