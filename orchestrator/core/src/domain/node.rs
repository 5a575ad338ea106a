// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Node
//!
//! Node aggregate: one satellite host together with the storage pools it
//! provides.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Lock domain:** `NODES` (storage pools and node connections included)

use crate::domain::flags::{lifecycle_flags, StateFlags};
use crate::domain::names::{NodeName, StorPoolName};
use crate::domain::props::Props;
use crate::domain::repository::{EntityKind, Persistable, PersistedRow, RepositoryError};
use crate::domain::satellite::ConnectionStatus;
use crate::domain::storage_pool::{StorPool, StorPoolApi};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

lifecycle_flags! {
    pub enum NodeFlag {
        Delete(0) "DELETE" requires [] forbids [] sticky true,
        Evicted(1) "EVICTED" requires [] forbids [Delete] sticky false,
        Evacuate(2) "EVACUATE" requires [] forbids [Delete] sticky false,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeType {
    Controller,
    Satellite,
    Combined,
}

impl NodeType {
    /// Whether the controller pushes storage configuration to this node
    pub fn is_satellite(self) -> bool {
        matches!(self, NodeType::Satellite | NodeType::Combined)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub uuid: Uuid,
    pub name: NodeName,
    pub node_type: NodeType,
    pub flags: StateFlags<NodeFlag>,
    pub props: Props,
    pub created_at: DateTime<Utc>,
    #[serde(
        default,
        serialize_with = "crate::domain::serialize_values",
        skip_deserializing
    )]
    pub stor_pools: BTreeMap<StorPoolName, StorPool>,
}

impl Node {
    pub fn new(name: NodeName, node_type: NodeType) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            name,
            node_type,
            flags: StateFlags::empty(),
            props: Props::new(),
            created_at: Utc::now(),
            stor_pools: BTreeMap::new(),
        }
    }

    pub fn is_deleting(&self) -> bool {
        self.flags.is_set(NodeFlag::Delete)
    }

    pub fn api_view(&self, connection_status: ConnectionStatus) -> NodeApi {
        NodeApi {
            uuid: self.uuid,
            name: self.name.to_string(),
            node_type: self.node_type,
            flags: self.flags.names(),
            props: self.props.to_map(),
            connection_status,
            stor_pools: self.stor_pools.values().map(StorPool::api_view).collect(),
        }
    }
}

impl Persistable for Node {
    fn collect_rows(&self, rows: &mut Vec<PersistedRow>) -> Result<(), RepositoryError> {
        rows.push(PersistedRow::encode(
            self.uuid,
            EntityKind::Node,
            self.name.as_str(),
            self.flags.bits(),
            &self.props,
            self,
            &["stor_pools"],
        )?);
        for sp in self.stor_pools.values() {
            sp.collect_rows(rows)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeApi {
    pub uuid: Uuid,
    pub name: String,
    pub node_type: NodeType,
    pub flags: Vec<String>,
    pub props: BTreeMap<String, String>,
    pub connection_status: ConnectionStatus,
    pub stor_pools: Vec<StorPoolApi>,
}
