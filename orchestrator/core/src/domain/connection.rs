// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Connections
//!
//! Pairwise relations between two nodes, two resources of the same
//! definition, or two volumes of those resources. Each owns a property bag
//! (typically network and DRBD path options). The pair is stored in sorted
//! order so `(a, b)` and `(b, a)` address the same connection.

use crate::domain::names::{NodeName, ResourceName, VolumeNumber};
use crate::domain::props::Props;
use crate::domain::repository::{EntityKind, Persistable, PersistedRow, RepositoryError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Canonical ordering of an unordered node pair
pub fn ordered_pair(a: NodeName, b: NodeName) -> (NodeName, NodeName) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConnection {
    pub uuid: Uuid,
    pub node_a: NodeName,
    pub node_b: NodeName,
    pub props: Props,
}

impl NodeConnection {
    pub fn new(a: NodeName, b: NodeName) -> Self {
        let (node_a, node_b) = ordered_pair(a, b);
        Self {
            uuid: Uuid::new_v4(),
            node_a,
            node_b,
            props: Props::new(),
        }
    }

    pub fn pair(&self) -> (NodeName, NodeName) {
        (self.node_a.clone(), self.node_b.clone())
    }

    pub fn involves(&self, node: &NodeName) -> bool {
        &self.node_a == node || &self.node_b == node
    }
}

impl Persistable for NodeConnection {
    fn collect_rows(&self, rows: &mut Vec<PersistedRow>) -> Result<(), RepositoryError> {
        rows.push(PersistedRow::encode(
            self.uuid,
            EntityKind::NodeConnection,
            format!("{}/{}", self.node_a, self.node_b),
            0,
            &self.props,
            self,
            &[],
        )?);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceConnection {
    pub uuid: Uuid,
    pub rsc_name: ResourceName,
    pub node_a: NodeName,
    pub node_b: NodeName,
    pub props: Props,
    #[serde(
        default,
        serialize_with = "crate::domain::serialize_values",
        skip_deserializing
    )]
    pub volume_conns: BTreeMap<VolumeNumber, VolumeConnection>,
}

impl ResourceConnection {
    pub fn new(rsc_name: ResourceName, a: NodeName, b: NodeName) -> Self {
        let (node_a, node_b) = ordered_pair(a, b);
        Self {
            uuid: Uuid::new_v4(),
            rsc_name,
            node_a,
            node_b,
            props: Props::new(),
            volume_conns: BTreeMap::new(),
        }
    }

    pub fn pair(&self) -> (NodeName, NodeName) {
        (self.node_a.clone(), self.node_b.clone())
    }

    pub fn involves(&self, node: &NodeName) -> bool {
        &self.node_a == node || &self.node_b == node
    }
}

impl Persistable for ResourceConnection {
    fn collect_rows(&self, rows: &mut Vec<PersistedRow>) -> Result<(), RepositoryError> {
        rows.push(PersistedRow::encode(
            self.uuid,
            EntityKind::ResourceConnection,
            format!("{}/{}/{}", self.rsc_name, self.node_a, self.node_b),
            0,
            &self.props,
            self,
            &["volume_conns"],
        )?);
        for conn in self.volume_conns.values() {
            conn.collect_rows(rows)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeConnection {
    pub uuid: Uuid,
    pub rsc_name: ResourceName,
    pub node_a: NodeName,
    pub node_b: NodeName,
    pub number: VolumeNumber,
    pub props: Props,
}

impl VolumeConnection {
    pub fn new(rsc_name: ResourceName, a: NodeName, b: NodeName, number: VolumeNumber) -> Self {
        let (node_a, node_b) = ordered_pair(a, b);
        Self {
            uuid: Uuid::new_v4(),
            rsc_name,
            node_a,
            node_b,
            number,
            props: Props::new(),
        }
    }
}

impl Persistable for VolumeConnection {
    fn collect_rows(&self, rows: &mut Vec<PersistedRow>) -> Result<(), RepositoryError> {
        rows.push(PersistedRow::encode(
            self.uuid,
            EntityKind::VolumeConnection,
            format!(
                "{}/{}/{}/{}",
                self.rsc_name, self.node_a, self.node_b, self.number
            ),
            0,
            &self.props,
            self,
            &[],
        )?);
        Ok(())
    }
}

/// Listing view of any connection type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionApi {
    pub uuid: Uuid,
    pub node_a: String,
    pub node_b: String,
    pub rsc_name: Option<String>,
    pub volume_number: Option<u32>,
    pub props: BTreeMap<String, String>,
}

impl From<&NodeConnection> for ConnectionApi {
    fn from(conn: &NodeConnection) -> Self {
        Self {
            uuid: conn.uuid,
            node_a: conn.node_a.to_string(),
            node_b: conn.node_b.to_string(),
            rsc_name: None,
            volume_number: None,
            props: conn.props.to_map(),
        }
    }
}

impl From<&ResourceConnection> for ConnectionApi {
    fn from(conn: &ResourceConnection) -> Self {
        Self {
            uuid: conn.uuid,
            node_a: conn.node_a.to_string(),
            node_b: conn.node_b.to_string(),
            rsc_name: Some(conn.rsc_name.to_string()),
            volume_number: None,
            props: conn.props.to_map(),
        }
    }
}

impl From<&VolumeConnection> for ConnectionApi {
    fn from(conn: &VolumeConnection) -> Self {
        Self {
            uuid: conn.uuid,
            node_a: conn.node_a.to_string(),
            node_b: conn.node_b.to_string(),
            rsc_name: Some(conn.rsc_name.to_string()),
            volume_number: Some(conn.number.value()),
            props: conn.props.to_map(),
        }
    }
}
