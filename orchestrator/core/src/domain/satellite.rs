// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Satellite Collaborators
//!
//! Contracts between the controller and its satellites: the peer connection,
//! the connection status the registry tracks, the state satellites report
//! back, and the content pushed to them.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Transport-neutral traits; the wire format is owned by the
//!   [`StateSerializer`] implementation

use crate::domain::api_rc::ApiCallRc;
use crate::domain::errors::ApiError;
use crate::domain::external_file::ExternalFile;
use crate::domain::names::{NodeName, ResourceName, StorPoolName};
use crate::domain::node::Node;
use crate::domain::props::Props;
use crate::domain::remote::Remote;
use crate::domain::resource_definition::ResourceDefinition;
use crate::domain::snapshot::SnapshotDefinition;
use crate::domain::storage_pool::StorPool;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionStatus {
    /// No connection
    Offline,
    /// Connected, initial full sync not finished
    Connected,
    /// Connected and in sync
    Online,
    /// Connected, but the satellite rejected the full sync
    FullSyncFailed,
}

impl ConnectionStatus {
    pub fn is_online(self) -> bool {
        matches!(self, ConnectionStatus::Online)
    }

    pub fn is_connected(self) -> bool {
        !matches!(self, ConnectionStatus::Offline)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PeerError {
    #[error("satellite is not connected")]
    NotConnected,

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("satellite did not answer within {0:?}")]
    Timeout(std::time::Duration),

    #[error("transport error: {0}")]
    Transport(String),
}

/// Per-resource state reported by a satellite
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResourceState {
    /// `None` until the satellite has reported
    pub in_use: Option<bool>,
    pub up_to_date: bool,
}

/// Last state reported by one satellite
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SatelliteState {
    pub resources: BTreeMap<ResourceName, ResourceState>,
}

impl SatelliteState {
    pub fn resource(&self, rsc_name: &ResourceName) -> Option<ResourceState> {
        self.resources.get(rsc_name).copied()
    }

    pub fn is_in_use(&self, rsc_name: &ResourceName) -> bool {
        self.resource(rsc_name)
            .and_then(|s| s.in_use)
            .unwrap_or(false)
    }
}

/// State pushed to a satellite for one update
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UpdateContent {
    ResourceDefinition(ResourceDefinition),
    Node(Node),
    NodeDeleted { node_name: NodeName },
    StorPool(StorPool),
    StorPoolDeleted {
        node_name: NodeName,
        stor_pool: StorPoolName,
    },
    SnapshotDefinition(SnapshotDefinition),
    Remote(Remote),
    ExternalFile(ExternalFile),
    ControllerConfig { props: Props },
}

impl UpdateContent {
    pub fn describe(&self) -> String {
        match self {
            UpdateContent::ResourceDefinition(dfn) => format!("resource definition '{}'", dfn.name),
            UpdateContent::Node(node) => format!("node '{}'", node.name),
            UpdateContent::NodeDeleted { node_name } => format!("deleted node '{}'", node_name),
            UpdateContent::StorPool(sp) => {
                format!("storage pool '{}' on node '{}'", sp.name, sp.node_name)
            }
            UpdateContent::StorPoolDeleted {
                node_name,
                stor_pool,
            } => format!("deleted storage pool '{}' on node '{}'", stor_pool, node_name),
            UpdateContent::SnapshotDefinition(snap) => {
                format!("snapshot '{}' of resource '{}'", snap.name, snap.rsc_name)
            }
            UpdateContent::Remote(remote) => format!("remote '{}'", remote.name),
            UpdateContent::ExternalFile(file) => format!("external file '{}'", file.name),
            UpdateContent::ControllerConfig { .. } => "controller configuration".to_string(),
        }
    }
}

/// One message to one satellite
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdatePayload {
    /// Monotonic id, lets satellites discard stale updates
    pub update_id: u64,
    pub target: String,
    pub body: Bytes,
}

/// Renders update content into the satellite wire format
pub trait StateSerializer: Send + Sync {
    fn serialize(&self, content: &UpdateContent) -> Result<Bytes, ApiError>;
}

/// Connection to one satellite
#[async_trait]
pub trait SatellitePeer: Send + Sync {
    fn node_name(&self) -> &NodeName;

    /// Sends one update and waits for the satellite's answer
    async fn api_call(&self, payload: UpdatePayload) -> Result<ApiCallRc, PeerError>;

    async fn close(&self);
}
