// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Domain Events
//!
//! Events published on the event bus. Satellite events drive the connection
//! notifier; object events are published after every successful commit.

use crate::domain::names::NodeName;
use crate::domain::repository::EntityKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum SatelliteEvent {
    Connected {
        node_name: NodeName,
        connected_at: DateTime<Utc>,
    },
    /// Full sync finished; the satellite now applies updates
    Online {
        node_name: NodeName,
        online_at: DateTime<Utc>,
    },
    Disconnected {
        node_name: NodeName,
        reason: String,
        disconnected_at: DateTime<Utc>,
    },
}

impl SatelliteEvent {
    pub fn node_name(&self) -> &NodeName {
        match self {
            SatelliteEvent::Connected { node_name, .. }
            | SatelliteEvent::Online { node_name, .. }
            | SatelliteEvent::Disconnected { node_name, .. } => node_name,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum ObjectEvent {
    Created {
        kind: EntityKind,
        uuid: Uuid,
        key: String,
    },
    Modified {
        kind: EntityKind,
        uuid: Uuid,
        key: String,
    },
    Deleted {
        kind: EntityKind,
        uuid: Uuid,
        key: String,
    },
}

impl ObjectEvent {
    pub fn kind(&self) -> EntityKind {
        match self {
            ObjectEvent::Created { kind, .. }
            | ObjectEvent::Modified { kind, .. }
            | ObjectEvent::Deleted { kind, .. } => *kind,
        }
    }

    pub fn key(&self) -> &str {
        match self {
            ObjectEvent::Created { key, .. }
            | ObjectEvent::Modified { key, .. }
            | ObjectEvent::Deleted { key, .. } => key,
        }
    }
}
