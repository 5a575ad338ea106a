// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Satellite Registry
//!
//! Tracks, per node, the connection status, the peer handle and the last
//! state the satellite reported. Every status change is published on the
//! event bus; the connection notifier reacts to those events.
//!
//! Handler code only reads from the registry. Status transitions come from
//! the transport layer (or from tests driving a [`MockSatellite`]).
//!
//! [`MockSatellite`]: super::MockSatellite

use crate::domain::events::SatelliteEvent;
use crate::domain::names::{NodeName, ResourceName};
use crate::domain::satellite::{ConnectionStatus, ResourceState, SatellitePeer, SatelliteState};
use crate::infrastructure::event_bus::EventBus;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

struct SatelliteEntry {
    status: ConnectionStatus,
    peer: Option<Arc<dyn SatellitePeer>>,
    state: SatelliteState,
}

impl Default for SatelliteEntry {
    fn default() -> Self {
        Self {
            status: ConnectionStatus::Offline,
            peer: None,
            state: SatelliteState::default(),
        }
    }
}

pub struct SatelliteRegistry {
    entries: DashMap<NodeName, SatelliteEntry>,
    event_bus: EventBus,
    next_update_id: AtomicU64,
}

impl SatelliteRegistry {
    pub fn new(event_bus: EventBus) -> Self {
        Self {
            entries: DashMap::new(),
            event_bus,
            next_update_id: AtomicU64::new(1),
        }
    }

    /// A peer connected; the satellite still has to finish its full sync
    pub fn connect(&self, peer: Arc<dyn SatellitePeer>) {
        let node_name = peer.node_name().clone();
        {
            let mut entry = self.entries.entry(node_name.clone()).or_default();
            entry.peer = Some(peer);
            entry.status = ConnectionStatus::Connected;
        }
        info!(node = %node_name, "Satellite connected");
        self.event_bus.publish_satellite_event(SatelliteEvent::Connected {
            node_name,
            connected_at: Utc::now(),
        });
    }

    /// Full sync finished; returns false if no peer is connected for the node
    pub fn mark_online(&self, node_name: &NodeName) -> bool {
        {
            let Some(mut entry) = self.entries.get_mut(node_name) else {
                warn!(node = %node_name, "Cannot mark unknown satellite online");
                return false;
            };
            if entry.peer.is_none() {
                warn!(node = %node_name, "Cannot mark disconnected satellite online");
                return false;
            }
            entry.status = ConnectionStatus::Online;
        }
        info!(node = %node_name, "Satellite online");
        self.event_bus.publish_satellite_event(SatelliteEvent::Online {
            node_name: node_name.clone(),
            online_at: Utc::now(),
        });
        true
    }

    pub fn mark_full_sync_failed(&self, node_name: &NodeName) {
        if let Some(mut entry) = self.entries.get_mut(node_name) {
            if entry.peer.is_some() {
                entry.status = ConnectionStatus::FullSyncFailed;
                warn!(node = %node_name, "Satellite rejected full sync");
            }
        }
    }

    /// Drops the peer, closing it, and forgets the reported state
    pub async fn disconnect(&self, node_name: &NodeName, reason: impl Into<String>) {
        let reason = reason.into();
        let peer = match self.entries.get_mut(node_name) {
            Some(mut entry) => {
                entry.status = ConnectionStatus::Offline;
                entry.state = SatelliteState::default();
                entry.peer.take()
            }
            None => None,
        };
        let Some(peer) = peer else {
            debug!(node = %node_name, "Satellite already disconnected");
            return;
        };
        peer.close().await;
        info!(node = %node_name, reason = %reason, "Satellite disconnected");
        self.event_bus.publish_satellite_event(SatelliteEvent::Disconnected {
            node_name: node_name.clone(),
            reason,
            disconnected_at: Utc::now(),
        });
    }

    /// Removes every trace of a deleted or lost node
    pub fn forget(&self, node_name: &NodeName) {
        if self.entries.remove(node_name).is_some() {
            debug!(node = %node_name, "Satellite entry removed");
        }
    }

    pub fn status(&self, node_name: &NodeName) -> ConnectionStatus {
        self.entries
            .get(node_name)
            .map(|e| e.status)
            .unwrap_or(ConnectionStatus::Offline)
    }

    pub fn is_online(&self, node_name: &NodeName) -> bool {
        self.status(node_name).is_online()
    }

    pub fn peer(&self, node_name: &NodeName) -> Option<Arc<dyn SatellitePeer>> {
        self.entries.get(node_name).and_then(|e| e.peer.clone())
    }

    pub fn state(&self, node_name: &NodeName) -> SatelliteState {
        self.entries
            .get(node_name)
            .map(|e| e.state.clone())
            .unwrap_or_default()
    }

    pub fn resource_state(&self, node_name: &NodeName, rsc_name: &ResourceName) -> Option<ResourceState> {
        self.entries
            .get(node_name)
            .and_then(|e| e.state.resource(rsc_name))
    }

    /// Records what a satellite reported for one of its resources
    pub fn report_resource(&self, node_name: &NodeName, rsc_name: ResourceName, state: ResourceState) {
        self.entries
            .entry(node_name.clone())
            .or_default()
            .state
            .resources
            .insert(rsc_name, state);
    }

    pub fn online_nodes(&self) -> Vec<NodeName> {
        let mut nodes: Vec<NodeName> = self
            .entries
            .iter()
            .filter(|e| e.status.is_online())
            .map(|e| e.key().clone())
            .collect();
        nodes.sort();
        nodes
    }

    /// Monotonic id stamped on every outgoing update
    pub fn next_update_id(&self) -> u64 {
        self.next_update_id.fetch_add(1, Ordering::SeqCst)
    }
}
