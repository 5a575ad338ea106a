// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Satellite Propagation Engine
//!
//! Pushes the current state of one object to every satellite that has to
//! know about it and turns the answers into result batches.
//!
//! - Satellites that are online receive the update concurrently; each
//!   round-trip is bounded by the configured timeout.
//! - Offline, lost or timed-out satellites are reported as
//!   `WARN_NOT_CONNECTED`. They will receive the state again when they
//!   reconnect, so this is not a failure of the operation.
//! - A satellite answering with error entries has not acknowledged; its
//!   entries are passed on to the caller.
//! - When at least one relevant satellite did not acknowledge, the stream
//!   ends with [`ApiError::Delayed`]. Callers chaining a finalization step
//!   after the propagation therefore stop there, and the step is resumed by
//!   the connection notifier once every satellite is back.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Collaborators:** [`SatelliteRegistry`], [`StateSerializer`]

use crate::application::scope_runner::{rc_stream, RcStream, Scope};
use crate::domain::api_rc::{ApiCallRc, RcEntry, ReturnCode};
use crate::domain::errors::ApiError;
use crate::domain::lock_domain::{LockObj, LockRequest};
use crate::domain::names::{ExternalFileName, NodeName, RemoteName, ResourceName, SnapshotName, StorPoolName};
use crate::domain::satellite::{ConnectionStatus, PeerError, StateSerializer, UpdateContent, UpdatePayload};
use crate::infrastructure::object_store::Transaction;
use crate::infrastructure::satellite::SatelliteRegistry;
use async_stream::try_stream;
use futures::stream::{BoxStream, FuturesUnordered, StreamExt};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

// ============================================================================
// Targets
// ============================================================================

/// Object whose state is pushed to the satellites
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateTarget {
    ResourceDefinition(ResourceName),
    Node(NodeName),
    /// The node is gone; its former peers drop their view of it
    NodeDeleted {
        node_name: NodeName,
        peers: Vec<NodeName>,
    },
    StorPool {
        node_name: NodeName,
        stor_pool: StorPoolName,
    },
    StorPoolDeleted {
        node_name: NodeName,
        stor_pool: StorPoolName,
    },
    SnapshotDefinition {
        rsc_name: ResourceName,
        snapshot_name: SnapshotName,
    },
    Remote(RemoteName),
    ExternalFile(ExternalFileName),
    ControllerConfig,
}

impl UpdateTarget {
    /// Domains read while rendering the update
    pub fn read_locks(&self) -> LockRequest {
        let objs: &[LockObj] = match self {
            UpdateTarget::ResourceDefinition(_) | UpdateTarget::SnapshotDefinition { .. } => {
                &[LockObj::ResourceDefinitions]
            }
            UpdateTarget::Node(_) => &[LockObj::Nodes, LockObj::ResourceDefinitions],
            UpdateTarget::NodeDeleted { .. } | UpdateTarget::StorPoolDeleted { .. } => &[],
            UpdateTarget::StorPool { .. } => &[LockObj::Nodes],
            UpdateTarget::Remote(_) => &[LockObj::Nodes, LockObj::Remotes],
            UpdateTarget::ExternalFile(_) => &[LockObj::Nodes, LockObj::ExternalFiles],
            UpdateTarget::ControllerConfig => &[LockObj::Nodes, LockObj::CtrlConfig],
        };
        LockRequest::new().read(objs)
    }
}

impl fmt::Display for UpdateTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateTarget::ResourceDefinition(rsc) => write!(f, "resource definition '{}'", rsc),
            UpdateTarget::Node(node) => write!(f, "node '{}'", node),
            UpdateTarget::NodeDeleted { node_name, .. } => write!(f, "deleted node '{}'", node_name),
            UpdateTarget::StorPool {
                node_name,
                stor_pool,
            } => write!(f, "storage pool '{}' on node '{}'", stor_pool, node_name),
            UpdateTarget::StorPoolDeleted {
                node_name,
                stor_pool,
            } => write!(f, "deleted storage pool '{}' on node '{}'", stor_pool, node_name),
            UpdateTarget::SnapshotDefinition {
                rsc_name,
                snapshot_name,
            } => write!(f, "snapshot '{}' of resource '{}'", snapshot_name, rsc_name),
            UpdateTarget::Remote(name) => write!(f, "remote '{}'", name),
            UpdateTarget::ExternalFile(name) => write!(f, "external file '{}'", name),
            UpdateTarget::ControllerConfig => f.write_str("controller configuration"),
        }
    }
}

/// Rendered update, one message per relevant satellite
#[derive(Debug, Clone, Default)]
pub struct PreparedUpdate {
    pub messages: Vec<(NodeName, UpdatePayload)>,
}

impl PreparedUpdate {
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn nodes(&self) -> Vec<NodeName> {
        self.messages.iter().map(|(node, _)| node.clone()).collect()
    }
}

// ============================================================================
// Outcomes
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum UpdateResult {
    /// Applied; the entries are the satellite's own remarks
    Applied(ApiCallRc),
    /// The satellite answered with errors
    Rejected(ApiCallRc),
    NotConnected,
    ConnectionLost(String),
    TimedOut(Duration),
    /// The satellite is connected but failed its full sync
    SyncFailed,
}

impl UpdateResult {
    /// Only a clean apply lets a finalization step run
    pub fn is_acknowledged(&self) -> bool {
        matches!(self, UpdateResult::Applied(_))
    }

    fn label(&self) -> &'static str {
        match self {
            UpdateResult::Applied(_) => "applied",
            UpdateResult::Rejected(_) => "rejected",
            UpdateResult::NotConnected => "not_connected",
            UpdateResult::ConnectionLost(_) => "connection_lost",
            UpdateResult::TimedOut(_) => "timed_out",
            UpdateResult::SyncFailed => "sync_failed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct NodeOutcome {
    pub node_name: NodeName,
    pub result: UpdateResult,
}

/// How successful deployments are reported to the caller.
///
/// Templates may use `{node}` and `{object}`.
#[derive(Debug, Clone)]
pub struct DeploymentMessages {
    object: String,
    success: String,
    primary: Option<(NodeName, String)>,
}

impl DeploymentMessages {
    pub fn new(object: impl Into<String>) -> Self {
        Self {
            object: object.into(),
            success: "Updated {object} on '{node}'".to_string(),
            primary: None,
        }
    }

    pub fn success(mut self, template: impl Into<String>) -> Self {
        self.success = template.into();
        self
    }

    /// Separate message for the node the operation is about
    pub fn primary(mut self, node_name: NodeName, template: impl Into<String>) -> Self {
        self.primary = Some((node_name, template.into()));
        self
    }

    pub fn object(&self) -> &str {
        &self.object
    }

    fn render(&self, template: &str, node_name: &NodeName) -> String {
        template
            .replace("{node}", node_name.as_str())
            .replace("{object}", &self.object)
    }

    fn success_message(&self, node_name: &NodeName) -> String {
        match &self.primary {
            Some((primary, template)) if primary == node_name => self.render(template, node_name),
            _ => self.render(&self.success, node_name),
        }
    }

    /// Result batch reporting one satellite's outcome
    pub fn report(&self, outcome: &NodeOutcome) -> ApiCallRc {
        let node = &outcome.node_name;
        let mut rc = ApiCallRc::new();
        match &outcome.result {
            UpdateResult::Applied(remarks) => {
                rc.push(
                    RcEntry::new(ReturnCode::UPDATED, self.success_message(node))
                        .with_obj_ref("node", node.as_str()),
                );
                rc.extend(remarks.clone());
            }
            UpdateResult::Rejected(errors) => rc.extend(errors.clone()),
            UpdateResult::NotConnected => rc.push(
                RcEntry::new(
                    ReturnCode::WARN_NOT_CONNECTED,
                    format!("No active connection to satellite '{}'", node),
                )
                .with_details(format!(
                    "The satellite will receive {} when it reconnects",
                    self.object
                ))
                .with_obj_ref("node", node.as_str()),
            ),
            UpdateResult::ConnectionLost(reason) => rc.push(
                RcEntry::new(
                    ReturnCode::WARN_NOT_CONNECTED,
                    format!("Connection to satellite '{}' lost", node),
                )
                .with_cause(reason.clone())
                .with_obj_ref("node", node.as_str()),
            ),
            UpdateResult::TimedOut(timeout) => rc.push(
                RcEntry::new(
                    ReturnCode::WARN_NOT_CONNECTED,
                    format!("Satellite '{}' did not answer within {:?}", node, timeout),
                )
                .with_obj_ref("node", node.as_str()),
            ),
            UpdateResult::SyncFailed => rc.push(
                RcEntry::new(
                    ReturnCode::FAIL_SATELLITE,
                    format!("Satellite '{}' failed its full sync", node),
                )
                .with_details(format!("{} could not be deployed there", self.object))
                .with_correction("Check the satellite log and reconnect the satellite")
                .with_obj_ref("node", node.as_str()),
            ),
        }
        rc
    }
}

// ============================================================================
// Engine
// ============================================================================

pub struct SatelliteUpdates {
    registry: Arc<SatelliteRegistry>,
    serializer: Arc<dyn StateSerializer>,
    timeout: Duration,
}

impl SatelliteUpdates {
    pub fn new(
        registry: Arc<SatelliteRegistry>,
        serializer: Arc<dyn StateSerializer>,
        timeout: Duration,
    ) -> Self {
        Self {
            registry,
            serializer,
            timeout,
        }
    }

    /// Renders the target's current state for every relevant satellite.
    ///
    /// A target that no longer exists renders to an empty update.
    pub fn prepare(&self, tx: &Transaction, target: &UpdateTarget) -> Result<PreparedUpdate, ApiError> {
        let (content, nodes) = match target {
            UpdateTarget::ResourceDefinition(rsc_name) => match tx.rsc_dfns()?.get(rsc_name) {
                Some(dfn) => (
                    UpdateContent::ResourceDefinition(dfn.clone()),
                    dfn.resource_nodes(),
                ),
                None => return Ok(PreparedUpdate::default()),
            },
            UpdateTarget::Node(node_name) => {
                let Some(node) = tx.nodes()?.nodes.get(node_name) else {
                    return Ok(PreparedUpdate::default());
                };
                let mut nodes = BTreeSet::from([node_name.clone()]);
                for dfn in tx.rsc_dfns()?.values() {
                    if dfn.resources.contains_key(node_name) {
                        nodes.extend(dfn.resources.keys().cloned());
                    }
                }
                (UpdateContent::Node(node.clone()), nodes.into_iter().collect())
            }
            UpdateTarget::NodeDeleted { node_name, peers } => (
                UpdateContent::NodeDeleted {
                    node_name: node_name.clone(),
                },
                peers.iter().filter(|p| *p != node_name).cloned().collect(),
            ),
            UpdateTarget::StorPool {
                node_name,
                stor_pool,
            } => match tx
                .nodes()?
                .nodes
                .get(node_name)
                .and_then(|node| node.stor_pools.get(stor_pool))
            {
                Some(sp) => (UpdateContent::StorPool(sp.clone()), vec![node_name.clone()]),
                None => return Ok(PreparedUpdate::default()),
            },
            UpdateTarget::StorPoolDeleted {
                node_name,
                stor_pool,
            } => (
                UpdateContent::StorPoolDeleted {
                    node_name: node_name.clone(),
                    stor_pool: stor_pool.clone(),
                },
                vec![node_name.clone()],
            ),
            UpdateTarget::SnapshotDefinition {
                rsc_name,
                snapshot_name,
            } => {
                let Some(dfn) = tx.rsc_dfns()?.get(rsc_name) else {
                    return Ok(PreparedUpdate::default());
                };
                let Some(snap_dfn) = dfn.snapshot_dfns.get(snapshot_name) else {
                    return Ok(PreparedUpdate::default());
                };
                let mut nodes: BTreeSet<NodeName> = snap_dfn.snapshots.keys().cloned().collect();
                nodes.extend(dfn.resources.keys().cloned());
                (
                    UpdateContent::SnapshotDefinition(snap_dfn.clone()),
                    nodes.into_iter().collect(),
                )
            }
            UpdateTarget::Remote(name) => match tx.remotes()?.get(name) {
                Some(remote) => (UpdateContent::Remote(remote.clone()), satellites(tx)?),
                None => return Ok(PreparedUpdate::default()),
            },
            UpdateTarget::ExternalFile(name) => match tx.ext_files()?.get(name) {
                Some(file) => (UpdateContent::ExternalFile(file.clone()), satellites(tx)?),
                None => return Ok(PreparedUpdate::default()),
            },
            UpdateTarget::ControllerConfig => (
                UpdateContent::ControllerConfig {
                    props: tx.ctrl()?.props.clone(),
                },
                satellites(tx)?,
            ),
        };

        let body = self.serializer.serialize(&content)?;
        let description = content.describe();
        let messages = nodes
            .into_iter()
            .map(|node| {
                let payload = UpdatePayload {
                    update_id: self.registry.next_update_id(),
                    target: description.clone(),
                    body: body.clone(),
                };
                (node, payload)
            })
            .collect();
        Ok(PreparedUpdate { messages })
    }

    /// Sends every message concurrently; outcomes arrive as they complete
    pub fn dispatch(&self, prepared: PreparedUpdate) -> BoxStream<'static, NodeOutcome> {
        prepared
            .messages
            .into_iter()
            .map(|(node_name, payload)| {
                send(Arc::clone(&self.registry), node_name, payload, self.timeout)
            })
            .collect::<FuturesUnordered<_>>()
            .boxed()
    }

    /// Propagates `target` within `scope` and reports every satellite's
    /// outcome. Ends with [`ApiError::Delayed`] unless every relevant
    /// satellite acknowledged.
    pub fn update_satellites(
        self: &Arc<Self>,
        scope: &Scope,
        target: UpdateTarget,
        messages: DeploymentMessages,
    ) -> RcStream {
        let engine = Arc::clone(self);
        let scope = scope.clone();
        rc_stream(try_stream! {
            let prepared = scope.with_tx(|tx| engine.prepare(tx, &target))?;
            if prepared.is_empty() {
                debug!(target = %target, "no satellite to update");
            }
            let mut pending = Vec::new();
            let mut outcomes = engine.dispatch(prepared);
            while let Some(outcome) = outcomes.next().await {
                if !outcome.result.is_acknowledged() {
                    pending.push(outcome.node_name.clone());
                }
                let rc = messages.report(&outcome);
                if !rc.is_empty() {
                    yield rc;
                }
            }
            if !pending.is_empty() {
                pending.sort();
                debug!(target = %target, nodes = ?pending, "update not acknowledged by every satellite");
                Err::<(), _>(ApiError::Delayed(pending))?;
            }
        })
    }
}

/// Every registered node that runs a satellite
fn satellites(tx: &Transaction) -> Result<Vec<NodeName>, ApiError> {
    Ok(tx
        .nodes()?
        .nodes
        .values()
        .filter(|node| node.node_type.is_satellite())
        .map(|node| node.name.clone())
        .collect())
}

async fn send(
    registry: Arc<SatelliteRegistry>,
    node_name: NodeName,
    payload: UpdatePayload,
    timeout: Duration,
) -> NodeOutcome {
    let result = match registry.status(&node_name) {
        ConnectionStatus::Online => match registry.peer(&node_name) {
            Some(peer) => match tokio::time::timeout(timeout, peer.api_call(payload)).await {
                Ok(Ok(rc)) if rc.has_errors() => UpdateResult::Rejected(rc),
                Ok(Ok(rc)) => UpdateResult::Applied(rc),
                Ok(Err(PeerError::NotConnected)) => UpdateResult::NotConnected,
                Ok(Err(PeerError::Timeout(after))) => UpdateResult::TimedOut(after),
                Ok(Err(e)) => UpdateResult::ConnectionLost(e.to_string()),
                Err(_) => UpdateResult::TimedOut(timeout),
            },
            None => UpdateResult::NotConnected,
        },
        ConnectionStatus::FullSyncFailed => UpdateResult::SyncFailed,
        ConnectionStatus::Offline | ConnectionStatus::Connected => UpdateResult::NotConnected,
    };
    match &result {
        UpdateResult::Rejected(rc) => {
            warn!(node = %node_name, entries = rc.entries.len(), "Satellite rejected update")
        }
        UpdateResult::ConnectionLost(reason) => {
            warn!(node = %node_name, reason = %reason, "Satellite connection lost during update")
        }
        UpdateResult::TimedOut(after) => {
            warn!(node = %node_name, timeout = ?after, "Satellite update timed out")
        }
        _ => {}
    }
    metrics::counter!("stork_satellite_updates_total", "outcome" => result.label()).increment(1);
    NodeOutcome { node_name, result }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::lock_manager::LockManager;
    use crate::application::scope_runner::ScopeRunner;
    use crate::domain::lock_domain::LockObj;
    use crate::domain::names::ResourceGroupName;
    use crate::domain::resource::Resource;
    use crate::domain::resource_definition::ResourceDefinition;
    use crate::domain::flags::StateFlags;
    use crate::infrastructure::event_bus::EventBus;
    use crate::infrastructure::number_pools::NumberPools;
    use crate::infrastructure::object_store::ObjectStore;
    use crate::infrastructure::repositories::InMemoryPersistence;
    use crate::infrastructure::satellite::{JsonStateSerializer, MockBehavior, MockSatellite};
    use futures::StreamExt;

    struct Harness {
        runner: ScopeRunner,
        registry: Arc<SatelliteRegistry>,
        engine: Arc<SatelliteUpdates>,
    }

    fn node(name: &str) -> NodeName {
        NodeName::new(name).unwrap()
    }

    async fn harness(nodes: &[&str]) -> Harness {
        let bus = EventBus::new(64);
        let store = ObjectStore::new(
            Arc::new(InMemoryPersistence::new()),
            Arc::new(NumberPools::default()),
            bus.clone(),
        );
        let runner = ScopeRunner::new(Arc::new(LockManager::new()), store);
        let names: Vec<NodeName> = nodes.iter().map(|n| node(n)).collect();
        let setup = runner.transactional(
            "setup",
            LockRequest::new().write(&[LockObj::ResourceDefinitions]),
            move |scope| {
                crate::application::scope_runner::from_result(scope.with_tx(|tx| {
                    let rsc = ResourceName::new("r1")?;
                    let mut dfn = ResourceDefinition::new(
                        rsc.clone(),
                        ResourceGroupName::new("DfltRscGrp")?,
                        7000,
                    );
                    for n in &names {
                        dfn.resources
                            .insert(n.clone(), Resource::new(n.clone(), rsc.clone(), StateFlags::empty()));
                    }
                    tx.rsc_dfns_mut()?.insert(rsc, dfn);
                    Ok(ApiCallRc::new())
                }))
            },
        );
        let _: Vec<_> = setup.collect().await;
        let registry = Arc::new(SatelliteRegistry::new(bus));
        let engine = Arc::new(SatelliteUpdates::new(
            registry.clone(),
            Arc::new(JsonStateSerializer),
            Duration::from_millis(200),
        ));
        Harness {
            runner,
            registry,
            engine,
        }
    }

    fn propagate(h: &Harness) -> RcStream {
        let engine = h.engine.clone();
        h.runner.transactionless(
            "propagate",
            UpdateTarget::ResourceDefinition(ResourceName::new("r1").unwrap()).read_locks(),
            move |scope| {
                engine.update_satellites(
                    &scope,
                    UpdateTarget::ResourceDefinition(ResourceName::new("r1").unwrap()),
                    DeploymentMessages::new("resource 'r1'"),
                )
            },
        )
    }

    fn online(h: &Harness, name: &str, behavior: MockBehavior) -> Arc<MockSatellite> {
        let mock = Arc::new(MockSatellite::with_behavior(node(name), behavior));
        h.registry.connect(mock.clone());
        assert!(h.registry.mark_online(&node(name)));
        mock
    }

    #[tokio::test]
    async fn test_all_acknowledged() {
        let h = harness(&["alpha", "bravo"]).await;
        let alpha = online(&h, "alpha", MockBehavior::Ack);
        let bravo = online(&h, "bravo", MockBehavior::Ack);

        let items: Vec<_> = propagate(&h).collect().await;
        assert_eq!(items.len(), 2);
        assert!(items.iter().all(|i| i.as_ref().unwrap().contains(ReturnCode::UPDATED)));
        assert_eq!(alpha.received_count(), 1);
        assert_eq!(bravo.received_json()[0]["kind"], "resource_definition");
    }

    #[tokio::test]
    async fn test_offline_node_delays() {
        let h = harness(&["alpha", "bravo"]).await;
        online(&h, "alpha", MockBehavior::Ack);

        let items: Vec<_> = propagate(&h).collect().await;
        let warnings: Vec<_> = items
            .iter()
            .filter_map(|i| i.as_ref().ok())
            .filter(|rc| rc.contains(ReturnCode::WARN_NOT_CONNECTED))
            .collect();
        assert_eq!(warnings.len(), 1);
        match items.last() {
            Some(Err(ApiError::Delayed(nodes))) => assert_eq!(nodes, &vec![node("bravo")]),
            other => panic!("expected delayed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_hanging_satellite_times_out() {
        let h = harness(&["alpha"]).await;
        online(&h, "alpha", MockBehavior::Hang);

        let items: Vec<_> = propagate(&h).collect().await;
        assert!(items[0].as_ref().unwrap().contains(ReturnCode::WARN_NOT_CONNECTED));
        assert!(matches!(items.last(), Some(Err(ApiError::Delayed(_)))));
    }

    #[tokio::test]
    async fn test_rejection_is_reported_and_delays() {
        let h = harness(&["alpha"]).await;
        let rejection = ApiCallRc::single(RcEntry::new(ReturnCode::FAIL_SATELLITE, "device busy"));
        online(&h, "alpha", MockBehavior::Reply(rejection));

        let items: Vec<_> = propagate(&h).collect().await;
        assert_eq!(items.len(), 2);
        let rc = items[0].as_ref().unwrap();
        assert!(rc.has_errors());
        assert!(rc.contains(ReturnCode::FAIL_SATELLITE));
        assert!(matches!(items[1], Err(ApiError::Delayed(_))));
    }

    #[tokio::test]
    async fn test_sync_failed_reports_error_entry() {
        let h = harness(&["alpha"]).await;
        online(&h, "alpha", MockBehavior::Ack);
        h.registry.mark_full_sync_failed(&node("alpha"));

        let items: Vec<_> = propagate(&h).collect().await;
        assert!(items[0].as_ref().unwrap().contains(ReturnCode::FAIL_SATELLITE));
        assert!(matches!(items.last(), Some(Err(ApiError::Delayed(_)))));
    }

    #[test]
    fn test_primary_message() {
        let messages = DeploymentMessages::new("resource 'r1'")
            .success("Added peer to {object} on '{node}'")
            .primary(node("alpha"), "Created {object} on '{node}'");
        assert_eq!(messages.success_message(&node("alpha")), "Created resource 'r1' on 'alpha'");
        assert_eq!(
            messages.success_message(&node("bravo")),
            "Added peer to resource 'r1' on 'bravo'"
        );
    }
}
