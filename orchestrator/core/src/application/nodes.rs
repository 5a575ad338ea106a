// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Node Handler
//!
//! Registers satellites and removes them again. A node with resources is
//! not removed directly: the node and its resources are flagged, and the
//! node disappears once the finalize step of its last resource ran. A node
//! whose satellite is permanently gone can be declared lost instead, which
//! drops everything on it without waiting for acknowledgements.
//!
//! An unreachable node can be evicted, which keeps its objects but takes it
//! out of placement decisions. Evacuating a node deletes every replica on it
//! that the cluster can spare; the last disk of a resource stays until a
//! replica exists elsewhere. Restoring a node clears both states.

use crate::application::context::{change_report, deferred, flow, ignore_delayed, ControllerContext, StepOutcome};
use crate::application::resource_definitions::{release_shipping_port, remove_resource_definition};
use crate::application::resources::{flag_deleted, ResourceHandler};
use crate::application::responses::{ApiResponse, ResponseContext};
use crate::application::satellite_updates::{DeploymentMessages, UpdateTarget};
use crate::application::scope_runner::{sequence, RcStream};
use crate::application::tie_breaker;
use crate::domain::access::{AccessType, Principal};
use crate::domain::api_rc::{ApiCallRc, RcEntry, ReturnCode};
use crate::domain::errors::ApiError;
use crate::domain::lock_domain::{LockObj, LockRequest};
use crate::domain::names::{NodeName, ResourceName};
use crate::domain::node::{Node, NodeApi, NodeFlag, NodeType};
use crate::domain::props::{Props, PropsChange};
use crate::domain::resource_definition::ResourceDefinition;
use crate::infrastructure::object_store::Transaction;
use crate::infrastructure::satellite::SatelliteRegistry;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{info, warn};

/// A node removed from the store, and the satellites that knew about it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovedNode {
    pub node_name: NodeName,
    pub peers: Vec<NodeName>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub name: NodeName,
    pub node_type: NodeType,
    #[serde(default)]
    pub props: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeStateChange {
    Evict,
    Evacuate,
    Restore,
}

impl NodeStateChange {
    fn verb(self) -> &'static str {
        match self {
            NodeStateChange::Evict => "evict",
            NodeStateChange::Evacuate => "evacuate",
            NodeStateChange::Restore => "restore",
        }
    }
}

/// Resources to delete and resources whose peers must hear about the change
#[derive(Debug, Default)]
struct NodeStateOutcome {
    staged: Vec<ResourceName>,
    affected: Vec<ResourceName>,
}

enum NodeDeletion {
    Removed(RemovedNode),
    Staged(Vec<ResourceName>),
}

fn deletion_locks() -> LockRequest {
    LockRequest::new()
        .read(&[LockObj::ResourceGroups, LockObj::CtrlConfig])
        .write(&[LockObj::Nodes, LockObj::ResourceDefinitions])
}

pub struct NodeHandler {
    ctx: Arc<ControllerContext>,
    resources: Arc<ResourceHandler>,
}

impl NodeHandler {
    pub fn new(ctx: Arc<ControllerContext>, resources: Arc<ResourceHandler>) -> Arc<Self> {
        Arc::new(Self { ctx, resources })
    }

    pub fn create(&self, principal: &Principal, spec: NodeSpec) -> ApiResponse {
        let response = ResponseContext::new("creating", format!("node '{}'", spec.name))
            .with_ref("node", spec.name.as_str());
        let stream = flow(
            principal
                .require(AccessType::Change, ReturnCode::FAIL_ACC_DENIED_NODE, "create node")
                .map(|()| {
                    let node_name = spec.name.clone();
                    let create = self.ctx.step(
                        format!("create node '{}'", node_name),
                        LockRequest::new().write(&[LockObj::Nodes]),
                        move |tx| create_node(tx, spec),
                    );
                    let deploy = self.ctx.notify(
                        format!("deploy node '{}'", node_name),
                        UpdateTarget::Node(node_name.clone()),
                        DeploymentMessages::new(format!("node '{}'", node_name)),
                    );
                    sequence(vec![create, deploy])
                }),
        );
        self.ctx.respond(stream, response)
    }

    pub fn modify(&self, principal: &Principal, node_name: NodeName, change: PropsChange) -> ApiResponse {
        let response = ResponseContext::new("modifying", format!("node '{}'", node_name))
            .with_ref("node", node_name.as_str());
        let stream = flow(
            principal
                .require(AccessType::Change, ReturnCode::FAIL_ACC_DENIED_NODE, "modify node")
                .map(|()| {
                    let node = node_name.clone();
                    let modify = self.ctx.step(
                        format!("modify node '{}'", node_name),
                        LockRequest::new().write(&[LockObj::Nodes]),
                        move |tx| {
                            let entry = tx
                                .nodes_mut()?
                                .nodes
                                .get_mut(&node)
                                .ok_or_else(|| not_found_node(&node))?;
                            let changed = change.apply_to(&mut entry.props)?;
                            Ok(change_report(changed, format!("Node '{}' modified", node)))
                        },
                    );
                    let deploy = self.ctx.propagate(
                        format!("deploy node '{}'", node_name),
                        UpdateTarget::Node(node_name.clone()),
                        DeploymentMessages::new(format!("node '{}'", node_name)),
                    );
                    sequence(vec![modify, deploy])
                }),
        );
        self.ctx.respond(stream, response)
    }

    pub fn delete(&self, principal: &Principal, node_name: NodeName) -> ApiResponse {
        let response = ResponseContext::new("deleting", format!("node '{}'", node_name))
            .with_ref("node", node_name.as_str());
        let stream = flow(
            principal
                .require(AccessType::Change, ReturnCode::FAIL_ACC_DENIED_NODE, "delete node")
                .map(|()| self.delete_flow(node_name)),
        );
        self.ctx.respond(stream, response)
    }

    /// Drops a node whose satellite will not come back
    pub fn lost(&self, principal: &Principal, node_name: NodeName) -> ApiResponse {
        let response = ResponseContext::new("declaring lost", format!("node '{}'", node_name))
            .with_ref("node", node_name.as_str());
        let stream = flow(
            principal
                .require(AccessType::Control, ReturnCode::FAIL_ACC_DENIED_NODE, "declare node lost")
                .and_then(|()| {
                    if self.ctx.registry.status(&node_name).is_connected() {
                        Err(ApiError::entry(
                            RcEntry::new(
                                ReturnCode::FAIL_IN_USE,
                                format!("Node '{}' is still connected", node_name),
                            )
                            .with_correction("Use node delete for connected nodes"),
                        ))
                    } else {
                        Ok(self.lost_flow(node_name))
                    }
                }),
        );
        self.ctx.respond(stream, response)
    }

    /// Marks a node whose satellite is gone as evicted
    pub fn evict(&self, principal: &Principal, node_name: NodeName) -> ApiResponse {
        let response = ResponseContext::new("evicting", format!("node '{}'", node_name))
            .with_ref("node", node_name.as_str());
        let stream = flow(
            principal
                .require(AccessType::Change, ReturnCode::FAIL_ACC_DENIED_NODE, "evict node")
                .and_then(|()| {
                    if self.ctx.registry.status(&node_name).is_connected() {
                        Err(ApiError::entry(
                            RcEntry::new(
                                ReturnCode::FAIL_IN_USE,
                                format!("Node '{}' is still connected", node_name),
                            )
                            .with_correction("Evacuate connected nodes instead"),
                        ))
                    } else {
                        Ok(self.state_change_flow(node_name, NodeStateChange::Evict))
                    }
                }),
        );
        self.ctx.respond(stream, response)
    }

    /// Moves everything the cluster can spare off the node
    pub fn evacuate(&self, principal: &Principal, node_name: NodeName) -> ApiResponse {
        let response = ResponseContext::new("evacuating", format!("node '{}'", node_name))
            .with_ref("node", node_name.as_str());
        let stream = flow(
            principal
                .require(AccessType::Change, ReturnCode::FAIL_ACC_DENIED_NODE, "evacuate node")
                .map(|()| self.state_change_flow(node_name, NodeStateChange::Evacuate)),
        );
        self.ctx.respond(stream, response)
    }

    /// Clears eviction and evacuation
    pub fn restore(&self, principal: &Principal, node_name: NodeName) -> ApiResponse {
        let response = ResponseContext::new("restoring", format!("node '{}'", node_name))
            .with_ref("node", node_name.as_str());
        let stream = flow(
            principal
                .require(AccessType::Change, ReturnCode::FAIL_ACC_DENIED_NODE, "restore node")
                .map(|()| self.state_change_flow(node_name, NodeStateChange::Restore)),
        );
        self.ctx.respond(stream, response)
    }

    pub fn list(&self, principal: &Principal) -> Result<Vec<NodeApi>, ApiError> {
        principal.require(AccessType::View, ReturnCode::FAIL_ACC_DENIED_NODE, "list nodes")?;
        let state = self.ctx.store.snapshot();
        Ok(state
            .nodes
            .nodes
            .values()
            .map(|node| node.api_view(self.ctx.registry.status(&node.name)))
            .collect())
    }

    fn delete_flow(&self, node_name: NodeName) -> RcStream {
        let outcome: StepOutcome<NodeDeletion> = StepOutcome::new();
        let writer = outcome.clone();
        let registry = Arc::clone(&self.ctx.registry);
        let node = node_name.clone();
        let mark = self.ctx.step(format!("mark node '{}' for deletion", node_name), deletion_locks(), move |tx| {
            let (rc, deletion) = mark_node_deleted(tx, &registry, &node)?;
            writer.set(deletion);
            Ok(rc)
        });
        let ctx = Arc::clone(&self.ctx);
        let resources = Arc::clone(&self.resources);
        let follow_up = deferred(move || match outcome.take() {
            Some(NodeDeletion::Removed(removed)) => announce_removal(&ctx, vec![removed]),
            Some(NodeDeletion::Staged(rsc_names)) => sequence(
                rsc_names
                    .into_iter()
                    .map(|rsc| ignore_delayed(resources.deletion_flow(rsc)))
                    .collect(),
            ),
            None => sequence(Vec::new()),
        });
        sequence(vec![mark, follow_up])
    }

    fn state_change_flow(&self, node_name: NodeName, change: NodeStateChange) -> RcStream {
        let outcome: StepOutcome<NodeStateOutcome> = StepOutcome::new();
        let writer = outcome.clone();
        let registry = Arc::clone(&self.ctx.registry);
        let node = node_name.clone();
        let apply = self.ctx.step(
            format!("{} node '{}'", change.verb(), node_name),
            deletion_locks(),
            move |tx| {
                let (rc, result) = match change {
                    NodeStateChange::Evict => evict_node(tx, &node)?,
                    NodeStateChange::Evacuate => evacuate_node(tx, &registry, &node)?,
                    NodeStateChange::Restore => restore_node(tx, &node)?,
                };
                writer.set(result);
                Ok(rc)
            },
        );
        let ctx = Arc::clone(&self.ctx);
        let resources = Arc::clone(&self.resources);
        let follow_up = deferred(move || {
            let Some(result) = outcome.take() else {
                return sequence(Vec::new());
            };
            let mut steps: Vec<RcStream> = result
                .staged
                .into_iter()
                .map(|rsc| ignore_delayed(resources.deletion_flow(rsc)))
                .collect();
            for rsc_name in result.affected {
                steps.push(ctx.notify(
                    format!("update resource '{}' after state change of node '{}'", rsc_name, node_name),
                    UpdateTarget::ResourceDefinition(rsc_name.clone()),
                    DeploymentMessages::new(format!("resource '{}'", rsc_name)),
                ));
            }
            sequence(steps)
        });
        sequence(vec![apply, follow_up])
    }

    fn lost_flow(&self, node_name: NodeName) -> RcStream {
        let outcome: StepOutcome<(RemovedNode, Vec<ResourceName>)> = StepOutcome::new();
        let writer = outcome.clone();
        let node = node_name.clone();
        let remove = self.ctx.step(format!("remove lost node '{}'", node_name), deletion_locks(), move |tx| {
            let (rc, removed, affected) = remove_lost_node(tx, &node)?;
            writer.set((removed, affected));
            Ok(rc)
        });
        let ctx = Arc::clone(&self.ctx);
        let follow_up = deferred(move || {
            let Some((removed, affected)) = outcome.take() else {
                return sequence(Vec::new());
            };
            let mut steps = vec![announce_removal(&ctx, vec![removed])];
            for rsc_name in affected {
                steps.push(ctx.notify(
                    format!("update resource '{}' after node loss", rsc_name),
                    UpdateTarget::ResourceDefinition(rsc_name.clone()),
                    DeploymentMessages::new(format!("resource '{}'", rsc_name)),
                ));
                ctx.notifier.check_resource_definition(rsc_name);
            }
            sequence(steps)
        });
        sequence(vec![remove, follow_up])
    }
}

// ============================================================================
// Steps
// ============================================================================

fn not_found_node(node_name: &NodeName) -> ApiError {
    ApiError::entry(
        RcEntry::new(
            ReturnCode::FAIL_NOT_FOUND_NODE,
            format!("Node '{}' not found", node_name),
        )
        .with_obj_ref("node", node_name.as_str()),
    )
}

fn create_node(tx: &mut Transaction, spec: NodeSpec) -> Result<ApiCallRc, ApiError> {
    let props = Props::from_pairs(spec.props)?;
    let nodes = tx.nodes_mut()?;
    if nodes.nodes.contains_key(&spec.name) {
        return Err(ApiError::rc(
            ReturnCode::FAIL_EXISTS_NODE,
            format!("Node '{}' already exists", spec.name),
        ));
    }
    let mut node = Node::new(spec.name.clone(), spec.node_type);
    node.props = props;
    nodes.nodes.insert(spec.name.clone(), node);
    info!(node = %spec.name, node_type = ?spec.node_type, "node registered");
    Ok(ApiCallRc::single(
        RcEntry::new(
            ReturnCode::CREATED,
            format!("New node '{}' registered", spec.name),
        )
        .with_obj_ref("node", spec.name.as_str()),
    ))
}

fn mark_node_deleted(
    tx: &mut Transaction,
    registry: &SatelliteRegistry,
    node_name: &NodeName,
) -> Result<(ApiCallRc, NodeDeletion), ApiError> {
    let already_deleting = tx
        .nodes()?
        .nodes
        .get(node_name)
        .ok_or_else(|| not_found_node(node_name))?
        .is_deleting();

    let mut rsc_names = Vec::new();
    for dfn in tx.rsc_dfns()?.values() {
        if dfn.snapshot_dfns.values().any(|s| s.snapshots.contains_key(node_name)) {
            return Err(ApiError::entry(
                RcEntry::new(
                    ReturnCode::FAIL_EXISTS_SNAPSHOT_DFN,
                    format!("Node '{}' still holds snapshots of resource '{}'", node_name, dfn.name),
                )
                .with_correction("Delete the snapshots first"),
            ));
        }
        let Some(rsc) = dfn.resources.get(node_name) else {
            continue;
        };
        if registry.resource_state(node_name, &dfn.name).and_then(|s| s.in_use) == Some(true) {
            return Err(ApiError::entry(
                RcEntry::new(
                    ReturnCode::FAIL_IN_USE,
                    format!("Resource '{}' on node '{}' is in use", dfn.name, node_name),
                )
                .with_correction("Stop using the resources of the node first"),
            ));
        }
        let other_diskful = dfn
            .resources
            .values()
            .any(|r| r.node_name != *node_name && r.is_active_diskful());
        let diskless_elsewhere = dfn
            .active_diskless()
            .any(|r| r.node_name != *node_name && !r.is_tie_breaker());
        if rsc.is_active_diskful() && !other_diskful && diskless_elsewhere {
            return Err(ApiError::entry(
                RcEntry::new(
                    ReturnCode::FAIL_IN_USE,
                    format!("Node '{}' holds the last disk of resource '{}'", node_name, dfn.name),
                )
                .with_correction("Delete the diskless resources of that resource first"),
            ));
        }
        rsc_names.push(dfn.name.clone());
    }

    if rsc_names.is_empty() {
        return match remove_node(tx, node_name)? {
            Some((entry, removed)) => Ok((ApiCallRc::single(entry), NodeDeletion::Removed(removed))),
            None => Err(not_found_node(node_name)),
        };
    }

    let mut rc = ApiCallRc::new();
    if already_deleting {
        rc.push(RcEntry::new(
            ReturnCode::WARN_DELETE_IN_PROGRESS,
            format!("Node '{}' is already being deleted", node_name),
        ));
    } else {
        tx.nodes_mut()?
            .nodes
            .get_mut(node_name)
            .ok_or_else(|| not_found_node(node_name))?
            .flags
            .enable(NodeFlag::Delete)?;
        rc.push(
            RcEntry::new(
                ReturnCode::MODIFIED,
                format!("Node '{}' marked for deletion", node_name),
            )
            .with_obj_ref("node", node_name.as_str()),
        );
    }
    for rsc_name in &rsc_names {
        if let Some(rsc) = tx
            .rsc_dfns_mut()?
            .get_mut(rsc_name)
            .and_then(|dfn| dfn.resources.get_mut(node_name))
        {
            flag_deleted(rsc)?;
        }
        rc.extend(tie_breaker::maintain(tx, rsc_name)?);
    }
    Ok((rc, NodeDeletion::Staged(rsc_names)))
}

/// Definitions with a resource on `node_name`
fn resources_on(tx: &Transaction, node_name: &NodeName) -> Result<Vec<ResourceName>, ApiError> {
    Ok(tx
        .rsc_dfns()?
        .values()
        .filter(|dfn| dfn.resources.contains_key(node_name))
        .map(|dfn| dfn.name.clone())
        .collect())
}

fn node_for_state_change<'a>(tx: &'a mut Transaction, node_name: &NodeName) -> Result<&'a mut Node, ApiError> {
    let node = tx
        .nodes_mut()?
        .nodes
        .get_mut(node_name)
        .ok_or_else(|| not_found_node(node_name))?;
    if node.is_deleting() {
        return Err(ApiError::rc(
            ReturnCode::WARN_DELETE_IN_PROGRESS,
            format!("Node '{}' is being deleted", node_name),
        ));
    }
    Ok(node)
}

fn evict_node(tx: &mut Transaction, node_name: &NodeName) -> Result<(ApiCallRc, NodeStateOutcome), ApiError> {
    let node = node_for_state_change(tx, node_name)?;
    if node.flags.is_set(NodeFlag::Evicted) {
        return Ok((
            ApiCallRc::single(RcEntry::new(
                ReturnCode::INFO_NO_PENDING_WORK,
                format!("Node '{}' is already evicted", node_name),
            )),
            NodeStateOutcome::default(),
        ));
    }
    node.flags.enable(NodeFlag::Evicted)?;
    let affected = resources_on(tx, node_name)?;
    let mut rc = ApiCallRc::single(
        RcEntry::new(ReturnCode::MODIFIED, format!("Node '{}' evicted", node_name))
            .with_details(format!("{} resource(s) on the node are kept", affected.len()))
            .with_obj_ref("node", node_name.as_str()),
    );
    for rsc_name in &affected {
        rc.extend(tie_breaker::maintain(tx, rsc_name)?);
    }
    warn!(node = %node_name, resources = affected.len(), "node evicted");
    Ok((
        rc,
        NodeStateOutcome {
            staged: Vec::new(),
            affected,
        },
    ))
}

/// Why the resource of `dfn` on `node_name` has to stay, if it does
fn evacuation_blocker(
    dfn: &ResourceDefinition,
    registry: &SatelliteRegistry,
    node_name: &NodeName,
    evacuating: &BTreeSet<NodeName>,
) -> Option<String> {
    let rsc = dfn.resources.get(node_name)?;
    if registry.resource_state(node_name, &dfn.name).and_then(|s| s.in_use) == Some(true) {
        return Some("it is in use".to_string());
    }
    if rsc.is_toggling_disk() || rsc.is_changing_activation() {
        return Some(format!("it is busy ({})", rsc.flags.names().join(", ")));
    }
    if dfn.snapshot_dfns.values().any(|s| s.snapshots.contains_key(node_name)) {
        return Some("it still holds snapshots".to_string());
    }
    let replaced = dfn
        .resources
        .values()
        .any(|r| r.node_name != *node_name && r.is_active_diskful() && !evacuating.contains(&r.node_name));
    if rsc.is_active_diskful() && !replaced {
        return Some("it holds the last disk outside evacuating nodes".to_string());
    }
    None
}

fn evacuate_node(
    tx: &mut Transaction,
    registry: &SatelliteRegistry,
    node_name: &NodeName,
) -> Result<(ApiCallRc, NodeStateOutcome), ApiError> {
    node_for_state_change(tx, node_name)?.flags.enable(NodeFlag::Evacuate)?;
    let evacuating: BTreeSet<NodeName> = tx
        .nodes()?
        .nodes
        .values()
        .filter(|n| n.flags.is_set(NodeFlag::Evacuate))
        .map(|n| n.name.clone())
        .collect();

    let mut rc = ApiCallRc::single(
        RcEntry::new(ReturnCode::MODIFIED, format!("Node '{}' is being evacuated", node_name))
            .with_obj_ref("node", node_name.as_str()),
    );
    let mut staged = Vec::new();
    let mut kept = Vec::new();
    for dfn in tx.rsc_dfns()?.values() {
        match dfn.resources.get(node_name) {
            Some(rsc) if !rsc.is_deleting() => {}
            _ => continue,
        }
        match evacuation_blocker(dfn, registry, node_name, &evacuating) {
            Some(reason) => {
                rc.push(
                    RcEntry::new(
                        ReturnCode::WARN_EVACUATION_BLOCKED,
                        format!("Resource '{}' stays on node '{}' because {}", dfn.name, node_name, reason),
                    )
                    .with_correction("Resolve the conflict and evacuate the node again")
                    .with_obj_ref("rsc_dfn", dfn.name.as_str()),
                );
                kept.push(dfn.name.clone());
            }
            None => staged.push(dfn.name.clone()),
        }
    }
    for rsc_name in &staged {
        if let Some(rsc) = tx
            .rsc_dfns_mut()?
            .get_mut(rsc_name)
            .and_then(|dfn| dfn.resources.get_mut(node_name))
        {
            flag_deleted(rsc)?;
        }
        rc.extend(tie_breaker::maintain(tx, rsc_name)?);
    }
    info!(node = %node_name, staged = staged.len(), kept = kept.len(), "node evacuation started");
    Ok((
        rc,
        NodeStateOutcome {
            staged,
            affected: kept,
        },
    ))
}

fn restore_node(tx: &mut Transaction, node_name: &NodeName) -> Result<(ApiCallRc, NodeStateOutcome), ApiError> {
    let node = node_for_state_change(tx, node_name)?;
    if !node.flags.is_any_set(&[NodeFlag::Evicted, NodeFlag::Evacuate]) {
        return Ok((
            ApiCallRc::single(RcEntry::new(
                ReturnCode::INFO_NO_PENDING_WORK,
                format!("Node '{}' is neither evicted nor evacuating", node_name),
            )),
            NodeStateOutcome::default(),
        ));
    }
    node.flags.disable_all(&[NodeFlag::Evicted, NodeFlag::Evacuate])?;
    let affected = resources_on(tx, node_name)?;
    let mut rc = ApiCallRc::single(
        RcEntry::new(ReturnCode::MODIFIED, format!("Node '{}' restored", node_name))
            .with_obj_ref("node", node_name.as_str()),
    );
    for rsc_name in &affected {
        rc.extend(tie_breaker::maintain(tx, rsc_name)?);
    }
    info!(node = %node_name, "node restored");
    Ok((
        rc,
        NodeStateOutcome {
            staged: Vec::new(),
            affected,
        },
    ))
}

/// Removes `node_name` and its node connections
pub(crate) fn remove_node(
    tx: &mut Transaction,
    node_name: &NodeName,
) -> Result<Option<(RcEntry, RemovedNode)>, ApiError> {
    let nodes = tx.nodes_mut()?;
    if nodes.nodes.remove(node_name).is_none() {
        return Ok(None);
    }
    nodes.connections.retain(|_, conn| !conn.involves(node_name));
    let peers = nodes
        .nodes
        .values()
        .filter(|n| n.node_type.is_satellite())
        .map(|n| n.name.clone())
        .collect();
    info!(node = %node_name, "node removed");
    Ok(Some((
        RcEntry::new(
            ReturnCode::DELETED,
            format!("Node '{}' deleted", node_name),
        )
        .with_obj_ref("node", node_name.as_str()),
        RemovedNode {
            node_name: node_name.clone(),
            peers,
        },
    )))
}

fn remove_lost_node(
    tx: &mut Transaction,
    node_name: &NodeName,
) -> Result<(ApiCallRc, RemovedNode, Vec<ResourceName>), ApiError> {
    if !tx.nodes()?.nodes.contains_key(node_name) {
        return Err(not_found_node(node_name));
    }
    let mut rc = ApiCallRc::new();
    let mut affected = Vec::new();
    let mut emptied = Vec::new();
    let mut released_ports = Vec::new();

    for dfn in tx.rsc_dfns_mut()?.values_mut() {
        let mut touched = dfn.resources.remove(node_name).is_some();
        dfn.connections.retain(|_, conn| !conn.involves(node_name));
        dfn.snapshot_dfns.retain(|_, snap| {
            if snap.snapshots.remove(node_name).is_none() {
                return true;
            }
            touched = true;
            if snap.snapshots.is_empty() {
                released_ports.push(snap.props.clone());
                false
            } else {
                true
            }
        });
        if touched {
            rc.push(
                RcEntry::new(
                    ReturnCode::DELETED,
                    format!("Resource '{}' on lost node '{}' removed", dfn.name, node_name),
                )
                .with_obj_ref("rsc_dfn", dfn.name.as_str()),
            );
            if dfn.is_deleting() && dfn.resources.is_empty() {
                emptied.push(dfn.name.clone());
            } else {
                affected.push(dfn.name.clone());
            }
        }
    }
    for props in &released_ports {
        release_shipping_port(tx, props);
    }
    for rsc_name in &emptied {
        rc.extend(remove_resource_definition(tx, rsc_name)?);
    }
    for rsc_name in &affected {
        rc.extend(tie_breaker::maintain(tx, rsc_name)?);
    }

    let (entry, removed) = remove_node(tx, node_name)?.ok_or_else(|| not_found_node(node_name))?;
    rc.push(entry);
    warn!(node = %node_name, resources = affected.len(), "node declared lost");
    Ok((rc, removed, affected))
}

/// Forgets removed nodes and tells their former peers
pub(crate) fn announce_removal(ctx: &ControllerContext, removed: Vec<RemovedNode>) -> RcStream {
    let steps = removed
        .into_iter()
        .map(|node| {
            ctx.registry.forget(&node.node_name);
            let description = format!("announce removal of node '{}'", node.node_name);
            let messages = DeploymentMessages::new(format!("removal of node '{}'", node.node_name))
                .success("Satellite '{node}' notified of the {object}");
            ctx.notify(
                description,
                UpdateTarget::NodeDeleted {
                    node_name: node.node_name,
                    peers: node.peers,
                },
                messages,
            )
        })
        .collect();
    sequence(steps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::flags::StateFlags;
    use crate::domain::lock_domain::LockMode;
    use crate::domain::names::{ResourceGroupName, SnapshotName};
    use crate::domain::resource::Resource;
    use crate::domain::satellite::ResourceState;
    use crate::domain::snapshot::{Snapshot, SnapshotDefinition};
    use crate::infrastructure::event_bus::EventBus;
    use crate::infrastructure::number_pools::NumberPools;
    use crate::infrastructure::object_store::ObjectStore;
    use crate::infrastructure::repositories::InMemoryPersistence;

    fn node(n: &str) -> NodeName {
        NodeName::new(n).unwrap()
    }

    fn transaction() -> Transaction {
        let store = ObjectStore::new(
            Arc::new(InMemoryPersistence::new()),
            Arc::new(NumberPools::default()),
            EventBus::new(16),
        );
        let mut tx = store.begin(true);
        for obj in LockObj::ALL {
            tx.attach(obj, LockMode::Write);
        }
        for n in ["a", "b"] {
            tx.nodes_mut()
                .unwrap()
                .nodes
                .insert(node(n), Node::new(node(n), NodeType::Satellite));
        }
        tx
    }

    fn add_resource(tx: &mut Transaction, rsc: &str, nodes: &[&str]) {
        let rsc_name = ResourceName::new(rsc).unwrap();
        let grp = ResourceGroupName::new("DfltRscGrp").unwrap();
        let mut dfn = ResourceDefinition::new(rsc_name.clone(), grp, 7000);
        for n in nodes {
            dfn.resources
                .insert(node(n), Resource::new(node(n), rsc_name.clone(), StateFlags::empty()));
        }
        tx.rsc_dfns_mut().unwrap().insert(rsc_name, dfn);
    }

    #[test]
    fn test_delete_empty_node_removes_it() {
        let mut tx = transaction();
        let registry = SatelliteRegistry::new(EventBus::new(4));
        let (rc, deletion) = mark_node_deleted(&mut tx, &registry, &node("a")).unwrap();
        assert_eq!(rc.codes(), vec![ReturnCode::DELETED]);
        match deletion {
            NodeDeletion::Removed(removed) => assert_eq!(removed.peers, vec![node("b")]),
            NodeDeletion::Staged(_) => panic!("node without resources must be removed"),
        }
        assert!(!tx.nodes().unwrap().nodes.contains_key(&node("a")));
    }

    #[test]
    fn test_delete_node_with_resources_is_staged() {
        let mut tx = transaction();
        add_resource(&mut tx, "r1", &["a", "b"]);
        let registry = SatelliteRegistry::new(EventBus::new(4));
        let (_, deletion) = mark_node_deleted(&mut tx, &registry, &node("a")).unwrap();
        assert!(matches!(deletion, NodeDeletion::Staged(ref r) if r.len() == 1));
        assert!(tx.nodes().unwrap().nodes[&node("a")].is_deleting());
        let rsc_name = ResourceName::new("r1").unwrap();
        assert!(tx.rsc_dfns().unwrap()[&rsc_name].resources[&node("a")].is_deleting());
    }

    #[test]
    fn test_delete_refused_with_snapshots() {
        let mut tx = transaction();
        add_resource(&mut tx, "r1", &["a"]);
        let rsc_name = ResourceName::new("r1").unwrap();
        let snap_name = SnapshotName::new("s1").unwrap();
        let mut snap = SnapshotDefinition::new(rsc_name.clone(), snap_name.clone(), StateFlags::empty(), Vec::new());
        snap.snapshots.insert(
            node("a"),
            Snapshot::new(node("a"), rsc_name.clone(), snap_name.clone(), StateFlags::empty()),
        );
        tx.rsc_dfns_mut()
            .unwrap()
            .get_mut(&rsc_name)
            .unwrap()
            .snapshot_dfns
            .insert(snap_name, snap);
        let registry = SatelliteRegistry::new(EventBus::new(4));
        let err = mark_node_deleted(&mut tx, &registry, &node("a")).err().unwrap();
        assert_eq!(err.code(), ReturnCode::FAIL_EXISTS_SNAPSHOT_DFN);
    }

    fn add_diskless(tx: &mut Transaction, rsc: &str, n: &str) {
        use crate::domain::resource::ResourceFlag;
        let rsc_name = ResourceName::new(rsc).unwrap();
        tx.rsc_dfns_mut().unwrap().get_mut(&rsc_name).unwrap().resources.insert(
            node(n),
            Resource::new(node(n), rsc_name.clone(), StateFlags::with(&[ResourceFlag::Diskless])),
        );
    }

    #[test]
    fn test_evacuate_keeps_last_disk() {
        let mut tx = transaction();
        tx.nodes_mut()
            .unwrap()
            .nodes
            .insert(node("c"), Node::new(node("c"), NodeType::Satellite));
        // r1 has another disk, r2 does not, r3 is diskless on "a"
        add_resource(&mut tx, "r1", &["a", "b"]);
        add_resource(&mut tx, "r2", &["a"]);
        add_diskless(&mut tx, "r2", "c");
        add_resource(&mut tx, "r3", &["b"]);
        add_diskless(&mut tx, "r3", "a");
        let registry = SatelliteRegistry::new(EventBus::new(4));

        let (rc, outcome) = evacuate_node(&mut tx, &registry, &node("a")).unwrap();
        assert!(rc.contains(ReturnCode::WARN_EVACUATION_BLOCKED));
        let r = |n: &str| ResourceName::new(n).unwrap();
        assert_eq!(outcome.staged, vec![r("r1"), r("r3")]);
        assert_eq!(outcome.affected, vec![r("r2")]);
        let dfns = tx.rsc_dfns().unwrap();
        assert!(dfns[&r("r1")].resources[&node("a")].is_deleting());
        assert!(!dfns[&r("r2")].resources[&node("a")].is_deleting());
        assert!(tx.nodes().unwrap().nodes[&node("a")].flags.is_set(NodeFlag::Evacuate));
    }

    #[test]
    fn test_disk_on_another_evacuating_node_does_not_count() {
        let mut tx = transaction();
        add_resource(&mut tx, "r1", &["a", "b"]);
        let registry = SatelliteRegistry::new(EventBus::new(4));
        registry.report_resource(
            &node("b"),
            ResourceName::new("r1").unwrap(),
            ResourceState {
                in_use: Some(true),
                up_to_date: true,
            },
        );
        let (_, outcome) = evacuate_node(&mut tx, &registry, &node("b")).unwrap();
        assert!(outcome.staged.is_empty());

        let (rc, outcome) = evacuate_node(&mut tx, &registry, &node("a")).unwrap();
        assert!(outcome.staged.is_empty());
        assert!(rc.contains(ReturnCode::WARN_EVACUATION_BLOCKED));
    }

    #[test]
    fn test_evict_and_restore() {
        let mut tx = transaction();
        add_resource(&mut tx, "r1", &["a", "b"]);
        let (rc, outcome) = evict_node(&mut tx, &node("a")).unwrap();
        assert!(rc.contains(ReturnCode::MODIFIED));
        assert_eq!(outcome.affected, vec![ResourceName::new("r1").unwrap()]);
        assert!(outcome.staged.is_empty());
        assert_eq!(tx.nodes().unwrap().nodes[&node("a")].flags.names(), vec!["EVICTED"]);

        let (rc, _) = evict_node(&mut tx, &node("a")).unwrap();
        assert_eq!(rc.codes(), vec![ReturnCode::INFO_NO_PENDING_WORK]);

        restore_node(&mut tx, &node("a")).unwrap();
        assert!(tx.nodes().unwrap().nodes[&node("a")].flags.names().is_empty());
        let (rc, outcome) = restore_node(&mut tx, &node("a")).unwrap();
        assert_eq!(rc.codes(), vec![ReturnCode::INFO_NO_PENDING_WORK]);
        assert!(outcome.affected.is_empty());
    }

    #[test]
    fn test_lost_node_drops_everything() {
        let mut tx = transaction();
        add_resource(&mut tx, "r1", &["a", "b"]);
        let (rc, removed, affected) = remove_lost_node(&mut tx, &node("a")).unwrap();
        assert!(rc.contains(ReturnCode::DELETED));
        assert_eq!(removed.node_name, node("a"));
        assert_eq!(affected, vec![ResourceName::new("r1").unwrap()]);
        let rsc_name = ResourceName::new("r1").unwrap();
        assert_eq!(tx.rsc_dfns().unwrap()[&rsc_name].resource_nodes(), vec![node("b")]);
    }
}
