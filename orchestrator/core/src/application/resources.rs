// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Resource Handler
//!
//! Creates and deletes resources, toggles their disks and takes them
//! down or up again on their node.
//!
//! Deletion and disk toggling follow the two-phase pattern: the intent is
//! committed as a flag, the resource definition is pushed to its
//! satellites, and only when every satellite acknowledged does the next
//! step run. Each step re-reads the flags, so a chain interrupted by an
//! unreachable satellite is picked up again by the [`ConnectionListener`]
//! implementation below.
//!
//! Disk toggling runs through
//! `DISK_ADD_REQUESTED -> DISK_ADDING -> diskful` or
//! `DISK_REMOVE_REQUESTED -> DISK_REMOVING -> DISKLESS`, with a propagation
//! between every transition. Deactivation sets `INACTIVE | INACTIVATING`
//! and reactivation sets `REACTIVATE`; the transient flag is cleared once
//! the satellites acknowledged the change.

use crate::application::connection_notifier::ConnectionListener;
use crate::application::context::{deferred, flow, ControllerContext, StepOutcome};
use crate::application::nodes::{announce_removal, remove_node, RemovedNode};
use crate::application::resource_definitions::remove_resource_definition;
use crate::application::responses::{ApiResponse, ResponseContext};
use crate::application::satellite_updates::{DeploymentMessages, UpdateTarget};
use crate::application::scope_runner::{empty_stream, sequence, RcStream};
use crate::application::tie_breaker;
use crate::domain::access::{AccessType, Principal};
use crate::domain::api_rc::{ApiCallRc, RcEntry, ReturnCode};
use crate::domain::errors::ApiError;
use crate::domain::flags::StateFlags;
use crate::domain::lock_domain::{LockObj, LockRequest};
use crate::domain::names::{NodeName, ResourceName, StorPoolName};
use crate::domain::props::keys;
use crate::domain::resource::{Resource, ResourceApi, ResourceFlag, Volume, VolumeFlag};
use crate::domain::snapshot::SnapshotFlag;
use crate::domain::storage_pool::DEFAULT_STOR_POOL;
use crate::infrastructure::object_store::{RscDfnMap, Transaction};
use crate::infrastructure::satellite::SatelliteRegistry;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info};

/// Locks of every step that may create or drop a tie-breaker
pub(crate) fn resource_locks() -> LockRequest {
    LockRequest::new()
        .read(&[LockObj::Nodes, LockObj::ResourceGroups, LockObj::CtrlConfig])
        .write(&[LockObj::ResourceDefinitions])
}

fn finalize_locks() -> LockRequest {
    LockRequest::new().write(&[LockObj::Nodes, LockObj::ResourceDefinitions])
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub node_name: NodeName,
    pub rsc_name: ResourceName,
    /// Defaults to `DfltStorPool` for diskful resources
    #[serde(default)]
    pub stor_pool: Option<StorPoolName>,
    #[serde(default)]
    pub diskless: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum DiskToggle {
    Add { stor_pool: Option<StorPoolName> },
    Remove,
}

pub struct ResourceHandler {
    ctx: Arc<ControllerContext>,
}

impl ResourceHandler {
    pub fn new(ctx: Arc<ControllerContext>) -> Arc<Self> {
        Arc::new(Self { ctx })
    }

    // ========================================================================
    // Entry points
    // ========================================================================

    pub fn create(&self, principal: &Principal, spec: ResourceSpec) -> ApiResponse {
        let response = ResponseContext::new(
            "creating",
            format!("resource '{}' on node '{}'", spec.rsc_name, spec.node_name),
        )
        .with_ref("node", spec.node_name.as_str())
        .with_ref("rsc_dfn", spec.rsc_name.as_str());
        let stream = flow(
            principal
                .require(AccessType::Change, ReturnCode::FAIL_ACC_DENIED_RSC, "create resource")
                .map(|()| self.create_flow(spec)),
        );
        self.ctx.respond(stream, response)
    }

    pub fn delete(&self, principal: &Principal, node_name: NodeName, rsc_name: ResourceName) -> ApiResponse {
        let response = ResponseContext::new(
            "deleting",
            format!("resource '{}' on node '{}'", rsc_name, node_name),
        )
        .with_ref("node", node_name.as_str())
        .with_ref("rsc_dfn", rsc_name.as_str());
        let stream = flow(
            principal
                .require(AccessType::Change, ReturnCode::FAIL_ACC_DENIED_RSC, "delete resource")
                .map(|()| self.delete_flow(node_name, rsc_name)),
        );
        self.ctx.respond(stream, response)
    }

    pub fn toggle_disk(
        &self,
        principal: &Principal,
        node_name: NodeName,
        rsc_name: ResourceName,
        toggle: DiskToggle,
    ) -> ApiResponse {
        let operation = match toggle {
            DiskToggle::Add { .. } => "adding a disk to",
            DiskToggle::Remove => "removing the disk of",
        };
        let response = ResponseContext::new(
            operation,
            format!("resource '{}' on node '{}'", rsc_name, node_name),
        )
        .with_ref("node", node_name.as_str())
        .with_ref("rsc_dfn", rsc_name.as_str());
        let stream = flow(
            principal
                .require(AccessType::Change, ReturnCode::FAIL_ACC_DENIED_RSC, "toggle disk")
                .map(|()| {
                    let node = node_name.clone();
                    let rsc = rsc_name.clone();
                    let request = self.ctx.step(
                        format!("request disk toggle of {}/{}", node_name, rsc_name),
                        resource_locks(),
                        move |tx| request_toggle(tx, &node, &rsc, &toggle),
                    );
                    sequence(vec![request, self.toggle_flow(node_name, rsc_name)])
                }),
        );
        self.ctx.respond(stream, response)
    }

    /// Takes the resource down on its node; it stays registered and keeps its data
    pub fn deactivate(&self, principal: &Principal, node_name: NodeName, rsc_name: ResourceName) -> ApiResponse {
        self.change_activation(principal, node_name, rsc_name, false)
    }

    pub fn activate(&self, principal: &Principal, node_name: NodeName, rsc_name: ResourceName) -> ApiResponse {
        self.change_activation(principal, node_name, rsc_name, true)
    }

    fn change_activation(
        &self,
        principal: &Principal,
        node_name: NodeName,
        rsc_name: ResourceName,
        active: bool,
    ) -> ApiResponse {
        let (operation, action) = if active {
            ("activating", "activate resource")
        } else {
            ("deactivating", "deactivate resource")
        };
        let response = ResponseContext::new(
            operation,
            format!("resource '{}' on node '{}'", rsc_name, node_name),
        )
        .with_ref("node", node_name.as_str())
        .with_ref("rsc_dfn", rsc_name.as_str());
        let stream = flow(
            principal
                .require(AccessType::Change, ReturnCode::FAIL_ACC_DENIED_RSC, action)
                .map(|()| {
                    let pending: StepOutcome<bool> = StepOutcome::new();
                    let writer = pending.clone();
                    let registry = Arc::clone(&self.ctx.registry);
                    let node = node_name.clone();
                    let rsc = rsc_name.clone();
                    let request = self.ctx.step(
                        format!("{} {}/{}", action, node_name, rsc_name),
                        resource_locks(),
                        move |tx| {
                            let (rc, changed) = request_activation(tx, &registry, &node, &rsc, active)?;
                            writer.set(changed);
                            Ok(rc)
                        },
                    );
                    let ctx = Arc::clone(&self.ctx);
                    let follow_up = deferred(move || match pending.take() {
                        Some(true) => activation_flow(&ctx, node_name, rsc_name),
                        _ => empty_stream(),
                    });
                    sequence(vec![request, follow_up])
                }),
        );
        self.ctx.respond(stream, response)
    }

    /// Resources as currently committed, with the in-use state satellites reported
    pub fn list(&self, principal: &Principal, node_filter: Option<&NodeName>) -> Result<Vec<ResourceApi>, ApiError> {
        principal.require(AccessType::View, ReturnCode::FAIL_ACC_DENIED_RSC, "list resources")?;
        let state = self.ctx.store.snapshot();
        Ok(state
            .rsc_dfns
            .values()
            .flat_map(|dfn| dfn.resources.values())
            .filter(|rsc| node_filter.map_or(true, |n| &rsc.node_name == n))
            .map(|rsc| {
                let in_use = self
                    .ctx
                    .registry
                    .resource_state(&rsc.node_name, &rsc.rsc_name)
                    .and_then(|s| s.in_use);
                rsc.api_view(in_use)
            })
            .collect())
    }

    // ========================================================================
    // Flows
    // ========================================================================

    fn create_flow(&self, spec: ResourceSpec) -> RcStream {
        let node_name = spec.node_name.clone();
        let rsc_name = spec.rsc_name.clone();
        let create = self.ctx.step(
            format!("create resource {}/{}", node_name, rsc_name),
            resource_locks(),
            move |tx| create_resource(tx, &spec),
        );
        // a tie-breaker may have been dropped
        let deploy = self.propagate_and_finalize(
            rsc_name.clone(),
            format!("deploy resource {}/{}", node_name, rsc_name),
            DeploymentMessages::new(format!("resource '{}'", rsc_name))
                .primary(node_name, "Created {object} on '{node}'"),
        );
        sequence(vec![create, deploy])
    }

    fn delete_flow(&self, node_name: NodeName, rsc_name: ResourceName) -> RcStream {
        let registry = Arc::clone(&self.ctx.registry);
        let rsc = rsc_name.clone();
        let mark = self.ctx.step(
            format!("mark resource {}/{} for deletion", node_name, rsc_name),
            resource_locks(),
            move |tx| mark_for_deletion(tx, &registry, &node_name, &rsc),
        );
        sequence(vec![mark, self.deletion_flow(rsc_name)])
    }

    /// Pushes the deletion flags to the satellites, then removes what they dropped
    pub(crate) fn deletion_flow(&self, rsc_name: ResourceName) -> RcStream {
        self.propagate_and_finalize(
            rsc_name.clone(),
            format!("propagate deletions of resource '{}'", rsc_name),
            DeploymentMessages::new(format!("resource '{}'", rsc_name))
                .success("Notified '{node}' that {object} is being deleted"),
        )
    }

    /// Propagates the resource definition and finalizes the deletions the
    /// satellites were told about.
    ///
    /// The deleting resources are recorded before the propagation renders
    /// its update, so a resource flagged later by another operation is left
    /// for that operation to finalize.
    fn propagate_and_finalize(
        &self,
        rsc_name: ResourceName,
        description: String,
        messages: DeploymentMessages,
    ) -> RcStream {
        let flagged: StepOutcome<BTreeSet<NodeName>> = StepOutcome::new();
        let writer = flagged.clone();
        let store = Arc::clone(&self.ctx.store);
        let rsc = rsc_name.clone();
        let capture = deferred(move || {
            let state = store.snapshot();
            writer.set(deleting_nodes(&state.rsc_dfns, &rsc));
            empty_stream()
        });
        let propagate = self.ctx.propagate(
            description,
            UpdateTarget::ResourceDefinition(rsc_name.clone()),
            messages,
        );
        sequence(vec![capture, propagate, self.finalize_stream(rsc_name, flagged)])
    }

    /// Removes the resources of `rsc_name` in `flagged` that are still
    /// deleting, the definition when it is deleting and now empty, and
    /// nodes whose last resource was removed while they are deleting
    fn finalize_stream(&self, rsc_name: ResourceName, flagged: StepOutcome<BTreeSet<NodeName>>) -> RcStream {
        let removed: StepOutcome<Vec<RemovedNode>> = StepOutcome::new();
        let writer = removed.clone();
        let finalize = self.ctx.step(
            format!("finalize deletions of resource '{}'", rsc_name),
            finalize_locks(),
            move |tx| {
                let flagged = flagged.take().unwrap_or_default();
                let (rc, nodes) = finalize_deletions(tx, &rsc_name, &flagged)?;
                writer.set(nodes);
                Ok(rc)
            },
        );
        let ctx = Arc::clone(&self.ctx);
        let announce = deferred(move || announce_removal(&ctx, removed.take().unwrap_or_default()));
        sequence(vec![finalize, announce])
    }

    fn toggle_flow(&self, node_name: NodeName, rsc_name: ResourceName) -> RcStream {
        let mut steps = Vec::new();
        for _ in 0..2 {
            steps.push(self.toggle_propagation(&node_name, &rsc_name));
            let node = node_name.clone();
            let rsc = rsc_name.clone();
            steps.push(self.ctx.step(
                format!("advance disk toggle of {}/{}", node_name, rsc_name),
                resource_locks(),
                move |tx| advance_toggle(tx, &node, &rsc),
            ));
        }
        steps.push(self.propagate_and_finalize(
            rsc_name.clone(),
            format!("propagate disk toggle of {}/{}", node_name, rsc_name),
            DeploymentMessages::new(format!("resource '{}'", rsc_name)),
        ));
        sequence(steps)
    }

    fn toggle_propagation(&self, node_name: &NodeName, rsc_name: &ResourceName) -> RcStream {
        self.ctx.propagate(
            format!("propagate disk toggle of {}/{}", node_name, rsc_name),
            UpdateTarget::ResourceDefinition(rsc_name.clone()),
            DeploymentMessages::new(format!("resource '{}'", rsc_name)),
        )
    }
}

/// Pushes a pending activation change, clears its transient flag and
/// announces the result
fn activation_flow(ctx: &ControllerContext, node_name: NodeName, rsc_name: ResourceName) -> RcStream {
    let target = UpdateTarget::ResourceDefinition(rsc_name.clone());
    let propagate = ctx.propagate(
        format!("propagate activation change of {}/{}", node_name, rsc_name),
        target.clone(),
        DeploymentMessages::new(format!("resource '{}'", rsc_name)),
    );
    let node = node_name.clone();
    let rsc = rsc_name.clone();
    let finish = ctx.step(
        format!("finish activation change of {}/{}", node_name, rsc_name),
        resource_locks(),
        move |tx| finish_activation(tx, &node, &rsc),
    );
    let announce = ctx.notify(
        format!("announce activation change of {}/{}", node_name, rsc_name),
        target,
        DeploymentMessages::new(format!("resource '{}'", rsc_name)),
    );
    sequence(vec![propagate, finish, announce])
}

impl ConnectionListener for ResourceHandler {
    fn name(&self) -> &'static str {
        "resources"
    }

    fn resource_definition_connected(&self, tx: &Transaction, rsc_name: &ResourceName) -> Result<Vec<RcStream>, ApiError> {
        let Some(dfn) = tx.rsc_dfns()?.get(rsc_name) else {
            return Ok(Vec::new());
        };
        // whole-definition deletion resumes through its own handler
        if dfn.is_deleting() {
            return Ok(Vec::new());
        }
        let mut flows = Vec::new();
        if dfn.resources.values().any(Resource::is_deleting) {
            flows.push(self.deletion_flow(rsc_name.clone()));
        }
        for rsc in dfn
            .resources
            .values()
            .filter(|r| r.is_toggling_disk() && !r.is_deleting())
        {
            flows.push(self.toggle_flow(rsc.node_name.clone(), rsc_name.clone()));
        }
        for rsc in dfn
            .resources
            .values()
            .filter(|r| r.is_changing_activation() && !r.is_deleting())
        {
            flows.push(activation_flow(&self.ctx, rsc.node_name.clone(), rsc_name.clone()));
        }
        Ok(flows)
    }
}

// ============================================================================
// Steps
// ============================================================================

fn not_found_rsc_dfn(rsc_name: &ResourceName) -> ApiError {
    ApiError::entry(
        RcEntry::new(
            ReturnCode::FAIL_NOT_FOUND_RSC_DFN,
            format!("Resource definition '{}' not found", rsc_name),
        )
        .with_obj_ref("rsc_dfn", rsc_name.as_str()),
    )
}

fn not_found_rsc(node_name: &NodeName, rsc_name: &ResourceName) -> ApiError {
    ApiError::entry(
        RcEntry::new(
            ReturnCode::FAIL_NOT_FOUND_RSC,
            format!("Resource '{}' not found on node '{}'", rsc_name, node_name),
        )
        .with_obj_ref("node", node_name.as_str())
        .with_obj_ref("rsc_dfn", rsc_name.as_str()),
    )
}

/// Checks that `node_name` exists and offers a diskful `stor_pool`
fn check_stor_pool(tx: &Transaction, node_name: &NodeName, stor_pool: &StorPoolName) -> Result<(), ApiError> {
    let nodes = tx.nodes()?;
    let node = nodes.nodes.get(node_name).ok_or_else(|| {
        ApiError::rc(
            ReturnCode::FAIL_NOT_FOUND_NODE,
            format!("Node '{}' not found", node_name),
        )
    })?;
    match node.stor_pools.get(stor_pool) {
        Some(pool) if pool.provider.has_disk() => Ok(()),
        Some(_) => Err(ApiError::entry(
            RcEntry::new(
                ReturnCode::FAIL_NOT_FOUND_STOR_POOL,
                format!("Storage pool '{}' on node '{}' has no disk", stor_pool, node_name),
            )
            .with_correction("Request a diskless resource or use a pool backed by storage"),
        )),
        None => Err(ApiError::entry(
            RcEntry::new(
                ReturnCode::FAIL_NOT_FOUND_STOR_POOL,
                format!("Storage pool '{}' not found on node '{}'", stor_pool, node_name),
            )
            .with_obj_ref("stor_pool", stor_pool.as_str()),
        )),
    }
}

fn default_pool(requested: &Option<StorPoolName>) -> Result<StorPoolName, ApiError> {
    match requested {
        Some(pool) => Ok(pool.clone()),
        None => Ok(StorPoolName::new(DEFAULT_STOR_POOL)?),
    }
}

fn create_resource(tx: &mut Transaction, spec: &ResourceSpec) -> Result<ApiCallRc, ApiError> {
    let node_name = &spec.node_name;
    let rsc_name = &spec.rsc_name;
    {
        let node = tx.nodes()?.nodes.get(node_name).ok_or_else(|| {
            ApiError::rc(
                ReturnCode::FAIL_NOT_FOUND_NODE,
                format!("Node '{}' not found", node_name),
            )
        })?;
        if node.is_deleting() {
            return Err(ApiError::rc(
                ReturnCode::FAIL_NOT_FOUND_NODE,
                format!("Node '{}' is being deleted", node_name),
            ));
        }
    }
    let stor_pool = if spec.diskless {
        None
    } else {
        let pool = default_pool(&spec.stor_pool)?;
        check_stor_pool(tx, node_name, &pool)?;
        Some(pool)
    };

    let mut rc = ApiCallRc::new();
    let dfn = tx
        .rsc_dfns_mut()?
        .get_mut(rsc_name)
        .ok_or_else(|| not_found_rsc_dfn(rsc_name))?;
    if dfn.is_deleting() {
        return Err(ApiError::rc(
            ReturnCode::FAIL_NOT_FOUND_RSC_DFN,
            format!("Resource definition '{}' is being deleted", rsc_name),
        ));
    }

    if let Some(existing) = dfn.resources.get_mut(node_name) {
        if existing.is_tie_breaker() && !existing.is_deleting() && spec.diskless {
            existing.flags.disable(ResourceFlag::TieBreaker)?;
            info!(node = %node_name, rsc = %rsc_name, "tie-breaker taken over");
            rc.push(
                RcEntry::new(
                    ReturnCode::INFO_TIE_BREAKER_TAKEOVER,
                    format!("Tie-breaker resource '{}' on node '{}' taken over", rsc_name, node_name),
                )
                .with_obj_ref("node", node_name.as_str()),
            );
        } else {
            return Err(ApiError::entry(
                RcEntry::new(
                    ReturnCode::FAIL_EXISTS_RSC,
                    format!("Resource '{}' already exists on node '{}'", rsc_name, node_name),
                )
                .with_correction("Use toggle-disk to change the disk state of an existing resource"),
            ));
        }
    } else {
        let flags = if spec.diskless {
            StateFlags::with(&[ResourceFlag::Diskless])
        } else {
            StateFlags::empty()
        };
        let mut rsc = Resource::new(node_name.clone(), rsc_name.clone(), flags);
        if let Some(pool) = &stor_pool {
            rsc.props.set(keys::STOR_POOL_NAME, pool.as_str())?;
        }
        for number in dfn.volume_dfns.values().filter(|v| !v.is_deleting()).map(|v| v.number) {
            rsc.volumes.insert(
                number,
                Volume::new(node_name.clone(), rsc_name.clone(), number, stor_pool.clone()),
            );
        }
        dfn.resources.insert(node_name.clone(), rsc);
        rc.push(
            RcEntry::new(
                ReturnCode::CREATED,
                format!("New resource '{}' on node '{}' registered", rsc_name, node_name),
            )
            .with_obj_ref("node", node_name.as_str())
            .with_obj_ref("rsc_dfn", rsc_name.as_str()),
        );
    }
    rc.extend(tie_breaker::maintain(tx, rsc_name)?);
    Ok(rc)
}

/// Whether `rsc` sits on a pool whose snapshots depend on its volumes
fn backs_snapshots(tx: &Transaction, rsc: &Resource) -> Result<bool, ApiError> {
    let nodes = tx.nodes()?;
    let Some(node) = nodes.nodes.get(&rsc.node_name) else {
        return Ok(false);
    };
    Ok(rsc
        .volumes
        .values()
        .filter_map(|v| v.stor_pool.as_ref())
        .filter_map(|p| node.stor_pools.get(p))
        .any(|p| p.provider.supports_snapshots()))
}

pub(crate) fn mark_for_deletion(
    tx: &mut Transaction,
    registry: &SatelliteRegistry,
    node_name: &NodeName,
    rsc_name: &ResourceName,
) -> Result<ApiCallRc, ApiError> {
    {
        let dfn = tx
            .rsc_dfns()?
            .get(rsc_name)
            .ok_or_else(|| not_found_rsc_dfn(rsc_name))?;
        let Some(rsc) = dfn.resources.get(node_name) else {
            return Err(ApiError::entry(
                RcEntry::new(
                    ReturnCode::WARN_NOT_FOUND,
                    format!("Resource '{}' not found on node '{}'", rsc_name, node_name),
                )
                .with_details("Nothing to delete"),
            ));
        };
        if rsc.is_deleting() {
            return Ok(ApiCallRc::single(RcEntry::new(
                ReturnCode::WARN_DELETE_IN_PROGRESS,
                format!("Resource '{}' on node '{}' is already being deleted", rsc_name, node_name),
            )));
        }
        if rsc.is_toggling_disk() {
            return Err(ApiError::rc(
                ReturnCode::FAIL_RSC_BUSY,
                format!("Resource '{}' on node '{}' is toggling its disk", rsc_name, node_name),
            ));
        }
        if rsc.is_changing_activation() {
            return Err(ApiError::rc(
                ReturnCode::FAIL_RSC_BUSY,
                format!("Resource '{}' on node '{}' is changing its activation", rsc_name, node_name),
            ));
        }
        if registry
            .resource_state(node_name, rsc_name)
            .and_then(|s| s.in_use)
            .unwrap_or(false)
        {
            return Err(ApiError::entry(
                RcEntry::new(
                    ReturnCode::FAIL_IN_USE,
                    format!("Resource '{}' on node '{}' is in use", rsc_name, node_name),
                )
                .with_correction("Stop using the resource before deleting it"),
            ));
        }
        if rsc.is_active_diskful() && dfn.diskful_count() == 1 {
            let dependents: Vec<&str> = dfn
                .active_diskless()
                .filter(|r| !r.is_tie_breaker())
                .map(|r| r.node_name.as_str())
                .collect();
            if !dependents.is_empty() {
                return Err(ApiError::entry(
                    RcEntry::new(
                        ReturnCode::FAIL_IN_USE,
                        format!(
                            "Resource '{}' on node '{}' is the last replica with a disk",
                            rsc_name, node_name
                        ),
                    )
                    .with_details(format!("Diskless resources on: {}", dependents.join(", ")))
                    .with_correction("Delete the diskless resources first"),
                ));
            }
        }
        let snapshots: Vec<&str> = dfn
            .snapshot_dfns
            .values()
            .filter(|s| s.snapshots.contains_key(node_name))
            .map(|s| s.name.as_str())
            .collect();
        if !snapshots.is_empty() && backs_snapshots(tx, rsc)? {
            return Err(ApiError::entry(
                RcEntry::new(
                    ReturnCode::FAIL_IN_USE,
                    format!(
                        "Resource '{}' on node '{}' still backs snapshots",
                        rsc_name, node_name
                    ),
                )
                .with_details(format!("Snapshots: {}", snapshots.join(", ")))
                .with_correction("Delete the snapshots first"),
            ));
        }
    }

    let dfn = tx
        .rsc_dfns_mut()?
        .get_mut(rsc_name)
        .ok_or_else(|| not_found_rsc_dfn(rsc_name))?;
    let rsc = dfn
        .resources
        .get_mut(node_name)
        .ok_or_else(|| not_found_rsc(node_name, rsc_name))?;
    flag_deleted(rsc)?;
    debug!(node = %node_name, rsc = %rsc_name, "resource marked for deletion");

    let mut rc = ApiCallRc::single(
        RcEntry::new(
            ReturnCode::MODIFIED,
            format!("Resource '{}' on node '{}' marked for deletion", rsc_name, node_name),
        )
        .with_obj_ref("node", node_name.as_str()),
    );
    rc.extend(tie_breaker::maintain(tx, rsc_name)?);
    Ok(rc)
}

pub(crate) fn flag_deleted(rsc: &mut Resource) -> Result<(), ApiError> {
    rsc.flags.enable(ResourceFlag::Delete)?;
    for vlm in rsc.volumes.values_mut() {
        vlm.flags.enable(VolumeFlag::Delete)?;
    }
    Ok(())
}

/// Nodes whose resource of `rsc_name` is flagged for deletion
fn deleting_nodes(rsc_dfns: &RscDfnMap, rsc_name: &ResourceName) -> BTreeSet<NodeName> {
    rsc_dfns
        .get(rsc_name)
        .map(|dfn| {
            dfn.resources
                .values()
                .filter(|r| r.is_deleting())
                .map(|r| r.node_name.clone())
                .collect()
        })
        .unwrap_or_default()
}

/// Removes what the satellites confirmed as deleted; only resources on
/// `flagged` nodes are considered
pub(crate) fn finalize_deletions(
    tx: &mut Transaction,
    rsc_name: &ResourceName,
    flagged: &BTreeSet<NodeName>,
) -> Result<(ApiCallRc, Vec<RemovedNode>), ApiError> {
    let mut rc = ApiCallRc::new();
    let (touched, dfn_done) = {
        let Some(dfn) = tx.rsc_dfns_mut()?.get_mut(rsc_name) else {
            return Ok((rc, Vec::new()));
        };
        let doomed: Vec<NodeName> = dfn
            .resources
            .values()
            .filter(|r| r.is_deleting() && flagged.contains(&r.node_name))
            .map(|r| r.node_name.clone())
            .collect();
        for node_name in &doomed {
            dfn.resources.remove(node_name);
            dfn.connections.retain(|_, conn| !conn.involves(node_name));
            rc.push(
                RcEntry::new(
                    ReturnCode::DELETED,
                    format!("Resource '{}' on node '{}' deleted", rsc_name, node_name),
                )
                .with_obj_ref("node", node_name.as_str())
                .with_obj_ref("rsc_dfn", rsc_name.as_str()),
            );
        }
        (doomed, dfn.is_deleting() && dfn.resources.is_empty())
    };
    if dfn_done {
        rc.extend(remove_resource_definition(tx, rsc_name)?);
    }

    let still_used: BTreeSet<NodeName> = tx
        .rsc_dfns()?
        .values()
        .flat_map(|dfn| dfn.resources.keys())
        .filter(|n| touched.contains(n))
        .cloned()
        .collect();
    let mut removed = Vec::new();
    for node_name in touched.iter().filter(|n| !still_used.contains(*n)) {
        let deleting = tx
            .nodes()?
            .nodes
            .get(node_name)
            .map_or(false, |n| n.is_deleting());
        if deleting {
            if let Some((entry, node)) = remove_node(tx, node_name)? {
                rc.push(entry);
                removed.push(node);
            }
        }
    }
    Ok((rc, removed))
}

fn request_toggle(
    tx: &mut Transaction,
    node_name: &NodeName,
    rsc_name: &ResourceName,
    toggle: &DiskToggle,
) -> Result<ApiCallRc, ApiError> {
    let (is_diskless, diskful_count) = {
        let dfn = tx
            .rsc_dfns()?
            .get(rsc_name)
            .ok_or_else(|| not_found_rsc_dfn(rsc_name))?;
        let rsc = dfn
            .resources
            .get(node_name)
            .ok_or_else(|| not_found_rsc(node_name, rsc_name))?;
        if rsc.is_deleting() || rsc.is_toggling_disk() || rsc.is_changing_activation() {
            return Err(ApiError::entry(
                RcEntry::new(
                    ReturnCode::FAIL_RSC_BUSY,
                    format!("Resource '{}' on node '{}' is busy", rsc_name, node_name),
                )
                .with_details(format!("Current flags: {}", rsc.flags.names().join(", "))),
            ));
        }
        (rsc.is_diskless(), dfn.diskful_count())
    };

    let stor_pool = match toggle {
        DiskToggle::Add { stor_pool } => {
            if !is_diskless {
                return Err(ApiError::rc(
                    ReturnCode::WARN_RSC_ALREADY_HAS_DISK,
                    format!("Resource '{}' on node '{}' already has a disk", rsc_name, node_name),
                ));
            }
            let pool = default_pool(stor_pool)?;
            check_stor_pool(tx, node_name, &pool)?;
            Some(pool)
        }
        DiskToggle::Remove => {
            if is_diskless {
                return Err(ApiError::rc(
                    ReturnCode::WARN_RSC_ALREADY_DISKLESS,
                    format!("Resource '{}' on node '{}' is already diskless", rsc_name, node_name),
                ));
            }
            if diskful_count <= 1 {
                return Err(ApiError::entry(
                    RcEntry::new(
                        ReturnCode::FAIL_INSUFFICIENT_REPLICA_COUNT,
                        format!("Resource '{}' on node '{}' holds the last disk", rsc_name, node_name),
                    )
                    .with_correction("Add a disk on another node first"),
                ));
            }
            None
        }
    };

    let dfn = tx
        .rsc_dfns_mut()?
        .get_mut(rsc_name)
        .ok_or_else(|| not_found_rsc_dfn(rsc_name))?;
    let rsc = dfn
        .resources
        .get_mut(node_name)
        .ok_or_else(|| not_found_rsc(node_name, rsc_name))?;
    let message = match stor_pool {
        Some(pool) => {
            rsc.flags.disable(ResourceFlag::TieBreaker)?;
            rsc.flags.enable(ResourceFlag::DiskAddRequested)?;
            rsc.props.set(keys::STOR_POOL_NAME, pool.as_str())?;
            for vlm in rsc.volumes.values_mut() {
                vlm.stor_pool = Some(pool.clone());
            }
            format!("Adding a disk to resource '{}' on node '{}'", rsc_name, node_name)
        }
        None => {
            rsc.flags.enable(ResourceFlag::DiskRemoveRequested)?;
            format!("Removing the disk of resource '{}' on node '{}'", rsc_name, node_name)
        }
    };
    let mut rc = ApiCallRc::single(RcEntry::new(ReturnCode::MODIFIED, message).with_obj_ref("node", node_name.as_str()));
    rc.extend(tie_breaker::maintain(tx, rsc_name)?);
    Ok(rc)
}

/// Records a deactivation (`active == false`) or reactivation.
///
/// The returned flag tells whether a change waits for the satellites, which
/// is also the case when the same request is still pending.
pub(crate) fn request_activation(
    tx: &mut Transaction,
    registry: &SatelliteRegistry,
    node_name: &NodeName,
    rsc_name: &ResourceName,
    active: bool,
) -> Result<(ApiCallRc, bool), ApiError> {
    let in_use = registry
        .resource_state(node_name, rsc_name)
        .and_then(|s| s.in_use)
        .unwrap_or(false);
    let receiving = tx.rsc_dfns()?.get(rsc_name).map_or(false, |dfn| {
        dfn.snapshot_dfns.values().any(|s| {
            s.is_shipping()
                && s.snapshots
                    .get(node_name)
                    .map_or(false, |snap| snap.flags.is_set(SnapshotFlag::ShippingTarget))
        })
    });
    let rsc = tx
        .rsc_dfns_mut()?
        .get_mut(rsc_name)
        .ok_or_else(|| not_found_rsc_dfn(rsc_name))?
        .resources
        .get_mut(node_name)
        .ok_or_else(|| not_found_rsc(node_name, rsc_name))?;
    if rsc.is_deleting() || rsc.is_toggling_disk() {
        return Err(ApiError::entry(
            RcEntry::new(
                ReturnCode::FAIL_RSC_BUSY,
                format!("Resource '{}' on node '{}' is busy", rsc_name, node_name),
            )
            .with_details(format!("Current flags: {}", rsc.flags.names().join(", "))),
        ));
    }
    let state = if active { "active" } else { "inactive" };
    if rsc.is_inactive() != active {
        let pending = rsc.is_changing_activation();
        return Ok((
            ApiCallRc::single(RcEntry::new(
                ReturnCode::INFO_NO_PENDING_WORK,
                format!("Resource '{}' on node '{}' is already {}", rsc_name, node_name, state),
            )),
            pending,
        ));
    }
    if active {
        if receiving {
            return Err(ApiError::entry(
                RcEntry::new(
                    ReturnCode::FAIL_IN_USE,
                    format!("Resource '{}' on node '{}' is receiving a snapshot", rsc_name, node_name),
                )
                .with_correction("Wait for the shipment to finish"),
            ));
        }
        rsc.flags
            .disable_all(&[ResourceFlag::Inactivating, ResourceFlag::Inactive])?;
        rsc.flags.enable(ResourceFlag::Reactivate)?;
    } else {
        if in_use {
            return Err(ApiError::entry(
                RcEntry::new(
                    ReturnCode::FAIL_IN_USE,
                    format!("Resource '{}' on node '{}' is in use", rsc_name, node_name),
                )
                .with_correction("Stop using the resource before deactivating it"),
            ));
        }
        rsc.flags.disable(ResourceFlag::Reactivate)?;
        rsc.flags
            .enable_all(&[ResourceFlag::Inactive, ResourceFlag::Inactivating])?;
    }
    debug!(node = %node_name, rsc = %rsc_name, state, "activation change requested");
    Ok((
        ApiCallRc::single(
            RcEntry::new(
                ReturnCode::MODIFIED,
                format!("Resource '{}' on node '{}' is becoming {}", rsc_name, node_name, state),
            )
            .with_obj_ref("node", node_name.as_str()),
        ),
        true,
    ))
}

/// Clears the transient activation flag after the satellites applied it
pub(crate) fn finish_activation(
    tx: &mut Transaction,
    node_name: &NodeName,
    rsc_name: &ResourceName,
) -> Result<ApiCallRc, ApiError> {
    let Some(rsc) = tx
        .rsc_dfns_mut()?
        .get_mut(rsc_name)
        .and_then(|dfn| dfn.resources.get_mut(node_name))
    else {
        return Ok(ApiCallRc::new());
    };
    let state = if rsc.flags.is_set(ResourceFlag::Inactivating) {
        rsc.flags.disable(ResourceFlag::Inactivating)?;
        "deactivated"
    } else if rsc.flags.is_set(ResourceFlag::Reactivate) {
        rsc.flags.disable(ResourceFlag::Reactivate)?;
        "activated"
    } else {
        return Ok(ApiCallRc::new());
    };
    info!(node = %node_name, rsc = %rsc_name, state, "resource activation changed");
    Ok(ApiCallRc::single(
        RcEntry::new(
            ReturnCode::MODIFIED,
            format!("Resource '{}' on node '{}' {}", rsc_name, node_name, state),
        )
        .with_obj_ref("node", node_name.as_str()),
    ))
}

/// Moves a disk toggle one step forward; does nothing when none is pending
pub(crate) fn advance_toggle(
    tx: &mut Transaction,
    node_name: &NodeName,
    rsc_name: &ResourceName,
) -> Result<ApiCallRc, ApiError> {
    let Some(rsc) = tx
        .rsc_dfns_mut()?
        .get_mut(rsc_name)
        .and_then(|dfn| dfn.resources.get_mut(node_name))
    else {
        return Ok(ApiCallRc::new());
    };
    if rsc.is_deleting() {
        return Ok(ApiCallRc::new());
    }

    let flags = &mut rsc.flags;
    let (message, completed) = if flags.is_set(ResourceFlag::DiskAdding) {
        flags.disable_all(&[ResourceFlag::DiskAdding, ResourceFlag::DiskAddRequested, ResourceFlag::Diskless])?;
        (format!("Disk added to resource '{}' on node '{}'", rsc_name, node_name), true)
    } else if flags.is_set(ResourceFlag::DiskAddRequested) {
        flags.enable(ResourceFlag::DiskAdding)?;
        (format!("Creating the disk of resource '{}' on node '{}'", rsc_name, node_name), false)
    } else if flags.is_set(ResourceFlag::DiskRemoving) {
        flags.disable_all(&[ResourceFlag::DiskRemoving, ResourceFlag::DiskRemoveRequested])?;
        flags.enable(ResourceFlag::Diskless)?;
        rsc.props.remove(keys::STOR_POOL_NAME)?;
        for vlm in rsc.volumes.values_mut() {
            vlm.stor_pool = None;
        }
        (format!("Disk removed from resource '{}' on node '{}'", rsc_name, node_name), true)
    } else if flags.is_set(ResourceFlag::DiskRemoveRequested) {
        flags.enable(ResourceFlag::DiskRemoving)?;
        (format!("Removing the disk of resource '{}' on node '{}'", rsc_name, node_name), false)
    } else {
        return Ok(ApiCallRc::new());
    };

    let mut rc = ApiCallRc::single(
        RcEntry::new(ReturnCode::MODIFIED, message).with_obj_ref("node", node_name.as_str()),
    );
    if completed {
        rc.extend(tie_breaker::maintain(tx, rsc_name)?);
    }
    Ok(rc)
}
