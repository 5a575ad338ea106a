// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Snapshot Shipping Handler
//!
//! Ships a snapshot from one diskful resource to another replica of the same
//! resource definition. The receiving resource has to be inactive, since its
//! volumes are overwritten by the transfer.
//!
//! The snapshot definition is flagged `SHIPPING` and holds two snapshots:
//! `SHIPPING_SOURCE` on the sending node and `SHIPPING_TARGET` on the
//! receiving one. Shipments are named `ship_<n>`, with `n` taken from a
//! counter kept in the resource definition properties. The sending satellite
//! reports the end of the transfer through
//! [`SnapshotShippingHandler::shipping_finished`], which releases the
//! shipping port.

use crate::application::context::{deferred, flow, ControllerContext, StepOutcome};
use crate::application::responses::{ApiResponse, ResponseContext};
use crate::application::satellite_updates::{DeploymentMessages, UpdateTarget};
use crate::application::scope_runner::{empty_stream, sequence};
use crate::application::snapshots::{end_shipment, new_snapshot_definition, SnapshotHandler};
use crate::domain::access::{AccessType, Principal};
use crate::domain::api_rc::{ApiCallRc, RcEntry, ReturnCode};
use crate::domain::errors::ApiError;
use crate::domain::flags::StateFlags;
use crate::domain::lock_domain::{LockObj, LockRequest};
use crate::domain::names::{NodeName, ResourceName, SnapshotName};
use crate::domain::number_pool::PoolKind;
use crate::domain::props::keys;
use crate::domain::resource_definition::ResourceDefinition;
use crate::domain::snapshot::{Snapshot, SnapshotDefinitionFlag, SnapshotFlag};
use crate::infrastructure::object_store::Transaction;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

const NAME_PREFIX: &str = "ship_";

fn locks() -> LockRequest {
    LockRequest::new().write(&[LockObj::ResourceDefinitions])
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShippingSpec {
    pub rsc_name: ResourceName,
    pub from_node: NodeName,
    pub to_node: NodeName,
}

pub struct SnapshotShippingHandler {
    ctx: Arc<ControllerContext>,
    snapshots: Arc<SnapshotHandler>,
}

impl SnapshotShippingHandler {
    pub fn new(ctx: Arc<ControllerContext>, snapshots: Arc<SnapshotHandler>) -> Arc<Self> {
        Arc::new(Self { ctx, snapshots })
    }

    pub fn ship(&self, principal: &Principal, spec: ShippingSpec) -> ApiResponse {
        let response = ResponseContext::new(
            "shipping",
            format!(
                "snapshot of '{}' from '{}' to '{}'",
                spec.rsc_name, spec.from_node, spec.to_node
            ),
        )
        .with_ref("rsc_dfn", spec.rsc_name.as_str())
        .with_ref("node", spec.from_node.as_str());
        let stream = flow(
            principal
                .require(AccessType::Change, ReturnCode::FAIL_ACC_DENIED_SNAPSHOT_DFN, "ship snapshot")
                .map(|()| {
                    let rsc_name = spec.rsc_name.clone();
                    let started: StepOutcome<SnapshotName> = StepOutcome::new();
                    let writer = started.clone();
                    let start = self.ctx.step(
                        format!("start shipping a snapshot of '{}'", rsc_name),
                        locks(),
                        move |tx| {
                            let (rc, name) = start_shipment(tx, &spec)?;
                            writer.set(name);
                            Ok(rc)
                        },
                    );
                    let snapshots = Arc::clone(&self.snapshots);
                    let take = deferred(move || match started.take() {
                        Some(name) => snapshots.completion_flow(rsc_name, name),
                        None => empty_stream(),
                    });
                    sequence(vec![start, take])
                }),
        );
        self.ctx.respond(stream, response)
    }

    /// Result of a shipment, reported by the sending satellite
    pub fn shipping_finished(
        &self,
        principal: &Principal,
        rsc_name: ResourceName,
        name: SnapshotName,
        success: bool,
    ) -> ApiResponse {
        let response = ResponseContext::new("finishing", format!("shipment '{}' of '{}'", name, rsc_name))
            .with_ref("rsc_dfn", rsc_name.as_str())
            .with_ref("snapshot", name.as_str());
        let stream = flow(
            principal
                .require_system(ReturnCode::FAIL_ACC_DENIED_SNAPSHOT_DFN, "report snapshot shipment")
                .map(|()| {
                    let rsc = rsc_name.clone();
                    let snap = name.clone();
                    let finish = self.ctx.step(
                        format!("finish shipment '{}' of '{}'", name, rsc_name),
                        locks(),
                        move |tx| finish_shipment(tx, &rsc, &snap, success),
                    );
                    let target = UpdateTarget::SnapshotDefinition {
                        rsc_name,
                        snapshot_name: name,
                    };
                    let announce = self.ctx.notify(
                        format!("announce {}", target),
                        target.clone(),
                        DeploymentMessages::new(target.to_string()),
                    );
                    sequence(vec![finish, announce])
                }),
        );
        self.ctx.respond(stream, response)
    }
}

// ============================================================================
// Steps
// ============================================================================

fn invalid_target(rsc_name: &ResourceName, to_node: &NodeName, reason: &str) -> ApiError {
    ApiError::entry(
        RcEntry::new(
            ReturnCode::FAIL_INVLD_SNAPSHOT_SHIPPING_TARGET,
            format!("Resource '{}' on node '{}' cannot receive a snapshot", rsc_name, to_node),
        )
        .with_cause(reason)
        .with_obj_ref("node", to_node.as_str()),
    )
}

/// Checks both ends of a shipment
fn check_endpoints(dfn: &ResourceDefinition, spec: &ShippingSpec) -> Result<(), ApiError> {
    let rsc_name = &spec.rsc_name;
    if spec.from_node == spec.to_node {
        return Err(invalid_target(rsc_name, &spec.to_node, "it is also the sending resource"));
    }
    match dfn.resources.get(&spec.from_node) {
        Some(rsc) if rsc.is_active_diskful() && !rsc.is_inactive() => {}
        _ => {
            return Err(ApiError::rc(
                ReturnCode::FAIL_NOT_FOUND_RSC,
                format!("No active diskful resource '{}' on node '{}'", rsc_name, spec.from_node),
            ))
        }
    }
    let Some(target) = dfn.resources.get(&spec.to_node) else {
        return Err(ApiError::rc(
            ReturnCode::FAIL_NOT_FOUND_RSC,
            format!("Resource '{}' not found on node '{}'", rsc_name, spec.to_node),
        ));
    };
    if !target.is_active_diskful() {
        return Err(invalid_target(rsc_name, &spec.to_node, "it has no disk"));
    }
    if !target.is_inactive() || target.is_changing_activation() {
        return Err(ApiError::entry(
            RcEntry::new(
                ReturnCode::FAIL_INVLD_SNAPSHOT_SHIPPING_TARGET,
                format!("Resource '{}' on node '{}' is active", rsc_name, spec.to_node),
            )
            .with_correction("Deactivate the receiving resource first"),
        ));
    }
    let running = dfn.snapshot_dfns.values().find(|s| {
        !s.is_backup()
            && s.is_shipping()
            && s.props.get(keys::SHIPPING_SOURCE_NODE) == Some(spec.from_node.as_str())
            && s.props.get(keys::SHIPPING_TARGET_NODE) == Some(spec.to_node.as_str())
    });
    if let Some(running) = running {
        return Err(ApiError::entry(
            RcEntry::new(
                ReturnCode::FAIL_EXISTS_SNAPSHOT_SHIPPING,
                format!(
                    "A snapshot of '{}' is already shipping from '{}' to '{}'",
                    rsc_name, spec.from_node, spec.to_node
                ),
            )
            .with_details(format!("Shipment '{}' is in progress", running.name)),
        ));
    }
    Ok(())
}

/// Next free `ship_<n>` name and the counter value to store afterwards
fn next_name(dfn: &ResourceDefinition) -> Result<(SnapshotName, u64), ApiError> {
    let mut id = match dfn.props.get(keys::SHIPPING_NEXT_ID) {
        Some(raw) => raw.parse::<u64>().unwrap_or_else(|_| {
            warn!(rsc = %dfn.name, value = raw, "ignoring malformed shipment counter");
            0
        }),
        None => 0,
    };
    loop {
        let name = SnapshotName::new(format!("{}{}", NAME_PREFIX, id))?;
        id += 1;
        if !dfn.snapshot_dfns.contains_key(&name) {
            return Ok((name, id));
        }
    }
}

fn start_shipment(tx: &mut Transaction, spec: &ShippingSpec) -> Result<(ApiCallRc, SnapshotName), ApiError> {
    let (name, next_id) = {
        let dfn = tx.rsc_dfns()?.get(&spec.rsc_name).ok_or_else(|| {
            ApiError::rc(
                ReturnCode::FAIL_NOT_FOUND_RSC_DFN,
                format!("Resource definition '{}' not found", spec.rsc_name),
            )
        })?;
        check_endpoints(dfn, spec)?;
        next_name(dfn)?
    };

    let mut snap_dfn = new_snapshot_definition(
        tx,
        &spec.rsc_name,
        &name,
        StateFlags::with(&[SnapshotDefinitionFlag::Shipping]),
    )?;
    let port = tx.allocate(PoolKind::ShippingPort)?;
    snap_dfn.props.set(keys::SHIPPING_PORT, port.to_string())?;
    snap_dfn.props.set(keys::SHIPPING_SOURCE_NODE, spec.from_node.as_str())?;
    snap_dfn.props.set(keys::SHIPPING_TARGET_NODE, spec.to_node.as_str())?;
    for (node_name, flag) in [
        (&spec.from_node, SnapshotFlag::ShippingSource),
        (&spec.to_node, SnapshotFlag::ShippingTarget),
    ] {
        snap_dfn.snapshots.insert(
            node_name.clone(),
            Snapshot::new(node_name.clone(), spec.rsc_name.clone(), name.clone(), StateFlags::with(&[flag])),
        );
    }
    let dfn = tx
        .rsc_dfns_mut()?
        .get_mut(&spec.rsc_name)
        .ok_or_else(|| ApiError::implementation(format!("resource definition '{}' vanished", spec.rsc_name)))?;
    dfn.props.set(keys::SHIPPING_NEXT_ID, next_id.to_string())?;
    dfn.snapshot_dfns.insert(name.clone(), snap_dfn);

    info!(
        rsc = %spec.rsc_name,
        snapshot = %name,
        from = %spec.from_node,
        to = %spec.to_node,
        port,
        "snapshot shipment started"
    );
    metrics::counter!("stork_snapshot_shipments_started_total").increment(1);
    let rc = ApiCallRc::single(
        RcEntry::new(
            ReturnCode::CREATED,
            format!("Shipment '{}' of '{}' started", name, spec.rsc_name),
        )
        .with_details(format!(
            "Shipping from '{}' to '{}' over port {}",
            spec.from_node, spec.to_node, port
        ))
        .with_obj_ref("rsc_dfn", spec.rsc_name.as_str())
        .with_obj_ref("snapshot", name.as_str()),
    );
    Ok((rc, name))
}

fn finish_shipment(
    tx: &mut Transaction,
    rsc_name: &ResourceName,
    name: &SnapshotName,
    success: bool,
) -> Result<ApiCallRc, ApiError> {
    let is_shipment = tx
        .rsc_dfns()?
        .get(rsc_name)
        .and_then(|dfn| dfn.snapshot_dfns.get(name))
        .map_or(false, |s| !s.is_backup());
    if !is_shipment || !end_shipment(tx, rsc_name, name, success)? {
        return Err(ApiError::rc(
            ReturnCode::WARN_NOT_FOUND,
            format!("Snapshot '{}' of '{}' is not shipping", name, rsc_name),
        ));
    }
    let result = if success { "ok" } else { "failed" };
    metrics::counter!("stork_snapshot_shipments_finished_total", "result" => result).increment(1);
    if success {
        info!(rsc = %rsc_name, snapshot = %name, "snapshot shipped");
        Ok(ApiCallRc::single(RcEntry::new(
            ReturnCode::MODIFIED,
            format!("Snapshot '{}' of '{}' shipped", name, rsc_name),
        )))
    } else {
        warn!(rsc = %rsc_name, snapshot = %name, "snapshot shipment failed");
        Ok(ApiCallRc::single(
            RcEntry::new(
                ReturnCode::FAIL_SATELLITE,
                format!("Shipping snapshot '{}' of '{}' failed", name, rsc_name),
            )
            .with_correction("Check the satellite log of the sending node"),
        ))
    }
}
