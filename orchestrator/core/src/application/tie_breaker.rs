// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Quorum Tie-Breaker
//!
//! A resource definition with exactly two diskful replicas and no other
//! diskless resource gets one extra diskless resource, so that quorum can
//! still be reached while one replica is down. It is removed again as soon
//! as the replica layout no longer needs it.
//!
//! The behavior is controlled by `DrbdOptions/auto-add-quorum-tiebreaker`,
//! looked up on the resource definition, its resource group and the
//! controller configuration (in that order). It defaults to enabled.
//!
//! Callers must hold read locks on `NODES`, `RESOURCE_GROUPS` and
//! `CTRL_CONFIG` and the write lock on `RESOURCE_DEFINITIONS`.

use crate::domain::api_rc::{ApiCallRc, RcEntry, ReturnCode};
use crate::domain::errors::ApiError;
use crate::domain::flags::StateFlags;
use crate::domain::names::{NodeName, ResourceName};
use crate::domain::node::NodeFlag;
use crate::domain::props::{keys, lookup, Props};
use crate::domain::resource::{Resource, ResourceFlag, Volume, VolumeFlag};
use crate::domain::resource_definition::ResourceDefinition;
use crate::infrastructure::object_store::Transaction;
use tracing::debug;

pub fn is_enabled(tx: &Transaction, dfn: &ResourceDefinition) -> Result<bool, ApiError> {
    let rsc_grps = tx.rsc_grps()?;
    let ctrl = tx.ctrl()?;
    let mut chain: Vec<&Props> = vec![&dfn.props];
    if let Some(grp) = rsc_grps.get(&dfn.resource_group) {
        chain.push(&grp.props);
    }
    chain.push(&ctrl.props);
    Ok(match lookup(&chain, keys::AUTO_ADD_QUORUM_TIEBREAKER) {
        Some(value) => !matches!(value.to_ascii_lowercase().as_str(), "false" | "no" | "0"),
        None => true,
    })
}

/// Whether the current layout of `dfn` calls for a tie-breaker
fn is_needed(tx: &Transaction, dfn: &ResourceDefinition) -> Result<bool, ApiError> {
    let other_diskless = dfn.active_diskless().filter(|r| !r.is_tie_breaker()).count();
    Ok(dfn.diskful_count() == 2 && other_diskless == 0 && is_enabled(tx, dfn)?)
}

/// First satellite (by name) that could host the tie-breaker
fn eligible_node(tx: &Transaction, dfn: &ResourceDefinition) -> Result<Option<NodeName>, ApiError> {
    Ok(tx
        .nodes()?
        .nodes
        .values()
        .filter(|n| n.node_type.is_satellite())
        .filter(|n| !n.flags.is_any_set(&[NodeFlag::Delete, NodeFlag::Evicted, NodeFlag::Evacuate]))
        .find(|n| !dfn.resources.contains_key(&n.name))
        .map(|n| n.name.clone()))
}

/// Adds or removes the tie-breaker of `rsc_name` as its layout requires
pub fn maintain(tx: &mut Transaction, rsc_name: &ResourceName) -> Result<ApiCallRc, ApiError> {
    let mut rc = ApiCallRc::new();
    let (needed, existing, candidate) = {
        let Some(dfn) = tx.rsc_dfns()?.get(rsc_name) else {
            return Ok(rc);
        };
        if dfn.is_deleting() {
            return Ok(rc);
        }
        let needed = is_needed(tx, dfn)?;
        let existing = dfn.tie_breaker().map(|r| r.node_name.clone());
        let candidate = if needed && existing.is_none() {
            eligible_node(tx, dfn)?
        } else {
            None
        };
        (needed, existing, candidate)
    };

    match (needed, existing) {
        (true, None) => match candidate {
            Some(node_name) => {
                let dfn = dfn_mut(tx, rsc_name)?;
                let mut rsc = Resource::new(
                    node_name.clone(),
                    rsc_name.clone(),
                    StateFlags::with(&[ResourceFlag::Diskless, ResourceFlag::TieBreaker]),
                );
                for number in dfn.volume_dfns.values().filter(|v| !v.is_deleting()).map(|v| v.number) {
                    rsc.volumes
                        .insert(number, Volume::new(node_name.clone(), rsc_name.clone(), number, None));
                }
                dfn.resources.insert(node_name.clone(), rsc);
                debug!(rsc = %rsc_name, node = %node_name, "tie-breaker created");
                rc.push(
                    RcEntry::new(
                        ReturnCode::INFO_TIE_BREAKER_CREATED,
                        format!("Tie-breaker resource '{}' created on node '{}'", rsc_name, node_name),
                    )
                    .with_obj_ref("node", node_name.as_str())
                    .with_obj_ref("rsc_dfn", rsc_name.as_str()),
                );
            }
            None => rc.push(
                RcEntry::new(
                    ReturnCode::WARN_NOT_ENOUGH_NODES_FOR_TIE_BREAKER,
                    format!("Could not find a node for the tie-breaker of resource '{}'", rsc_name),
                )
                .with_details("Every satellite already holds a resource of this resource definition")
                .with_obj_ref("rsc_dfn", rsc_name.as_str()),
            ),
        },
        (false, Some(node_name)) => {
            let dfn = dfn_mut(tx, rsc_name)?;
            if let Some(rsc) = dfn.resources.get_mut(&node_name) {
                rsc.flags.enable(ResourceFlag::Delete)?;
                for vlm in rsc.volumes.values_mut() {
                    vlm.flags.enable(VolumeFlag::Delete)?;
                }
            }
            debug!(rsc = %rsc_name, node = %node_name, "tie-breaker no longer needed");
            rc.push(
                RcEntry::new(
                    ReturnCode::INFO_TIE_BREAKER_DELETING,
                    format!("Tie-breaker resource '{}' on node '{}' is being deleted", rsc_name, node_name),
                )
                .with_obj_ref("node", node_name.as_str())
                .with_obj_ref("rsc_dfn", rsc_name.as_str()),
            );
        }
        _ => {}
    }
    Ok(rc)
}

fn dfn_mut<'a>(tx: &'a mut Transaction, rsc_name: &ResourceName) -> Result<&'a mut ResourceDefinition, ApiError> {
    tx.rsc_dfns_mut()?
        .get_mut(rsc_name)
        .ok_or_else(|| ApiError::implementation(format!("resource definition '{}' vanished", rsc_name)))
}
