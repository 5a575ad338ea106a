// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Snapshot Restore Handler
//!
//! Restores a successful snapshot into another resource definition, or rolls
//! the resources of its own definition back to it.
//!
//! A restore creates one resource per snapshot node, or per requested node,
//! in a target definition without resources. Until the satellites deployed
//! them, the new resources name their source snapshot in their properties,
//! which makes the satellites fill the volumes from it. Volume definitions
//! are copied from the snapshot when the target has none.
//!
//! A rollback needs every satellite of the definition online and no
//! resource in use. The target snapshot is recorded on the diskful
//! resources for one propagation and removed afterwards.
//!
//! Both operations resume from these properties when a satellite reconnects,
//! and the snapshot cannot be deleted while either is pending.

use crate::application::connection_notifier::ConnectionListener;
use crate::application::context::{flow, ControllerContext};
use crate::application::resources::resource_locks;
use crate::application::responses::{ApiResponse, ResponseContext};
use crate::application::satellite_updates::{DeploymentMessages, UpdateTarget};
use crate::application::scope_runner::{sequence, RcStream};
use crate::application::tie_breaker;
use crate::domain::access::{AccessType, Principal};
use crate::domain::api_rc::{ApiCallRc, RcEntry, ReturnCode};
use crate::domain::errors::ApiError;
use crate::domain::flags::StateFlags;
use crate::domain::names::{NodeName, ResourceName, SnapshotName, StorPoolName};
use crate::domain::number_pool::PoolKind;
use crate::domain::props::keys;
use crate::domain::resource::{Resource, Volume};
use crate::domain::resource_definition::VolumeDefinition;
use crate::domain::snapshot::{SnapshotDefinition, SnapshotDefinitionFlag, SnapshotVolumeDefinition};
use crate::domain::storage_pool::DEFAULT_STOR_POOL;
use crate::infrastructure::object_store::Transaction;
use crate::infrastructure::satellite::SatelliteRegistry;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreSpec {
    pub from_rsc: ResourceName,
    pub snapshot: SnapshotName,
    pub to_rsc: ResourceName,
    /// Every node holding the snapshot when empty
    #[serde(default)]
    pub nodes: Vec<NodeName>,
}

pub struct SnapshotRestoreHandler {
    ctx: Arc<ControllerContext>,
}

impl SnapshotRestoreHandler {
    pub fn new(ctx: Arc<ControllerContext>) -> Arc<Self> {
        Arc::new(Self { ctx })
    }

    pub fn restore(&self, principal: &Principal, spec: RestoreSpec) -> ApiResponse {
        let response = ResponseContext::new(
            "restoring",
            format!(
                "snapshot '{}' of '{}' into '{}'",
                spec.snapshot, spec.from_rsc, spec.to_rsc
            ),
        )
        .with_ref("rsc_dfn", spec.to_rsc.as_str())
        .with_ref("snapshot", spec.snapshot.as_str());
        let stream = flow(
            principal
                .require(AccessType::Change, ReturnCode::FAIL_ACC_DENIED_RSC, "restore snapshot")
                .map(|()| {
                    let to_rsc = spec.to_rsc.clone();
                    let create = self.ctx.step(
                        format!("restore snapshot '{}' of '{}' into '{}'", spec.snapshot, spec.from_rsc, to_rsc),
                        resource_locks(),
                        move |tx| restore_snapshot(tx, &spec),
                    );
                    sequence(vec![create, self.restore_flow(to_rsc)])
                }),
        );
        self.ctx.respond(stream, response)
    }

    pub fn rollback(&self, principal: &Principal, rsc_name: ResourceName, name: SnapshotName) -> ApiResponse {
        let response = ResponseContext::new(
            "rolling back",
            format!("resource '{}' to snapshot '{}'", rsc_name, name),
        )
        .with_ref("rsc_dfn", rsc_name.as_str())
        .with_ref("snapshot", name.as_str());
        let stream = flow(
            principal
                .require(AccessType::Change, ReturnCode::FAIL_ACC_DENIED_RSC, "roll back resource")
                .map(|()| {
                    let registry = Arc::clone(&self.ctx.registry);
                    let rsc = rsc_name.clone();
                    let start = self.ctx.step(
                        format!("start rollback of '{}' to '{}'", rsc_name, name),
                        resource_locks(),
                        move |tx| start_rollback(tx, &registry, &rsc, &name),
                    );
                    sequence(vec![start, self.rollback_flow(rsc_name)])
                }),
        );
        self.ctx.respond(stream, response)
    }

    /// Deploys the restored resources, then forgets where they came from
    fn restore_flow(&self, rsc_name: ResourceName) -> RcStream {
        self.pending_flow(rsc_name, "restore", finish_restore)
    }

    /// Lets the satellites roll back, then clears the rollback target
    fn rollback_flow(&self, rsc_name: ResourceName) -> RcStream {
        self.pending_flow(rsc_name, "rollback", finish_rollback)
    }

    fn pending_flow(
        &self,
        rsc_name: ResourceName,
        what: &'static str,
        finish: fn(&mut Transaction, &ResourceName) -> Result<ApiCallRc, ApiError>,
    ) -> RcStream {
        let target = UpdateTarget::ResourceDefinition(rsc_name.clone());
        let propagate = self.ctx.propagate(
            format!("propagate {} of '{}'", what, rsc_name),
            target.clone(),
            DeploymentMessages::new(format!("resource '{}'", rsc_name)),
        );
        let rsc = rsc_name.clone();
        let complete = self.ctx.step(
            format!("finish {} of '{}'", what, rsc_name),
            resource_locks(),
            move |tx| finish(tx, &rsc),
        );
        let announce = self.ctx.notify(
            format!("announce {} of '{}'", what, rsc_name),
            target,
            DeploymentMessages::new(format!("resource '{}'", rsc_name)),
        );
        sequence(vec![propagate, complete, announce])
    }
}

impl ConnectionListener for SnapshotRestoreHandler {
    fn name(&self) -> &'static str {
        "snapshot_restore"
    }

    fn resource_definition_connected(&self, tx: &Transaction, rsc_name: &ResourceName) -> Result<Vec<RcStream>, ApiError> {
        let Some(dfn) = tx.rsc_dfns()?.get(rsc_name) else {
            return Ok(Vec::new());
        };
        let pending = |key: &str| dfn.resources.values().any(|r| r.props.get(key).is_some());
        let mut flows = Vec::new();
        if pending(keys::RESTORE_FROM_SNAPSHOT) {
            flows.push(self.restore_flow(rsc_name.clone()));
        }
        if pending(keys::ROLLBACK_TARGET) {
            flows.push(self.rollback_flow(rsc_name.clone()));
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

/// The snapshot, provided it is complete and not being shipped
fn usable_snapshot<'a>(
    tx: &'a Transaction,
    rsc_name: &ResourceName,
    name: &SnapshotName,
) -> Result<&'a SnapshotDefinition, ApiError> {
    let snap_dfn = tx
        .rsc_dfns()?
        .get(rsc_name)
        .ok_or_else(|| not_found_rsc_dfn(rsc_name))?
        .snapshot_dfns
        .get(name)
        .ok_or_else(|| {
            ApiError::rc(
                ReturnCode::FAIL_NOT_FOUND_SNAPSHOT_DFN,
                format!("Snapshot '{}' of resource '{}' not found", name, rsc_name),
            )
        })?;
    if snap_dfn.is_deleting() {
        return Err(ApiError::rc(
            ReturnCode::WARN_DELETE_IN_PROGRESS,
            format!("Snapshot '{}' of resource '{}' is being deleted", name, rsc_name),
        ));
    }
    if snap_dfn.is_shipping() {
        return Err(ApiError::entry(
            RcEntry::new(
                ReturnCode::FAIL_EXISTS_SNAPSHOT_SHIPPING,
                format!("Snapshot '{}' of resource '{}' is being shipped", name, rsc_name),
            )
            .with_correction("Wait for the shipment to finish"),
        ));
    }
    if snap_dfn.flags.is_unset(SnapshotDefinitionFlag::Successful) {
        return Err(ApiError::rc(
            ReturnCode::FAIL_SNAPSHOT_INCOMPLETE,
            format!("Snapshot '{}' of resource '{}' has not completed", name, rsc_name),
        ));
    }
    Ok(snap_dfn)
}

/// Resources that still restore from or roll back to the given snapshot
pub(crate) fn snapshot_users(
    tx: &Transaction,
    rsc_name: &ResourceName,
    name: &SnapshotName,
) -> Result<Vec<String>, ApiError> {
    let mut users = Vec::new();
    for dfn in tx.rsc_dfns()?.values() {
        for rsc in dfn.resources.values() {
            let restoring = rsc.props.get(keys::RESTORE_FROM_RESOURCE) == Some(rsc_name.as_str())
                && rsc.props.get(keys::RESTORE_FROM_SNAPSHOT) == Some(name.as_str());
            let rolling_back = dfn.name == *rsc_name && rsc.props.get(keys::ROLLBACK_TARGET) == Some(name.as_str());
            if restoring || rolling_back {
                users.push(rsc.key());
            }
        }
    }
    Ok(users)
}

/// What a restore needs from the source snapshot
struct RestoreSource {
    volumes: Vec<SnapshotVolumeDefinition>,
    pools: BTreeMap<NodeName, StorPoolName>,
}

fn restore_source(tx: &Transaction, spec: &RestoreSpec) -> Result<RestoreSource, ApiError> {
    let snap_dfn = usable_snapshot(tx, &spec.from_rsc, &spec.snapshot)?;
    let available: Vec<&NodeName> = snap_dfn
        .snapshots
        .values()
        .filter(|s| !s.is_deleting())
        .map(|s| &s.node_name)
        .collect();
    let nodes: Vec<NodeName> = if spec.nodes.is_empty() {
        available.into_iter().cloned().collect()
    } else {
        if let Some(missing) = spec.nodes.iter().find(|n| !available.contains(n)) {
            return Err(ApiError::entry(
                RcEntry::new(
                    ReturnCode::FAIL_NOT_FOUND_SNAPSHOT_DFN,
                    format!("Snapshot '{}' of '{}' is not present on node '{}'", spec.snapshot, spec.from_rsc, missing),
                )
                .with_correction("Restore only to nodes holding the snapshot"),
            ));
        }
        spec.nodes.clone()
    };

    let source = tx.rsc_dfns()?.get(&spec.from_rsc);
    let nodes_map = tx.nodes()?;
    let mut pools = BTreeMap::new();
    for node_name in nodes {
        let pool_name = source
            .and_then(|dfn| dfn.resources.get(&node_name))
            .and_then(|r| r.props.get(keys::STOR_POOL_NAME))
            .unwrap_or(DEFAULT_STOR_POOL);
        let pool = StorPoolName::new(pool_name)?;
        let node = nodes_map
            .nodes
            .get(&node_name)
            .filter(|n| !n.is_deleting())
            .ok_or_else(|| {
                ApiError::rc(
                    ReturnCode::FAIL_NOT_FOUND_NODE,
                    format!("Node '{}' not found", node_name),
                )
            })?;
        if !node.stor_pools.contains_key(&pool) {
            return Err(ApiError::rc(
                ReturnCode::FAIL_NOT_FOUND_STOR_POOL,
                format!("Storage pool '{}' not found on node '{}'", pool, node_name),
            ));
        }
        pools.insert(node_name, pool);
    }
    Ok(RestoreSource {
        volumes: snap_dfn.volumes.clone(),
        pools,
    })
}

fn restore_snapshot(tx: &mut Transaction, spec: &RestoreSpec) -> Result<ApiCallRc, ApiError> {
    let source = restore_source(tx, spec)?;
    let needs_volumes = {
        let target = tx
            .rsc_dfns()?
            .get(&spec.to_rsc)
            .ok_or_else(|| not_found_rsc_dfn(&spec.to_rsc))?;
        if target.is_deleting() {
            return Err(ApiError::rc(
                ReturnCode::WARN_DELETE_IN_PROGRESS,
                format!("Resource definition '{}' is being deleted", spec.to_rsc),
            ));
        }
        if !target.resources.is_empty() {
            return Err(ApiError::entry(
                RcEntry::new(
                    ReturnCode::FAIL_EXISTS_RSC,
                    format!("Resource definition '{}' already has resources", spec.to_rsc),
                )
                .with_correction("Restore into a resource definition without resources"),
            ));
        }
        target.volume_dfns.values().all(|v| v.is_deleting())
    };

    let mut rc = ApiCallRc::new();
    if needs_volumes {
        for vlm in &source.volumes {
            let minor = tx.allocate(PoolKind::MinorNumber)?;
            tx.rsc_dfns_mut()?
                .get_mut(&spec.to_rsc)
                .ok_or_else(|| not_found_rsc_dfn(&spec.to_rsc))?
                .volume_dfns
                .insert(vlm.number, VolumeDefinition::new(spec.to_rsc.clone(), vlm.number, vlm.size_kib, minor));
            rc.push(RcEntry::new(
                ReturnCode::CREATED,
                format!("Volume {} of '{}' restored with {} KiB", vlm.number, spec.to_rsc, vlm.size_kib),
            ));
        }
    }

    let target = tx
        .rsc_dfns_mut()?
        .get_mut(&spec.to_rsc)
        .ok_or_else(|| not_found_rsc_dfn(&spec.to_rsc))?;
    let numbers: Vec<_> = target
        .volume_dfns
        .values()
        .filter(|v| !v.is_deleting())
        .map(|v| v.number)
        .collect();
    for (node_name, pool) in &source.pools {
        let mut rsc = Resource::new(node_name.clone(), spec.to_rsc.clone(), StateFlags::empty());
        rsc.props.set(keys::STOR_POOL_NAME, pool.as_str())?;
        rsc.props.set(keys::RESTORE_FROM_RESOURCE, spec.from_rsc.as_str())?;
        rsc.props.set(keys::RESTORE_FROM_SNAPSHOT, spec.snapshot.as_str())?;
        for number in &numbers {
            rsc.volumes.insert(
                *number,
                Volume::new(node_name.clone(), spec.to_rsc.clone(), *number, Some(pool.clone())),
            );
        }
        target.resources.insert(node_name.clone(), rsc);
        rc.push(
            RcEntry::new(
                ReturnCode::CREATED,
                format!("Resource '{}' on node '{}' restored from snapshot '{}'", spec.to_rsc, node_name, spec.snapshot),
            )
            .with_obj_ref("node", node_name.as_str()),
        );
    }
    rc.extend(tie_breaker::maintain(tx, &spec.to_rsc)?);
    info!(
        from = %spec.from_rsc,
        snapshot = %spec.snapshot,
        to = %spec.to_rsc,
        nodes = source.pools.len(),
        "snapshot restore started"
    );
    Ok(rc)
}

/// Removes `key` from every resource of `rsc_name`; returns how many had it
fn clear_resource_prop(tx: &mut Transaction, rsc_name: &ResourceName, key: &str) -> Result<usize, ApiError> {
    let Some(dfn) = tx.rsc_dfns_mut()?.get_mut(rsc_name) else {
        return Ok(0);
    };
    let mut cleared = 0;
    for rsc in dfn.resources.values_mut() {
        if rsc.props.remove(key)?.is_some() {
            cleared += 1;
        }
    }
    Ok(cleared)
}

fn finish_restore(tx: &mut Transaction, rsc_name: &ResourceName) -> Result<ApiCallRc, ApiError> {
    clear_resource_prop(tx, rsc_name, keys::RESTORE_FROM_RESOURCE)?;
    if clear_resource_prop(tx, rsc_name, keys::RESTORE_FROM_SNAPSHOT)? == 0 {
        return Ok(ApiCallRc::new());
    }
    info!(rsc = %rsc_name, "snapshot restore finished");
    Ok(ApiCallRc::single(RcEntry::new(
        ReturnCode::MODIFIED,
        format!("Resource '{}' restored", rsc_name),
    )))
}

fn start_rollback(
    tx: &mut Transaction,
    registry: &SatelliteRegistry,
    rsc_name: &ResourceName,
    name: &SnapshotName,
) -> Result<ApiCallRc, ApiError> {
    let participants = {
        let snap_dfn = usable_snapshot(tx, rsc_name, name)?;
        let dfn = tx.rsc_dfns()?.get(rsc_name).ok_or_else(|| not_found_rsc_dfn(rsc_name))?;
        let mut participants = Vec::new();
        for rsc in dfn.resources.values() {
            let node_name = &rsc.node_name;
            if !registry.is_online(node_name) {
                return Err(ApiError::entry(
                    RcEntry::new(
                        ReturnCode::FAIL_NOT_CONNECTED,
                        format!("Node '{}' of resource '{}' is not connected", node_name, rsc_name),
                    )
                    .with_correction("A rollback needs every satellite of the resource online"),
                ));
            }
            if registry.resource_state(node_name, rsc_name).and_then(|s| s.in_use) == Some(true) {
                return Err(ApiError::entry(
                    RcEntry::new(
                        ReturnCode::FAIL_IN_USE,
                        format!("Resource '{}' on node '{}' is in use", rsc_name, node_name),
                    )
                    .with_correction("Stop using the resource before rolling it back"),
                ));
            }
            if rsc.is_deleting()
                || rsc.is_toggling_disk()
                || rsc.is_changing_activation()
                || rsc.props.get(keys::ROLLBACK_TARGET).is_some()
            {
                return Err(ApiError::rc(
                    ReturnCode::FAIL_RSC_BUSY,
                    format!("Resource '{}' on node '{}' is busy", rsc_name, node_name),
                ));
            }
            if !rsc.is_active_diskful() {
                continue;
            }
            if !snap_dfn.snapshots.values().any(|s| s.node_name == *node_name && !s.is_deleting()) {
                return Err(ApiError::entry(
                    RcEntry::new(
                        ReturnCode::FAIL_NOT_FOUND_SNAPSHOT_DFN,
                        format!("Snapshot '{}' of '{}' is missing on node '{}'", name, rsc_name, node_name),
                    )
                    .with_correction("Every diskful resource needs the snapshot for a rollback"),
                ));
            }
            participants.push(node_name.clone());
        }
        participants
    };
    if participants.is_empty() {
        return Err(ApiError::rc(
            ReturnCode::FAIL_NOT_ENOUGH_NODES,
            format!("Resource '{}' has no diskful replica to roll back", rsc_name),
        ));
    }

    let dfn = tx.rsc_dfns_mut()?.get_mut(rsc_name).ok_or_else(|| not_found_rsc_dfn(rsc_name))?;
    for node_name in &participants {
        if let Some(rsc) = dfn.resources.get_mut(node_name) {
            rsc.props.set(keys::ROLLBACK_TARGET, name.as_str())?;
        }
    }
    info!(rsc = %rsc_name, snapshot = %name, nodes = participants.len(), "rollback started");
    Ok(ApiCallRc::single(
        RcEntry::new(
            ReturnCode::MODIFIED,
            format!("Rolling back resource '{}' to snapshot '{}'", rsc_name, name),
        )
        .with_details(format!(
            "Nodes: {}",
            participants.iter().map(NodeName::as_str).collect::<Vec<_>>().join(", ")
        ))
        .with_obj_ref("rsc_dfn", rsc_name.as_str())
        .with_obj_ref("snapshot", name.as_str()),
    ))
}

fn finish_rollback(tx: &mut Transaction, rsc_name: &ResourceName) -> Result<ApiCallRc, ApiError> {
    if clear_resource_prop(tx, rsc_name, keys::ROLLBACK_TARGET)? == 0 {
        return Ok(ApiCallRc::new());
    }
    info!(rsc = %rsc_name, "rollback finished");
    Ok(ApiCallRc::single(RcEntry::new(
        ReturnCode::MODIFIED,
        format!("Resource '{}' rolled back", rsc_name),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::lock_domain::{LockMode, LockObj};
    use crate::domain::names::{ResourceGroupName, VolumeNumber};
    use crate::domain::node::{Node, NodeType};
    use crate::domain::resource::ResourceFlag;
    use crate::domain::resource_definition::{ResourceDefinition, DEFAULT_RESOURCE_GROUP};
    use crate::domain::resource_group::ResourceGroup;
    use crate::domain::satellite::ResourceState;
    use crate::domain::snapshot::Snapshot;
    use crate::domain::storage_pool::{DeviceProviderKind, StorPool};
    use crate::infrastructure::event_bus::EventBus;
    use crate::infrastructure::number_pools::NumberPools;
    use crate::infrastructure::object_store::ObjectStore;
    use crate::infrastructure::repositories::InMemoryPersistence;

    fn name(n: &str) -> ResourceName {
        ResourceName::new(n).unwrap()
    }

    fn node(n: &str) -> NodeName {
        NodeName::new(n).unwrap()
    }

    fn snap() -> SnapshotName {
        SnapshotName::new("s1").unwrap()
    }

    /// `src` is diskful on a and b with a successful snapshot `s1`; `dst` is empty
    fn transaction() -> (Arc<ObjectStore>, Transaction) {
        let store = ObjectStore::new(
            Arc::new(InMemoryPersistence::new()),
            Arc::new(NumberPools::default()),
            EventBus::new(16),
        );
        let mut tx = store.begin(true);
        for obj in LockObj::ALL {
            tx.attach(obj, LockMode::Write);
        }
        for n in ["a", "b", "c"] {
            let mut entry = Node::new(node(n), NodeType::Satellite);
            let pool = StorPoolName::new(DEFAULT_STOR_POOL).unwrap();
            entry
                .stor_pools
                .insert(pool.clone(), StorPool::new(node(n), pool, DeviceProviderKind::LvmThin));
            tx.nodes_mut().unwrap().nodes.insert(node(n), entry);
        }
        let grp = ResourceGroupName::new(DEFAULT_RESOURCE_GROUP).unwrap();
        tx.rsc_grps_mut().unwrap().insert(grp.clone(), ResourceGroup::new(grp.clone()));

        let vlm0 = VolumeNumber::new(0).unwrap();
        let mut src = ResourceDefinition::new(name("src"), grp.clone(), 7000);
        src.volume_dfns.insert(vlm0, VolumeDefinition::new(name("src"), vlm0, 4096, 1000));
        let mut snap_dfn = SnapshotDefinition::new(
            name("src"),
            snap(),
            StateFlags::with(&[SnapshotDefinitionFlag::Successful]),
            vec![SnapshotVolumeDefinition {
                number: vlm0,
                size_kib: 4096,
            }],
        );
        for n in ["a", "b"] {
            let mut rsc = Resource::new(node(n), name("src"), StateFlags::empty());
            rsc.props.set(keys::STOR_POOL_NAME, DEFAULT_STOR_POOL).unwrap();
            src.resources.insert(node(n), rsc);
            snap_dfn
                .snapshots
                .insert(node(n), Snapshot::new(node(n), name("src"), snap(), StateFlags::empty()));
        }
        src.snapshot_dfns.insert(snap(), snap_dfn);
        tx.rsc_dfns_mut().unwrap().insert(name("src"), src);
        tx.rsc_dfns_mut()
            .unwrap()
            .insert(name("dst"), ResourceDefinition::new(name("dst"), grp, 7001));
        (store, tx)
    }

    fn restore_spec(nodes: &[&str]) -> RestoreSpec {
        RestoreSpec {
            from_rsc: name("src"),
            snapshot: snap(),
            to_rsc: name("dst"),
            nodes: nodes.iter().map(|n| node(n)).collect(),
        }
    }

    fn online(nodes: &[&str]) -> SatelliteRegistry {
        use crate::infrastructure::satellite::MockSatellite;
        let registry = SatelliteRegistry::new(EventBus::new(4));
        for n in nodes {
            registry.connect(Arc::new(MockSatellite::new(node(n))));
            registry.mark_online(&node(n));
        }
        registry
    }

    #[test]
    fn test_restore_copies_volumes_and_marks_resources() {
        let (store, mut tx) = transaction();
        let rc = restore_snapshot(&mut tx, &restore_spec(&[])).unwrap();
        assert!(rc.contains(ReturnCode::CREATED));

        let dst = &tx.rsc_dfns().unwrap()[&name("dst")];
        let vlm0 = VolumeNumber::new(0).unwrap();
        assert_eq!(dst.volume_dfns[&vlm0].size_kib, 4096);
        assert!(store.pools().is_allocated(PoolKind::MinorNumber, dst.volume_dfns[&vlm0].minor));
        assert_eq!(dst.resource_nodes(), vec![node("a"), node("b"), node("c")]);
        assert!(dst.resources[&node("c")].is_tie_breaker());
        assert!(rc.contains(ReturnCode::INFO_TIE_BREAKER_CREATED));
        let rsc = &dst.resources[&node("a")];
        assert_eq!(rsc.props.get(keys::RESTORE_FROM_SNAPSHOT), Some("s1"));
        assert_eq!(rsc.volumes.len(), 1);
        assert_eq!(snapshot_users(&tx, &name("src"), &snap()).unwrap().len(), 2);

        let err = restore_snapshot(&mut tx, &restore_spec(&[])).unwrap_err();
        assert_eq!(err.code(), ReturnCode::FAIL_EXISTS_RSC);

        finish_restore(&mut tx, &name("dst")).unwrap();
        assert!(snapshot_users(&tx, &name("src"), &snap()).unwrap().is_empty());
        assert!(finish_restore(&mut tx, &name("dst")).unwrap().is_empty());
    }

    #[test]
    fn test_restore_needs_complete_snapshot_on_requested_nodes() {
        let (_store, mut tx) = transaction();
        let err = restore_snapshot(&mut tx, &restore_spec(&["c"])).unwrap_err();
        assert_eq!(err.code(), ReturnCode::FAIL_NOT_FOUND_SNAPSHOT_DFN);

        tx.rsc_dfns_mut()
            .unwrap()
            .get_mut(&name("src"))
            .unwrap()
            .snapshot_dfns
            .get_mut(&snap())
            .unwrap()
            .flags
            .disable(SnapshotDefinitionFlag::Successful)
            .unwrap();
        let err = restore_snapshot(&mut tx, &restore_spec(&["a"])).unwrap_err();
        assert_eq!(err.code(), ReturnCode::FAIL_SNAPSHOT_INCOMPLETE);
        assert!(tx.rsc_dfns().unwrap()[&name("dst")].resources.is_empty());
    }

    #[test]
    fn test_rollback_needs_every_node_online() {
        let (_store, mut tx) = transaction();
        let err = start_rollback(&mut tx, &online(&["a"]), &name("src"), &snap()).unwrap_err();
        assert_eq!(err.code(), ReturnCode::FAIL_NOT_CONNECTED);

        let registry = online(&["a", "b"]);
        registry.report_resource(
            &node("b"),
            name("src"),
            ResourceState {
                in_use: Some(true),
                up_to_date: true,
            },
        );
        let err = start_rollback(&mut tx, &registry, &name("src"), &snap()).unwrap_err();
        assert_eq!(err.code(), ReturnCode::FAIL_IN_USE);
    }

    #[test]
    fn test_rollback_marks_diskful_resources_until_finished() {
        let (_store, mut tx) = transaction();
        tx.rsc_dfns_mut().unwrap().get_mut(&name("src")).unwrap().resources.insert(
            node("c"),
            Resource::new(node("c"), name("src"), StateFlags::with(&[ResourceFlag::Diskless])),
        );
        let registry = online(&["a", "b", "c"]);
        start_rollback(&mut tx, &registry, &name("src"), &snap()).unwrap();

        let src = &tx.rsc_dfns().unwrap()[&name("src")];
        assert_eq!(src.resources[&node("a")].props.get(keys::ROLLBACK_TARGET), Some("s1"));
        assert_eq!(src.resources[&node("c")].props.get(keys::ROLLBACK_TARGET), None);
        assert_eq!(snapshot_users(&tx, &name("src"), &snap()).unwrap().len(), 2);

        let err = start_rollback(&mut tx, &registry, &name("src"), &snap()).unwrap_err();
        assert_eq!(err.code(), ReturnCode::FAIL_RSC_BUSY);

        let rc = finish_rollback(&mut tx, &name("src")).unwrap();
        assert!(rc.contains(ReturnCode::MODIFIED));
        assert!(snapshot_users(&tx, &name("src"), &snap()).unwrap().is_empty());
    }
}
