// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Snapshot Handler
//!
//! A snapshot is taken on every diskful resource of the definition (or on
//! the requested nodes). The definition is marked `SUCCESSFUL` only after
//! every participating satellite acknowledged it.

use crate::application::connection_notifier::ConnectionListener;
use crate::application::context::{flow, ControllerContext};
use crate::application::resource_definitions::release_shipping_port;
use crate::application::responses::{ApiResponse, ResponseContext};
use crate::application::satellite_updates::{DeploymentMessages, UpdateTarget};
use crate::application::scope_runner::{sequence, RcStream};
use crate::application::snapshot_restore::snapshot_users;
use crate::domain::access::{AccessType, Principal};
use crate::domain::api_rc::{ApiCallRc, RcEntry, ReturnCode};
use crate::domain::errors::ApiError;
use crate::domain::flags::StateFlags;
use crate::domain::lock_domain::{LockObj, LockRequest};
use crate::domain::names::{NodeName, ResourceName, SnapshotName};
use crate::domain::props::keys;
use crate::domain::snapshot::{
    Snapshot, SnapshotDefinition, SnapshotDefinitionApi, SnapshotDefinitionFlag, SnapshotFlag, SnapshotVolumeDefinition,
};
use crate::infrastructure::object_store::Transaction;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

fn locks() -> LockRequest {
    LockRequest::new().write(&[LockObj::ResourceDefinitions])
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotSpec {
    pub rsc_name: ResourceName,
    pub name: SnapshotName,
    /// Every diskful resource takes part when empty
    #[serde(default)]
    pub nodes: Vec<NodeName>,
}

pub struct SnapshotHandler {
    ctx: Arc<ControllerContext>,
}

impl SnapshotHandler {
    pub fn new(ctx: Arc<ControllerContext>) -> Arc<Self> {
        Arc::new(Self { ctx })
    }

    pub fn create(&self, principal: &Principal, spec: SnapshotSpec) -> ApiResponse {
        let response = ResponseContext::new(
            "creating",
            format!("snapshot '{}' of resource '{}'", spec.name, spec.rsc_name),
        )
        .with_ref("rsc_dfn", spec.rsc_name.as_str())
        .with_ref("snapshot", spec.name.as_str());
        let stream = flow(
            principal
                .require(AccessType::Change, ReturnCode::FAIL_ACC_DENIED_SNAPSHOT_DFN, "create snapshot")
                .map(|()| {
                    let rsc_name = spec.rsc_name.clone();
                    let name = spec.name.clone();
                    let create = self.ctx.step(
                        format!("create snapshot '{}' of '{}'", name, rsc_name),
                        locks(),
                        move |tx| create_snapshot(tx, spec),
                    );
                    sequence(vec![create, self.completion_flow(rsc_name, name)])
                }),
        );
        self.ctx.respond(stream, response)
    }

    /// Deletes the snapshot on `nodes`, or everywhere when `nodes` is empty
    pub fn delete(
        &self,
        principal: &Principal,
        rsc_name: ResourceName,
        name: SnapshotName,
        nodes: Vec<NodeName>,
    ) -> ApiResponse {
        let response = ResponseContext::new("deleting", format!("snapshot '{}' of resource '{}'", name, rsc_name))
            .with_ref("rsc_dfn", rsc_name.as_str())
            .with_ref("snapshot", name.as_str());
        let stream = flow(
            principal
                .require(AccessType::Change, ReturnCode::FAIL_ACC_DENIED_SNAPSHOT_DFN, "delete snapshot")
                .map(|()| {
                    let rsc = rsc_name.clone();
                    let snap = name.clone();
                    let mark = self.ctx.step(
                        format!("mark snapshot '{}' of '{}' for deletion", name, rsc_name),
                        locks(),
                        move |tx| mark_snapshot_deleted(tx, &rsc, &snap, &nodes),
                    );
                    sequence(vec![mark, self.deletion_flow(rsc_name, name)])
                }),
        );
        self.ctx.respond(stream, response)
    }

    pub fn list(&self, principal: &Principal, rsc_filter: Option<&ResourceName>) -> Result<Vec<SnapshotDefinitionApi>, ApiError> {
        principal.require(AccessType::View, ReturnCode::FAIL_ACC_DENIED_SNAPSHOT_DFN, "list snapshots")?;
        Ok(self
            .ctx
            .store
            .snapshot()
            .rsc_dfns
            .values()
            .filter(|dfn| rsc_filter.map_or(true, |r| &dfn.name == r))
            .flat_map(|dfn| dfn.snapshot_dfns.values())
            .map(SnapshotDefinition::api_view)
            .collect())
    }

    fn deploy(&self, rsc_name: &ResourceName, name: &SnapshotName) -> RcStream {
        let target = UpdateTarget::SnapshotDefinition {
            rsc_name: rsc_name.clone(),
            snapshot_name: name.clone(),
        };
        self.ctx.propagate(
            format!("deploy {}", target),
            target.clone(),
            DeploymentMessages::new(target.to_string()),
        )
    }

    /// Takes the snapshot on the satellites, then marks it successful
    pub(crate) fn completion_flow(&self, rsc_name: ResourceName, name: SnapshotName) -> RcStream {
        let rsc = rsc_name.clone();
        let snap = name.clone();
        let finish = self.ctx.step(
            format!("complete snapshot '{}' of '{}'", name, rsc_name),
            locks(),
            move |tx| complete_snapshot(tx, &rsc, &snap),
        );
        let target = UpdateTarget::SnapshotDefinition {
            rsc_name: rsc_name.clone(),
            snapshot_name: name.clone(),
        };
        let resume = self.ctx.notify(
            format!("resume IO after {}", target),
            target.clone(),
            DeploymentMessages::new(target.to_string()).success("Took {object} on '{node}'"),
        );
        sequence(vec![self.deploy(&rsc_name, &name), finish, resume])
    }

    fn deletion_flow(&self, rsc_name: ResourceName, name: SnapshotName) -> RcStream {
        let rsc = rsc_name.clone();
        let snap = name.clone();
        let remove = self.ctx.step(
            format!("remove deleted snapshots '{}' of '{}'", name, rsc_name),
            locks(),
            move |tx| remove_deleted_snapshots(tx, &rsc, &snap),
        );
        sequence(vec![self.deploy(&rsc_name, &name), remove])
    }
}

impl ConnectionListener for SnapshotHandler {
    fn name(&self) -> &'static str {
        "snapshots"
    }

    fn resource_definition_connected(&self, tx: &Transaction, rsc_name: &ResourceName) -> Result<Vec<RcStream>, ApiError> {
        let Some(dfn) = tx.rsc_dfns()?.get(rsc_name) else {
            return Ok(Vec::new());
        };
        let mut flows = Vec::new();
        for snap_dfn in dfn.snapshot_dfns.values() {
            let deleting = snap_dfn.is_deleting() || snap_dfn.snapshots.values().any(Snapshot::is_deleting);
            if deleting {
                flows.push(self.deletion_flow(rsc_name.clone(), snap_dfn.name.clone()));
            } else if snap_dfn
                .flags
                .is_unset(SnapshotDefinitionFlag::Successful)
                && snap_dfn.flags.is_unset(SnapshotDefinitionFlag::Failed)
            {
                flows.push(self.completion_flow(rsc_name.clone(), snap_dfn.name.clone()));
            }
        }
        Ok(flows)
    }
}

// ============================================================================
// Steps
// ============================================================================

fn not_found(rsc_name: &ResourceName, name: &SnapshotName) -> ApiError {
    ApiError::entry(
        RcEntry::new(
            ReturnCode::FAIL_NOT_FOUND_SNAPSHOT_DFN,
            format!("Snapshot '{}' of resource '{}' not found", name, rsc_name),
        )
        .with_obj_ref("rsc_dfn", rsc_name.as_str())
        .with_obj_ref("snapshot", name.as_str()),
    )
}

/// Builds a snapshot definition over the current volume definitions of `rsc_name`
pub(crate) fn new_snapshot_definition(
    tx: &Transaction,
    rsc_name: &ResourceName,
    name: &SnapshotName,
    flags: StateFlags<SnapshotDefinitionFlag>,
) -> Result<SnapshotDefinition, ApiError> {
    let dfn = tx.rsc_dfns()?.get(rsc_name).ok_or_else(|| {
        ApiError::rc(
            ReturnCode::FAIL_NOT_FOUND_RSC_DFN,
            format!("Resource definition '{}' not found", rsc_name),
        )
    })?;
    if dfn.is_deleting() {
        return Err(ApiError::rc(
            ReturnCode::WARN_DELETE_IN_PROGRESS,
            format!("Resource definition '{}' is being deleted", rsc_name),
        ));
    }
    if dfn.snapshot_dfns.contains_key(name) {
        return Err(ApiError::rc(
            ReturnCode::FAIL_EXISTS_SNAPSHOT_DFN,
            format!("Snapshot '{}' of resource '{}' already exists", name, rsc_name),
        ));
    }
    let volumes = dfn
        .volume_dfns
        .values()
        .filter(|v| !v.is_deleting())
        .map(|v| SnapshotVolumeDefinition {
            number: v.number,
            size_kib: v.size_kib,
        })
        .collect();
    Ok(SnapshotDefinition::new(rsc_name.clone(), name.clone(), flags, volumes))
}

fn create_snapshot(tx: &mut Transaction, spec: SnapshotSpec) -> Result<ApiCallRc, ApiError> {
    let mut snap_dfn = new_snapshot_definition(tx, &spec.rsc_name, &spec.name, StateFlags::empty())?;
    let participants: Vec<NodeName> = {
        let dfn = tx.rsc_dfns()?.get(&spec.rsc_name).ok_or_else(|| not_found(&spec.rsc_name, &spec.name))?;
        let diskful: Vec<NodeName> = dfn
            .resources
            .values()
            .filter(|r| r.is_active_diskful())
            .map(|r| r.node_name.clone())
            .collect();
        if let Some(missing) = spec.nodes.iter().find(|n| !diskful.contains(n)) {
            return Err(ApiError::rc(
                ReturnCode::FAIL_NOT_FOUND_RSC,
                format!("No diskful resource '{}' on node '{}'", spec.rsc_name, missing),
            ));
        }
        if spec.nodes.is_empty() {
            diskful
        } else {
            spec.nodes.clone()
        }
    };
    if participants.is_empty() {
        return Err(ApiError::entry(
            RcEntry::new(
                ReturnCode::FAIL_NOT_ENOUGH_NODES,
                format!("Resource '{}' has no diskful replica to snapshot", spec.rsc_name),
            )
            .with_correction("Snapshots need at least one diskful resource"),
        ));
    }
    for node_name in &participants {
        snap_dfn.snapshots.insert(
            node_name.clone(),
            Snapshot::new(node_name.clone(), spec.rsc_name.clone(), spec.name.clone(), StateFlags::empty()),
        );
    }
    tx.rsc_dfns_mut()?
        .get_mut(&spec.rsc_name)
        .ok_or_else(|| not_found(&spec.rsc_name, &spec.name))?
        .snapshot_dfns
        .insert(spec.name.clone(), snap_dfn);
    info!(rsc = %spec.rsc_name, snapshot = %spec.name, nodes = participants.len(), "snapshot created");
    Ok(ApiCallRc::single(
        RcEntry::new(
            ReturnCode::CREATED,
            format!("New snapshot '{}' of resource '{}' created", spec.name, spec.rsc_name),
        )
        .with_details(format!(
            "Nodes: {}",
            participants.iter().map(NodeName::as_str).collect::<Vec<_>>().join(", ")
        ))
        .with_obj_ref("rsc_dfn", spec.rsc_name.as_str())
        .with_obj_ref("snapshot", spec.name.as_str()),
    ))
}

fn complete_snapshot(tx: &mut Transaction, rsc_name: &ResourceName, name: &SnapshotName) -> Result<ApiCallRc, ApiError> {
    let Some(snap_dfn) = tx
        .rsc_dfns_mut()?
        .get_mut(rsc_name)
        .and_then(|dfn| dfn.snapshot_dfns.get_mut(name))
    else {
        return Ok(ApiCallRc::new());
    };
    if snap_dfn.is_deleting() || snap_dfn.flags.is_any_set(&[SnapshotDefinitionFlag::Successful, SnapshotDefinitionFlag::Failed]) {
        return Ok(ApiCallRc::new());
    }
    snap_dfn.flags.enable(SnapshotDefinitionFlag::Successful)?;
    Ok(ApiCallRc::single(RcEntry::new(
        ReturnCode::MODIFIED,
        format!("Snapshot '{}' of resource '{}' is complete", name, rsc_name),
    )))
}

fn mark_snapshot_deleted(
    tx: &mut Transaction,
    rsc_name: &ResourceName,
    name: &SnapshotName,
    nodes: &[NodeName],
) -> Result<ApiCallRc, ApiError> {
    let users = snapshot_users(tx, rsc_name, name)?;
    if !users.is_empty() {
        return Err(ApiError::entry(
            RcEntry::new(
                ReturnCode::FAIL_IN_USE,
                format!("Snapshot '{}' of resource '{}' is still being restored", name, rsc_name),
            )
            .with_details(format!("Pending resources: {}", users.join(", ")))
            .with_correction("Wait until the restore or rollback has been deployed"),
        ));
    }
    let snap_dfn = tx
        .rsc_dfns_mut()?
        .get_mut(rsc_name)
        .and_then(|dfn| dfn.snapshot_dfns.get_mut(name))
        .ok_or_else(|| not_found(rsc_name, name))?;
    if snap_dfn.is_shipping() {
        return Err(ApiError::entry(
            RcEntry::new(
                ReturnCode::FAIL_IN_USE,
                format!("Snapshot '{}' of resource '{}' is being shipped", name, rsc_name),
            )
            .with_correction("Abort the shipment first"),
        ));
    }
    if let Some(missing) = nodes.iter().find(|n| !snap_dfn.snapshots.contains_key(n)) {
        return Err(ApiError::rc(
            ReturnCode::WARN_NOT_FOUND,
            format!("Snapshot '{}' of resource '{}' not found on node '{}'", name, rsc_name, missing),
        ));
    }
    for snap in snap_dfn
        .snapshots
        .values_mut()
        .filter(|s| nodes.is_empty() || nodes.contains(&s.node_name))
    {
        snap.flags.enable(SnapshotFlag::Delete)?;
    }
    if nodes.is_empty() || snap_dfn.snapshots.values().all(Snapshot::is_deleting) {
        snap_dfn.flags.enable(SnapshotDefinitionFlag::Delete)?;
    }
    Ok(ApiCallRc::single(
        RcEntry::new(
            ReturnCode::MODIFIED,
            format!("Snapshot '{}' of resource '{}' marked for deletion", name, rsc_name),
        )
        .with_obj_ref("snapshot", name.as_str()),
    ))
}

/// Clears the shipment state and returns the shipping port
pub(crate) fn end_shipment(tx: &mut Transaction, rsc_name: &ResourceName, name: &SnapshotName, shipped: bool) -> Result<bool, ApiError> {
    let props = {
        let Some(snap_dfn) = tx
            .rsc_dfns_mut()?
            .get_mut(rsc_name)
            .and_then(|dfn| dfn.snapshot_dfns.get_mut(name))
        else {
            return Ok(false);
        };
        if !snap_dfn.is_shipping() {
            return Ok(false);
        }
        let aborted = snap_dfn.flags.is_set(SnapshotDefinitionFlag::ShippingAbort);
        snap_dfn
            .flags
            .disable_all(&[SnapshotDefinitionFlag::ShippingAbort, SnapshotDefinitionFlag::Shipping])?;
        if shipped && !aborted {
            snap_dfn.flags.enable(SnapshotDefinitionFlag::Shipped)?;
        }
        let props = snap_dfn.props.clone();
        snap_dfn.props.remove(keys::SHIPPING_PORT)?;
        props
    };
    release_shipping_port(tx, &props);
    Ok(true)
}

/// Drops flagged snapshots, and the definition once it is deleting or empty
pub(crate) fn remove_deleted_snapshots(
    tx: &mut Transaction,
    rsc_name: &ResourceName,
    name: &SnapshotName,
) -> Result<ApiCallRc, ApiError> {
    let mut rc = ApiCallRc::new();
    let removed_dfn = {
        let Some(dfn) = tx.rsc_dfns_mut()?.get_mut(rsc_name) else {
            return Ok(rc);
        };
        let Some(snap_dfn) = dfn.snapshot_dfns.get_mut(name) else {
            return Ok(rc);
        };
        let before = snap_dfn.snapshots.len();
        snap_dfn.snapshots.retain(|_, s| !s.is_deleting());
        if snap_dfn.snapshots.len() != before {
            rc.push(RcEntry::new(
                ReturnCode::DELETED,
                format!("Removed {} snapshot(s) '{}' of '{}'", before - snap_dfn.snapshots.len(), name, rsc_name),
            ));
        }
        if snap_dfn.is_deleting() || snap_dfn.snapshots.is_empty() {
            dfn.snapshot_dfns.remove(name)
        } else {
            None
        }
    };
    if let Some(snap_dfn) = removed_dfn {
        release_shipping_port(tx, &snap_dfn.props);
        info!(rsc = %rsc_name, snapshot = %name, "snapshot definition removed");
        rc.push(
            RcEntry::new(
                ReturnCode::DELETED,
                format!("Snapshot '{}' of resource '{}' deleted", name, rsc_name),
            )
            .with_obj_ref("snapshot", name.as_str()),
        );
    }
    Ok(rc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::lock_domain::LockMode;
    use crate::domain::names::{ResourceGroupName, VolumeNumber};
    use crate::domain::resource::{Resource, ResourceFlag};
    use crate::domain::resource_definition::{ResourceDefinition, VolumeDefinition};
    use crate::infrastructure::event_bus::EventBus;
    use crate::infrastructure::number_pools::NumberPools;
    use crate::infrastructure::object_store::ObjectStore;
    use crate::infrastructure::repositories::InMemoryPersistence;

    fn r1() -> ResourceName {
        ResourceName::new("r1").unwrap()
    }

    fn snap() -> SnapshotName {
        SnapshotName::new("s1").unwrap()
    }

    fn node(n: &str) -> NodeName {
        NodeName::new(n).unwrap()
    }

    fn transaction(diskful: &[&str], diskless: &[&str]) -> (Arc<ObjectStore>, Transaction) {
        let store = ObjectStore::new(
            Arc::new(InMemoryPersistence::new()),
            Arc::new(NumberPools::default()),
            EventBus::new(16),
        );
        let mut tx = store.begin(true);
        tx.attach(LockObj::ResourceDefinitions, LockMode::Write);
        let mut dfn = ResourceDefinition::new(r1(), ResourceGroupName::new("DfltRscGrp").unwrap(), 7000);
        let vlm0 = VolumeNumber::new(0).unwrap();
        dfn.volume_dfns.insert(vlm0, VolumeDefinition::new(r1(), vlm0, 1024, 1000));
        for n in diskful {
            dfn.resources
                .insert(node(n), Resource::new(node(n), r1(), StateFlags::empty()));
        }
        for n in diskless {
            dfn.resources.insert(
                node(n),
                Resource::new(node(n), r1(), StateFlags::with(&[ResourceFlag::Diskless])),
            );
        }
        tx.rsc_dfns_mut().unwrap().insert(r1(), dfn);
        (store, tx)
    }

    fn spec(nodes: &[&str]) -> SnapshotSpec {
        SnapshotSpec {
            rsc_name: r1(),
            name: snap(),
            nodes: nodes.iter().map(|n| node(n)).collect(),
        }
    }

    #[test]
    fn test_snapshot_on_diskful_resources_only() {
        let (_store, mut tx) = transaction(&["a", "b"], &["c"]);
        create_snapshot(&mut tx, spec(&[])).unwrap();
        let snap_dfn = &tx.rsc_dfns().unwrap()[&r1()].snapshot_dfns[&snap()];
        assert_eq!(snap_dfn.snapshots.len(), 2);
        assert!(!snap_dfn.snapshots.contains_key(&node("c")));
        assert_eq!(snap_dfn.volumes.len(), 1);

        let err = create_snapshot(&mut tx, spec(&[])).unwrap_err();
        assert_eq!(err.code(), ReturnCode::FAIL_EXISTS_SNAPSHOT_DFN);

        complete_snapshot(&mut tx, &r1(), &snap()).unwrap();
        let flags = tx.rsc_dfns().unwrap()[&r1()].snapshot_dfns[&snap()].flags;
        assert!(flags.is_set(SnapshotDefinitionFlag::Successful));
    }

    #[test]
    fn test_no_diskful_resource() {
        let (_store, mut tx) = transaction(&[], &["c"]);
        let err = create_snapshot(&mut tx, spec(&[])).unwrap_err();
        assert_eq!(err.code(), ReturnCode::FAIL_NOT_ENOUGH_NODES);
    }

    #[test]
    fn test_partial_then_full_delete() {
        let (_store, mut tx) = transaction(&["a", "b"], &[]);
        create_snapshot(&mut tx, spec(&[])).unwrap();

        mark_snapshot_deleted(&mut tx, &r1(), &snap(), &[node("a")]).unwrap();
        remove_deleted_snapshots(&mut tx, &r1(), &snap()).unwrap();
        let dfn = &tx.rsc_dfns().unwrap()[&r1()];
        assert_eq!(dfn.snapshot_dfns[&snap()].snapshots.len(), 1);

        mark_snapshot_deleted(&mut tx, &r1(), &snap(), &[]).unwrap();
        let rc = remove_deleted_snapshots(&mut tx, &r1(), &snap()).unwrap();
        assert!(rc.contains(ReturnCode::DELETED));
        assert!(tx.rsc_dfns().unwrap()[&r1()].snapshot_dfns.is_empty());
    }

    #[test]
    fn test_shipping_snapshot_cannot_be_deleted() {
        let (_store, mut tx) = transaction(&["a"], &[]);
        create_snapshot(&mut tx, spec(&[])).unwrap();
        let dfns = tx.rsc_dfns_mut().unwrap();
        let snap_dfn = dfns.get_mut(&r1()).unwrap().snapshot_dfns.get_mut(&snap()).unwrap();
        snap_dfn.flags.enable(SnapshotDefinitionFlag::Shipping).unwrap();
        let err = mark_snapshot_deleted(&mut tx, &r1(), &snap(), &[]).unwrap_err();
        assert_eq!(err.code(), ReturnCode::FAIL_IN_USE);
    }

    #[test]
    fn test_snapshot_pending_rollback_cannot_be_deleted() {
        let (_store, mut tx) = transaction(&["a", "b"], &[]);
        create_snapshot(&mut tx, spec(&[])).unwrap();
        complete_snapshot(&mut tx, &r1(), &snap()).unwrap();
        let rsc = tx.rsc_dfns_mut().unwrap().get_mut(&r1()).unwrap().resources.get_mut(&node("b")).unwrap();
        rsc.props.set(keys::ROLLBACK_TARGET, "s1").unwrap();

        let err = mark_snapshot_deleted(&mut tx, &r1(), &snap(), &[]).unwrap_err();
        assert_eq!(err.code(), ReturnCode::FAIL_IN_USE);
        assert!(!tx.rsc_dfns().unwrap()[&r1()].snapshot_dfns[&snap()].is_deleting());

        let rsc = tx.rsc_dfns_mut().unwrap().get_mut(&r1()).unwrap().resources.get_mut(&node("b")).unwrap();
        rsc.props.remove(keys::ROLLBACK_TARGET).unwrap();
        mark_snapshot_deleted(&mut tx, &r1(), &snap(), &[]).unwrap();
    }
}
