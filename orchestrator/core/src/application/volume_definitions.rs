// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Volume Definition Handler
//!
//! Creating a volume definition adds a volume to every existing resource of
//! the definition. Resizing and deleting are two-phase: the flags are pushed
//! to the satellites first, and cleared (or the volumes dropped) only after
//! every satellite acknowledged.

use crate::application::connection_notifier::ConnectionListener;
use crate::application::context::{flow, ControllerContext};
use crate::application::responses::{ApiResponse, ResponseContext};
use crate::application::satellite_updates::{DeploymentMessages, UpdateTarget};
use crate::application::scope_runner::{sequence, RcStream};
use crate::domain::access::{AccessType, Principal};
use crate::domain::api_rc::{ApiCallRc, RcEntry, ReturnCode};
use crate::domain::errors::ApiError;
use crate::domain::lock_domain::{LockObj, LockRequest};
use crate::domain::names::{ResourceName, StorPoolName, VolumeNumber};
use crate::domain::number_pool::PoolKind;
use crate::domain::props::keys;
use crate::domain::resource::{Resource, Volume, VolumeFlag};
use crate::domain::resource_definition::{ResourceDefinition, VolumeDefinition, VolumeDefinitionApi, VolumeDefinitionFlag};
use crate::domain::storage_pool::DEFAULT_STOR_POOL;
use crate::infrastructure::object_store::Transaction;
use crate::infrastructure::satellite::SatelliteRegistry;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

fn locks() -> LockRequest {
    LockRequest::new().write(&[LockObj::ResourceDefinitions])
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeDefinitionSpec {
    pub rsc_name: ResourceName,
    /// First free number when not given
    #[serde(default)]
    pub number: Option<VolumeNumber>,
    pub size_kib: u64,
    #[serde(default)]
    pub minor: Option<u32>,
}

pub struct VolumeDefinitionHandler {
    ctx: Arc<ControllerContext>,
}

impl VolumeDefinitionHandler {
    pub fn new(ctx: Arc<ControllerContext>) -> Arc<Self> {
        Arc::new(Self { ctx })
    }

    pub fn create(&self, principal: &Principal, spec: VolumeDefinitionSpec) -> ApiResponse {
        let response = ResponseContext::new("creating", format!("volume definition of '{}'", spec.rsc_name))
            .with_ref("rsc_dfn", spec.rsc_name.as_str());
        let stream = flow(
            principal
                .require(AccessType::Change, ReturnCode::FAIL_ACC_DENIED_VLM_DFN, "create volume definition")
                .map(|()| {
                    let rsc_name = spec.rsc_name.clone();
                    let create = self.ctx.step(
                        format!("create volume definition of '{}'", rsc_name),
                        locks(),
                        move |tx| create_volume_definition(tx, spec),
                    );
                    sequence(vec![create, self.deploy(&rsc_name, "Added volume of {object} on '{node}'")])
                }),
        );
        self.ctx.respond(stream, response)
    }

    pub fn resize(
        &self,
        principal: &Principal,
        rsc_name: ResourceName,
        number: VolumeNumber,
        size_kib: u64,
    ) -> ApiResponse {
        let response = ResponseContext::new("resizing", format!("volume {} of '{}'", number, rsc_name))
            .with_ref("rsc_dfn", rsc_name.as_str())
            .with_ref("vlm_nr", number.to_string());
        let stream = flow(
            principal
                .require(AccessType::Change, ReturnCode::FAIL_ACC_DENIED_VLM_DFN, "resize volume definition")
                .map(|()| {
                    let registry = Arc::clone(&self.ctx.registry);
                    let rsc = rsc_name.clone();
                    let request = self.ctx.step(
                        format!("request resize of volume {} of '{}'", number, rsc_name),
                        locks(),
                        move |tx| request_resize(tx, &registry, &rsc, number, size_kib),
                    );
                    sequence(vec![request, self.resize_flow(rsc_name, number)])
                }),
        );
        self.ctx.respond(stream, response)
    }

    pub fn delete(&self, principal: &Principal, rsc_name: ResourceName, number: VolumeNumber) -> ApiResponse {
        let response = ResponseContext::new("deleting", format!("volume {} of '{}'", number, rsc_name))
            .with_ref("rsc_dfn", rsc_name.as_str())
            .with_ref("vlm_nr", number.to_string());
        let stream = flow(
            principal
                .require(AccessType::Change, ReturnCode::FAIL_ACC_DENIED_VLM_DFN, "delete volume definition")
                .map(|()| {
                    let registry = Arc::clone(&self.ctx.registry);
                    let rsc = rsc_name.clone();
                    let mark = self.ctx.step(
                        format!("mark volume {} of '{}' for deletion", number, rsc_name),
                        locks(),
                        move |tx| mark_volume_definition_deleted(tx, &registry, &rsc, number),
                    );
                    sequence(vec![mark, self.deletion_flow(rsc_name, number)])
                }),
        );
        self.ctx.respond(stream, response)
    }

    pub fn list(&self, principal: &Principal, rsc_name: &ResourceName) -> Result<Vec<VolumeDefinitionApi>, ApiError> {
        principal.require(AccessType::View, ReturnCode::FAIL_ACC_DENIED_VLM_DFN, "list volume definitions")?;
        let state = self.ctx.store.snapshot();
        let dfn = state.rsc_dfns.get(rsc_name).ok_or_else(|| not_found_rsc_dfn(rsc_name))?;
        Ok(dfn.api_view().volume_dfns)
    }

    fn deploy(&self, rsc_name: &ResourceName, template: &str) -> RcStream {
        self.ctx.propagate(
            format!("deploy volumes of '{}'", rsc_name),
            UpdateTarget::ResourceDefinition(rsc_name.clone()),
            DeploymentMessages::new(format!("resource '{}'", rsc_name)).success(template),
        )
    }

    fn resize_flow(&self, rsc_name: ResourceName, number: VolumeNumber) -> RcStream {
        let rsc = rsc_name.clone();
        let finish = self.ctx.step(
            format!("finish resize of volume {} of '{}'", number, rsc_name),
            locks(),
            move |tx| finish_resize(tx, &rsc, number),
        );
        sequence(vec![self.deploy(&rsc_name, "Resized {object} on '{node}'"), finish])
    }

    fn deletion_flow(&self, rsc_name: ResourceName, number: VolumeNumber) -> RcStream {
        let rsc = rsc_name.clone();
        let finish = self.ctx.step(
            format!("remove volume {} of '{}'", number, rsc_name),
            locks(),
            move |tx| remove_volume_definition(tx, &rsc, number),
        );
        sequence(vec![
            self.deploy(&rsc_name, "Notified '{node}' that a volume of {object} is being deleted"),
            finish,
        ])
    }
}

impl ConnectionListener for VolumeDefinitionHandler {
    fn name(&self) -> &'static str {
        "volume-definitions"
    }

    fn resource_definition_connected(&self, tx: &Transaction, rsc_name: &ResourceName) -> Result<Vec<RcStream>, ApiError> {
        let Some(dfn) = tx.rsc_dfns()?.get(rsc_name) else {
            return Ok(Vec::new());
        };
        if dfn.is_deleting() {
            return Ok(Vec::new());
        }
        let mut flows = Vec::new();
        for vlm_dfn in dfn.volume_dfns.values() {
            if vlm_dfn.is_deleting() {
                flows.push(self.deletion_flow(rsc_name.clone(), vlm_dfn.number));
            } else if vlm_dfn.flags.is_set(VolumeDefinitionFlag::Resize) {
                flows.push(self.resize_flow(rsc_name.clone(), vlm_dfn.number));
            }
        }
        Ok(flows)
    }
}

// ============================================================================
// Steps
// ============================================================================

fn not_found_rsc_dfn(rsc_name: &ResourceName) -> ApiError {
    ApiError::rc(
        ReturnCode::FAIL_NOT_FOUND_RSC_DFN,
        format!("Resource definition '{}' not found", rsc_name),
    )
}

fn not_found_vlm_dfn(rsc_name: &ResourceName, number: VolumeNumber) -> ApiError {
    ApiError::entry(
        RcEntry::new(
            ReturnCode::FAIL_NOT_FOUND_VLM_DFN,
            format!("Volume {} of resource definition '{}' not found", number, rsc_name),
        )
        .with_obj_ref("rsc_dfn", rsc_name.as_str())
        .with_obj_ref("vlm_nr", number.to_string()),
    )
}

fn active_dfn<'a>(tx: &'a Transaction, rsc_name: &ResourceName) -> Result<&'a ResourceDefinition, ApiError> {
    let dfn = tx.rsc_dfns()?.get(rsc_name).ok_or_else(|| not_found_rsc_dfn(rsc_name))?;
    if dfn.is_deleting() {
        return Err(ApiError::rc(
            ReturnCode::WARN_DELETE_IN_PROGRESS,
            format!("Resource definition '{}' is being deleted", rsc_name),
        ));
    }
    Ok(dfn)
}

/// Pool a new volume of `rsc` is placed in
fn volume_pool(rsc: &Resource) -> Result<Option<StorPoolName>, ApiError> {
    if rsc.is_diskless() {
        return Ok(None);
    }
    let name = rsc.props.get(keys::STOR_POOL_NAME).unwrap_or(DEFAULT_STOR_POOL);
    Ok(Some(StorPoolName::new(name)?))
}

fn create_volume_definition(tx: &mut Transaction, spec: VolumeDefinitionSpec) -> Result<ApiCallRc, ApiError> {
    if spec.size_kib == 0 {
        return Err(ApiError::rc(
            ReturnCode::FAIL_INVLD_VLM_SIZE,
            "Volume size must be greater than zero",
        ));
    }
    let number = {
        let dfn = active_dfn(tx, &spec.rsc_name)?;
        match spec.number {
            Some(number) if dfn.volume_dfns.contains_key(&number) => {
                return Err(ApiError::rc(
                    ReturnCode::FAIL_EXISTS_VLM_DFN,
                    format!("Volume {} of resource definition '{}' already exists", number, spec.rsc_name),
                ));
            }
            Some(number) => number,
            None => {
                let free = (0..)
                    .find(|n| !dfn.volume_dfns.keys().any(|v| v.value() == *n))
                    .unwrap_or_default();
                VolumeNumber::new(free)?
            }
        }
    };
    let minor = match spec.minor {
        Some(minor) => {
            tx.allocate_specific(PoolKind::MinorNumber, minor)?;
            minor
        }
        None => tx.allocate(PoolKind::MinorNumber)?,
    };

    let dfn = tx
        .rsc_dfns_mut()?
        .get_mut(&spec.rsc_name)
        .ok_or_else(|| not_found_rsc_dfn(&spec.rsc_name))?;
    dfn.volume_dfns.insert(
        number,
        VolumeDefinition::new(spec.rsc_name.clone(), number, spec.size_kib, minor),
    );
    for rsc in dfn.resources.values_mut().filter(|r| !r.is_deleting()) {
        let stor_pool = volume_pool(rsc)?;
        rsc.volumes.insert(
            number,
            Volume::new(rsc.node_name.clone(), spec.rsc_name.clone(), number, stor_pool),
        );
    }
    info!(rsc = %spec.rsc_name, vlm_nr = %number, minor, "volume definition created");
    Ok(ApiCallRc::single(
        RcEntry::new(
            ReturnCode::CREATED,
            format!("New volume {} of resource definition '{}' created", number, spec.rsc_name),
        )
        .with_details(format!("Size {} KiB, minor number {}", spec.size_kib, minor))
        .with_obj_ref("rsc_dfn", spec.rsc_name.as_str())
        .with_obj_ref("vlm_nr", number.to_string()),
    ))
}

fn request_resize(
    tx: &mut Transaction,
    registry: &SatelliteRegistry,
    rsc_name: &ResourceName,
    number: VolumeNumber,
    size_kib: u64,
) -> Result<ApiCallRc, ApiError> {
    if size_kib == 0 {
        return Err(ApiError::rc(
            ReturnCode::FAIL_INVLD_VLM_SIZE,
            "Volume size must be greater than zero",
        ));
    }
    let old_size = {
        let dfn = active_dfn(tx, rsc_name)?;
        let vlm_dfn = dfn
            .volume_dfns
            .get(&number)
            .ok_or_else(|| not_found_vlm_dfn(rsc_name, number))?;
        // a satellite without a report counts as outdated
        let outdated: Vec<&str> = dfn
            .resources
            .values()
            .filter(|r| r.is_active_diskful())
            .filter(|r| !registry.resource_state(&r.node_name, rsc_name).map_or(false, |s| s.up_to_date))
            .map(|r| r.node_name.as_str())
            .collect();
        if !outdated.is_empty() {
            return Err(ApiError::entry(
                RcEntry::new(
                    ReturnCode::FAIL_NOT_ALL_UPTODATE,
                    format!("Not every replica of '{}' is up to date", rsc_name),
                )
                .with_details(format!("Outdated on: {}", outdated.join(", ")))
                .with_correction("Wait for the resynchronization to finish"),
            ));
        }
        vlm_dfn.size_kib
    };
    if old_size == size_kib {
        return Ok(ApiCallRc::single(RcEntry::new(
            ReturnCode::INFO_NO_PENDING_WORK,
            format!("Volume {} of '{}' already has {} KiB", number, rsc_name, size_kib),
        )));
    }

    let dfn = tx
        .rsc_dfns_mut()?
        .get_mut(rsc_name)
        .ok_or_else(|| not_found_rsc_dfn(rsc_name))?;
    let vlm_dfn = dfn
        .volume_dfns
        .get_mut(&number)
        .ok_or_else(|| not_found_vlm_dfn(rsc_name, number))?;
    vlm_dfn.flags.enable(VolumeDefinitionFlag::Resize)?;
    if size_kib < old_size {
        vlm_dfn.flags.enable(VolumeDefinitionFlag::ResizeShrink)?;
    }
    vlm_dfn.size_kib = size_kib;
    for vlm in dfn
        .resources
        .values_mut()
        .filter(|r| !r.is_deleting())
        .filter_map(|r| r.volumes.get_mut(&number))
    {
        vlm.flags.enable(VolumeFlag::Resize)?;
    }
    debug!(rsc = %rsc_name, vlm_nr = %number, old_size, size_kib, "volume resize requested");
    Ok(ApiCallRc::single(
        RcEntry::new(
            ReturnCode::MODIFIED,
            format!("Volume {} of '{}' resizing from {} KiB to {} KiB", number, rsc_name, old_size, size_kib),
        )
        .with_obj_ref("rsc_dfn", rsc_name.as_str()),
    ))
}

fn finish_resize(tx: &mut Transaction, rsc_name: &ResourceName, number: VolumeNumber) -> Result<ApiCallRc, ApiError> {
    let Some(dfn) = tx.rsc_dfns_mut()?.get_mut(rsc_name) else {
        return Ok(ApiCallRc::new());
    };
    let Some(vlm_dfn) = dfn.volume_dfns.get_mut(&number) else {
        return Ok(ApiCallRc::new());
    };
    if !vlm_dfn.flags.is_set(VolumeDefinitionFlag::Resize) {
        return Ok(ApiCallRc::new());
    }
    vlm_dfn
        .flags
        .disable_all(&[VolumeDefinitionFlag::ResizeShrink, VolumeDefinitionFlag::Resize])?;
    let size_kib = vlm_dfn.size_kib;
    for vlm in dfn.resources.values_mut().filter_map(|r| r.volumes.get_mut(&number)) {
        vlm.flags.disable(VolumeFlag::Resize)?;
    }
    Ok(ApiCallRc::single(RcEntry::new(
        ReturnCode::MODIFIED,
        format!("Volume {} of '{}' resized to {} KiB", number, rsc_name, size_kib),
    )))
}

fn mark_volume_definition_deleted(
    tx: &mut Transaction,
    registry: &SatelliteRegistry,
    rsc_name: &ResourceName,
    number: VolumeNumber,
) -> Result<ApiCallRc, ApiError> {
    {
        let dfn = active_dfn(tx, rsc_name)?;
        let vlm_dfn = dfn
            .volume_dfns
            .get(&number)
            .ok_or_else(|| not_found_vlm_dfn(rsc_name, number))?;
        if vlm_dfn.is_deleting() {
            return Ok(ApiCallRc::single(RcEntry::new(
                ReturnCode::WARN_DELETE_IN_PROGRESS,
                format!("Volume {} of '{}' is already being deleted", number, rsc_name),
            )));
        }
        let snapshots: Vec<&str> = dfn
            .snapshot_dfns
            .values()
            .filter(|s| s.volumes.iter().any(|v| v.number == number))
            .map(|s| s.name.as_str())
            .collect();
        if !snapshots.is_empty() {
            return Err(ApiError::entry(
                RcEntry::new(
                    ReturnCode::FAIL_EXISTS_SNAPSHOT_DFN,
                    format!("Volume {} of '{}' is part of snapshots", number, rsc_name),
                )
                .with_details(format!("Snapshots: {}", snapshots.join(", "))),
            ));
        }
        let in_use = dfn
            .resources
            .keys()
            .any(|node| registry.resource_state(node, rsc_name).and_then(|s| s.in_use) == Some(true));
        if in_use {
            return Err(ApiError::rc(
                ReturnCode::FAIL_IN_USE,
                format!("Resource '{}' is in use", rsc_name),
            ));
        }
    }

    let dfn = tx
        .rsc_dfns_mut()?
        .get_mut(rsc_name)
        .ok_or_else(|| not_found_rsc_dfn(rsc_name))?;
    if let Some(vlm_dfn) = dfn.volume_dfns.get_mut(&number) {
        vlm_dfn.flags.disable_all(&[VolumeDefinitionFlag::ResizeShrink, VolumeDefinitionFlag::Resize])?;
        vlm_dfn.flags.enable(VolumeDefinitionFlag::Delete)?;
    }
    for vlm in dfn.resources.values_mut().filter_map(|r| r.volumes.get_mut(&number)) {
        vlm.flags.disable(VolumeFlag::Resize)?;
        vlm.flags.enable(VolumeFlag::Delete)?;
    }
    Ok(ApiCallRc::single(
        RcEntry::new(
            ReturnCode::MODIFIED,
            format!("Volume {} of '{}' marked for deletion", number, rsc_name),
        )
        .with_obj_ref("rsc_dfn", rsc_name.as_str()),
    ))
}

fn remove_volume_definition(tx: &mut Transaction, rsc_name: &ResourceName, number: VolumeNumber) -> Result<ApiCallRc, ApiError> {
    let minor = {
        let Some(dfn) = tx.rsc_dfns_mut()?.get_mut(rsc_name) else {
            return Ok(ApiCallRc::new());
        };
        if !dfn.volume_dfns.get(&number).map_or(false, VolumeDefinition::is_deleting) {
            return Ok(ApiCallRc::new());
        }
        for rsc in dfn.resources.values_mut() {
            rsc.volumes.remove(&number);
        }
        for conn in dfn.connections.values_mut() {
            conn.volume_conns.remove(&number);
        }
        dfn.volume_dfns.remove(&number).map(|v| v.minor)
    };
    if let Some(minor) = minor {
        tx.release_number(PoolKind::MinorNumber, minor);
    }
    info!(rsc = %rsc_name, vlm_nr = %number, "volume definition removed");
    Ok(ApiCallRc::single(RcEntry::new(
        ReturnCode::DELETED,
        format!("Volume {} of resource definition '{}' deleted", number, rsc_name),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::flags::StateFlags;
    use crate::domain::lock_domain::LockMode;
    use crate::domain::names::{NodeName, ResourceGroupName};
    use crate::domain::resource::ResourceFlag;
    use crate::domain::satellite::ResourceState;
    use crate::infrastructure::event_bus::EventBus;
    use crate::infrastructure::number_pools::NumberPools;
    use crate::infrastructure::object_store::ObjectStore;
    use crate::infrastructure::repositories::InMemoryPersistence;

    fn r1() -> ResourceName {
        ResourceName::new("r1").unwrap()
    }

    fn node(n: &str) -> NodeName {
        NodeName::new(n).unwrap()
    }

    fn transaction() -> (Arc<ObjectStore>, Transaction) {
        let store = ObjectStore::new(
            Arc::new(InMemoryPersistence::new()),
            Arc::new(NumberPools::default()),
            EventBus::new(16),
        );
        let mut tx = store.begin(true);
        tx.attach(LockObj::ResourceDefinitions, LockMode::Write);
        let mut dfn = ResourceDefinition::new(r1(), ResourceGroupName::new("DfltRscGrp").unwrap(), 7000);
        dfn.resources
            .insert(node("a"), Resource::new(node("a"), r1(), StateFlags::empty()));
        dfn.resources.insert(
            node("b"),
            Resource::new(node("b"), r1(), StateFlags::with(&[ResourceFlag::Diskless])),
        );
        tx.rsc_dfns_mut().unwrap().insert(r1(), dfn);
        (store, tx)
    }

    fn spec(size_kib: u64) -> VolumeDefinitionSpec {
        VolumeDefinitionSpec {
            rsc_name: r1(),
            number: None,
            size_kib,
            minor: None,
        }
    }

    #[test]
    fn test_create_adds_volumes_to_resources() {
        let (_store, mut tx) = transaction();
        create_volume_definition(&mut tx, spec(1024)).unwrap();
        create_volume_definition(&mut tx, spec(2048)).unwrap();
        let dfn = &tx.rsc_dfns().unwrap()[&r1()];
        assert_eq!(dfn.volume_dfns.len(), 2);
        let vlm1 = VolumeNumber::new(1).unwrap();
        assert_eq!(
            dfn.resources[&node("a")].volumes[&vlm1].stor_pool.as_ref().map(|p| p.as_str()),
            Some(DEFAULT_STOR_POOL)
        );
        assert!(dfn.resources[&node("b")].volumes[&vlm1].stor_pool.is_none());
    }

    #[test]
    fn test_zero_size_is_rejected() {
        let (_store, mut tx) = transaction();
        let err = create_volume_definition(&mut tx, spec(0)).unwrap_err();
        assert_eq!(err.code(), ReturnCode::FAIL_INVLD_VLM_SIZE);
    }

    #[test]
    fn test_resize_requires_up_to_date_replicas() {
        let (_store, mut tx) = transaction();
        create_volume_definition(&mut tx, spec(1024)).unwrap();
        let vlm0 = VolumeNumber::new(0).unwrap();
        let registry = SatelliteRegistry::new(EventBus::new(4));
        let err = request_resize(&mut tx, &registry, &r1(), vlm0, 512).unwrap_err();
        assert_eq!(err.code(), ReturnCode::FAIL_NOT_ALL_UPTODATE);

        registry.report_resource(
            &node("a"),
            r1(),
            ResourceState {
                in_use: Some(false),
                up_to_date: true,
            },
        );
        request_resize(&mut tx, &registry, &r1(), vlm0, 512).unwrap();
        let flags = tx.rsc_dfns().unwrap()[&r1()].volume_dfns[&vlm0].flags;
        assert!(flags.is_set(VolumeDefinitionFlag::ResizeShrink));

        finish_resize(&mut tx, &r1(), vlm0).unwrap();
        let dfn = &tx.rsc_dfns().unwrap()[&r1()];
        assert!(dfn.volume_dfns[&vlm0].flags.is_unset(VolumeDefinitionFlag::Resize));
        assert_eq!(dfn.volume_dfns[&vlm0].size_kib, 512);
    }

    #[test]
    fn test_delete_releases_minor() {
        let (store, mut tx) = transaction();
        create_volume_definition(&mut tx, spec(1024)).unwrap();
        let vlm0 = VolumeNumber::new(0).unwrap();
        let minor = tx.rsc_dfns().unwrap()[&r1()].volume_dfns[&vlm0].minor;
        let registry = SatelliteRegistry::new(EventBus::new(4));
        mark_volume_definition_deleted(&mut tx, &registry, &r1(), vlm0).unwrap();
        assert!(tx.rsc_dfns().unwrap()[&r1()].resources[&node("a")].volumes[&vlm0]
            .flags
            .is_set(VolumeFlag::Delete));

        let rc = remove_volume_definition(&mut tx, &r1(), vlm0).unwrap();
        assert_eq!(rc.codes(), vec![ReturnCode::DELETED]);
        assert!(tx.rsc_dfns().unwrap()[&r1()].resources[&node("a")].volumes.is_empty());
        assert!(!store.pools().is_allocated(PoolKind::MinorNumber, minor));
        // second run finds nothing to do
        assert!(remove_volume_definition(&mut tx, &r1(), vlm0).unwrap().is_empty());
    }
}
