// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Resource Definition Handler
//!
//! Deleting a resource definition is staged: diskless resources go first,
//! the remaining resources after the satellites dropped them, and the
//! definition itself with its last resource. The TCP port and the minor
//! numbers of its volumes return to their pools in the transaction that
//! removes the definition.

use crate::application::connection_notifier::ConnectionListener;
use crate::application::context::{change_report, flow, ControllerContext};
use crate::application::resources::{flag_deleted, ResourceHandler};
use crate::application::responses::{ApiResponse, ResponseContext};
use crate::application::satellite_updates::{DeploymentMessages, UpdateTarget};
use crate::application::scope_runner::{sequence, RcStream};
use crate::domain::access::{AccessType, Principal};
use crate::domain::api_rc::{ApiCallRc, RcEntry, ReturnCode};
use crate::domain::errors::ApiError;
use crate::domain::flags::DeleteFlag;
use crate::domain::lock_domain::{LockObj, LockRequest};
use crate::domain::names::{ExternalFileName, ResourceGroupName, ResourceName};
use crate::domain::number_pool::PoolKind;
use crate::domain::props::{keys, Props, PropsChange};
use crate::domain::resource_definition::{ResourceDefinition, ResourceDefinitionApi, DEFAULT_RESOURCE_GROUP};
use crate::infrastructure::object_store::Transaction;
use crate::infrastructure::satellite::SatelliteRegistry;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDefinitionSpec {
    pub name: ResourceName,
    #[serde(default)]
    pub resource_group: Option<ResourceGroupName>,
    /// Allocated from the TCP port pool when not given
    #[serde(default)]
    pub tcp_port: Option<u32>,
    #[serde(default)]
    pub props: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDefinitionChange {
    #[serde(default)]
    pub tcp_port: Option<u32>,
    #[serde(default)]
    pub resource_group: Option<ResourceGroupName>,
    #[serde(default)]
    pub props: PropsChange,
}

pub struct ResourceDefinitionHandler {
    ctx: Arc<ControllerContext>,
    resources: Arc<ResourceHandler>,
}

impl ResourceDefinitionHandler {
    pub fn new(ctx: Arc<ControllerContext>, resources: Arc<ResourceHandler>) -> Arc<Self> {
        Arc::new(Self { ctx, resources })
    }

    pub fn create(&self, principal: &Principal, spec: ResourceDefinitionSpec) -> ApiResponse {
        let response = ResponseContext::new("creating", format!("resource definition '{}'", spec.name))
            .with_ref("rsc_dfn", spec.name.as_str());
        let stream = flow(
            principal
                .require(AccessType::Change, ReturnCode::FAIL_ACC_DENIED_RSC_DFN, "create resource definition")
                .map(|()| {
                    self.ctx.step(
                        format!("create resource definition '{}'", spec.name),
                        LockRequest::new()
                            .read(&[LockObj::ExternalFiles, LockObj::ResourceGroups])
                            .write(&[LockObj::ResourceDefinitions]),
                        move |tx| create_definition(tx, spec),
                    )
                }),
        );
        self.ctx.respond(stream, response)
    }

    pub fn modify(
        &self,
        principal: &Principal,
        rsc_name: ResourceName,
        change: ResourceDefinitionChange,
    ) -> ApiResponse {
        let response = ResponseContext::new("modifying", format!("resource definition '{}'", rsc_name))
            .with_ref("rsc_dfn", rsc_name.as_str());
        let stream = flow(
            principal
                .require(AccessType::Change, ReturnCode::FAIL_ACC_DENIED_RSC_DFN, "modify resource definition")
                .map(|()| {
                    let rsc = rsc_name.clone();
                    let modify = self.ctx.step(
                        format!("modify resource definition '{}'", rsc_name),
                        LockRequest::new()
                            .read(&[LockObj::ExternalFiles, LockObj::ResourceGroups])
                            .write(&[LockObj::ResourceDefinitions]),
                        move |tx| modify_definition(tx, &rsc, change),
                    );
                    let deploy = self.ctx.propagate(
                        format!("deploy resource definition '{}'", rsc_name),
                        UpdateTarget::ResourceDefinition(rsc_name.clone()),
                        DeploymentMessages::new(format!("resource definition '{}'", rsc_name)),
                    );
                    sequence(vec![modify, deploy])
                }),
        );
        self.ctx.respond(stream, response)
    }

    pub fn delete(&self, principal: &Principal, rsc_name: ResourceName) -> ApiResponse {
        let response = ResponseContext::new("deleting", format!("resource definition '{}'", rsc_name))
            .with_ref("rsc_dfn", rsc_name.as_str());
        let stream = flow(
            principal
                .require(AccessType::Change, ReturnCode::FAIL_ACC_DENIED_RSC_DFN, "delete resource definition")
                .map(|()| {
                    let registry = Arc::clone(&self.ctx.registry);
                    let rsc = rsc_name.clone();
                    let mark = self.ctx.step(
                        format!("mark resource definition '{}' for deletion", rsc_name),
                        LockRequest::new().write(&[LockObj::ResourceDefinitions]),
                        move |tx| mark_definition_deleted(tx, &registry, &rsc),
                    );
                    sequence(vec![mark, self.deletion_flow(rsc_name)])
                }),
        );
        self.ctx.respond(stream, response)
    }

    pub fn list(&self, principal: &Principal) -> Result<Vec<ResourceDefinitionApi>, ApiError> {
        principal.require(AccessType::View, ReturnCode::FAIL_ACC_DENIED_RSC_DFN, "list resource definitions")?;
        Ok(self
            .ctx
            .store
            .snapshot()
            .rsc_dfns
            .values()
            .map(ResourceDefinition::api_view)
            .collect())
    }

    /// Removes the staged resources, stages the rest and removes those too
    fn deletion_flow(&self, rsc_name: ResourceName) -> RcStream {
        let rsc = rsc_name.clone();
        let stage = self.ctx.step(
            format!("stage remaining resources of '{}'", rsc_name),
            LockRequest::new().write(&[LockObj::ResourceDefinitions]),
            move |tx| stage_remaining(tx, &rsc),
        );
        sequence(vec![
            self.resources.deletion_flow(rsc_name.clone()),
            stage,
            self.resources.deletion_flow(rsc_name),
        ])
    }
}

impl ConnectionListener for ResourceDefinitionHandler {
    fn name(&self) -> &'static str {
        "resource-definitions"
    }

    fn resource_definition_connected(&self, tx: &Transaction, rsc_name: &ResourceName) -> Result<Vec<RcStream>, ApiError> {
        let deleting = tx
            .rsc_dfns()?
            .get(rsc_name)
            .map_or(false, ResourceDefinition::is_deleting);
        Ok(if deleting {
            vec![self.deletion_flow(rsc_name.clone())]
        } else {
            Vec::new()
        })
    }
}

// ============================================================================
// Steps
// ============================================================================

fn not_found(rsc_name: &ResourceName) -> ApiError {
    ApiError::entry(
        RcEntry::new(
            ReturnCode::FAIL_NOT_FOUND_RSC_DFN,
            format!("Resource definition '{}' not found", rsc_name),
        )
        .with_obj_ref("rsc_dfn", rsc_name.as_str()),
    )
}

/// Property keys in the `files` namespace must name an existing external file
pub(crate) fn check_file_references<'a>(
    tx: &Transaction,
    keys_set: impl Iterator<Item = &'a String>,
) -> Result<(), ApiError> {
    let prefix = format!("{}/", keys::EXT_FILES_NAMESPACE);
    let ext_files = tx.ext_files()?;
    for key in keys_set.filter(|k| k.starts_with(&prefix)) {
        let path = ExternalFileName::new(&key[keys::EXT_FILES_NAMESPACE.len()..])?;
        if !ext_files.get(&path).map_or(false, |f| !f.is_deleting()) {
            return Err(ApiError::entry(
                RcEntry::new(
                    ReturnCode::FAIL_NOT_FOUND_EXT_FILE,
                    format!("External file '{}' not found", path),
                )
                .with_details(format!("Referenced by property '{}'", key)),
            ));
        }
    }
    Ok(())
}

fn create_definition(tx: &mut Transaction, spec: ResourceDefinitionSpec) -> Result<ApiCallRc, ApiError> {
    if tx.rsc_dfns()?.contains_key(&spec.name) {
        return Err(ApiError::rc(
            ReturnCode::FAIL_EXISTS_RSC_DFN,
            format!("Resource definition '{}' already exists", spec.name),
        ));
    }
    let group = match spec.resource_group {
        Some(group) => group,
        None => ResourceGroupName::new(DEFAULT_RESOURCE_GROUP)?,
    };
    if !tx.rsc_grps()?.contains_key(&group) {
        return Err(ApiError::rc(
            ReturnCode::FAIL_NOT_FOUND_RSC_GRP,
            format!("Resource group '{}' not found", group),
        ));
    }
    let props = Props::from_pairs(spec.props)?;
    check_file_references(tx, props.iter().map(|(k, _)| k))?;

    let tcp_port = match spec.tcp_port {
        Some(port) => {
            tx.allocate_specific(PoolKind::TcpPort, port)?;
            port
        }
        None => tx.allocate(PoolKind::TcpPort)?,
    };
    let mut dfn = ResourceDefinition::new(spec.name.clone(), group, tcp_port);
    dfn.props = props;
    tx.rsc_dfns_mut()?.insert(spec.name.clone(), dfn);
    info!(rsc = %spec.name, tcp_port, "resource definition created");
    Ok(ApiCallRc::single(
        RcEntry::new(
            ReturnCode::CREATED,
            format!("New resource definition '{}' created", spec.name),
        )
        .with_details(format!("TCP port {}", tcp_port))
        .with_obj_ref("rsc_dfn", spec.name.as_str()),
    ))
}

fn modify_definition(
    tx: &mut Transaction,
    rsc_name: &ResourceName,
    change: ResourceDefinitionChange,
) -> Result<ApiCallRc, ApiError> {
    let old_port = {
        let dfn = tx.rsc_dfns()?.get(rsc_name).ok_or_else(|| not_found(rsc_name))?;
        if dfn.is_deleting() {
            return Err(ApiError::rc(
                ReturnCode::WARN_DELETE_IN_PROGRESS,
                format!("Resource definition '{}' is being deleted", rsc_name),
            ));
        }
        dfn.tcp_port
    };
    if let Some(group) = &change.resource_group {
        if !tx.rsc_grps()?.contains_key(group) {
            return Err(ApiError::rc(
                ReturnCode::FAIL_NOT_FOUND_RSC_GRP,
                format!("Resource group '{}' not found", group),
            ));
        }
    }
    check_file_references(tx, change.props.set.keys())?;

    let new_port = match change.tcp_port {
        Some(port) if port != old_port => {
            tx.allocate_specific(PoolKind::TcpPort, port)?;
            tx.release_number(PoolKind::TcpPort, old_port);
            Some(port)
        }
        _ => None,
    };

    let dfn = tx
        .rsc_dfns_mut()?
        .get_mut(rsc_name)
        .ok_or_else(|| not_found(rsc_name))?;
    let mut changed = change.props.apply_to(&mut dfn.props)?;
    if let Some(port) = new_port {
        dfn.tcp_port = port;
        changed = true;
    }
    if let Some(group) = change.resource_group {
        changed |= dfn.resource_group != group;
        dfn.resource_group = group;
    }
    Ok(change_report(changed, format!("Resource definition '{}' modified", rsc_name)))
}

fn mark_definition_deleted(
    tx: &mut Transaction,
    registry: &SatelliteRegistry,
    rsc_name: &ResourceName,
) -> Result<ApiCallRc, ApiError> {
    {
        let Some(dfn) = tx.rsc_dfns()?.get(rsc_name) else {
            return Err(ApiError::rc(
                ReturnCode::WARN_NOT_FOUND,
                format!("Resource definition '{}' not found", rsc_name),
            ));
        };
        if dfn.is_deleting() {
            return Ok(ApiCallRc::single(RcEntry::new(
                ReturnCode::WARN_DELETE_IN_PROGRESS,
                format!("Resource definition '{}' is already being deleted", rsc_name),
            )));
        }
        if !dfn.snapshot_dfns.is_empty() {
            let names: Vec<&str> = dfn.snapshot_dfns.keys().map(|s| s.as_str()).collect();
            return Err(ApiError::entry(
                RcEntry::new(
                    ReturnCode::FAIL_EXISTS_SNAPSHOT_DFN,
                    format!("Resource definition '{}' still has snapshots", rsc_name),
                )
                .with_details(format!("Snapshots: {}", names.join(", ")))
                .with_correction("Delete the snapshots first"),
            ));
        }
        let in_use: Vec<&str> = dfn
            .resources
            .keys()
            .filter(|node| registry.resource_state(node, rsc_name).and_then(|s| s.in_use) == Some(true))
            .map(|node| node.as_str())
            .collect();
        if !in_use.is_empty() {
            return Err(ApiError::entry(
                RcEntry::new(
                    ReturnCode::FAIL_IN_USE,
                    format!("Resource definition '{}' is in use", rsc_name),
                )
                .with_details(format!("In use on: {}", in_use.join(", ")))
                .with_correction("Stop using the resources first"),
            ));
        }
    }

    let empty = {
        let dfn = tx
            .rsc_dfns_mut()?
            .get_mut(rsc_name)
            .ok_or_else(|| not_found(rsc_name))?;
        dfn.flags.enable(DeleteFlag::Delete)?;
        let has_diskless = dfn.resources.values().any(|r| r.is_diskless() && !r.is_deleting());
        for rsc in dfn
            .resources
            .values_mut()
            .filter(|r| !r.is_deleting() && (!has_diskless || r.is_diskless()))
        {
            flag_deleted(rsc)?;
        }
        dfn.resources.is_empty()
    };
    debug!(rsc = %rsc_name, "resource definition marked for deletion");
    if empty {
        return remove_resource_definition(tx, rsc_name);
    }
    Ok(ApiCallRc::single(
        RcEntry::new(
            ReturnCode::MODIFIED,
            format!("Resource definition '{}' marked for deletion", rsc_name),
        )
        .with_obj_ref("rsc_dfn", rsc_name.as_str()),
    ))
}

fn stage_remaining(tx: &mut Transaction, rsc_name: &ResourceName) -> Result<ApiCallRc, ApiError> {
    let Some(dfn) = tx.rsc_dfns_mut()?.get_mut(rsc_name) else {
        return Ok(ApiCallRc::new());
    };
    if !dfn.is_deleting() {
        return Ok(ApiCallRc::new());
    }
    let mut staged = 0;
    for rsc in dfn.resources.values_mut().filter(|r| !r.is_deleting()) {
        flag_deleted(rsc)?;
        staged += 1;
    }
    if staged == 0 {
        return Ok(ApiCallRc::new());
    }
    Ok(ApiCallRc::single(RcEntry::new(
        ReturnCode::MODIFIED,
        format!("Deleting the remaining {} resource(s) of '{}'", staged, rsc_name),
    )))
}

/// Returns the shipping port recorded in `props` to its pool
pub(crate) fn release_shipping_port(tx: &mut Transaction, props: &Props) {
    if let Some(raw) = props.get(keys::SHIPPING_PORT) {
        match raw.parse::<u32>() {
            Ok(port) => tx.release_number(PoolKind::ShippingPort, port),
            Err(_) => warn!(value = raw, "ignoring malformed shipping port property"),
        }
    }
}

/// Drops the definition with everything below it and releases its numbers
pub(crate) fn remove_resource_definition(tx: &mut Transaction, rsc_name: &ResourceName) -> Result<ApiCallRc, ApiError> {
    let Some(dfn) = tx.rsc_dfns_mut()?.remove(rsc_name) else {
        return Ok(ApiCallRc::new());
    };
    tx.release_number(PoolKind::TcpPort, dfn.tcp_port);
    for vlm_dfn in dfn.volume_dfns.values() {
        tx.release_number(PoolKind::MinorNumber, vlm_dfn.minor);
    }
    for snap in dfn.snapshot_dfns.values() {
        release_shipping_port(tx, &snap.props);
    }
    info!(rsc = %rsc_name, "resource definition removed");
    Ok(ApiCallRc::single(
        RcEntry::new(
            ReturnCode::DELETED,
            format!("Resource definition '{}' deleted", rsc_name),
        )
        .with_obj_ref("rsc_dfn", rsc_name.as_str()),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::external_file::ExternalFile;
    use crate::domain::flags::StateFlags;
    use crate::domain::lock_domain::LockMode;
    use crate::domain::names::NodeName;
    use crate::domain::resource::{Resource, ResourceFlag};
    use crate::domain::resource_group::ResourceGroup;
    use crate::infrastructure::event_bus::EventBus;
    use crate::infrastructure::number_pools::NumberPools;
    use crate::infrastructure::object_store::ObjectStore;
    use crate::infrastructure::repositories::InMemoryPersistence;

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
        let grp = ResourceGroupName::new(DEFAULT_RESOURCE_GROUP).unwrap();
        tx.rsc_grps_mut().unwrap().insert(grp.clone(), ResourceGroup::new(grp));
        (store, tx)
    }

    fn spec(name: &str) -> ResourceDefinitionSpec {
        ResourceDefinitionSpec {
            name: ResourceName::new(name).unwrap(),
            resource_group: None,
            tcp_port: None,
            props: BTreeMap::new(),
        }
    }

    #[test]
    fn test_create_allocates_port() {
        let (store, mut tx) = transaction();
        create_definition(&mut tx, spec("r1")).unwrap();
        let port = tx.rsc_dfns().unwrap()[&ResourceName::new("r1").unwrap()].tcp_port;
        assert!(store.pools().is_allocated(PoolKind::TcpPort, port));

        let err = create_definition(&mut tx, spec("r1")).unwrap_err();
        assert_eq!(err.code(), ReturnCode::FAIL_EXISTS_RSC_DFN);
    }

    #[test]
    fn test_unknown_file_reference_is_rejected() {
        let (_store, mut tx) = transaction();
        let mut with_file = spec("r1");
        with_file.props.insert("files/etc/app.conf".into(), "true".into());
        let err = create_definition(&mut tx, with_file.clone()).unwrap_err();
        assert_eq!(err.code(), ReturnCode::FAIL_NOT_FOUND_EXT_FILE);

        let path = ExternalFileName::new("/etc/app.conf").unwrap();
        tx.ext_files_mut()
            .unwrap()
            .insert(path.clone(), ExternalFile::new(path, "x=1".into()));
        create_definition(&mut tx, with_file).unwrap();
    }

    #[test]
    fn test_delete_stages_diskless_first() {
        let (_store, mut tx) = transaction();
        create_definition(&mut tx, spec("r1")).unwrap();
        let rsc_name = ResourceName::new("r1").unwrap();
        let a = NodeName::new("a").unwrap();
        let b = NodeName::new("b").unwrap();
        {
            let dfn = tx.rsc_dfns_mut().unwrap().get_mut(&rsc_name).unwrap();
            dfn.resources
                .insert(a.clone(), Resource::new(a.clone(), rsc_name.clone(), StateFlags::empty()));
            dfn.resources.insert(
                b.clone(),
                Resource::new(b.clone(), rsc_name.clone(), StateFlags::with(&[ResourceFlag::Diskless])),
            );
        }
        let registry = SatelliteRegistry::new(EventBus::new(4));
        mark_definition_deleted(&mut tx, &registry, &rsc_name).unwrap();
        let dfn = &tx.rsc_dfns().unwrap()[&rsc_name];
        assert!(dfn.is_deleting());
        assert!(!dfn.resources[&a].is_deleting());
        assert!(dfn.resources[&b].is_deleting());

        let rc = stage_remaining(&mut tx, &rsc_name).unwrap();
        assert!(rc.contains(ReturnCode::MODIFIED));
        assert!(tx.rsc_dfns().unwrap()[&rsc_name].resources[&a].is_deleting());
    }

    #[test]
    fn test_delete_empty_definition_releases_port() {
        let (store, mut tx) = transaction();
        create_definition(&mut tx, spec("r1")).unwrap();
        let rsc_name = ResourceName::new("r1").unwrap();
        let port = tx.rsc_dfns().unwrap()[&rsc_name].tcp_port;
        let registry = SatelliteRegistry::new(EventBus::new(4));
        let rc = mark_definition_deleted(&mut tx, &registry, &rsc_name).unwrap();
        assert_eq!(rc.codes(), vec![ReturnCode::DELETED]);
        // allocated and released in the same transaction
        assert!(!store.pools().is_allocated(PoolKind::TcpPort, port));
    }
}
