// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Remote Handler

use crate::application::connection_notifier::ConnectionListener;
use crate::application::context::{change_report, flow, ControllerContext};
use crate::application::responses::{ApiResponse, ResponseContext};
use crate::application::satellite_updates::{DeploymentMessages, UpdateTarget};
use crate::application::scope_runner::{sequence, RcStream};
use crate::domain::access::{AccessType, Principal};
use crate::domain::api_rc::{ApiCallRc, RcEntry, ReturnCode};
use crate::domain::errors::ApiError;
use crate::domain::lock_domain::{LockObj, LockRequest};
use crate::domain::names::{NodeName, RemoteName};
use crate::domain::props::{keys, Props, PropsChange};
use crate::domain::remote::{Remote, RemoteApi, RemoteFlag, RemoteKind};
use crate::infrastructure::object_store::Transaction;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteSpec {
    pub name: RemoteName,
    pub kind: RemoteKind,
    #[serde(default)]
    pub props: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteChange {
    #[serde(default)]
    pub kind: Option<RemoteKind>,
    #[serde(default)]
    pub props: PropsChange,
}

pub struct RemoteHandler {
    ctx: Arc<ControllerContext>,
}

impl RemoteHandler {
    pub fn new(ctx: Arc<ControllerContext>) -> Arc<Self> {
        Arc::new(Self { ctx })
    }

    pub fn create(&self, principal: &Principal, spec: RemoteSpec) -> ApiResponse {
        let response = ResponseContext::new("creating", format!("remote '{}'", spec.name))
            .with_ref("remote", spec.name.as_str());
        let stream = flow(
            principal
                .require(AccessType::Change, ReturnCode::FAIL_ACC_DENIED_REMOTE, "create remote")
                .map(|()| {
                    let name = spec.name.clone();
                    let create = self.ctx.step(
                        format!("create remote '{}'", name),
                        LockRequest::new().write(&[LockObj::Remotes]),
                        move |tx| create_remote(tx, spec),
                    );
                    sequence(vec![create, self.announce(&name)])
                }),
        );
        self.ctx.respond(stream, response)
    }

    pub fn modify(&self, principal: &Principal, name: RemoteName, change: RemoteChange) -> ApiResponse {
        let response = ResponseContext::new("modifying", format!("remote '{}'", name)).with_ref("remote", name.as_str());
        let stream = flow(
            principal
                .require(AccessType::Change, ReturnCode::FAIL_ACC_DENIED_REMOTE, "modify remote")
                .map(|()| {
                    let remote = name.clone();
                    let modify = self.ctx.step(
                        format!("modify remote '{}'", name),
                        LockRequest::new().write(&[LockObj::Remotes]),
                        move |tx| modify_remote(tx, &remote, change),
                    );
                    sequence(vec![modify, self.announce(&name)])
                }),
        );
        self.ctx.respond(stream, response)
    }

    pub fn delete(&self, principal: &Principal, name: RemoteName) -> ApiResponse {
        let response = ResponseContext::new("deleting", format!("remote '{}'", name)).with_ref("remote", name.as_str());
        let stream = flow(
            principal
                .require(AccessType::Change, ReturnCode::FAIL_ACC_DENIED_REMOTE, "delete remote")
                .map(|()| {
                    let remote = name.clone();
                    let mark = self.ctx.step(
                        format!("mark remote '{}' for deletion", name),
                        LockRequest::new()
                            .read(&[LockObj::ResourceDefinitions])
                            .write(&[LockObj::Remotes]),
                        move |tx| mark_remote_deleted(tx, &remote),
                    );
                    sequence(vec![mark, self.deletion_flow(name)])
                }),
        );
        self.ctx.respond(stream, response)
    }

    pub fn list(&self, principal: &Principal) -> Result<Vec<RemoteApi>, ApiError> {
        principal.require(AccessType::View, ReturnCode::FAIL_ACC_DENIED_REMOTE, "list remotes")?;
        Ok(self.ctx.store.snapshot().remotes.values().map(Remote::api_view).collect())
    }

    fn announce(&self, name: &RemoteName) -> RcStream {
        self.ctx.notify(
            format!("deploy remote '{}'", name),
            UpdateTarget::Remote(name.clone()),
            DeploymentMessages::new(format!("remote '{}'", name)),
        )
    }

    fn deletion_flow(&self, name: RemoteName) -> RcStream {
        let propagate = self.ctx.propagate(
            format!("propagate deletion of remote '{}'", name),
            UpdateTarget::Remote(name.clone()),
            DeploymentMessages::new(format!("remote '{}'", name)).success("Removed {object} from '{node}'"),
        );
        let remove = self.ctx.step(
            format!("remove remote '{}'", name),
            LockRequest::new().write(&[LockObj::Remotes]),
            move |tx| remove_remote(tx, &name),
        );
        sequence(vec![propagate, remove])
    }
}

impl ConnectionListener for RemoteHandler {
    fn name(&self) -> &'static str {
        "remotes"
    }

    fn node_connected(&self, tx: &Transaction, _node_name: &NodeName) -> Result<Vec<RcStream>, ApiError> {
        Ok(tx
            .remotes()?
            .values()
            .filter(|r| r.is_deleting())
            .map(|r| self.deletion_flow(r.name.clone()))
            .collect())
    }
}

// ============================================================================
// Steps
// ============================================================================

fn invalid(name: &RemoteName, reason: String) -> ApiError {
    ApiError::entry(
        RcEntry::new(ReturnCode::FAIL_INVLD_REMOTE, format!("Invalid remote '{}'", name))
            .with_cause(reason)
            .with_obj_ref("remote", name.as_str()),
    )
}

fn create_remote(tx: &mut Transaction, spec: RemoteSpec) -> Result<ApiCallRc, ApiError> {
    spec.kind.validate().map_err(|reason| invalid(&spec.name, reason))?;
    if tx.remotes()?.contains_key(&spec.name) {
        return Err(ApiError::rc(
            ReturnCode::FAIL_EXISTS_REMOTE,
            format!("Remote '{}' already exists", spec.name),
        ));
    }
    let mut remote = Remote::new(spec.name.clone(), spec.kind);
    remote.props = Props::from_pairs(spec.props)?;
    tx.remotes_mut()?.insert(spec.name.clone(), remote);
    info!(remote = %spec.name, "remote created");
    Ok(ApiCallRc::single(
        RcEntry::new(ReturnCode::CREATED, format!("New remote '{}' created", spec.name))
            .with_obj_ref("remote", spec.name.as_str()),
    ))
}

fn modify_remote(tx: &mut Transaction, name: &RemoteName, change: RemoteChange) -> Result<ApiCallRc, ApiError> {
    if let Some(kind) = &change.kind {
        kind.validate().map_err(|reason| invalid(name, reason))?;
    }
    let remote = tx
        .remotes_mut()?
        .get_mut(name)
        .filter(|r| !r.is_deleting())
        .ok_or_else(|| {
            ApiError::rc(
                ReturnCode::FAIL_NOT_FOUND_REMOTE,
                format!("Remote '{}' not found", name),
            )
        })?;
    let mut changed = change.props.apply_to(&mut remote.props)?;
    if let Some(kind) = change.kind {
        // switching between S3 and controller remotes is not a modification
        if std::mem::discriminant(&kind) != std::mem::discriminant(&remote.kind) {
            return Err(invalid(name, "the remote type cannot be changed".to_string()));
        }
        changed |= remote.kind != kind;
        remote.kind = kind;
    }
    Ok(change_report(changed, format!("Remote '{}' modified", name)))
}

fn mark_remote_deleted(tx: &mut Transaction, name: &RemoteName) -> Result<ApiCallRc, ApiError> {
    let shipping: Vec<String> = tx
        .rsc_dfns()?
        .values()
        .flat_map(|dfn| dfn.snapshot_dfns.values())
        .filter(|s| s.is_shipping() && s.props.get(keys::BACKUP_TARGET_REMOTE) == Some(name.as_str()))
        .map(|s| s.key())
        .collect();
    let remote = tx.remotes_mut()?.get_mut(name).ok_or_else(|| {
        ApiError::rc(ReturnCode::WARN_NOT_FOUND, format!("Remote '{}' not found", name))
    })?;
    if !shipping.is_empty() {
        return Err(ApiError::entry(
            RcEntry::new(
                ReturnCode::FAIL_IN_USE,
                format!("Remote '{}' is the target of running backups", name),
            )
            .with_details(format!("Backups: {}", shipping.join(", ")))
            .with_correction("Wait for the backups to finish or abort them"),
        ));
    }
    if remote.is_deleting() {
        return Ok(ApiCallRc::single(RcEntry::new(
            ReturnCode::WARN_DELETE_IN_PROGRESS,
            format!("Remote '{}' is already being deleted", name),
        )));
    }
    remote.flags.enable(RemoteFlag::Delete)?;
    Ok(ApiCallRc::single(RcEntry::new(
        ReturnCode::MODIFIED,
        format!("Remote '{}' marked for deletion", name),
    )))
}

fn remove_remote(tx: &mut Transaction, name: &RemoteName) -> Result<ApiCallRc, ApiError> {
    if !tx.remotes()?.get(name).map_or(false, Remote::is_deleting) {
        return Ok(ApiCallRc::new());
    }
    tx.remotes_mut()?.remove(name);
    info!(remote = %name, "remote removed");
    Ok(ApiCallRc::single(RcEntry::new(
        ReturnCode::DELETED,
        format!("Remote '{}' deleted", name),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::flags::StateFlags;
    use crate::domain::lock_domain::LockMode;
    use crate::domain::names::{ResourceGroupName, ResourceName, SnapshotName};
    use crate::domain::resource_definition::ResourceDefinition;
    use crate::domain::snapshot::{SnapshotDefinition, SnapshotDefinitionFlag};
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
        tx.attach(LockObj::Remotes, LockMode::Write);
        tx.attach(LockObj::ResourceDefinitions, LockMode::Write);
        (store, tx)
    }

    fn s3_spec(bucket: &str) -> RemoteSpec {
        RemoteSpec {
            name: RemoteName::new("s3").unwrap(),
            kind: RemoteKind::S3 {
                endpoint: "s3.example.com".into(),
                bucket: bucket.into(),
                region: "eu-1".into(),
            },
            props: BTreeMap::new(),
        }
    }

    #[test]
    fn test_create_validates() {
        let (_store, mut tx) = transaction();
        let err = create_remote(&mut tx, s3_spec("x")).unwrap_err();
        assert_eq!(err.code(), ReturnCode::FAIL_INVLD_REMOTE);
        create_remote(&mut tx, s3_spec("backups")).unwrap();
        let err = create_remote(&mut tx, s3_spec("backups")).unwrap_err();
        assert_eq!(err.code(), ReturnCode::FAIL_EXISTS_REMOTE);
    }

    #[test]
    fn test_delete_refused_while_shipping() {
        let (_store, mut tx) = transaction();
        create_remote(&mut tx, s3_spec("backups")).unwrap();
        let rsc = ResourceName::new("r1").unwrap();
        let snap = SnapshotName::new("back_1").unwrap();
        let mut snap_dfn = SnapshotDefinition::new(
            rsc.clone(),
            snap.clone(),
            StateFlags::with(&[SnapshotDefinitionFlag::Backup, SnapshotDefinitionFlag::Shipping]),
            Vec::new(),
        );
        snap_dfn.props.set(keys::BACKUP_TARGET_REMOTE, "s3").unwrap();
        let mut dfn = ResourceDefinition::new(rsc.clone(), ResourceGroupName::new("DfltRscGrp").unwrap(), 7000);
        dfn.snapshot_dfns.insert(snap, snap_dfn);
        tx.rsc_dfns_mut().unwrap().insert(rsc.clone(), dfn);

        let name = RemoteName::new("s3").unwrap();
        let err = mark_remote_deleted(&mut tx, &name).unwrap_err();
        assert_eq!(err.code(), ReturnCode::FAIL_IN_USE);

        tx.rsc_dfns_mut().unwrap().remove(&rsc);
        mark_remote_deleted(&mut tx, &name).unwrap();
        assert_eq!(remove_remote(&mut tx, &name).unwrap().codes(), vec![ReturnCode::DELETED]);
        assert!(tx.remotes().unwrap().is_empty());
    }
}
