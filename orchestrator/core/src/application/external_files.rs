// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! External File Handler
//!
//! Deleting a file also drops every resource definition's reference to it;
//! those definitions are redeployed before the file itself is withdrawn.

use crate::application::connection_notifier::ConnectionListener;
use crate::application::context::{deferred, flow, ControllerContext, StepOutcome};
use crate::application::responses::{ApiResponse, ResponseContext};
use crate::application::satellite_updates::{DeploymentMessages, UpdateTarget};
use crate::application::scope_runner::{sequence, RcStream};
use crate::domain::access::{AccessType, Principal};
use crate::domain::api_rc::{ApiCallRc, RcEntry, ReturnCode};
use crate::domain::errors::ApiError;
use crate::domain::external_file::{reference_key, ExternalFile, ExternalFileApi, MAX_CONTENT_LENGTH};
use crate::domain::flags::DeleteFlag;
use crate::domain::lock_domain::{LockObj, LockRequest};
use crate::domain::names::{ExternalFileName, NodeName, ResourceName};
use crate::infrastructure::object_store::Transaction;
use std::sync::Arc;
use tracing::debug;

pub struct ExternalFileHandler {
    ctx: Arc<ControllerContext>,
}

impl ExternalFileHandler {
    pub fn new(ctx: Arc<ControllerContext>) -> Arc<Self> {
        Arc::new(Self { ctx })
    }

    /// Creates the file or replaces its content
    pub fn set(&self, principal: &Principal, name: ExternalFileName, content: String) -> ApiResponse {
        let response = ResponseContext::new("setting", format!("external file '{}'", name))
            .with_ref("extFile", name.as_str());
        let stream = flow(
            principal
                .require(AccessType::Change, ReturnCode::FAIL_ACC_DENIED_EXT_FILE, "set external file")
                .map(|()| {
                    let path = name.clone();
                    let set = self.ctx.step(
                        format!("set external file '{}'", name),
                        LockRequest::new().write(&[LockObj::ExternalFiles]),
                        move |tx| set_file(tx, &path, content),
                    );
                    let deploy = self.ctx.notify(
                        format!("deploy external file '{}'", name),
                        UpdateTarget::ExternalFile(name.clone()),
                        DeploymentMessages::new(format!("external file '{}'", name)),
                    );
                    sequence(vec![set, deploy])
                }),
        );
        self.ctx.respond(stream, response)
    }

    pub fn delete(&self, principal: &Principal, name: ExternalFileName) -> ApiResponse {
        let response = ResponseContext::new("deleting", format!("external file '{}'", name))
            .with_ref("extFile", name.as_str());
        let stream = flow(
            principal
                .require(AccessType::Change, ReturnCode::FAIL_ACC_DENIED_EXT_FILE, "delete external file")
                .map(|()| {
                    let path = name.clone();
                    let detached: StepOutcome<Vec<ResourceName>> = StepOutcome::new();
                    let writer = detached.clone();
                    let mark = self.ctx.step(
                        format!("mark external file '{}' for deletion", name),
                        LockRequest::new().write(&[LockObj::ResourceDefinitions, LockObj::ExternalFiles]),
                        move |tx| {
                            let (rc, rsc_names) = mark_file_deleted(tx, &path)?;
                            writer.set(rsc_names);
                            Ok(rc)
                        },
                    );
                    let ctx = Arc::clone(&self.ctx);
                    let redeploy = deferred(move || {
                        let updates = detached
                            .take()
                            .unwrap_or_default()
                            .into_iter()
                            .map(|rsc_name| {
                                ctx.notify(
                                    format!("update resource definition '{}'", rsc_name),
                                    UpdateTarget::ResourceDefinition(rsc_name.clone()),
                                    DeploymentMessages::new(format!("resource definition '{}'", rsc_name)),
                                )
                            })
                            .collect();
                        sequence(updates)
                    });
                    sequence(vec![mark, redeploy, self.deletion_flow(name)])
                }),
        );
        self.ctx.respond(stream, response)
    }

    pub fn list(&self, principal: &Principal) -> Result<Vec<ExternalFileApi>, ApiError> {
        principal.require(AccessType::View, ReturnCode::FAIL_ACC_DENIED_EXT_FILE, "list external files")?;
        Ok(self
            .ctx
            .store
            .snapshot()
            .ext_files
            .values()
            .map(ExternalFile::api_view)
            .collect())
    }

    fn deletion_flow(&self, name: ExternalFileName) -> RcStream {
        let propagate = self.ctx.propagate(
            format!("withdraw external file '{}'", name),
            UpdateTarget::ExternalFile(name.clone()),
            DeploymentMessages::new(format!("external file '{}'", name)).success("Removed {object} from '{node}'"),
        );
        let remove = self.ctx.step(
            format!("remove external file '{}'", name),
            LockRequest::new().write(&[LockObj::ExternalFiles]),
            move |tx| remove_file(tx, &name),
        );
        sequence(vec![propagate, remove])
    }
}

impl ConnectionListener for ExternalFileHandler {
    fn name(&self) -> &'static str {
        "external-files"
    }

    fn node_connected(&self, tx: &Transaction, _node_name: &NodeName) -> Result<Vec<RcStream>, ApiError> {
        Ok(tx
            .ext_files()?
            .values()
            .filter(|f| f.is_deleting())
            .map(|f| self.deletion_flow(f.name.clone()))
            .collect())
    }
}

// ============================================================================
// Steps
// ============================================================================

fn set_file(tx: &mut Transaction, name: &ExternalFileName, content: String) -> Result<ApiCallRc, ApiError> {
    if content.len() > MAX_CONTENT_LENGTH {
        return Err(ApiError::entry(
            RcEntry::new(
                ReturnCode::FAIL_INVLD_EXT_FILE,
                format!("External file '{}' is too large", name),
            )
            .with_details(format!(
                "{} bytes exceed the limit of {} bytes",
                content.len(),
                MAX_CONTENT_LENGTH
            )),
        ));
    }
    let files = tx.ext_files_mut()?;
    match files.get_mut(name) {
        Some(file) if file.is_deleting() => Err(ApiError::rc(
            ReturnCode::FAIL_IN_USE,
            format!("External file '{}' is being deleted", name),
        )),
        Some(file) => {
            if file.content == content {
                return Ok(ApiCallRc::single(RcEntry::new(
                    ReturnCode::INFO_NO_PENDING_WORK,
                    format!("External file '{}' is unchanged", name),
                )));
            }
            file.content = content;
            Ok(ApiCallRc::single(RcEntry::new(
                ReturnCode::MODIFIED,
                format!("External file '{}' modified", name),
            )))
        }
        None => {
            files.insert(name.clone(), ExternalFile::new(name.clone(), content));
            Ok(ApiCallRc::single(
                RcEntry::new(ReturnCode::CREATED, format!("New external file '{}' created", name))
                    .with_obj_ref("extFile", name.as_str()),
            ))
        }
    }
}

/// Flags the file and strips every reference to it
fn mark_file_deleted(
    tx: &mut Transaction,
    name: &ExternalFileName,
) -> Result<(ApiCallRc, Vec<ResourceName>), ApiError> {
    let file = tx.ext_files_mut()?.get_mut(name).ok_or_else(|| {
        ApiError::rc(
            ReturnCode::WARN_NOT_FOUND,
            format!("External file '{}' not found", name),
        )
    })?;
    file.flags.enable(DeleteFlag::Delete)?;

    let key = reference_key(name);
    let mut detached = Vec::new();
    for dfn in tx.rsc_dfns_mut()?.values_mut() {
        if dfn.props.remove(&key)?.is_some() {
            debug!(rsc = %dfn.name, file = %name, "dropped external file reference");
            detached.push(dfn.name.clone());
        }
    }
    let mut rc = ApiCallRc::single(RcEntry::new(
        ReturnCode::MODIFIED,
        format!("External file '{}' marked for deletion", name),
    ));
    if !detached.is_empty() {
        rc.push(RcEntry::new(
            ReturnCode::MODIFIED,
            format!("Removed the reference from {} resource definition(s)", detached.len()),
        ));
    }
    Ok((rc, detached))
}

fn remove_file(tx: &mut Transaction, name: &ExternalFileName) -> Result<ApiCallRc, ApiError> {
    if !tx.ext_files()?.get(name).map_or(false, ExternalFile::is_deleting) {
        return Ok(ApiCallRc::new());
    }
    tx.ext_files_mut()?.remove(name);
    Ok(ApiCallRc::single(RcEntry::new(
        ReturnCode::DELETED,
        format!("External file '{}' deleted", name),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::lock_domain::LockMode;
    use crate::domain::names::ResourceGroupName;
    use crate::domain::resource_definition::ResourceDefinition;
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
        tx.attach(LockObj::ExternalFiles, LockMode::Write);
        tx.attach(LockObj::ResourceDefinitions, LockMode::Write);
        (store, tx)
    }

    fn path() -> ExternalFileName {
        ExternalFileName::new("/etc/drbd.d/global.res").unwrap()
    }

    #[test]
    fn test_set_creates_then_modifies() {
        let (_store, mut tx) = transaction();
        let rc = set_file(&mut tx, &path(), "a".into()).unwrap();
        assert_eq!(rc.codes(), vec![ReturnCode::CREATED]);
        let rc = set_file(&mut tx, &path(), "a".into()).unwrap();
        assert_eq!(rc.codes(), vec![ReturnCode::INFO_NO_PENDING_WORK]);
        let rc = set_file(&mut tx, &path(), "b".into()).unwrap();
        assert_eq!(rc.codes(), vec![ReturnCode::MODIFIED]);
    }

    #[test]
    fn test_oversized_content_is_rejected() {
        let (_store, mut tx) = transaction();
        let err = set_file(&mut tx, &path(), "x".repeat(MAX_CONTENT_LENGTH + 1)).unwrap_err();
        assert_eq!(err.code(), ReturnCode::FAIL_INVLD_EXT_FILE);
        assert!(tx.ext_files().unwrap().is_empty());
    }

    #[test]
    fn test_delete_strips_references() {
        let (_store, mut tx) = transaction();
        set_file(&mut tx, &path(), "a".into()).unwrap();
        let rsc = ResourceName::new("r1").unwrap();
        let mut dfn = ResourceDefinition::new(rsc.clone(), ResourceGroupName::new("DfltRscGrp").unwrap(), 7000);
        dfn.props.set(reference_key(&path()), "True").unwrap();
        tx.rsc_dfns_mut().unwrap().insert(rsc.clone(), dfn);

        let (_, detached) = mark_file_deleted(&mut tx, &path()).unwrap();
        assert_eq!(detached, vec![rsc.clone()]);
        assert!(tx.rsc_dfns().unwrap()[&rsc].props.get("files/etc/drbd.d/global.res").is_none());

        remove_file(&mut tx, &path()).unwrap();
        assert!(tx.ext_files().unwrap().is_empty());
    }
}
