// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Backup Handler
//!
//! A full backup is a snapshot definition flagged `BACKUP | SHIPPING` whose
//! single snapshot lives on the source node. The source satellite ships the
//! data to an S3 remote and reports the result through
//! [`BackupHandler::shipping_finished`]. At most one backup per resource
//! definition may be shipping at any time.

use crate::application::connection_notifier::ConnectionListener;
use crate::application::context::{deferred, flow, ControllerContext, StepOutcome};
use crate::application::responses::{ApiResponse, ResponseContext};
use crate::application::satellite_updates::{DeploymentMessages, UpdateTarget};
use crate::application::scope_runner::{empty_stream, sequence, RcStream};
use crate::application::snapshots::{end_shipment, new_snapshot_definition, SnapshotHandler};
use crate::domain::access::{AccessType, Principal};
use crate::domain::api_rc::{ApiCallRc, RcEntry, ReturnCode};
use crate::domain::errors::ApiError;
use crate::domain::flags::StateFlags;
use crate::domain::lock_domain::{LockObj, LockRequest};
use crate::domain::names::{NodeName, RemoteName, ResourceName, SnapshotName};
use crate::domain::number_pool::PoolKind;
use crate::domain::props::keys;
use crate::domain::remote::RemoteKind;
use crate::domain::snapshot::{Snapshot, SnapshotDefinitionFlag, SnapshotFlag};
use crate::infrastructure::object_store::Transaction;
use crate::infrastructure::satellite::SatelliteRegistry;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

fn locks() -> LockRequest {
    LockRequest::new().write(&[LockObj::ResourceDefinitions])
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupSpec {
    pub rsc_name: ResourceName,
    pub remote: RemoteName,
    /// Picked among the online diskful resources when not given
    #[serde(default)]
    pub node_name: Option<NodeName>,
}

pub struct BackupHandler {
    ctx: Arc<ControllerContext>,
    snapshots: Arc<SnapshotHandler>,
}

impl BackupHandler {
    pub fn new(ctx: Arc<ControllerContext>, snapshots: Arc<SnapshotHandler>) -> Arc<Self> {
        Arc::new(Self { ctx, snapshots })
    }

    pub fn create_full(&self, principal: &Principal, spec: BackupSpec) -> ApiResponse {
        let response = ResponseContext::new(
            "shipping",
            format!("backup of '{}' to remote '{}'", spec.rsc_name, spec.remote),
        )
        .with_ref("rsc_dfn", spec.rsc_name.as_str())
        .with_ref("remote", spec.remote.as_str());
        let stream = flow(
            principal
                .require(AccessType::Change, ReturnCode::FAIL_ACC_DENIED_SNAPSHOT_DFN, "create backup")
                .map(|()| {
                    let rsc_name = spec.rsc_name.clone();
                    let registry = Arc::clone(&self.ctx.registry);
                    let created: StepOutcome<SnapshotName> = StepOutcome::new();
                    let writer = created.clone();
                    let create = self.ctx.step(
                        format!("create backup of '{}'", rsc_name),
                        LockRequest::new()
                            .read(&[LockObj::Remotes])
                            .write(&[LockObj::ResourceDefinitions]),
                        move |tx| {
                            let (rc, name) = create_backup(tx, &registry, &spec)?;
                            writer.set(name);
                            Ok(rc)
                        },
                    );
                    let snapshots = Arc::clone(&self.snapshots);
                    let ship = deferred(move || match created.take() {
                        Some(name) => snapshots.completion_flow(rsc_name, name),
                        None => empty_stream(),
                    });
                    sequence(vec![create, ship])
                }),
        );
        self.ctx.respond(stream, response)
    }

    /// Result of a shipment, reported by the source satellite
    pub fn shipping_finished(
        &self,
        principal: &Principal,
        rsc_name: ResourceName,
        name: SnapshotName,
        success: bool,
    ) -> ApiResponse {
        let response = ResponseContext::new("finishing", format!("backup '{}' of '{}'", name, rsc_name))
            .with_ref("rsc_dfn", rsc_name.as_str())
            .with_ref("snapshot", name.as_str());
        let stream = flow(
            principal
                .require_system(ReturnCode::FAIL_ACC_DENIED_SNAPSHOT_DFN, "report backup shipment")
                .map(|()| {
                    let rsc = rsc_name.clone();
                    let snap = name.clone();
                    let finish = self.ctx.step(
                        format!("finish shipping of '{}' of '{}'", name, rsc_name),
                        locks(),
                        move |tx| finish_shipping(tx, &rsc, &snap, success),
                    );
                    sequence(vec![finish, self.announce(rsc_name, name)])
                }),
        );
        self.ctx.respond(stream, response)
    }

    /// Aborts every shipping backup of `rsc_name`
    pub fn abort(&self, principal: &Principal, rsc_name: ResourceName) -> ApiResponse {
        let response = ResponseContext::new("aborting", format!("backups of '{}'", rsc_name))
            .with_ref("rsc_dfn", rsc_name.as_str());
        let stream = flow(
            principal
                .require(AccessType::Change, ReturnCode::FAIL_ACC_DENIED_SNAPSHOT_DFN, "abort backup")
                .map(|()| {
                    let rsc = rsc_name.clone();
                    let aborted: StepOutcome<Vec<SnapshotName>> = StepOutcome::new();
                    let writer = aborted.clone();
                    let request = self.ctx.step(
                        format!("request abort of backups of '{}'", rsc_name),
                        locks(),
                        move |tx| {
                            let (rc, names) = request_abort(tx, &rsc)?;
                            writer.set(names);
                            Ok(rc)
                        },
                    );
                    let ctx = Arc::clone(&self.ctx);
                    let follow = deferred(move || {
                        let flows = aborted
                            .take()
                            .unwrap_or_default()
                            .into_iter()
                            .map(|name| abort_flow(&ctx, rsc_name.clone(), name))
                            .collect();
                        sequence(flows)
                    });
                    sequence(vec![request, follow])
                }),
        );
        self.ctx.respond(stream, response)
    }

    fn announce(&self, rsc_name: ResourceName, name: SnapshotName) -> RcStream {
        let target = UpdateTarget::SnapshotDefinition {
            rsc_name,
            snapshot_name: name,
        };
        self.ctx.notify(
            format!("announce {}", target),
            target.clone(),
            DeploymentMessages::new(target.to_string()),
        )
    }
}

/// Tells the satellites to stop shipping, then clears the shipment
fn abort_flow(ctx: &ControllerContext, rsc_name: ResourceName, name: SnapshotName) -> RcStream {
    let target = UpdateTarget::SnapshotDefinition {
        rsc_name: rsc_name.clone(),
        snapshot_name: name.clone(),
    };
    let propagate = ctx.propagate(
        format!("abort shipping of {}", target),
        target.clone(),
        DeploymentMessages::new(target.to_string()).success("Stopped shipping {object} on '{node}'"),
    );
    let finish = ctx.step(
        format!("finish abort of '{}' of '{}'", name, rsc_name),
        locks(),
        move |tx| finish_abort(tx, &rsc_name, &name),
    );
    sequence(vec![propagate, finish])
}

impl ConnectionListener for BackupHandler {
    fn name(&self) -> &'static str {
        "backups"
    }

    fn resource_definition_connected(&self, tx: &Transaction, rsc_name: &ResourceName) -> Result<Vec<RcStream>, ApiError> {
        let Some(dfn) = tx.rsc_dfns()?.get(rsc_name) else {
            return Ok(Vec::new());
        };
        Ok(dfn
            .snapshot_dfns
            .values()
            .filter(|s| s.flags.is_set(SnapshotDefinitionFlag::ShippingAbort))
            .map(|s| abort_flow(&self.ctx, rsc_name.clone(), s.name.clone()))
            .collect())
    }
}

// ============================================================================
// Steps
// ============================================================================

fn backup_name() -> Result<SnapshotName, ApiError> {
    Ok(SnapshotName::new(format!("back_{}", Utc::now().format("%Y%m%d_%H%M%S")))?)
}

/// Diskful resource the backup is shipped from
fn pick_source(
    tx: &Transaction,
    registry: &SatelliteRegistry,
    rsc_name: &ResourceName,
    requested: Option<&NodeName>,
) -> Result<NodeName, ApiError> {
    let dfn = tx.rsc_dfns()?.get(rsc_name).ok_or_else(|| {
        ApiError::rc(
            ReturnCode::FAIL_NOT_FOUND_RSC_DFN,
            format!("Resource definition '{}' not found", rsc_name),
        )
    })?;
    let mut diskful = dfn.resources.values().filter(|r| r.is_active_diskful());
    if let Some(node_name) = requested {
        return diskful
            .find(|r| &r.node_name == node_name)
            .map(|r| r.node_name.clone())
            .ok_or_else(|| {
                ApiError::rc(
                    ReturnCode::FAIL_NOT_FOUND_RSC,
                    format!("No diskful resource '{}' on node '{}'", rsc_name, node_name),
                )
            });
    }
    let candidates: Vec<&NodeName> = diskful.map(|r| &r.node_name).collect();
    candidates
        .iter()
        .find(|n| registry.is_online(n))
        .or_else(|| candidates.first())
        .map(|n| (*n).clone())
        .ok_or_else(|| {
            ApiError::rc(
                ReturnCode::FAIL_NOT_ENOUGH_NODES,
                format!("Resource '{}' has no diskful replica to back up", rsc_name),
            )
        })
}

fn create_backup(
    tx: &mut Transaction,
    registry: &SatelliteRegistry,
    spec: &BackupSpec,
) -> Result<(ApiCallRc, SnapshotName), ApiError> {
    {
        let remote = tx
            .remotes()?
            .get(&spec.remote)
            .filter(|r| !r.is_deleting())
            .ok_or_else(|| {
                ApiError::rc(
                    ReturnCode::FAIL_NOT_FOUND_REMOTE,
                    format!("Remote '{}' not found", spec.remote),
                )
            })?;
        if !matches!(remote.kind, RemoteKind::S3 { .. }) {
            return Err(ApiError::entry(
                RcEntry::new(
                    ReturnCode::FAIL_INVLD_BACKUP_CONFIG,
                    format!("Remote '{}' is not an S3 remote", spec.remote),
                )
                .with_correction("Full backups can only be shipped to S3 remotes"),
            ));
        }
    }
    let shipping = tx.rsc_dfns()?.get(&spec.rsc_name).and_then(|dfn| {
        dfn.snapshot_dfns
            .values()
            .find(|s| s.is_backup() && s.is_shipping())
            .map(|s| s.name.clone())
    });
    if let Some(running) = shipping {
        return Err(ApiError::entry(
            RcEntry::new(
                ReturnCode::FAIL_EXISTS_SNAPSHOT_SHIPPING,
                format!("Resource '{}' is already shipping a backup", spec.rsc_name),
            )
            .with_details(format!("Backup '{}' is in progress", running))
            .with_correction("Wait for the running backup or abort it"),
        ));
    }

    let source = pick_source(tx, registry, &spec.rsc_name, spec.node_name.as_ref())?;
    let name = backup_name()?;
    let mut snap_dfn = new_snapshot_definition(
        tx,
        &spec.rsc_name,
        &name,
        StateFlags::with(&[SnapshotDefinitionFlag::Backup, SnapshotDefinitionFlag::Shipping]),
    )?;
    let port = tx.allocate(PoolKind::ShippingPort)?;
    snap_dfn.props.set(keys::SHIPPING_PORT, port.to_string())?;
    snap_dfn.props.set(keys::BACKUP_TARGET_REMOTE, spec.remote.as_str())?;
    snap_dfn.props.set(keys::BACKUP_SOURCE_NODE, source.as_str())?;
    snap_dfn.snapshots.insert(
        source.clone(),
        Snapshot::new(
            source.clone(),
            spec.rsc_name.clone(),
            name.clone(),
            StateFlags::with(&[SnapshotFlag::BackupSource]),
        ),
    );
    tx.rsc_dfns_mut()?
        .get_mut(&spec.rsc_name)
        .ok_or_else(|| ApiError::implementation(format!("resource definition '{}' vanished", spec.rsc_name)))?
        .snapshot_dfns
        .insert(name.clone(), snap_dfn);

    info!(rsc = %spec.rsc_name, backup = %name, source = %source, remote = %spec.remote, port, "backup started");
    metrics::counter!("stork_backups_started_total").increment(1);
    let rc = ApiCallRc::single(
        RcEntry::new(
            ReturnCode::CREATED,
            format!("Backup '{}' of '{}' started", name, spec.rsc_name),
        )
        .with_details(format!("Shipping from '{}' to remote '{}' over port {}", source, spec.remote, port))
        .with_obj_ref("rsc_dfn", spec.rsc_name.as_str())
        .with_obj_ref("snapshot", name.as_str()),
    );
    Ok((rc, name))
}

fn finish_shipping(tx: &mut Transaction, rsc_name: &ResourceName, name: &SnapshotName, success: bool) -> Result<ApiCallRc, ApiError> {
    if !end_shipment(tx, rsc_name, name, success)? {
        return Err(ApiError::rc(
            ReturnCode::WARN_NOT_FOUND,
            format!("Backup '{}' of '{}' is not shipping", name, rsc_name),
        ));
    }
    let result = if success { "ok" } else { "failed" };
    metrics::counter!("stork_backups_finished_total", "result" => result).increment(1);
    if success {
        info!(rsc = %rsc_name, backup = %name, "backup shipped");
        Ok(ApiCallRc::single(RcEntry::new(
            ReturnCode::MODIFIED,
            format!("Backup '{}' of '{}' shipped", name, rsc_name),
        )))
    } else {
        warn!(rsc = %rsc_name, backup = %name, "backup shipment failed");
        Ok(ApiCallRc::single(
            RcEntry::new(
                ReturnCode::FAIL_SATELLITE,
                format!("Shipping backup '{}' of '{}' failed", name, rsc_name),
            )
            .with_correction("Check the satellite log of the source node"),
        ))
    }
}

fn request_abort(tx: &mut Transaction, rsc_name: &ResourceName) -> Result<(ApiCallRc, Vec<SnapshotName>), ApiError> {
    let dfn = tx.rsc_dfns_mut()?.get_mut(rsc_name).ok_or_else(|| {
        ApiError::rc(
            ReturnCode::FAIL_NOT_FOUND_RSC_DFN,
            format!("Resource definition '{}' not found", rsc_name),
        )
    })?;
    let mut rc = ApiCallRc::new();
    let mut names = Vec::new();
    for snap_dfn in dfn.snapshot_dfns.values_mut().filter(|s| s.is_backup() && s.is_shipping()) {
        snap_dfn.flags.enable(SnapshotDefinitionFlag::ShippingAbort)?;
        rc.push(RcEntry::new(
            ReturnCode::MODIFIED,
            format!("Aborting backup '{}' of '{}'", snap_dfn.name, rsc_name),
        ));
        names.push(snap_dfn.name.clone());
    }
    if names.is_empty() {
        return Err(ApiError::rc(
            ReturnCode::WARN_NOT_FOUND,
            format!("No backup of '{}' is shipping", rsc_name),
        ));
    }
    Ok((rc, names))
}

fn finish_abort(tx: &mut Transaction, rsc_name: &ResourceName, name: &SnapshotName) -> Result<ApiCallRc, ApiError> {
    if !end_shipment(tx, rsc_name, name, false)? {
        return Ok(ApiCallRc::new());
    }
    metrics::counter!("stork_backups_finished_total", "result" => "aborted").increment(1);
    Ok(ApiCallRc::single(RcEntry::new(
        ReturnCode::MODIFIED,
        format!("Backup '{}' of '{}' aborted", name, rsc_name),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::flags::StateFlags;
    use crate::domain::lock_domain::LockMode;
    use crate::domain::names::{ResourceGroupName, VolumeNumber};
    use crate::domain::remote::Remote;
    use crate::domain::resource::Resource;
    use crate::domain::resource_definition::{ResourceDefinition, VolumeDefinition};
    use crate::infrastructure::event_bus::EventBus;
    use crate::infrastructure::number_pools::NumberPools;
    use crate::infrastructure::object_store::ObjectStore;
    use crate::infrastructure::repositories::InMemoryPersistence;

    fn r1() -> ResourceName {
        ResourceName::new("r1").unwrap()
    }

    fn s3() -> RemoteName {
        RemoteName::new("s3").unwrap()
    }

    fn transaction() -> (Arc<ObjectStore>, Transaction) {
        let store = ObjectStore::new(
            Arc::new(InMemoryPersistence::new()),
            Arc::new(NumberPools::default()),
            EventBus::new(16),
        );
        let mut tx = store.begin(true);
        tx.attach(LockObj::ResourceDefinitions, LockMode::Write);
        tx.attach(LockObj::Remotes, LockMode::Write);
        tx.remotes_mut().unwrap().insert(
            s3(),
            Remote::new(
                s3(),
                RemoteKind::S3 {
                    endpoint: "s3.example.com".into(),
                    bucket: "backups".into(),
                    region: "eu-1".into(),
                },
            ),
        );
        let ctrl = RemoteName::new("other").unwrap();
        tx.remotes_mut().unwrap().insert(
            ctrl.clone(),
            Remote::new(
                ctrl,
                RemoteKind::Controller {
                    url: "https://ctrl.example.com".into(),
                },
            ),
        );
        let mut dfn = ResourceDefinition::new(r1(), ResourceGroupName::new("DfltRscGrp").unwrap(), 7000);
        let vlm0 = VolumeNumber::new(0).unwrap();
        dfn.volume_dfns.insert(vlm0, VolumeDefinition::new(r1(), vlm0, 1024, 1000));
        for n in ["a", "b"] {
            let node = NodeName::new(n).unwrap();
            dfn.resources
                .insert(node.clone(), Resource::new(node, r1(), StateFlags::empty()));
        }
        tx.rsc_dfns_mut().unwrap().insert(r1(), dfn);
        (store, tx)
    }

    fn spec(remote: RemoteName) -> BackupSpec {
        BackupSpec {
            rsc_name: r1(),
            remote,
            node_name: None,
        }
    }

    #[test]
    fn test_second_backup_is_rejected_while_shipping() {
        let (store, mut tx) = transaction();
        let registry = SatelliteRegistry::new(EventBus::new(4));
        let (_rc, name) = create_backup(&mut tx, &registry, &spec(s3())).unwrap();
        let snap_dfn = &tx.rsc_dfns().unwrap()[&r1()].snapshot_dfns[&name];
        assert!(snap_dfn.is_backup() && snap_dfn.is_shipping());
        assert_eq!(snap_dfn.snapshots.len(), 1);
        let port: u32 = snap_dfn.props.get(keys::SHIPPING_PORT).unwrap().parse().unwrap();
        assert!(store.pools().is_allocated(PoolKind::ShippingPort, port));

        let err = create_backup(&mut tx, &registry, &spec(s3())).unwrap_err();
        assert_eq!(err.code(), ReturnCode::FAIL_EXISTS_SNAPSHOT_SHIPPING);
    }

    #[test]
    fn test_backup_needs_s3_remote() {
        let (_store, mut tx) = transaction();
        let registry = SatelliteRegistry::new(EventBus::new(4));
        let err = create_backup(&mut tx, &registry, &spec(RemoteName::new("other").unwrap())).unwrap_err();
        assert_eq!(err.code(), ReturnCode::FAIL_INVLD_BACKUP_CONFIG);
    }

    #[test]
    fn test_finished_shipment_releases_port() {
        let (store, mut tx) = transaction();
        let registry = SatelliteRegistry::new(EventBus::new(4));
        let (_rc, name) = create_backup(&mut tx, &registry, &spec(s3())).unwrap();
        let port: u32 = tx.rsc_dfns().unwrap()[&r1()].snapshot_dfns[&name]
            .props
            .get(keys::SHIPPING_PORT)
            .unwrap()
            .parse()
            .unwrap();

        finish_shipping(&mut tx, &r1(), &name, true).unwrap();
        let snap_dfn = &tx.rsc_dfns().unwrap()[&r1()].snapshot_dfns[&name];
        assert!(snap_dfn.flags.is_set(SnapshotDefinitionFlag::Shipped));
        assert!(snap_dfn.props.get(keys::SHIPPING_PORT).is_none());
        assert!(!store.pools().is_allocated(PoolKind::ShippingPort, port));

        let err = finish_shipping(&mut tx, &r1(), &name, true).unwrap_err();
        assert_eq!(err.code(), ReturnCode::WARN_NOT_FOUND);
    }

    #[test]
    fn test_abort_clears_shipment() {
        let (_store, mut tx) = transaction();
        let registry = SatelliteRegistry::new(EventBus::new(4));
        let (_rc, name) = create_backup(&mut tx, &registry, &spec(s3())).unwrap();
        let (_rc, names) = request_abort(&mut tx, &r1()).unwrap();
        assert_eq!(names, vec![name.clone()]);

        finish_abort(&mut tx, &r1(), &name).unwrap();
        let flags = tx.rsc_dfns().unwrap()[&r1()].snapshot_dfns[&name].flags;
        assert!(flags.is_unset(SnapshotDefinitionFlag::Shipping));
        assert!(flags.is_unset(SnapshotDefinitionFlag::Shipped));

        let err = request_abort(&mut tx, &r1()).unwrap_err();
        assert_eq!(err.code(), ReturnCode::WARN_NOT_FOUND);
    }
}
