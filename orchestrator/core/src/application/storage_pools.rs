// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Storage Pool Handler
//!
//! Storage pool definitions and their per-node instances. Creating a pool
//! on a node creates its definition on the fly.

use crate::application::context::{flow, ControllerContext};
use crate::application::responses::{ApiResponse, ResponseContext};
use crate::application::satellite_updates::{DeploymentMessages, UpdateTarget};
use crate::application::scope_runner::sequence;
use crate::domain::access::{AccessType, Principal};
use crate::domain::api_rc::{ApiCallRc, RcEntry, ReturnCode};
use crate::domain::errors::ApiError;
use crate::domain::lock_domain::{LockObj, LockRequest};
use crate::domain::names::{NodeName, StorPoolName};
use crate::domain::props::Props;
use crate::domain::storage_pool::{DeviceProviderKind, StorPool, StorPoolApi, StorPoolDefinition};
use crate::infrastructure::object_store::Transaction;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorPoolSpec {
    pub node_name: NodeName,
    pub name: StorPoolName,
    pub provider: DeviceProviderKind,
    #[serde(default)]
    pub props: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorPoolDefinitionApi {
    pub name: String,
    pub props: BTreeMap<String, String>,
    /// Nodes that have an instance of the pool
    pub nodes: Vec<String>,
}

pub struct StorPoolHandler {
    ctx: Arc<ControllerContext>,
}

impl StorPoolHandler {
    pub fn new(ctx: Arc<ControllerContext>) -> Arc<Self> {
        Arc::new(Self { ctx })
    }

    pub fn create_definition(&self, principal: &Principal, name: StorPoolName) -> ApiResponse {
        let response = ResponseContext::new("creating", format!("storage pool definition '{}'", name))
            .with_ref("stor_pool_dfn", name.as_str());
        let stream = flow(
            principal
                .require(AccessType::Change, ReturnCode::FAIL_ACC_DENIED_STOR_POOL_DFN, "create storage pool definition")
                .map(|()| {
                    self.ctx.step(
                        format!("create storage pool definition '{}'", name),
                        LockRequest::new().write(&[LockObj::StorPoolDefinitions]),
                        move |tx| {
                            if tx.stor_pool_dfns()?.contains_key(&name) {
                                return Err(ApiError::rc(
                                    ReturnCode::FAIL_EXISTS_STOR_POOL_DFN,
                                    format!("Storage pool definition '{}' already exists", name),
                                ));
                            }
                            Ok(ensure_definition(tx, &name)?.unwrap_or_default())
                        },
                    )
                }),
        );
        self.ctx.respond(stream, response)
    }

    pub fn delete_definition(&self, principal: &Principal, name: StorPoolName) -> ApiResponse {
        let response = ResponseContext::new("deleting", format!("storage pool definition '{}'", name))
            .with_ref("stor_pool_dfn", name.as_str());
        let stream = flow(
            principal
                .require(AccessType::Change, ReturnCode::FAIL_ACC_DENIED_STOR_POOL_DFN, "delete storage pool definition")
                .map(|()| {
                    self.ctx.step(
                        format!("delete storage pool definition '{}'", name),
                        LockRequest::new()
                            .read(&[LockObj::Nodes])
                            .write(&[LockObj::StorPoolDefinitions]),
                        move |tx| delete_definition(tx, &name),
                    )
                }),
        );
        self.ctx.respond(stream, response)
    }

    pub fn create(&self, principal: &Principal, spec: StorPoolSpec) -> ApiResponse {
        let response = ResponseContext::new(
            "creating",
            format!("storage pool '{}' on node '{}'", spec.name, spec.node_name),
        )
        .with_ref("node", spec.node_name.as_str())
        .with_ref("stor_pool", spec.name.as_str());
        let stream = flow(
            principal
                .require(AccessType::Change, ReturnCode::FAIL_ACC_DENIED_STOR_POOL, "create storage pool")
                .map(|()| {
                    let target = UpdateTarget::StorPool {
                        node_name: spec.node_name.clone(),
                        stor_pool: spec.name.clone(),
                    };
                    let create = self.ctx.step(
                        format!("create storage pool '{}' on '{}'", spec.name, spec.node_name),
                        LockRequest::new().write(&[LockObj::Nodes, LockObj::StorPoolDefinitions]),
                        move |tx| create_stor_pool(tx, spec),
                    );
                    let deploy = self.ctx.notify(
                        format!("deploy {}", target),
                        target.clone(),
                        DeploymentMessages::new(target.to_string()).success("Storage pool configured on '{node}'"),
                    );
                    sequence(vec![create, deploy])
                }),
        );
        self.ctx.respond(stream, response)
    }

    pub fn delete(&self, principal: &Principal, node_name: NodeName, name: StorPoolName) -> ApiResponse {
        let response = ResponseContext::new(
            "deleting",
            format!("storage pool '{}' on node '{}'", name, node_name),
        )
        .with_ref("node", node_name.as_str())
        .with_ref("stor_pool", name.as_str());
        let stream = flow(
            principal
                .require(AccessType::Change, ReturnCode::FAIL_ACC_DENIED_STOR_POOL, "delete storage pool")
                .map(|()| {
                    let target = UpdateTarget::StorPoolDeleted {
                        node_name: node_name.clone(),
                        stor_pool: name.clone(),
                    };
                    let delete = self.ctx.step(
                        format!("delete storage pool '{}' on '{}'", name, node_name),
                        LockRequest::new()
                            .read(&[LockObj::ResourceDefinitions])
                            .write(&[LockObj::Nodes]),
                        move |tx| delete_stor_pool(tx, &node_name, &name),
                    );
                    let deploy = self.ctx.notify(
                        format!("deploy {}", target),
                        target.clone(),
                        DeploymentMessages::new(target.to_string()).success("Storage pool removed from '{node}'"),
                    );
                    sequence(vec![delete, deploy])
                }),
        );
        self.ctx.respond(stream, response)
    }

    pub fn list_definitions(&self, principal: &Principal) -> Result<Vec<StorPoolDefinitionApi>, ApiError> {
        principal.require(
            AccessType::View,
            ReturnCode::FAIL_ACC_DENIED_STOR_POOL_DFN,
            "list storage pool definitions",
        )?;
        let state = self.ctx.store.snapshot();
        Ok(state
            .stor_pool_dfns
            .values()
            .map(|dfn| StorPoolDefinitionApi {
                name: dfn.name.to_string(),
                props: dfn.props.to_map(),
                nodes: state
                    .nodes
                    .nodes
                    .values()
                    .filter(|n| n.stor_pools.contains_key(&dfn.name))
                    .map(|n| n.name.to_string())
                    .collect(),
            })
            .collect())
    }

    pub fn list(&self, principal: &Principal) -> Result<Vec<StorPoolApi>, ApiError> {
        principal.require(AccessType::View, ReturnCode::FAIL_ACC_DENIED_STOR_POOL, "list storage pools")?;
        Ok(self
            .ctx
            .store
            .snapshot()
            .nodes
            .nodes
            .values()
            .flat_map(|n| n.stor_pools.values())
            .map(StorPool::api_view)
            .collect())
    }
}

// ============================================================================
// Steps
// ============================================================================

/// Creates the definition unless it exists; `None` when it did
fn ensure_definition(tx: &mut Transaction, name: &StorPoolName) -> Result<Option<ApiCallRc>, ApiError> {
    if tx.stor_pool_dfns()?.contains_key(name) {
        return Ok(None);
    }
    tx.stor_pool_dfns_mut()?
        .insert(name.clone(), StorPoolDefinition::new(name.clone()));
    Ok(Some(ApiCallRc::single(
        RcEntry::new(
            ReturnCode::CREATED,
            format!("New storage pool definition '{}' created", name),
        )
        .with_obj_ref("stor_pool_dfn", name.as_str()),
    )))
}

fn delete_definition(tx: &mut Transaction, name: &StorPoolName) -> Result<ApiCallRc, ApiError> {
    if !tx.stor_pool_dfns()?.contains_key(name) {
        return Err(ApiError::rc(
            ReturnCode::FAIL_NOT_FOUND_STOR_POOL_DFN,
            format!("Storage pool definition '{}' not found", name),
        ));
    }
    let nodes: Vec<String> = tx
        .nodes()?
        .nodes
        .values()
        .filter(|n| n.stor_pools.contains_key(name))
        .map(|n| n.name.to_string())
        .collect();
    if !nodes.is_empty() {
        return Err(ApiError::entry(
            RcEntry::new(
                ReturnCode::FAIL_IN_USE,
                format!("Storage pool definition '{}' still has storage pools", name),
            )
            .with_details(format!("Nodes: {}", nodes.join(", ")))
            .with_correction("Delete the storage pools first"),
        ));
    }
    tx.stor_pool_dfns_mut()?.remove(name);
    Ok(ApiCallRc::single(RcEntry::new(
        ReturnCode::DELETED,
        format!("Storage pool definition '{}' deleted", name),
    )))
}

fn create_stor_pool(tx: &mut Transaction, spec: StorPoolSpec) -> Result<ApiCallRc, ApiError> {
    let props = Props::from_pairs(spec.props)?;
    {
        let nodes = tx.nodes()?;
        let node = nodes.nodes.get(&spec.node_name).ok_or_else(|| {
            ApiError::rc(
                ReturnCode::FAIL_NOT_FOUND_NODE,
                format!("Node '{}' not found", spec.node_name),
            )
        })?;
        if node.is_deleting() {
            return Err(ApiError::rc(
                ReturnCode::WARN_DELETE_IN_PROGRESS,
                format!("Node '{}' is being deleted", spec.node_name),
            ));
        }
        if node.stor_pools.contains_key(&spec.name) {
            return Err(ApiError::rc(
                ReturnCode::FAIL_EXISTS_STOR_POOL,
                format!("Storage pool '{}' already exists on node '{}'", spec.name, spec.node_name),
            ));
        }
    }
    let mut rc = ensure_definition(tx, &spec.name)?.unwrap_or_default();

    let mut pool = StorPool::new(spec.node_name.clone(), spec.name.clone(), spec.provider);
    pool.props = props;
    if let Some(node) = tx.nodes_mut()?.nodes.get_mut(&spec.node_name) {
        node.stor_pools.insert(spec.name.clone(), pool);
    }
    info!(node = %spec.node_name, stor_pool = %spec.name, provider = ?spec.provider, "storage pool created");
    rc.push(
        RcEntry::new(
            ReturnCode::CREATED,
            format!("New storage pool '{}' on node '{}' created", spec.name, spec.node_name),
        )
        .with_obj_ref("node", spec.node_name.as_str())
        .with_obj_ref("stor_pool", spec.name.as_str()),
    );
    Ok(rc)
}

fn delete_stor_pool(tx: &mut Transaction, node_name: &NodeName, name: &StorPoolName) -> Result<ApiCallRc, ApiError> {
    let exists = tx
        .nodes()?
        .nodes
        .get(node_name)
        .map_or(false, |n| n.stor_pools.contains_key(name));
    if !exists {
        return Err(ApiError::rc(
            ReturnCode::FAIL_NOT_FOUND_STOR_POOL,
            format!("Storage pool '{}' not found on node '{}'", name, node_name),
        ));
    }
    let volumes: Vec<String> = tx
        .rsc_dfns()?
        .values()
        .filter_map(|dfn| dfn.resources.get(node_name))
        .flat_map(|rsc| rsc.volumes.values())
        .filter(|vlm| vlm.stor_pool.as_ref() == Some(name))
        .map(|vlm| format!("{}/{}", vlm.rsc_name, vlm.number))
        .collect();
    if !volumes.is_empty() {
        return Err(ApiError::entry(
            RcEntry::new(
                ReturnCode::FAIL_IN_USE,
                format!("Storage pool '{}' on node '{}' still holds volumes", name, node_name),
            )
            .with_details(format!("Volumes: {}", volumes.join(", ")))
            .with_correction("Delete the resources placed in this pool first"),
        ));
    }
    if let Some(node) = tx.nodes_mut()?.nodes.get_mut(node_name) {
        node.stor_pools.remove(name);
    }
    Ok(ApiCallRc::single(
        RcEntry::new(
            ReturnCode::DELETED,
            format!("Storage pool '{}' on node '{}' deleted", name, node_name),
        )
        .with_obj_ref("node", node_name.as_str()),
    ))
}
