// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Resource Group Handler

use crate::application::context::{change_report, deferred, flow, ControllerContext, StepOutcome};
use crate::application::responses::{ApiResponse, ResponseContext};
use crate::application::satellite_updates::{DeploymentMessages, UpdateTarget};
use crate::application::scope_runner::sequence;
use crate::domain::access::{AccessType, Principal};
use crate::domain::api_rc::{ApiCallRc, RcEntry, ReturnCode};
use crate::domain::errors::ApiError;
use crate::domain::lock_domain::{LockObj, LockRequest};
use crate::domain::names::{ResourceGroupName, ResourceName};
use crate::domain::props::{Props, PropsChange};
use crate::domain::resource_definition::DEFAULT_RESOURCE_GROUP;
use crate::domain::resource_group::{ResourceGroup, ResourceGroupApi};
use crate::infrastructure::object_store::Transaction;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceGroupSpec {
    pub name: ResourceGroupName,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub place_count: Option<u32>,
    #[serde(default)]
    pub props: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceGroupChange {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub place_count: Option<u32>,
    #[serde(default)]
    pub props: PropsChange,
}

pub struct ResourceGroupHandler {
    ctx: Arc<ControllerContext>,
}

impl ResourceGroupHandler {
    pub fn new(ctx: Arc<ControllerContext>) -> Arc<Self> {
        Arc::new(Self { ctx })
    }

    pub fn create(&self, principal: &Principal, spec: ResourceGroupSpec) -> ApiResponse {
        let response = ResponseContext::new("creating", format!("resource group '{}'", spec.name))
            .with_ref("rscGrp", spec.name.as_str());
        let stream = flow(
            principal
                .require(AccessType::Change, ReturnCode::FAIL_ACC_DENIED_RSC_GRP, "create resource group")
                .map(|()| {
                    self.ctx.step(
                        format!("create resource group '{}'", spec.name),
                        LockRequest::new().write(&[LockObj::ResourceGroups]),
                        move |tx| create_group(tx, spec),
                    )
                }),
        );
        self.ctx.respond(stream, response)
    }

    /// Group properties are inherited, so every member definition is redeployed
    pub fn modify(&self, principal: &Principal, name: ResourceGroupName, change: ResourceGroupChange) -> ApiResponse {
        let response = ResponseContext::new("modifying", format!("resource group '{}'", name))
            .with_ref("rscGrp", name.as_str());
        let stream = flow(
            principal
                .require(AccessType::Change, ReturnCode::FAIL_ACC_DENIED_RSC_GRP, "modify resource group")
                .map(|()| {
                    let members: StepOutcome<Vec<ResourceName>> = StepOutcome::new();
                    let writer = members.clone();
                    let modify = self.ctx.step(
                        format!("modify resource group '{}'", name),
                        LockRequest::new()
                            .read(&[LockObj::ResourceDefinitions])
                            .write(&[LockObj::ResourceGroups]),
                        move |tx| {
                            let (rc, props_changed) = modify_group(tx, &name, change)?;
                            if props_changed {
                                writer.set(member_definitions(tx, &name)?);
                            }
                            Ok(rc)
                        },
                    );
                    let ctx = Arc::clone(&self.ctx);
                    let redeploy = deferred(move || {
                        let updates = members
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
                    sequence(vec![modify, redeploy])
                }),
        );
        self.ctx.respond(stream, response)
    }

    pub fn delete(&self, principal: &Principal, name: ResourceGroupName) -> ApiResponse {
        let response = ResponseContext::new("deleting", format!("resource group '{}'", name))
            .with_ref("rscGrp", name.as_str());
        let stream = flow(
            principal
                .require(AccessType::Change, ReturnCode::FAIL_ACC_DENIED_RSC_GRP, "delete resource group")
                .map(|()| {
                    self.ctx.step(
                        format!("delete resource group '{}'", name),
                        LockRequest::new()
                            .read(&[LockObj::ResourceDefinitions])
                            .write(&[LockObj::ResourceGroups]),
                        move |tx| delete_group(tx, &name),
                    )
                }),
        );
        self.ctx.respond(stream, response)
    }

    pub fn list(&self, principal: &Principal) -> Result<Vec<ResourceGroupApi>, ApiError> {
        principal.require(AccessType::View, ReturnCode::FAIL_ACC_DENIED_RSC_GRP, "list resource groups")?;
        Ok(self
            .ctx
            .store
            .snapshot()
            .rsc_grps
            .values()
            .map(ResourceGroup::api_view)
            .collect())
    }
}

// ============================================================================
// Steps
// ============================================================================

/// Creates the default group on first start; returns whether it was missing
pub(crate) fn ensure_default_group(tx: &mut Transaction) -> Result<bool, ApiError> {
    let name = ResourceGroupName::new(DEFAULT_RESOURCE_GROUP)?;
    if tx.rsc_grps()?.contains_key(&name) {
        return Ok(false);
    }
    tx.rsc_grps_mut()?.insert(name.clone(), ResourceGroup::new(name));
    Ok(true)
}

fn create_group(tx: &mut Transaction, spec: ResourceGroupSpec) -> Result<ApiCallRc, ApiError> {
    if tx.rsc_grps()?.contains_key(&spec.name) {
        return Err(ApiError::rc(
            ReturnCode::FAIL_EXISTS_RSC_GRP,
            format!("Resource group '{}' already exists", spec.name),
        ));
    }
    let mut group = ResourceGroup::new(spec.name.clone());
    group.description = spec.description;
    group.place_count = spec.place_count;
    group.props = Props::from_pairs(spec.props)?;
    tx.rsc_grps_mut()?.insert(spec.name.clone(), group);
    Ok(ApiCallRc::single(
        RcEntry::new(
            ReturnCode::CREATED,
            format!("New resource group '{}' created", spec.name),
        )
        .with_obj_ref("rscGrp", spec.name.as_str()),
    ))
}

/// Returns the report and whether the group's properties changed
fn modify_group(
    tx: &mut Transaction,
    name: &ResourceGroupName,
    change: ResourceGroupChange,
) -> Result<(ApiCallRc, bool), ApiError> {
    let group = tx.rsc_grps_mut()?.get_mut(name).ok_or_else(|| {
        ApiError::rc(
            ReturnCode::FAIL_NOT_FOUND_RSC_GRP,
            format!("Resource group '{}' not found", name),
        )
    })?;
    let props_changed = change.props.apply_to(&mut group.props)?;
    let mut changed = props_changed;
    if change.description.is_some() && change.description != group.description {
        group.description = change.description;
        changed = true;
    }
    if change.place_count.is_some() && change.place_count != group.place_count {
        group.place_count = change.place_count;
        changed = true;
    }
    Ok((
        change_report(changed, format!("Resource group '{}' modified", name)),
        props_changed,
    ))
}

fn member_definitions(tx: &Transaction, name: &ResourceGroupName) -> Result<Vec<ResourceName>, ApiError> {
    Ok(tx
        .rsc_dfns()?
        .values()
        .filter(|dfn| &dfn.resource_group == name && !dfn.is_deleting())
        .map(|dfn| dfn.name.clone())
        .collect())
}

fn delete_group(tx: &mut Transaction, name: &ResourceGroupName) -> Result<ApiCallRc, ApiError> {
    if name.as_str() == DEFAULT_RESOURCE_GROUP {
        return Err(ApiError::rc(
            ReturnCode::FAIL_IN_USE,
            format!("The default resource group '{}' cannot be deleted", name),
        ));
    }
    if !tx.rsc_grps()?.contains_key(name) {
        return Err(ApiError::rc(
            ReturnCode::WARN_NOT_FOUND,
            format!("Resource group '{}' not found", name),
        ));
    }
    let members: Vec<String> = tx
        .rsc_dfns()?
        .values()
        .filter(|dfn| &dfn.resource_group == name)
        .map(|dfn| dfn.name.to_string())
        .collect();
    if !members.is_empty() {
        return Err(ApiError::entry(
            RcEntry::new(
                ReturnCode::FAIL_IN_USE,
                format!("Resource group '{}' still has resource definitions", name),
            )
            .with_details(format!("Members: {}", members.join(", ")))
            .with_correction("Delete the resource definitions first"),
        ));
    }
    tx.rsc_grps_mut()?.remove(name);
    Ok(ApiCallRc::single(RcEntry::new(
        ReturnCode::DELETED,
        format!("Resource group '{}' deleted", name),
    )))
}
