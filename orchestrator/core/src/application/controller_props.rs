// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Controller-wide properties. They form the outermost level of the property
//! lookup chain, so every satellite receives the new set.

use crate::application::context::{change_report, flow, ControllerContext};
use crate::application::responses::{ApiResponse, ResponseContext};
use crate::application::satellite_updates::{DeploymentMessages, UpdateTarget};
use crate::application::scope_runner::sequence;
use crate::domain::access::{AccessType, Principal};
use crate::domain::api_rc::{ApiCallRc, ReturnCode};
use crate::domain::errors::ApiError;
use crate::domain::lock_domain::{LockObj, LockRequest};
use crate::domain::props::PropsChange;
use crate::infrastructure::object_store::Transaction;
use std::collections::BTreeMap;
use std::sync::Arc;

pub struct ControllerPropsHandler {
    ctx: Arc<ControllerContext>,
}

impl ControllerPropsHandler {
    pub fn new(ctx: Arc<ControllerContext>) -> Arc<Self> {
        Arc::new(Self { ctx })
    }

    pub fn modify(&self, principal: &Principal, change: PropsChange) -> ApiResponse {
        let response = ResponseContext::new("modifying", "controller properties");
        let stream = flow(
            principal
                .require(AccessType::Control, ReturnCode::FAIL_ACC_DENIED_CTRL_CFG, "modify controller properties")
                .map(|()| {
                    let modify = self.ctx.step(
                        "modify controller properties",
                        LockRequest::new().write(&[LockObj::CtrlConfig]),
                        move |tx| modify_props(tx, &change),
                    );
                    let deploy = self.ctx.propagate(
                        "deploy controller properties",
                        UpdateTarget::ControllerConfig,
                        DeploymentMessages::new("controller properties"),
                    );
                    sequence(vec![modify, deploy])
                }),
        );
        self.ctx.respond(stream, response)
    }

    pub fn list(&self, principal: &Principal) -> Result<BTreeMap<String, String>, ApiError> {
        principal.require(AccessType::View, ReturnCode::FAIL_ACC_DENIED_CTRL_CFG, "list controller properties")?;
        Ok(self.ctx.store.snapshot().ctrl.props.to_map())
    }
}

fn modify_props(tx: &mut Transaction, change: &PropsChange) -> Result<ApiCallRc, ApiError> {
    let changed = change.apply_to(&mut tx.ctrl_mut()?.props)?;
    Ok(change_report(changed, "Controller properties modified"))
}
