// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Backup schedule handler. Schedules live on the controller only, so no
//! satellite is involved.

use crate::application::context::{change_report, flow, ControllerContext};
use crate::application::responses::{ApiResponse, ResponseContext};
use crate::application::scope_runner::sequence;
use crate::domain::access::{AccessType, Principal};
use crate::domain::api_rc::{ApiCallRc, RcEntry, ReturnCode};
use crate::domain::errors::ApiError;
use crate::domain::flags::DeleteFlag;
use crate::domain::lock_domain::{LockObj, LockRequest};
use crate::domain::names::ScheduleName;
use crate::domain::props::{Props, PropsChange};
use crate::domain::schedule::{OnFailure, Schedule, ScheduleApi};
use crate::infrastructure::object_store::Transaction;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

fn locks() -> LockRequest {
    LockRequest::new().write(&[LockObj::Schedules])
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleSpec {
    pub name: ScheduleName,
    pub full_cron: String,
    #[serde(default)]
    pub inc_cron: Option<String>,
    #[serde(default)]
    pub keep_local: Option<u32>,
    #[serde(default)]
    pub keep_remote: Option<u32>,
    #[serde(default = "default_on_failure")]
    pub on_failure: OnFailure,
    #[serde(default)]
    pub props: BTreeMap<String, String>,
}

fn default_on_failure() -> OnFailure {
    OnFailure::Skip
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleChange {
    #[serde(default)]
    pub full_cron: Option<String>,
    #[serde(default)]
    pub inc_cron: Option<String>,
    #[serde(default)]
    pub keep_local: Option<u32>,
    #[serde(default)]
    pub keep_remote: Option<u32>,
    #[serde(default)]
    pub on_failure: Option<OnFailure>,
    #[serde(default)]
    pub props: PropsChange,
}

pub struct ScheduleHandler {
    ctx: Arc<ControllerContext>,
}

impl ScheduleHandler {
    pub fn new(ctx: Arc<ControllerContext>) -> Arc<Self> {
        Arc::new(Self { ctx })
    }

    pub fn create(&self, principal: &Principal, spec: ScheduleSpec) -> ApiResponse {
        let response = ResponseContext::new("creating", format!("schedule '{}'", spec.name))
            .with_ref("schedule", spec.name.as_str());
        let stream = flow(
            principal
                .require(AccessType::Change, ReturnCode::FAIL_ACC_DENIED_SCHEDULE, "create schedule")
                .map(|()| {
                    self.ctx.step(
                        format!("create schedule '{}'", spec.name),
                        locks(),
                        move |tx| create_schedule(tx, spec),
                    )
                }),
        );
        self.ctx.respond(stream, response)
    }

    pub fn modify(&self, principal: &Principal, name: ScheduleName, change: ScheduleChange) -> ApiResponse {
        let response = ResponseContext::new("modifying", format!("schedule '{}'", name))
            .with_ref("schedule", name.as_str());
        let stream = flow(
            principal
                .require(AccessType::Change, ReturnCode::FAIL_ACC_DENIED_SCHEDULE, "modify schedule")
                .map(|()| {
                    self.ctx.step(
                        format!("modify schedule '{}'", name),
                        locks(),
                        move |tx| modify_schedule(tx, &name, change),
                    )
                }),
        );
        self.ctx.respond(stream, response)
    }

    pub fn delete(&self, principal: &Principal, name: ScheduleName) -> ApiResponse {
        let response = ResponseContext::new("deleting", format!("schedule '{}'", name))
            .with_ref("schedule", name.as_str());
        let stream = flow(
            principal
                .require(AccessType::Change, ReturnCode::FAIL_ACC_DENIED_SCHEDULE, "delete schedule")
                .map(|()| {
                    let schedule = name.clone();
                    let mark = self.ctx.step(
                        format!("mark schedule '{}' for deletion", name),
                        locks(),
                        move |tx| mark_schedule_deleted(tx, &schedule),
                    );
                    let remove = self.ctx.step(
                        format!("remove schedule '{}'", name),
                        locks(),
                        move |tx| remove_schedule(tx, &name),
                    );
                    sequence(vec![mark, remove])
                }),
        );
        self.ctx.respond(stream, response)
    }

    pub fn list(&self, principal: &Principal) -> Result<Vec<ScheduleApi>, ApiError> {
        principal.require(AccessType::View, ReturnCode::FAIL_ACC_DENIED_SCHEDULE, "list schedules")?;
        Ok(self
            .ctx
            .store
            .snapshot()
            .schedules
            .values()
            .map(Schedule::api_view)
            .collect())
    }
}

fn invalid(name: &ScheduleName, reason: String) -> ApiError {
    ApiError::entry(
        RcEntry::new(ReturnCode::FAIL_INVLD_SCHEDULE, format!("Invalid schedule '{}'", name))
            .with_cause(reason)
            .with_obj_ref("schedule", name.as_str()),
    )
}

fn create_schedule(tx: &mut Transaction, spec: ScheduleSpec) -> Result<ApiCallRc, ApiError> {
    if tx.schedules()?.contains_key(&spec.name) {
        return Err(ApiError::rc(
            ReturnCode::FAIL_EXISTS_SCHEDULE,
            format!("Schedule '{}' already exists", spec.name),
        ));
    }
    let mut schedule = Schedule::new(spec.name.clone(), spec.full_cron, spec.on_failure);
    schedule.inc_cron = spec.inc_cron;
    schedule.keep_local = spec.keep_local;
    schedule.keep_remote = spec.keep_remote;
    schedule.props = Props::from_pairs(spec.props)?;
    schedule.validate().map_err(|reason| invalid(&spec.name, reason))?;
    tx.schedules_mut()?.insert(spec.name.clone(), schedule);
    Ok(ApiCallRc::single(
        RcEntry::new(ReturnCode::CREATED, format!("New schedule '{}' created", spec.name))
            .with_obj_ref("schedule", spec.name.as_str()),
    ))
}

fn modify_schedule(tx: &mut Transaction, name: &ScheduleName, change: ScheduleChange) -> Result<ApiCallRc, ApiError> {
    let current = tx
        .schedules()?
        .get(name)
        .filter(|s| !s.is_deleting())
        .ok_or_else(|| {
            ApiError::rc(
                ReturnCode::FAIL_NOT_FOUND_SCHEDULE,
                format!("Schedule '{}' not found", name),
            )
        })?;
    let mut updated = current.clone();
    if let Some(full_cron) = change.full_cron {
        updated.full_cron = full_cron;
    }
    if let Some(inc_cron) = change.inc_cron {
        updated.inc_cron = Some(inc_cron);
    }
    if let Some(keep) = change.keep_local {
        updated.keep_local = Some(keep);
    }
    if let Some(keep) = change.keep_remote {
        updated.keep_remote = Some(keep);
    }
    if let Some(on_failure) = change.on_failure {
        updated.on_failure = on_failure;
    }
    change.props.apply_to(&mut updated.props)?;
    updated.validate().map_err(|reason| invalid(name, reason))?;

    let changed = &updated != current;
    if changed {
        tx.schedules_mut()?.insert(name.clone(), updated);
    }
    Ok(change_report(changed, format!("Schedule '{}' modified", name)))
}

fn mark_schedule_deleted(tx: &mut Transaction, name: &ScheduleName) -> Result<ApiCallRc, ApiError> {
    let schedule = tx.schedules_mut()?.get_mut(name).ok_or_else(|| {
        ApiError::rc(ReturnCode::WARN_NOT_FOUND, format!("Schedule '{}' not found", name))
    })?;
    schedule.flags.enable(DeleteFlag::Delete)?;
    Ok(ApiCallRc::new())
}

fn remove_schedule(tx: &mut Transaction, name: &ScheduleName) -> Result<ApiCallRc, ApiError> {
    if !tx.schedules()?.get(name).map_or(false, Schedule::is_deleting) {
        return Ok(ApiCallRc::new());
    }
    tx.schedules_mut()?.remove(name);
    Ok(ApiCallRc::single(RcEntry::new(
        ReturnCode::DELETED,
        format!("Schedule '{}' deleted", name),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::lock_domain::LockMode;
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
        tx.attach(LockObj::Schedules, LockMode::Write);
        (store, tx)
    }

    fn spec(cron: &str) -> ScheduleSpec {
        ScheduleSpec {
            name: ScheduleName::new("nightly").unwrap(),
            full_cron: cron.to_string(),
            inc_cron: None,
            keep_local: Some(3),
            keep_remote: None,
            on_failure: OnFailure::Skip,
            props: BTreeMap::new(),
        }
    }

    #[test]
    fn test_invalid_cron_is_rejected() {
        let (_store, mut tx) = transaction();
        let err = create_schedule(&mut tx, spec("0 3 * *")).unwrap_err();
        assert_eq!(err.code(), ReturnCode::FAIL_INVLD_SCHEDULE);
        assert!(tx.schedules().unwrap().is_empty());
    }

    #[test]
    fn test_modify_and_delete() {
        let (_store, mut tx) = transaction();
        create_schedule(&mut tx, spec("0 3 * * *")).unwrap();
        let name = ScheduleName::new("nightly").unwrap();

        let unchanged = modify_schedule(&mut tx, &name, ScheduleChange::default()).unwrap();
        assert_eq!(unchanged.codes(), vec![ReturnCode::INFO_NO_PENDING_WORK]);

        let change = ScheduleChange {
            inc_cron: Some("0 * * * *".into()),
            ..Default::default()
        };
        assert_eq!(
            modify_schedule(&mut tx, &name, change).unwrap().codes(),
            vec![ReturnCode::MODIFIED]
        );

        let bad = ScheduleChange {
            on_failure: Some(OnFailure::Retry { max_retries: 0 }),
            ..Default::default()
        };
        let err = modify_schedule(&mut tx, &name, bad).unwrap_err();
        assert_eq!(err.code(), ReturnCode::FAIL_INVLD_SCHEDULE);

        mark_schedule_deleted(&mut tx, &name).unwrap();
        remove_schedule(&mut tx, &name).unwrap();
        assert!(tx.schedules().unwrap().is_empty());
    }
}
