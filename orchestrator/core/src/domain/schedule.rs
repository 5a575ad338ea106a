// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Backup Schedules
//!
//! Controller-side policy objects that tell the backup scheduler when to ship
//! full and incremental backups and how many to keep.

use crate::domain::flags::{DeleteFlag, StateFlags};
use crate::domain::names::ScheduleName;
use crate::domain::props::Props;
use crate::domain::repository::{EntityKind, Persistable, PersistedRow, RepositoryError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum OnFailure {
    Skip,
    Retry { max_retries: u32 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub uuid: Uuid,
    pub name: ScheduleName,
    pub full_cron: String,
    pub inc_cron: Option<String>,
    pub keep_local: Option<u32>,
    pub keep_remote: Option<u32>,
    pub on_failure: OnFailure,
    pub flags: StateFlags<DeleteFlag>,
    pub props: Props,
}

/// Validates a five-field cron expression (minute hour day month weekday)
pub fn validate_cron(expr: &str) -> Result<(), String> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(format!(
            "cron expression '{}' must have 5 fields, found {}",
            expr,
            fields.len()
        ));
    }
    let valid_field = |f: &str| {
        f.chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '*' | '/' | ',' | '-' | '?'))
    };
    match fields.iter().find(|f| !valid_field(f)) {
        Some(bad) => Err(format!("invalid cron field '{}' in '{}'", bad, expr)),
        None => Ok(()),
    }
}

impl Schedule {
    pub fn new(name: ScheduleName, full_cron: String, on_failure: OnFailure) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            name,
            full_cron,
            inc_cron: None,
            keep_local: None,
            keep_remote: None,
            on_failure,
            flags: StateFlags::empty(),
            props: Props::new(),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        validate_cron(&self.full_cron)?;
        if let Some(inc) = &self.inc_cron {
            validate_cron(inc)?;
        }
        if let OnFailure::Retry { max_retries: 0 } = self.on_failure {
            return Err("retry policy needs at least one retry".to_string());
        }
        Ok(())
    }

    pub fn is_deleting(&self) -> bool {
        self.flags.is_set(DeleteFlag::Delete)
    }

    pub fn api_view(&self) -> ScheduleApi {
        ScheduleApi {
            uuid: self.uuid,
            name: self.name.to_string(),
            full_cron: self.full_cron.clone(),
            inc_cron: self.inc_cron.clone(),
            keep_local: self.keep_local,
            keep_remote: self.keep_remote,
            on_failure: self.on_failure,
            flags: self.flags.names(),
            props: self.props.to_map(),
        }
    }
}

impl Persistable for Schedule {
    fn collect_rows(&self, rows: &mut Vec<PersistedRow>) -> Result<(), RepositoryError> {
        rows.push(PersistedRow::encode(
            self.uuid,
            EntityKind::Schedule,
            self.name.as_str(),
            self.flags.bits(),
            &self.props,
            self,
            &[],
        )?);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleApi {
    pub uuid: Uuid,
    pub name: String,
    pub full_cron: String,
    pub inc_cron: Option<String>,
    pub keep_local: Option<u32>,
    pub keep_remote: Option<u32>,
    pub on_failure: OnFailure,
    pub flags: Vec<String>,
    pub props: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cron_validation() {
        assert!(validate_cron("0 2 * * *").is_ok());
        assert!(validate_cron("*/15 0-6 1,15 * 1-5").is_ok());
        assert!(validate_cron("0 2 * *").is_err());
        assert!(validate_cron("0 2 * * MON").is_err());
    }

    #[test]
    fn test_schedule_validation() {
        let mut sched = Schedule::new(
            ScheduleName::new("nightly").unwrap(),
            "0 2 * * *".into(),
            OnFailure::Retry { max_retries: 0 },
        );
        assert!(sched.validate().is_err());
        sched.on_failure = OnFailure::Skip;
        sched.inc_cron = Some("0 * * * *".into());
        assert!(sched.validate().is_ok());
    }
}
