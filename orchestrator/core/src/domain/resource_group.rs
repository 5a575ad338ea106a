// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Resource Groups
//!
//! Templates shared by resource definitions. Properties set on a group apply
//! to each member definition unless the definition overrides them.

use crate::domain::names::ResourceGroupName;
use crate::domain::props::Props;
use crate::domain::repository::{EntityKind, Persistable, PersistedRow, RepositoryError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceGroup {
    pub uuid: Uuid,
    pub name: ResourceGroupName,
    pub description: Option<String>,
    pub place_count: Option<u32>,
    pub props: Props,
    pub created_at: DateTime<Utc>,
}

impl ResourceGroup {
    pub fn new(name: ResourceGroupName) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            name,
            description: None,
            place_count: None,
            props: Props::new(),
            created_at: Utc::now(),
        }
    }

    pub fn api_view(&self) -> ResourceGroupApi {
        ResourceGroupApi {
            uuid: self.uuid,
            name: self.name.to_string(),
            description: self.description.clone(),
            place_count: self.place_count,
            props: self.props.to_map(),
        }
    }
}

impl Persistable for ResourceGroup {
    fn collect_rows(&self, rows: &mut Vec<PersistedRow>) -> Result<(), RepositoryError> {
        rows.push(PersistedRow::encode(
            self.uuid,
            EntityKind::ResourceGroup,
            self.name.as_str(),
            0,
            &self.props,
            self,
            &[],
        )?);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceGroupApi {
    pub uuid: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub place_count: Option<u32>,
    pub props: BTreeMap<String, String>,
}
