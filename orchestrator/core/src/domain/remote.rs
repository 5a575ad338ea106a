// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Remotes
//!
//! Backup targets: S3 buckets or other controllers. Satellites need to know
//! every remote, so remote changes are propagated to all nodes.

use crate::domain::flags::{lifecycle_flags, StateFlags};
use crate::domain::names::RemoteName;
use crate::domain::props::Props;
use crate::domain::repository::{EntityKind, Persistable, PersistedRow, RepositoryError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

lifecycle_flags! {
    pub enum RemoteFlag {
        Delete(0) "DELETE" requires [] forbids [] sticky true,
        S3UsePathStyle(1) "S3_USE_PATH_STYLE" requires [] forbids [] sticky false,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RemoteKind {
    S3 {
        endpoint: String,
        bucket: String,
        region: String,
    },
    Controller {
        url: String,
    },
}

impl RemoteKind {
    /// Basic shape check of the remote's address fields
    pub fn validate(&self) -> Result<(), String> {
        match self {
            RemoteKind::S3 {
                endpoint,
                bucket,
                region,
            } => {
                if endpoint.trim().is_empty() {
                    return Err("S3 endpoint must not be empty".to_string());
                }
                if bucket.len() < 3 || bucket.len() > 63 {
                    return Err(format!("S3 bucket name '{}' must be 3-63 characters", bucket));
                }
                if region.trim().is_empty() {
                    return Err("S3 region must not be empty".to_string());
                }
                Ok(())
            }
            RemoteKind::Controller { url } => {
                if url.starts_with("http://") || url.starts_with("https://") {
                    Ok(())
                } else {
                    Err(format!("controller URL '{}' must use http or https", url))
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Remote {
    pub uuid: Uuid,
    pub name: RemoteName,
    pub kind: RemoteKind,
    pub flags: StateFlags<RemoteFlag>,
    pub props: Props,
}

impl Remote {
    pub fn new(name: RemoteName, kind: RemoteKind) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            name,
            kind,
            flags: StateFlags::empty(),
            props: Props::new(),
        }
    }

    pub fn is_deleting(&self) -> bool {
        self.flags.is_set(RemoteFlag::Delete)
    }

    pub fn api_view(&self) -> RemoteApi {
        RemoteApi {
            uuid: self.uuid,
            name: self.name.to_string(),
            kind: self.kind.clone(),
            flags: self.flags.names(),
            props: self.props.to_map(),
        }
    }
}

impl Persistable for Remote {
    fn collect_rows(&self, rows: &mut Vec<PersistedRow>) -> Result<(), RepositoryError> {
        rows.push(PersistedRow::encode(
            self.uuid,
            EntityKind::Remote,
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
pub struct RemoteApi {
    pub uuid: Uuid,
    pub name: String,
    pub kind: RemoteKind,
    pub flags: Vec<String>,
    pub props: BTreeMap<String, String>,
}
