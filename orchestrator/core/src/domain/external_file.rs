// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! External Files
//!
//! Files the controller distributes to satellites (for example DRBD include
//! snippets). A resource definition references a file through a property
//! under the `files/` namespace keyed by the file's path.

use crate::domain::flags::{DeleteFlag, StateFlags};
use crate::domain::names::ExternalFileName;
use crate::domain::props::{keys, Props};
use crate::domain::repository::{EntityKind, Persistable, PersistedRow, RepositoryError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

pub const MAX_CONTENT_LENGTH: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalFile {
    pub uuid: Uuid,
    pub name: ExternalFileName,
    pub content: String,
    pub flags: StateFlags<DeleteFlag>,
    pub props: Props,
}

impl ExternalFile {
    pub fn new(name: ExternalFileName, content: String) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            name,
            content,
            flags: StateFlags::empty(),
            props: Props::new(),
        }
    }

    pub fn is_deleting(&self) -> bool {
        self.flags.is_set(DeleteFlag::Delete)
    }

    /// Property key a resource definition uses to reference this file
    pub fn reference_key(&self) -> String {
        reference_key(&self.name)
    }

    pub fn api_view(&self) -> ExternalFileApi {
        ExternalFileApi {
            uuid: self.uuid,
            path: self.name.to_string(),
            size: self.content.len(),
            flags: self.flags.names(),
        }
    }
}

pub fn reference_key(name: &ExternalFileName) -> String {
    format!("{}{}", keys::EXT_FILES_NAMESPACE, name.as_str())
}

impl Persistable for ExternalFile {
    fn collect_rows(&self, rows: &mut Vec<PersistedRow>) -> Result<(), RepositoryError> {
        rows.push(PersistedRow::encode(
            self.uuid,
            EntityKind::ExternalFile,
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
pub struct ExternalFileApi {
    pub uuid: Uuid,
    pub path: String,
    pub size: usize,
    pub flags: Vec<String>,
}

/// Paths of every external file `props` references
pub fn referenced_files(props: &Props) -> BTreeMap<String, String> {
    props
        .namespace(keys::EXT_FILES_NAMESPACE)
        .into_iter()
        .map(|(k, v)| (format!("/{}", k), v))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_key_round_trip() {
        let file = ExternalFile::new(
            ExternalFileName::new("/etc/drbd.d/extra.res").unwrap(),
            "options {}".into(),
        );
        assert_eq!(file.reference_key(), "files/etc/drbd.d/extra.res");

        let mut props = Props::new();
        props.set(file.reference_key(), "True").unwrap();
        let refs = referenced_files(&props);
        assert!(refs.contains_key("/etc/drbd.d/extra.res"));
    }
}
