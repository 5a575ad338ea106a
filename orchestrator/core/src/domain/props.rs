// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Property container
//!
//! Namespaced key/value properties attached to every entity. Keys are
//! slash-separated paths (`DrbdOptions/Net/protocol`); a namespace is any key
//! prefix ending at a separator.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

pub const PATH_SEPARATOR: char = '/';
pub const MAX_KEY_LENGTH: usize = 256;
pub const MAX_VALUE_LENGTH: usize = 4096;

/// Well-known property keys
pub mod keys {
    pub const AUTO_ADD_QUORUM_TIEBREAKER: &str = "DrbdOptions/auto-add-quorum-tiebreaker";
    pub const BACKUP_TARGET_REMOTE: &str = "Backup/TargetRemote";
    pub const BACKUP_SOURCE_NODE: &str = "Backup/SourceNode";
    pub const SHIPPING_PORT: &str = "Shipping/Port";
    pub const SHIPPING_SOURCE_NODE: &str = "SnapshotShipping/SourceNode";
    pub const SHIPPING_TARGET_NODE: &str = "SnapshotShipping/TargetNode";
    pub const SHIPPING_NEXT_ID: &str = "SnapshotShipping/NextId";
    pub const RESTORE_FROM_RESOURCE: &str = "Restore/FromResource";
    pub const RESTORE_FROM_SNAPSHOT: &str = "Restore/FromSnapshot";
    pub const ROLLBACK_TARGET: &str = "Rollback/Target";
    pub const STOR_POOL_NAME: &str = "StorPoolName";
    pub const EXT_FILES_NAMESPACE: &str = "files";
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PropsError {
    #[error("invalid property key '{0}'")]
    InvalidKey(String),

    #[error("invalid value for property '{key}': {reason}")]
    InvalidValue { key: String, reason: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Props {
    entries: BTreeMap<String, String>,
}

fn check_key(key: &str) -> Result<(), PropsError> {
    let valid = !key.is_empty()
        && key.len() <= MAX_KEY_LENGTH
        && key.split(PATH_SEPARATOR).all(|seg| {
            !seg.is_empty()
                && seg
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'))
        });
    if valid {
        Ok(())
    } else {
        Err(PropsError::InvalidKey(key.to_string()))
    }
}

fn check_value(key: &str, value: &str) -> Result<(), PropsError> {
    if value.len() > MAX_VALUE_LENGTH {
        return Err(PropsError::InvalidValue {
            key: key.to_string(),
            reason: format!("longer than {} bytes", MAX_VALUE_LENGTH),
        });
    }
    if value.contains('\0') {
        return Err(PropsError::InvalidValue {
            key: key.to_string(),
            reason: "contains a NUL character".to_string(),
        });
    }
    Ok(())
}

fn namespace_prefix(namespace: &str) -> String {
    let trimmed = namespace.trim_end_matches(PATH_SEPARATOR);
    format!("{}{}", trimmed, PATH_SEPARATOR)
}

impl Props {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a container from unchecked pairs, validating each one
    pub fn from_pairs<I, K, V>(pairs: I) -> Result<Self, PropsError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut props = Self::new();
        for (key, value) in pairs {
            props.set(key, value)?;
        }
        Ok(props)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(|v| match v.to_ascii_lowercase().as_str() {
            "true" | "yes" | "1" => Some(true),
            "false" | "no" | "0" => Some(false),
            _ => None,
        })
    }

    /// Sets a property and returns the previous value
    pub fn set(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<Option<String>, PropsError> {
        let key = key.into();
        let value = value.into();
        check_key(&key)?;
        check_value(&key, &value)?;
        Ok(self.entries.insert(key, value))
    }

    pub fn remove(&mut self, key: &str) -> Result<Option<String>, PropsError> {
        check_key(key)?;
        Ok(self.entries.remove(key))
    }

    /// Removes every key below `namespace` and returns how many were removed
    pub fn remove_namespace(&mut self, namespace: &str) -> usize {
        let prefix = namespace_prefix(namespace);
        let before = self.entries.len();
        self.entries.retain(|k, _| !k.starts_with(&prefix));
        before - self.entries.len()
    }

    /// Entries below `namespace`, keyed relative to it
    pub fn namespace(&self, namespace: &str) -> BTreeMap<String, String> {
        let prefix = namespace_prefix(namespace);
        self.entries
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .map(|(k, v)| (k[prefix.len()..].to_string(), v.clone()))
            .collect()
    }

    /// Copies every entry below `namespace` from `other`, overwriting existing keys
    pub fn copy_namespace_from(&mut self, other: &Props, namespace: &str) {
        let prefix = namespace_prefix(namespace);
        for (k, v) in other.entries.iter().filter(|(k, _)| k.starts_with(&prefix)) {
            self.entries.insert(k.clone(), v.clone());
        }
    }

    /// Applies a batch of changes atomically: either all are valid or none is applied
    pub fn apply_changes(
        &mut self,
        set: &BTreeMap<String, String>,
        delete: &[String],
        delete_namespaces: &[String],
    ) -> Result<bool, PropsError> {
        let mut next = self.clone();
        for key in delete {
            next.remove(key)?;
        }
        for namespace in delete_namespaces {
            next.remove_namespace(namespace);
        }
        for (key, value) in set {
            next.set(key.clone(), value.clone())?;
        }
        let changed = next != *self;
        *self = next;
        Ok(changed)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_map(&self) -> BTreeMap<String, String> {
        self.entries.clone()
    }
}

/// Property changes requested by one modify call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropsChange {
    #[serde(default)]
    pub set: BTreeMap<String, String>,
    #[serde(default)]
    pub delete: Vec<String>,
    #[serde(default)]
    pub delete_namespaces: Vec<String>,
}

impl PropsChange {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set.insert(key.into(), value.into());
        self
    }

    pub fn delete(mut self, key: impl Into<String>) -> Self {
        self.delete.push(key.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.delete.is_empty() && self.delete_namespaces.is_empty()
    }

    /// Applies every change or none; returns whether anything changed
    pub fn apply_to(&self, props: &mut Props) -> Result<bool, PropsError> {
        props.apply_changes(&self.set, &self.delete, &self.delete_namespaces)
    }
}

/// Looks a key up through a chain of containers, most specific first
pub fn lookup<'a>(chain: &[&'a Props], key: &str) -> Option<&'a str> {
    chain.iter().find_map(|props| props.get(key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_remove() {
        let mut props = Props::new();
        assert_eq!(props.set("DrbdOptions/Net/protocol", "C").unwrap(), None);
        assert_eq!(props.get("DrbdOptions/Net/protocol"), Some("C"));
        assert_eq!(
            props.remove("DrbdOptions/Net/protocol").unwrap(),
            Some("C".to_string())
        );
        assert!(props.is_empty());
    }

    #[test]
    fn test_invalid_key_and_value() {
        let mut props = Props::new();
        assert!(matches!(props.set("", "x"), Err(PropsError::InvalidKey(_))));
        assert!(matches!(props.set("a//b", "x"), Err(PropsError::InvalidKey(_))));
        assert!(matches!(props.set("a/b c", "x"), Err(PropsError::InvalidKey(_))));
        assert!(matches!(
            props.set("a", "x".repeat(MAX_VALUE_LENGTH + 1)),
            Err(PropsError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_namespaces() {
        let mut props = Props::from_pairs([
            ("files/etc/a.conf", "True"),
            ("files/etc/b.conf", "True"),
            ("filesystem", "xfs"),
        ])
        .unwrap();
        let files = props.namespace("files");
        assert_eq!(files.len(), 2);
        assert!(files.contains_key("etc/a.conf"));

        let mut other = Props::new();
        other.copy_namespace_from(&props, "files/");
        assert_eq!(other.len(), 2);

        assert_eq!(props.remove_namespace("files"), 2);
        assert_eq!(props.get("filesystem"), Some("xfs"));
    }

    #[test]
    fn test_apply_changes_is_atomic() {
        let mut props = Props::from_pairs([("a", "1")]).unwrap();
        let mut set = BTreeMap::new();
        set.insert("b".to_string(), "2".to_string());
        set.insert("bad key".to_string(), "3".to_string());
        assert!(props.apply_changes(&set, &[], &[]).is_err());
        assert_eq!(props.len(), 1);

        set.remove("bad key");
        assert!(props.apply_changes(&set, &["a".to_string()], &[]).unwrap());
        assert_eq!(props.get("b"), Some("2"));
        assert_eq!(props.get("a"), None);
    }

    #[test]
    fn test_lookup_chain() {
        let rsc_dfn = Props::from_pairs([("k", "dfn")]).unwrap();
        let ctrl = Props::from_pairs([("k", "ctrl"), ("other", "x")]).unwrap();
        assert_eq!(lookup(&[&rsc_dfn, &ctrl], "k"), Some("dfn"));
        assert_eq!(lookup(&[&rsc_dfn, &ctrl], "other"), Some("x"));
        assert_eq!(lookup(&[&rsc_dfn], "missing"), None);
    }
}
