// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Lock Domains
//!
//! Named lock domains and their fixed global order. The derived `Ord` of
//! [`LockObj`] is the acquisition order; every multi-domain request is sorted
//! by it, which is what keeps concurrent operations deadlock free.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LockObj {
    Nodes,
    ResourceDefinitions,
    StorPoolDefinitions,
    Remotes,
    Schedules,
    ExternalFiles,
    ResourceGroups,
    CtrlConfig,
}

impl LockObj {
    pub const ALL: [LockObj; 8] = [
        LockObj::Nodes,
        LockObj::ResourceDefinitions,
        LockObj::StorPoolDefinitions,
        LockObj::Remotes,
        LockObj::Schedules,
        LockObj::ExternalFiles,
        LockObj::ResourceGroups,
        LockObj::CtrlConfig,
    ];

    /// Position in the global order, also the index into [`LockObj::ALL`]
    pub const fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LockObj::Nodes => "NODES",
            LockObj::ResourceDefinitions => "RESOURCE_DEFINITIONS",
            LockObj::StorPoolDefinitions => "STOR_POOL_DEFINITIONS",
            LockObj::Remotes => "REMOTES",
            LockObj::Schedules => "SCHEDULES",
            LockObj::ExternalFiles => "EXTERNAL_FILES",
            LockObj::ResourceGroups => "RESOURCE_GROUPS",
            LockObj::CtrlConfig => "CTRL_CONFIG",
        }
    }
}

impl fmt::Display for LockObj {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum LockMode {
    Read,
    Write,
}

/// Set of domains one operation wants, each with its mode.
///
/// Requesting the same domain twice keeps the stronger mode.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockRequest {
    domains: BTreeMap<LockObj, LockMode>,
}

impl LockRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(mut self, objs: &[LockObj]) -> Self {
        for obj in objs {
            self.domains.entry(*obj).or_insert(LockMode::Read);
        }
        self
    }

    pub fn write(mut self, objs: &[LockObj]) -> Self {
        for obj in objs {
            self.domains.insert(*obj, LockMode::Write);
        }
        self
    }

    pub fn all(mode: LockMode, objs: &[LockObj]) -> Self {
        match mode {
            LockMode::Read => Self::new().read(objs),
            LockMode::Write => Self::new().write(objs),
        }
    }

    /// Domains in acquisition order
    pub fn iter(&self) -> impl Iterator<Item = (LockObj, LockMode)> + '_ {
        self.domains.iter().map(|(obj, mode)| (*obj, *mode))
    }

    pub fn mode(&self, obj: LockObj) -> Option<LockMode> {
        self.domains.get(&obj).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    pub fn len(&self) -> usize {
        self.domains.len()
    }
}

impl fmt::Display for LockRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .iter()
            .map(|(obj, mode)| match mode {
                LockMode::Read => format!("{}:r", obj),
                LockMode::Write => format!("{}:w", obj),
            })
            .collect();
        write!(f, "[{}]", parts.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_order() {
        let mut objs = vec![LockObj::CtrlConfig, LockObj::Nodes, LockObj::Remotes];
        objs.sort();
        assert_eq!(objs, vec![LockObj::Nodes, LockObj::Remotes, LockObj::CtrlConfig]);
        assert!(LockObj::ALL.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_index_matches_position() {
        for (pos, obj) in LockObj::ALL.iter().enumerate() {
            assert_eq!(obj.index(), pos);
        }
    }

    #[test]
    fn test_write_wins_regardless_of_order() {
        let a = LockRequest::new()
            .read(&[LockObj::Nodes])
            .write(&[LockObj::Nodes]);
        let b = LockRequest::new()
            .write(&[LockObj::Nodes])
            .read(&[LockObj::Nodes]);
        assert_eq!(a.mode(LockObj::Nodes), Some(LockMode::Write));
        assert_eq!(a, b);
    }

    #[test]
    fn test_iteration_is_sorted() {
        let req = LockRequest::new()
            .write(&[LockObj::ResourceGroups])
            .read(&[LockObj::ResourceDefinitions, LockObj::Nodes]);
        let order: Vec<LockObj> = req.iter().map(|(o, _)| o).collect();
        assert_eq!(
            order,
            vec![LockObj::Nodes, LockObj::ResourceDefinitions, LockObj::ResourceGroups]
        );
        assert_eq!(
            req.to_string(),
            "[NODES:r, RESOURCE_DEFINITIONS:r, RESOURCE_GROUPS:w]"
        );
    }
}
