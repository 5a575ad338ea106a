// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Access Control
//!
//! The acting principal is an explicit argument of every operation. Internal
//! callbacks run as [`Principal::System`].

use crate::domain::api_rc::ReturnCode;
use crate::domain::errors::ApiError;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessType {
    View,
    Use,
    Change,
    Control,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Operator,
    Viewer,
}

impl Role {
    fn max_access(self) -> AccessType {
        match self {
            Role::Admin => AccessType::Control,
            Role::Operator => AccessType::Change,
            Role::Viewer => AccessType::View,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Principal {
    User { name: String, role: Role },
    System,
}

impl Principal {
    pub fn user(name: impl Into<String>, role: Role) -> Self {
        Self::User {
            name: name.into(),
            role,
        }
    }

    pub fn admin(name: impl Into<String>) -> Self {
        Self::user(name, Role::Admin)
    }

    pub fn is_system(&self) -> bool {
        matches!(self, Self::System)
    }

    pub fn has_access(&self, access: AccessType) -> bool {
        match self {
            Self::System => true,
            Self::User { role, .. } => access <= role.max_access(),
        }
    }

    /// Fails with `code` unless the principal holds `access`
    pub fn require(
        &self,
        access: AccessType,
        code: ReturnCode,
        action: impl Into<String>,
    ) -> Result<(), ApiError> {
        if self.has_access(access) {
            Ok(())
        } else {
            Err(ApiError::AccessDenied {
                action: format!("{} ({:?} access required, principal {})", action.into(), access, self),
                code,
            })
        }
    }

    /// Fails unless the call originates from the controller itself
    pub fn require_system(&self, code: ReturnCode, action: impl Into<String>) -> Result<(), ApiError> {
        if self.is_system() {
            Ok(())
        } else {
            Err(ApiError::AccessDenied {
                action: format!("{} is reserved for the system context (principal {})", action.into(), self),
                code,
            })
        }
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::System => f.write_str("SYSTEM"),
            Self::User { name, .. } => f.write_str(name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_ladder() {
        let viewer = Principal::user("v", Role::Viewer);
        let operator = Principal::user("o", Role::Operator);
        assert!(viewer.has_access(AccessType::View));
        assert!(!viewer.has_access(AccessType::Change));
        assert!(operator.has_access(AccessType::Change));
        assert!(!operator.has_access(AccessType::Control));
        assert!(Principal::admin("a").has_access(AccessType::Control));
        assert!(Principal::System.has_access(AccessType::Control));
    }

    #[test]
    fn test_require_carries_code() {
        let viewer = Principal::user("v", Role::Viewer);
        match viewer.require(AccessType::Change, ReturnCode::FAIL_ACC_DENIED_NODE, "delete node") {
            Err(ApiError::AccessDenied { code, .. }) => {
                assert_eq!(code, ReturnCode::FAIL_ACC_DENIED_NODE)
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_require_system() {
        assert!(Principal::System
            .require_system(ReturnCode::FAIL_ACC_DENIED_SNAPSHOT_DFN, "shipping finished")
            .is_ok());
        assert!(Principal::admin("root")
            .require_system(ReturnCode::FAIL_ACC_DENIED_SNAPSHOT_DFN, "shipping finished")
            .is_err());
    }
}
