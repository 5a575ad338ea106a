// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Operation Errors
//!
//! Single error taxonomy every operation funnels into. Module-level errors
//! (names, props, flags, pools, persistence) convert into [`ApiError`] so
//! handlers can use `?` throughout.
//!
//! | Variant | Meaning | Reported as |
//! |---------|---------|-------------|
//! | `Rc` | expected negative result | final batch, no retry |
//! | `AccessDenied` | authorization failure | per-entity code |
//! | `Persistence` | storage failure | `FAIL_SQL`, safe to retry |
//! | `Delayed` | satellites have not acknowledged yet | swallowed, resumed later |
//! | `Implementation` | broken internal assumption | logged, generic error |

use crate::domain::api_rc::{ApiCallRc, RcEntry, ReturnCode};
use crate::domain::flags::FlagError;
use crate::domain::names::{NameError, NodeName};
use crate::domain::number_pool::{PoolError, PoolKind};
use crate::domain::props::PropsError;
use crate::domain::repository::RepositoryError;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum ApiError {
    #[error("{}", first_message(.0))]
    Rc(ApiCallRc),

    #[error("access denied: {action}")]
    AccessDenied { action: String, code: ReturnCode },

    #[error("persistence failure: {0}")]
    Persistence(String),

    #[error("satellites have not acknowledged yet: {}", join_nodes(.0))]
    Delayed(Vec<NodeName>),

    #[error("implementation error: {0}")]
    Implementation(String),
}

fn first_message(rc: &ApiCallRc) -> &str {
    rc.entries
        .first()
        .map(|e| e.message.as_str())
        .unwrap_or("operation failed")
}

fn join_nodes(nodes: &[NodeName]) -> String {
    nodes
        .iter()
        .map(NodeName::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

impl ApiError {
    pub fn rc(code: ReturnCode, message: impl Into<String>) -> Self {
        Self::Rc(ApiCallRc::single(RcEntry::new(code, message)))
    }

    pub fn entry(entry: RcEntry) -> Self {
        Self::Rc(ApiCallRc::single(entry))
    }

    pub fn implementation(message: impl Into<String>) -> Self {
        Self::Implementation(message.into())
    }

    pub fn is_delayed(&self) -> bool {
        matches!(self, Self::Delayed(_))
    }

    /// Return code of the first entry, or the code this error is reported with
    pub fn code(&self) -> ReturnCode {
        match self {
            Self::Rc(rc) => rc
                .entries
                .first()
                .map(|e| e.code)
                .unwrap_or(ReturnCode::FAIL_IMPL_ERROR),
            Self::AccessDenied { code, .. } => *code,
            Self::Persistence(_) => ReturnCode::FAIL_SQL,
            Self::Delayed(_) => ReturnCode::WARN_NOT_CONNECTED,
            Self::Implementation(_) => ReturnCode::FAIL_IMPL_ERROR,
        }
    }
}

impl From<NameError> for ApiError {
    fn from(err: NameError) -> Self {
        let code = match err {
            NameError::InvalidPath(_) => ReturnCode::FAIL_INVLD_EXT_FILE,
            _ => ReturnCode::FAIL_INVLD_NAME,
        };
        Self::rc(code, err.to_string())
    }
}

impl From<PropsError> for ApiError {
    fn from(err: PropsError) -> Self {
        Self::rc(ReturnCode::FAIL_INVLD_PROP, err.to_string())
    }
}

impl From<FlagError> for ApiError {
    fn from(err: FlagError) -> Self {
        Self::Implementation(format!("illegal flag transition: {}", err))
    }
}

impl From<RepositoryError> for ApiError {
    fn from(err: RepositoryError) -> Self {
        Self::Persistence(err.to_string())
    }
}

impl From<PoolError> for ApiError {
    fn from(err: PoolError) -> Self {
        match &err {
            PoolError::Exhausted { kind } => {
                let code = match kind {
                    PoolKind::TcpPort => ReturnCode::FAIL_POOL_EXHAUSTED_TCP_PORT,
                    PoolKind::MinorNumber => ReturnCode::FAIL_POOL_EXHAUSTED_MINOR_NR,
                    PoolKind::ShippingPort => ReturnCode::FAIL_POOL_EXHAUSTED_SHIPPING_PORT,
                };
                Self::entry(
                    RcEntry::new(code, err.to_string())
                        .with_correction("Delete unused objects or widen the configured range"),
                )
            }
            PoolError::OutOfRange { kind, .. } | PoolError::AlreadyAllocated { kind, .. } => {
                match kind {
                    PoolKind::TcpPort => Self::rc(ReturnCode::FAIL_INVLD_TCP_PORT, err.to_string()),
                    PoolKind::MinorNumber => {
                        Self::rc(ReturnCode::FAIL_INVLD_MINOR_NR, err.to_string())
                    }
                    PoolKind::ShippingPort => Self::Implementation(err.to_string()),
                }
            }
            PoolError::NotAllocated { .. } => Self::Implementation(err.to_string()),
        }
    }
}
