// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! API Return Codes
//!
//! Every operation answers with batches of [`RcEntry`] values. The severity of
//! an entry is encoded in the two top bits of its [`ReturnCode`].
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Machine-readable results shared by handlers, the propagation
//!   engine and satellites

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReturnCode(pub u64);

pub const MASK_ERROR: u64 = 0xC000_0000_0000_0000;
pub const MASK_WARN: u64 = 0x8000_0000_0000_0000;
pub const MASK_INFO: u64 = 0x4000_0000_0000_0000;
const MASK_SEVERITY: u64 = 0xC000_0000_0000_0000;

const fn error(n: u64) -> ReturnCode {
    ReturnCode(MASK_ERROR | n)
}

const fn warn(n: u64) -> ReturnCode {
    ReturnCode(MASK_WARN | n)
}

const fn info(n: u64) -> ReturnCode {
    ReturnCode(MASK_INFO | n)
}

impl ReturnCode {
    // ========================================================================
    // Success
    // ========================================================================

    pub const CREATED: ReturnCode = ReturnCode(1);
    pub const MODIFIED: ReturnCode = ReturnCode(2);
    pub const DELETED: ReturnCode = ReturnCode(3);
    pub const UPDATED: ReturnCode = ReturnCode(4);

    // ========================================================================
    // Info
    // ========================================================================

    pub const INFO_TIE_BREAKER_CREATED: ReturnCode = info(1);
    pub const INFO_TIE_BREAKER_DELETING: ReturnCode = info(2);
    pub const INFO_TIE_BREAKER_TAKEOVER: ReturnCode = info(3);
    pub const INFO_NO_PENDING_WORK: ReturnCode = info(4);

    // ========================================================================
    // Warnings
    // ========================================================================

    pub const WARN_NOT_CONNECTED: ReturnCode = warn(1);
    pub const WARN_NOT_FOUND: ReturnCode = warn(2);
    pub const WARN_RSC_ALREADY_HAS_DISK: ReturnCode = warn(3);
    pub const WARN_RSC_ALREADY_DISKLESS: ReturnCode = warn(4);
    pub const WARN_NOT_ENOUGH_NODES_FOR_TIE_BREAKER: ReturnCode = warn(5);
    pub const WARN_DELETE_IN_PROGRESS: ReturnCode = warn(6);
    pub const WARN_EVACUATION_BLOCKED: ReturnCode = warn(7);

    // ========================================================================
    // Failures
    // ========================================================================

    pub const FAIL_INVLD_NAME: ReturnCode = error(10);
    pub const FAIL_INVLD_PROP: ReturnCode = error(11);
    pub const FAIL_INVLD_TCP_PORT: ReturnCode = error(12);
    pub const FAIL_INVLD_MINOR_NR: ReturnCode = error(13);
    pub const FAIL_INVLD_VLM_SIZE: ReturnCode = error(14);
    pub const FAIL_INVLD_EXT_FILE: ReturnCode = error(15);
    pub const FAIL_INVLD_BACKUP_CONFIG: ReturnCode = error(16);
    pub const FAIL_INVLD_SCHEDULE: ReturnCode = error(17);
    pub const FAIL_INVLD_REMOTE: ReturnCode = error(18);
    pub const FAIL_INVLD_SNAPSHOT_SHIPPING_TARGET: ReturnCode = error(19);

    pub const FAIL_NOT_FOUND_NODE: ReturnCode = error(100);
    pub const FAIL_NOT_FOUND_RSC_DFN: ReturnCode = error(101);
    pub const FAIL_NOT_FOUND_RSC: ReturnCode = error(102);
    pub const FAIL_NOT_FOUND_VLM_DFN: ReturnCode = error(103);
    pub const FAIL_NOT_FOUND_STOR_POOL_DFN: ReturnCode = error(104);
    pub const FAIL_NOT_FOUND_STOR_POOL: ReturnCode = error(105);
    pub const FAIL_NOT_FOUND_SNAPSHOT_DFN: ReturnCode = error(106);
    pub const FAIL_NOT_FOUND_REMOTE: ReturnCode = error(107);
    pub const FAIL_NOT_FOUND_SCHEDULE: ReturnCode = error(108);
    pub const FAIL_NOT_FOUND_EXT_FILE: ReturnCode = error(109);
    pub const FAIL_NOT_FOUND_RSC_GRP: ReturnCode = error(110);
    pub const FAIL_NOT_FOUND_NODE_CONN: ReturnCode = error(111);
    pub const FAIL_NOT_FOUND_RSC_CONN: ReturnCode = error(112);
    pub const FAIL_NOT_FOUND_VLM: ReturnCode = error(113);

    pub const FAIL_EXISTS_NODE: ReturnCode = error(200);
    pub const FAIL_EXISTS_RSC_DFN: ReturnCode = error(201);
    pub const FAIL_EXISTS_RSC: ReturnCode = error(202);
    pub const FAIL_EXISTS_VLM_DFN: ReturnCode = error(203);
    pub const FAIL_EXISTS_STOR_POOL_DFN: ReturnCode = error(204);
    pub const FAIL_EXISTS_STOR_POOL: ReturnCode = error(205);
    pub const FAIL_EXISTS_SNAPSHOT_DFN: ReturnCode = error(206);
    pub const FAIL_EXISTS_REMOTE: ReturnCode = error(207);
    pub const FAIL_EXISTS_SCHEDULE: ReturnCode = error(208);
    pub const FAIL_EXISTS_EXT_FILE: ReturnCode = error(209);
    pub const FAIL_EXISTS_RSC_GRP: ReturnCode = error(210);
    pub const FAIL_EXISTS_NODE_CONN: ReturnCode = error(211);
    pub const FAIL_EXISTS_RSC_CONN: ReturnCode = error(212);
    pub const FAIL_EXISTS_VLM: ReturnCode = error(213);
    pub const FAIL_EXISTS_SNAPSHOT_SHIPPING: ReturnCode = error(214);

    pub const FAIL_IN_USE: ReturnCode = error(300);
    pub const FAIL_RSC_BUSY: ReturnCode = error(301);
    pub const FAIL_INSUFFICIENT_REPLICA_COUNT: ReturnCode = error(302);
    pub const FAIL_NOT_ENOUGH_NODES: ReturnCode = error(303);
    pub const FAIL_NOT_ALL_UPTODATE: ReturnCode = error(304);
    pub const FAIL_NOT_CONNECTED: ReturnCode = error(305);
    pub const FAIL_SNAPSHOT_INCOMPLETE: ReturnCode = error(306);

    pub const FAIL_POOL_EXHAUSTED_TCP_PORT: ReturnCode = error(400);
    pub const FAIL_POOL_EXHAUSTED_MINOR_NR: ReturnCode = error(401);
    pub const FAIL_POOL_EXHAUSTED_SHIPPING_PORT: ReturnCode = error(402);

    pub const FAIL_SQL: ReturnCode = error(500);
    pub const FAIL_IMPL_ERROR: ReturnCode = error(501);
    pub const FAIL_SATELLITE: ReturnCode = error(502);

    pub const FAIL_ACC_DENIED_NODE: ReturnCode = error(600);
    pub const FAIL_ACC_DENIED_RSC_DFN: ReturnCode = error(601);
    pub const FAIL_ACC_DENIED_RSC: ReturnCode = error(602);
    pub const FAIL_ACC_DENIED_VLM_DFN: ReturnCode = error(603);
    pub const FAIL_ACC_DENIED_STOR_POOL_DFN: ReturnCode = error(604);
    pub const FAIL_ACC_DENIED_STOR_POOL: ReturnCode = error(605);
    pub const FAIL_ACC_DENIED_SNAPSHOT_DFN: ReturnCode = error(606);
    pub const FAIL_ACC_DENIED_REMOTE: ReturnCode = error(607);
    pub const FAIL_ACC_DENIED_SCHEDULE: ReturnCode = error(608);
    pub const FAIL_ACC_DENIED_EXT_FILE: ReturnCode = error(609);
    pub const FAIL_ACC_DENIED_RSC_GRP: ReturnCode = error(610);
    pub const FAIL_ACC_DENIED_CTRL_CFG: ReturnCode = error(611);
    pub const FAIL_ACC_DENIED_COMMAND: ReturnCode = error(612);

    pub fn is_error(self) -> bool {
        self.0 & MASK_SEVERITY == MASK_ERROR
    }

    pub fn is_warning(self) -> bool {
        self.0 & MASK_SEVERITY == MASK_WARN
    }

    pub fn is_info(self) -> bool {
        self.0 & MASK_SEVERITY == MASK_INFO
    }

    pub fn is_success(self) -> bool {
        self.0 & MASK_SEVERITY == 0
    }
}

impl fmt::Display for ReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let severity = if self.is_error() {
            "ERROR"
        } else if self.is_warning() {
            "WARN"
        } else if self.is_info() {
            "INFO"
        } else {
            "SUCCESS"
        };
        write!(f, "{}({})", severity, self.0 & !MASK_SEVERITY)
    }
}

/// One result entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RcEntry {
    pub code: ReturnCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correction: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    /// Structured references to the objects the entry is about (`Node` -> name)
    #[serde(default)]
    pub obj_refs: BTreeMap<String, String>,
}

impl RcEntry {
    pub fn new(code: ReturnCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            cause: None,
            correction: None,
            details: None,
            obj_refs: BTreeMap::new(),
        }
    }

    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    pub fn with_correction(mut self, correction: impl Into<String>) -> Self {
        self.correction = Some(correction.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_obj_ref(mut self, kind: impl Into<String>, name: impl Into<String>) -> Self {
        self.obj_refs.insert(kind.into(), name.into());
        self
    }
}

/// One batch of result entries
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiCallRc {
    pub entries: Vec<RcEntry>,
}

impl ApiCallRc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(entry: RcEntry) -> Self {
        Self {
            entries: vec![entry],
        }
    }

    pub fn push(&mut self, entry: RcEntry) {
        self.entries.push(entry);
    }

    pub fn extend(&mut self, other: ApiCallRc) {
        self.entries.extend(other.entries);
    }

    pub fn has_errors(&self) -> bool {
        self.entries.iter().any(|e| e.code.is_error())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn codes(&self) -> Vec<ReturnCode> {
        self.entries.iter().map(|e| e.code).collect()
    }

    pub fn contains(&self, code: ReturnCode) -> bool {
        self.entries.iter().any(|e| e.code == code)
    }
}

impl From<RcEntry> for ApiCallRc {
    fn from(entry: RcEntry) -> Self {
        Self::single(entry)
    }
}
