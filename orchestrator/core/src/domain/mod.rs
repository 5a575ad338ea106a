// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Domain
//!
//! Entities, lifecycle flags, value objects and the contracts of external
//! collaborators (persistence, satellite transport, serialization).
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Pure model types; no I/O happens here

pub mod access;
pub mod api_rc;
pub mod connection;
pub mod controller_config;
pub mod errors;
pub mod events;
pub mod external_file;
pub mod flags;
pub mod lock_domain;
pub mod names;
pub mod node;
pub mod number_pool;
pub mod props;
pub mod remote;
pub mod repository;
pub mod resource;
pub mod resource_definition;
pub mod resource_group;
pub mod satellite;
pub mod schedule;
pub mod snapshot;
pub mod storage_pool;

use serde::{Serialize, Serializer};
use std::collections::BTreeMap;

/// Serializes a child map as a plain list of its values.
///
/// Child collections are keyed by composite or numeric keys that do not map
/// onto JSON object keys, so payloads carry them as arrays.
pub(crate) fn serialize_values<S, K, V>(map: &BTreeMap<K, V>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
    V: Serialize,
{
    serializer.collect_seq(map.values())
}
