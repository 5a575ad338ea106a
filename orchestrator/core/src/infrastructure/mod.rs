// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Infrastructure
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure Layer
//! - **Purpose:** State ownership and adapters: the object store, number
//!   pools, event bus, satellite registry and persistence drivers

pub mod db;
pub mod event_bus;
pub mod number_pools;
pub mod object_store;
pub mod repositories;
pub mod satellite;

pub use event_bus::{DomainEvent, EventBus};
pub use number_pools::NumberPools;
pub use object_store::{ObjectStore, StoreState, Transaction};
pub use satellite::{JsonStateSerializer, MockSatellite, SatelliteRegistry};
