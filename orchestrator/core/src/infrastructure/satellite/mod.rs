// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Satellite Infrastructure
//!
//! - [`SatelliteRegistry`]: owner of every peer connection and the last state
//!   each satellite reported
//! - [`MockSatellite`]: in-process peer with scripted answers, used by tests
//!   and by controllers started without a transport
//! - [`JsonStateSerializer`]: default update body encoding

pub mod mock;
pub mod registry;
pub mod serializer;

pub use mock::{MockBehavior, MockSatellite};
pub use registry::SatelliteRegistry;
pub use serializer::JsonStateSerializer;
