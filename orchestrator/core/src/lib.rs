// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Stork Core
//!
//! Mutation-and-propagation core of the stork storage orchestrator controller.
//!
//! # Architecture
//!
//! - **Layer:** Core System
//! - **Purpose:** Domain model, lock-ordered transactional scopes, satellite
//!   propagation and resumption for every configuration change

pub mod domain;
pub mod application;
pub mod infrastructure;

pub use domain::*;
