// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Command implementations for stork CLI

pub mod config;
pub mod controller;

pub use self::config::ConfigCommand;
pub use self::controller::ControllerCommand;
