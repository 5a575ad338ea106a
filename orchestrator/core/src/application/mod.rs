// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Execution machinery
pub mod lock_manager;
pub mod scope_runner;
pub mod responses;
pub mod background;
pub mod satellite_updates;
pub mod connection_notifier;
pub mod context;
pub mod tie_breaker;

// API handlers
pub mod nodes;
pub mod resources;
pub mod resource_definitions;
pub mod volume_definitions;
pub mod storage_pools;
pub mod snapshots;
pub mod snapshot_shipping;
pub mod snapshot_restore;
pub mod backups;
pub mod remotes;
pub mod schedules;
pub mod external_files;
pub mod resource_groups;
pub mod connections;
pub mod controller_props;

pub mod controller;

// Re-export handlers for convenience
pub use context::ControllerContext;
pub use controller::Controller;
pub use responses::ApiResponse;
