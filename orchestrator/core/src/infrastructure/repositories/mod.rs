// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Persistence Drivers
//!
//! Implementations of the domain [`PersistenceDriver`] contract.
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure
//! - **Purpose:** Durable storage of object store rows
//! - **Pattern:** Repository (DDD), Adapter (Hexagonal Architecture)
//!
//! # Available Implementations
//!
//! - **InMemoryPersistence** - process memory; records every commit and can
//!   be told to fail, which tests use to exercise rollback
//! - **PostgresPersistence** - `stork_objects` and `stork_props` tables,
//!   one database transaction per object store commit
//!
//! Both enforce the `(kind, key)` uniqueness the object store relies on.
//!
//! [`PersistenceDriver`]: crate::domain::repository::PersistenceDriver

pub mod in_memory;
pub mod postgres;

pub use in_memory::InMemoryPersistence;
pub use postgres::PostgresPersistence;
