// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # PostgreSQL Persistence Driver
//!
//! Production `PersistenceDriver` backed by two tables:
//!
//! - `stork_objects`: one row per entity, `UNIQUE (kind, key)`
//! - `stork_props`: the entity's properties, cascading on delete
//!
//! Every object store commit runs inside one database transaction, so either
//! all of its rows change or none do.

use crate::domain::repository::{
    EntityKind, PersistOp, PersistedRow, PersistenceDriver, RepositoryError,
};
use async_trait::async_trait;
use sqlx::postgres::PgPool;
use sqlx::{Postgres, Row, Transaction};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info};
use uuid::Uuid;

const CREATE_OBJECTS: &str = r#"
CREATE TABLE IF NOT EXISTS stork_objects (
    uuid        UUID PRIMARY KEY,
    kind        TEXT NOT NULL,
    key         TEXT NOT NULL,
    flags       BIGINT NOT NULL DEFAULT 0,
    data        JSONB NOT NULL,
    updated_at  TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    UNIQUE (kind, key)
)
"#;

const CREATE_PROPS: &str = r#"
CREATE TABLE IF NOT EXISTS stork_props (
    object_uuid UUID NOT NULL REFERENCES stork_objects(uuid) ON DELETE CASCADE,
    prop_key    TEXT NOT NULL,
    prop_value  TEXT NOT NULL,
    PRIMARY KEY (object_uuid, prop_key)
)
"#;

pub struct PostgresPersistence {
    pool: PgPool,
}

fn map_sqlx(context: &str, e: sqlx::Error) -> RepositoryError {
    if let sqlx::Error::Database(db) = &e {
        if db.is_unique_violation() {
            return RepositoryError::Constraint(format!("{}: {}", context, db));
        }
    }
    RepositoryError::Database(format!("{}: {}", context, e))
}

impl PostgresPersistence {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Creates the tables if they do not exist yet
    pub async fn ensure_schema(&self) -> Result<(), RepositoryError> {
        for statement in [CREATE_OBJECTS, CREATE_PROPS] {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx("Failed to create schema", e))?;
        }
        info!("PostgreSQL persistence schema ready");
        Ok(())
    }

    async fn upsert(
        tx: &mut Transaction<'_, Postgres>,
        row: &PersistedRow,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO stork_objects (uuid, kind, key, flags, data, updated_at)
            VALUES ($1, $2, $3, $4, $5, NOW())
            ON CONFLICT (uuid) DO UPDATE SET
                kind = EXCLUDED.kind,
                key = EXCLUDED.key,
                flags = EXCLUDED.flags,
                data = EXCLUDED.data,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(row.uuid)
        .bind(row.kind.as_str())
        .bind(&row.key)
        .bind(row.flags as i64)
        .bind(&row.data)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx(&format!("Failed to save {} '{}'", row.kind, row.key), e))?;

        sqlx::query("DELETE FROM stork_props WHERE object_uuid = $1")
            .bind(row.uuid)
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx("Failed to clear props", e))?;

        for (key, value) in &row.props {
            sqlx::query(
                "INSERT INTO stork_props (object_uuid, prop_key, prop_value) VALUES ($1, $2, $3)",
            )
            .bind(row.uuid)
            .bind(key)
            .bind(value)
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx("Failed to save prop", e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl PersistenceDriver for PostgresPersistence {
    async fn load_all(&self) -> Result<Vec<PersistedRow>, RepositoryError> {
        let prop_rows = sqlx::query("SELECT object_uuid, prop_key, prop_value FROM stork_props")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx("Failed to load props", e))?;

        let mut props: HashMap<Uuid, BTreeMap<String, String>> = HashMap::new();
        for row in prop_rows {
            let owner: Uuid = row.get("object_uuid");
            props
                .entry(owner)
                .or_default()
                .insert(row.get("prop_key"), row.get("prop_value"));
        }

        let object_rows = sqlx::query("SELECT uuid, kind, key, flags, data FROM stork_objects")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx("Failed to load objects", e))?;

        let mut rows = Vec::with_capacity(object_rows.len());
        for row in object_rows {
            let uuid: Uuid = row.get("uuid");
            let kind_str: String = row.get("kind");
            let kind = EntityKind::parse(&kind_str).ok_or_else(|| {
                RepositoryError::Serialization(format!("Unknown entity kind '{}'", kind_str))
            })?;
            let flags: i64 = row.get("flags");
            rows.push(PersistedRow {
                uuid,
                kind,
                key: row.get("key"),
                flags: flags as u64,
                props: props.remove(&uuid).unwrap_or_default(),
                data: row.get("data"),
            });
        }
        debug!(rows = rows.len(), "Loaded persisted objects");
        Ok(rows)
    }

    async fn commit(&self, ops: &[PersistOp]) -> Result<(), RepositoryError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx("Failed to begin transaction", e))?;

        for op in ops {
            match op {
                PersistOp::Delete { uuid, kind } => {
                    sqlx::query("DELETE FROM stork_objects WHERE uuid = $1")
                        .bind(uuid)
                        .execute(&mut *tx)
                        .await
                        .map_err(|e| map_sqlx(&format!("Failed to delete {} {}", kind, uuid), e))?;
                }
                PersistOp::Upsert(row) => Self::upsert(&mut tx, row).await?,
            }
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx("Failed to commit transaction", e))
    }
}
