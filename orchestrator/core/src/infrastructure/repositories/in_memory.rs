// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use crate::domain::repository::{PersistOp, PersistedRow, PersistenceDriver, RepositoryError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Default)]
struct InMemoryState {
    rows: HashMap<Uuid, PersistedRow>,
    commits: Vec<Vec<PersistOp>>,
    fail_next: Option<String>,
}

/// Row storage in process memory.
///
/// Every successful commit is recorded so callers can assert on exactly what
/// reached persistence.
#[derive(Default)]
pub struct InMemoryPersistence {
    state: Mutex<InMemoryState>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next commit fails with a database error and writes nothing
    pub fn fail_next_commit(&self, reason: impl Into<String>) {
        self.state.lock().fail_next = Some(reason.into());
    }

    pub fn row_count(&self) -> usize {
        self.state.lock().rows.len()
    }

    pub fn rows(&self) -> Vec<PersistedRow> {
        let mut rows: Vec<PersistedRow> = self.state.lock().rows.values().cloned().collect();
        rows.sort_by(|a, b| a.kind.cmp(&b.kind).then_with(|| a.key.cmp(&b.key)));
        rows
    }

    /// Operations of every successful commit, oldest first
    pub fn commits(&self) -> Vec<Vec<PersistOp>> {
        self.state.lock().commits.clone()
    }

    pub fn commit_count(&self) -> usize {
        self.state.lock().commits.len()
    }
}

#[async_trait]
impl PersistenceDriver for InMemoryPersistence {
    async fn load_all(&self) -> Result<Vec<PersistedRow>, RepositoryError> {
        Ok(self.state.lock().rows.values().cloned().collect())
    }

    async fn commit(&self, ops: &[PersistOp]) -> Result<(), RepositoryError> {
        let mut state = self.state.lock();
        if let Some(reason) = state.fail_next.take() {
            return Err(RepositoryError::Database(reason));
        }

        let mut rows = state.rows.clone();
        for op in ops {
            match op {
                PersistOp::Delete { uuid, .. } => {
                    rows.remove(uuid);
                }
                PersistOp::Upsert(row) => {
                    if let Some(clash) = rows
                        .values()
                        .find(|r| r.kind == row.kind && r.key == row.key && r.uuid != row.uuid)
                    {
                        return Err(RepositoryError::Constraint(format!(
                            "{} '{}' already stored as {}",
                            row.kind, row.key, clash.uuid
                        )));
                    }
                    rows.insert(row.uuid, row.clone());
                }
            }
        }

        state.rows = rows;
        state.commits.push(ops.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::repository::EntityKind;
    use std::collections::BTreeMap;

    fn row(kind: EntityKind, key: &str) -> PersistedRow {
        PersistedRow {
            uuid: Uuid::new_v4(),
            kind,
            key: key.to_string(),
            flags: 0,
            props: BTreeMap::new(),
            data: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn test_commit_is_all_or_nothing() {
        let driver = InMemoryPersistence::new();
        driver
            .commit(&[PersistOp::Upsert(row(EntityKind::Node, "alpha"))])
            .await
            .unwrap();

        let result = driver
            .commit(&[
                PersistOp::Upsert(row(EntityKind::Node, "beta")),
                PersistOp::Upsert(row(EntityKind::Node, "alpha")),
            ])
            .await;
        assert!(matches!(result, Err(RepositoryError::Constraint(_))));
        assert_eq!(driver.row_count(), 1);
        assert_eq!(driver.commit_count(), 1);
    }

    #[tokio::test]
    async fn test_injected_failure_applies_once() {
        let driver = InMemoryPersistence::new();
        driver.fail_next_commit("disk full");
        let op = PersistOp::Upsert(row(EntityKind::Remote, "s3"));
        assert!(driver.commit(std::slice::from_ref(&op)).await.is_err());
        driver.commit(&[op]).await.unwrap();
        assert_eq!(driver.load_all().await.unwrap().len(), 1);
    }
}
