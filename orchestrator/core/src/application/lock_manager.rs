// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Lock Manager
//!
//! One async read/write lock per [`LockObj`]. Every acquisition goes through
//! [`LockManager::acquire`], which takes the requested domains strictly in
//! the global order of `LockObj`, no matter in which order they were named.
//! The returned [`LockSet`] releases them in reverse order when dropped.
//!
//! Extending an already held set is only allowed with domains that sort after
//! every held domain; anything else could wait on a lock while holding a
//! later one and is reported as a [`LockError`].

use crate::domain::lock_domain::{LockMode, LockObj, LockRequest};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::trace;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
    #[error("{requested} requested while holding {held}, which sorts after it")]
    OutOfOrder { requested: LockObj, held: LockObj },

    #[error("{0} is held for reading and cannot be upgraded to writing")]
    Upgrade(LockObj),
}

enum HeldGuard {
    Read(#[allow(dead_code)] OwnedRwLockReadGuard<()>),
    Write(#[allow(dead_code)] OwnedRwLockWriteGuard<()>),
}

impl HeldGuard {
    fn mode(&self) -> LockMode {
        match self {
            HeldGuard::Read(_) => LockMode::Read,
            HeldGuard::Write(_) => LockMode::Write,
        }
    }
}

/// Guards taken by one acquisition, in acquisition order
pub struct LockSet {
    guards: Vec<(LockObj, HeldGuard)>,
}

impl LockSet {
    pub fn mode(&self, obj: LockObj) -> Option<LockMode> {
        self.guards
            .iter()
            .find(|(held, _)| *held == obj)
            .map(|(_, guard)| guard.mode())
    }

    /// Held domains with their modes, in acquisition order
    pub fn held(&self) -> Vec<(LockObj, LockMode)> {
        self.guards.iter().map(|(obj, g)| (*obj, g.mode())).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.guards.is_empty()
    }

    /// Highest held domain in the global order
    pub fn last(&self) -> Option<LockObj> {
        self.guards.last().map(|(obj, _)| *obj)
    }

    /// Adopts guards acquired later; they must sort after every held one
    pub fn append(&mut self, mut other: LockSet) {
        self.guards.append(&mut other.guards);
    }

    /// Releases the given domains, latest first
    pub fn release(&mut self, objs: &[LockObj]) {
        while let Some(pos) = self.guards.iter().rposition(|(obj, _)| objs.contains(obj)) {
            let (obj, _guard) = self.guards.remove(pos);
            trace!(domain = %obj, "lock released");
        }
    }

    /// Splits a request into domains that still have to be taken.
    ///
    /// Already held domains are reused; a write request for a domain held for
    /// reading, or a new domain sorting before a held one, is an error.
    pub fn missing(&self, request: &LockRequest) -> Result<LockRequest, LockError> {
        let mut missing = LockRequest::new();
        for (obj, mode) in request.iter() {
            match self.mode(obj) {
                Some(LockMode::Read) if mode == LockMode::Write => {
                    return Err(LockError::Upgrade(obj));
                }
                Some(_) => {}
                None => {
                    if let Some(held) = self.last().filter(|held| *held > obj) {
                        return Err(LockError::OutOfOrder {
                            requested: obj,
                            held,
                        });
                    }
                    missing = match mode {
                        LockMode::Read => missing.read(&[obj]),
                        LockMode::Write => missing.write(&[obj]),
                    };
                }
            }
        }
        Ok(missing)
    }
}

impl Drop for LockSet {
    fn drop(&mut self) {
        while let Some((obj, _guard)) = self.guards.pop() {
            trace!(domain = %obj, "lock released");
        }
    }
}

pub struct LockManager {
    /// Indexed by [`LockObj::index`]
    locks: [Arc<RwLock<()>>; LockObj::ALL.len()],
}

impl LockManager {
    pub fn new() -> Self {
        Self {
            locks: std::array::from_fn(|_| Arc::new(RwLock::new(()))),
        }
    }

    fn lock(&self, obj: LockObj) -> Arc<RwLock<()>> {
        Arc::clone(&self.locks[obj.index()])
    }

    /// Takes every requested domain in global order
    pub async fn acquire(&self, request: &LockRequest) -> LockSet {
        let started = Instant::now();
        let mut guards = Vec::with_capacity(request.len());
        for (obj, mode) in request.iter() {
            let lock = self.lock(obj);
            let guard = match mode {
                LockMode::Read => HeldGuard::Read(lock.read_owned().await),
                LockMode::Write => HeldGuard::Write(lock.write_owned().await),
            };
            trace!(domain = %obj, ?mode, "lock acquired");
            guards.push((obj, guard));
        }
        metrics::histogram!("stork_lock_wait_seconds").record(started.elapsed().as_secs_f64());
        LockSet { guards }
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_acquires_in_global_order() {
        let manager = LockManager::new();
        let request = LockRequest::new()
            .write(&[LockObj::CtrlConfig])
            .read(&[LockObj::Remotes, LockObj::Nodes]);
        let set = manager.acquire(&request).await;
        let order: Vec<LockObj> = set.held().into_iter().map(|(obj, _)| obj).collect();
        assert_eq!(order, vec![LockObj::Nodes, LockObj::Remotes, LockObj::CtrlConfig]);
        assert_eq!(set.mode(LockObj::CtrlConfig), Some(LockMode::Write));
    }

    #[tokio::test]
    async fn test_readers_share_writers_exclude() {
        let manager = Arc::new(LockManager::new());
        let read = LockRequest::new().read(&[LockObj::Nodes]);
        let first = manager.acquire(&read).await;
        let _second = tokio::time::timeout(Duration::from_millis(100), manager.acquire(&read))
            .await
            .expect("readers must not block each other");

        let write = LockRequest::new().write(&[LockObj::Nodes]);
        assert!(
            tokio::time::timeout(Duration::from_millis(50), manager.acquire(&write))
                .await
                .is_err()
        );
        drop(first);
    }

    #[test]
    fn test_writer_wakes_when_reader_leaves() {
        let manager = LockManager::new();
        let reader = tokio_test::block_on(manager.acquire(&LockRequest::new().read(&[LockObj::Remotes])));
        let write = LockRequest::new().write(&[LockObj::Remotes]);
        let mut writer = tokio_test::task::spawn(manager.acquire(&write));
        assert!(writer.poll().is_pending());

        drop(reader);
        assert!(writer.is_woken());
        let set = tokio_test::assert_ready!(writer.poll());
        assert_eq!(set.mode(LockObj::Remotes), Some(LockMode::Write));
    }

    #[tokio::test]
    async fn test_missing_checks_order_and_upgrades() {
        let manager = LockManager::new();
        let set = manager
            .acquire(&LockRequest::new().read(&[LockObj::ResourceDefinitions]))
            .await;

        let extra = set
            .missing(&LockRequest::new().read(&[LockObj::ResourceDefinitions, LockObj::Remotes]))
            .unwrap();
        assert_eq!(extra.mode(LockObj::Remotes), Some(LockMode::Read));
        assert_eq!(extra.len(), 1);

        assert_eq!(
            set.missing(&LockRequest::new().read(&[LockObj::Nodes])),
            Err(LockError::OutOfOrder {
                requested: LockObj::Nodes,
                held: LockObj::ResourceDefinitions
            })
        );
        assert_eq!(
            set.missing(&LockRequest::new().write(&[LockObj::ResourceDefinitions])),
            Err(LockError::Upgrade(LockObj::ResourceDefinitions))
        );
    }

    #[test]
    fn test_each_domain_has_one_shared_lock() {
        let manager = LockManager::new();
        for obj in LockObj::ALL {
            assert!(Arc::ptr_eq(&manager.lock(obj), &manager.lock(obj)));
            for other in LockObj::ALL.iter().filter(|o| **o != obj) {
                assert!(!Arc::ptr_eq(&manager.lock(obj), &manager.lock(*other)));
            }
        }
    }

    #[tokio::test]
    async fn test_release_frees_domain() {
        let manager = LockManager::new();
        let mut set = manager
            .acquire(&LockRequest::new().write(&[LockObj::Nodes, LockObj::Remotes]))
            .await;
        set.release(&[LockObj::Remotes]);
        assert_eq!(set.mode(LockObj::Remotes), None);
        let _remotes = tokio::time::timeout(
            Duration::from_millis(100),
            manager.acquire(&LockRequest::new().write(&[LockObj::Remotes])),
        )
        .await
        .expect("released domain must be available");
    }
}
