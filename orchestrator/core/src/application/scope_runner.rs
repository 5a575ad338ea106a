// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Scoped Transaction Runner
//!
//! Runs a unit of work as a cold [`RcStream`]: nothing happens until the
//! stream is polled. Polling it
//!
//! 1. acquires the requested lock domains through the [`LockManager`],
//! 2. opens a [`Transaction`] on the object store,
//! 3. hands a [`Scope`] to the work and forwards every batch it yields,
//! 4. commits what is still staged when the work finishes successfully.
//!
//! When the work fails or the stream is dropped, the staged changes are
//! discarded, pending number allocations are returned and the locks are
//! released in reverse order.
//!
//! A [`Scope`] can be extended from inside the work: nested scopes reuse
//! already held domains, take additional ones (which must sort after every
//! held domain) and release them again when they finish.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Collaborators:** [`LockManager`], [`ObjectStore`]

use crate::application::lock_manager::{LockManager, LockSet};
use crate::domain::api_rc::ApiCallRc;
use crate::domain::errors::ApiError;
use crate::domain::lock_domain::{LockMode, LockObj, LockRequest};
use crate::infrastructure::object_store::{ObjectStore, Transaction};
use async_stream::try_stream;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;
use tracing::{debug, trace};

/// Cold sequence of result batches produced by one operation step
pub type RcStream = BoxStream<'static, Result<ApiCallRc, ApiError>>;

/// Boxes a result stream
pub fn rc_stream<S>(stream: S) -> RcStream
where
    S: Stream<Item = Result<ApiCallRc, ApiError>> + Send + 'static,
{
    stream.boxed()
}

/// Stream that yields nothing
pub fn empty_stream() -> RcStream {
    stream::empty().boxed()
}

/// Stream that yields one batch
pub fn single(rc: ApiCallRc) -> RcStream {
    stream::once(async move { Ok(rc) }).boxed()
}

/// Stream that fails immediately
pub fn error_stream(err: ApiError) -> RcStream {
    stream::once(async move { Err(err) }).boxed()
}

/// Runs `streams` one after another, stopping at the first error
pub fn sequence(streams: Vec<RcStream>) -> RcStream {
    rc_stream(try_stream! {
        for step in streams {
            for await batch in step {
                yield batch?;
            }
        }
    })
}

/// Synchronous work funneled into the result stream
pub fn from_result(result: Result<ApiCallRc, ApiError>) -> RcStream {
    stream::once(async move { result }).boxed()
}

// ============================================================================
// Runner
// ============================================================================

#[derive(Clone)]
pub struct ScopeRunner {
    lock_manager: Arc<LockManager>,
    store: Arc<ObjectStore>,
}

impl ScopeRunner {
    pub fn new(lock_manager: Arc<LockManager>, store: Arc<ObjectStore>) -> Self {
        Self {
            lock_manager,
            store,
        }
    }

    pub fn store(&self) -> &Arc<ObjectStore> {
        &self.store
    }

    /// Work that stages changes; they are committed when it completes
    pub fn transactional<F>(&self, description: impl Into<String>, locks: LockRequest, work: F) -> RcStream
    where
        F: FnOnce(Scope) -> RcStream + Send + 'static,
    {
        self.run(description.into(), locks, true, work)
    }

    /// Read-only work that still needs a consistent lock
    pub fn transactionless<F>(&self, description: impl Into<String>, locks: LockRequest, work: F) -> RcStream
    where
        F: FnOnce(Scope) -> RcStream + Send + 'static,
    {
        self.run(description.into(), locks, false, work)
    }

    fn run<F>(&self, description: String, locks: LockRequest, writable: bool, work: F) -> RcStream
    where
        F: FnOnce(Scope) -> RcStream + Send + 'static,
    {
        let lock_manager = Arc::clone(&self.lock_manager);
        let store = Arc::clone(&self.store);
        rc_stream(try_stream! {
            trace!(scope = %description, locks = %locks, "waiting for locks");
            let lock_set = lock_manager.acquire(&locks).await;
            let mut tx = store.begin(writable);
            for (obj, mode) in lock_set.held() {
                tx.attach(obj, mode);
            }
            let scope = Scope {
                inner: Arc::new(ScopeInner {
                    description: description.clone(),
                    lock_manager,
                    locks: Mutex::new(Some(lock_set)),
                    tx: Mutex::new(tx),
                }),
            };
            let _release = ReleaseOnDrop(scope.clone());
            debug!(scope = %description, "scope entered");

            let mut inner = work(scope.clone());
            while let Some(batch) = inner.next().await {
                yield batch?;
            }
            drop(inner);

            if writable {
                scope.commit().await?;
            }
            debug!(scope = %description, "scope finished");
        })
    }
}

// ============================================================================
// Scope
// ============================================================================

struct ScopeInner {
    description: String,
    lock_manager: Arc<LockManager>,
    locks: Mutex<Option<LockSet>>,
    tx: Mutex<Transaction>,
}

/// Handle of a running scope, passed to its work
#[derive(Clone)]
pub struct Scope {
    inner: Arc<ScopeInner>,
}

struct ReleaseOnDrop(Scope);

impl Drop for ReleaseOnDrop {
    fn drop(&mut self) {
        self.0.release_all();
    }
}

/// Restores a scope when a nested scope ends
struct NestedRelease {
    scope: Scope,
    added: Vec<LockObj>,
    was_writable: bool,
}

impl Drop for NestedRelease {
    fn drop(&mut self) {
        {
            let mut tx = self.scope.inner.tx.lock();
            for obj in &self.added {
                tx.detach(*obj);
            }
            tx.set_writable(self.was_writable);
        }
        if let Some(locks) = self.scope.inner.locks.lock().as_mut() {
            locks.release(&self.added);
        }
    }
}

impl Scope {
    pub fn description(&self) -> &str {
        &self.inner.description
    }

    /// The scope's mutation buffer. The guard must not be held across an
    /// await point.
    pub fn tx(&self) -> MutexGuard<'_, Transaction> {
        self.inner.tx.lock()
    }

    /// Runs synchronous work against the mutation buffer
    pub fn with_tx<T>(&self, f: impl FnOnce(&mut Transaction) -> T) -> T {
        f(&mut self.inner.tx.lock())
    }

    pub fn held_mode(&self, obj: LockObj) -> Option<LockMode> {
        self.inner
            .locks
            .lock()
            .as_ref()
            .and_then(|locks| locks.mode(obj))
    }

    /// Persists everything staged so far; the scope keeps its locks
    pub async fn commit(&self) -> Result<(), ApiError> {
        let (prepared, driver) = {
            let tx = self.tx();
            (tx.prepare_commit()?, tx.driver())
        };
        if let Err(e) = prepared.persist(driver.as_ref()).await {
            self.tx().discard();
            return Err(e);
        }
        self.tx().finish_commit(prepared);
        trace!(scope = %self.inner.description, "scope committed");
        Ok(())
    }

    /// Takes additional domains for the rest of this scope
    pub async fn extend(&self, request: &LockRequest, writable: bool) -> Result<(), ApiError> {
        self.acquire_more(request, writable).await.map(|_| ())
    }

    async fn acquire_more(&self, request: &LockRequest, writable: bool) -> Result<Vec<LockObj>, ApiError> {
        let missing = {
            let locks = self.inner.locks.lock();
            let locks = locks
                .as_ref()
                .ok_or_else(|| ApiError::implementation("scope used after release"))?;
            locks.missing(request).map_err(|e| {
                ApiError::Implementation(format!("scope '{}': {}", self.inner.description, e))
            })?
        };
        let acquired = self.inner.lock_manager.acquire(&missing).await;
        let added: Vec<LockObj> = acquired.held().into_iter().map(|(obj, _)| obj).collect();
        {
            let mut tx = self.tx();
            for (obj, mode) in acquired.held() {
                tx.attach(obj, mode);
            }
            if writable {
                tx.set_writable(true);
            }
        }
        match self.inner.locks.lock().as_mut() {
            Some(locks) => locks.append(acquired),
            None => return Err(ApiError::implementation("scope released while extending")),
        }
        Ok(added)
    }

    /// Nested scope whose staged changes are committed when it completes
    pub fn transactional<F>(&self, description: impl Into<String>, locks: LockRequest, work: F) -> RcStream
    where
        F: FnOnce(Scope) -> RcStream + Send + 'static,
    {
        self.nested(description.into(), locks, true, work)
    }

    /// Nested read-only scope
    pub fn transactionless<F>(&self, description: impl Into<String>, locks: LockRequest, work: F) -> RcStream
    where
        F: FnOnce(Scope) -> RcStream + Send + 'static,
    {
        self.nested(description.into(), locks, false, work)
    }

    fn nested<F>(&self, description: String, locks: LockRequest, writable: bool, work: F) -> RcStream
    where
        F: FnOnce(Scope) -> RcStream + Send + 'static,
    {
        let scope = self.clone();
        rc_stream(try_stream! {
            let was_writable = scope.tx().is_writable();
            let added = scope.acquire_more(&locks, writable).await?;
            let _restore = NestedRelease {
                scope: scope.clone(),
                added,
                was_writable,
            };
            debug!(scope = %description, parent = %scope.description(), "nested scope entered");

            let mut inner = work(scope.clone());
            while let Some(batch) = inner.next().await {
                yield batch?;
            }
            drop(inner);

            if writable {
                scope.commit().await?;
            }
        })
    }

    fn release_all(&self) {
        {
            let mut tx = self.tx();
            if tx.has_changes() {
                debug!(scope = %self.inner.description, "discarding staged changes");
            }
            tx.discard();
            for obj in LockObj::ALL {
                tx.detach(obj);
            }
        }
        // LockSet drops its guards in reverse acquisition order
        self.inner.locks.lock().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::api_rc::{RcEntry, ReturnCode};
    use crate::domain::names::{NodeName, RemoteName};
    use crate::domain::node::{Node, NodeType};
    use crate::domain::number_pool::PoolKind;
    use crate::domain::remote::{Remote, RemoteKind};
    use crate::infrastructure::event_bus::EventBus;
    use crate::infrastructure::number_pools::NumberPools;
    use crate::infrastructure::repositories::InMemoryPersistence;
    use futures::TryStreamExt;
    use std::time::Duration;

    fn runner() -> (ScopeRunner, Arc<InMemoryPersistence>) {
        let driver = Arc::new(InMemoryPersistence::new());
        let store = ObjectStore::new(
            driver.clone(),
            Arc::new(NumberPools::default()),
            EventBus::new(16),
        );
        (ScopeRunner::new(Arc::new(LockManager::new()), store), driver)
    }

    fn add_node(scope: &Scope, name: &str) -> Result<(), ApiError> {
        scope.with_tx(|tx| {
            let node = Node::new(NodeName::new(name)?, NodeType::Satellite);
            tx.nodes_mut()?.nodes.insert(node.name.clone(), node);
            Ok(())
        })
    }

    #[tokio::test]
    async fn test_stream_is_cold() {
        let (runner, driver) = runner();
        let stream = runner.transactional(
            "create node",
            LockRequest::new().write(&[LockObj::Nodes]),
            |scope| from_result(add_node(&scope, "alpha").map(|_| ApiCallRc::new())),
        );
        assert_eq!(driver.commit_count(), 0);
        let batches: Vec<ApiCallRc> = stream.try_collect().await.unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(driver.commit_count(), 1);
    }

    #[tokio::test]
    async fn test_error_discards_changes_and_releases_locks() {
        let (runner, driver) = runner();
        let pools = runner.store().pools().clone();
        let result: Result<Vec<ApiCallRc>, ApiError> = runner
            .transactional(
                "failing",
                LockRequest::new().write(&[LockObj::Nodes]),
                |scope| {
                    rc_stream(try_stream! {
                        add_node(&scope, "alpha")?;
                        scope.with_tx(|tx| tx.allocate(PoolKind::TcpPort))?;
                        yield ApiCallRc::single(RcEntry::new(ReturnCode::CREATED, "staged"));
                        Err::<(), _>(ApiError::rc(ReturnCode::FAIL_IN_USE, "refused"))?;
                    })
                },
            )
            .try_collect()
            .await;

        assert_eq!(result.unwrap_err().code(), ReturnCode::FAIL_IN_USE);
        assert_eq!(driver.commit_count(), 0);
        assert!(runner.store().snapshot().nodes.nodes.is_empty());
        assert_eq!(pools.allocated_count(PoolKind::TcpPort), 0);

        let again = tokio::time::timeout(
            Duration::from_millis(200),
            runner
                .transactional("after", LockRequest::new().write(&[LockObj::Nodes]), |_| empty_stream())
                .try_collect::<Vec<_>>(),
        )
        .await;
        assert!(again.is_ok());
    }

    #[tokio::test]
    async fn test_transactionless_scope_rejects_writes() {
        let (runner, _) = runner();
        let result: Result<Vec<ApiCallRc>, ApiError> = runner
            .transactionless("read", LockRequest::new().write(&[LockObj::Nodes]), |scope| {
                from_result(add_node(&scope, "alpha").map(|_| ApiCallRc::new()))
            })
            .try_collect()
            .await;
        assert!(matches!(result, Err(ApiError::Implementation(_))));
    }

    #[tokio::test]
    async fn test_nested_scope_extends_and_releases() {
        let (runner, driver) = runner();
        let result: Result<Vec<ApiCallRc>, ApiError> = runner
            .transactionless("outer", LockRequest::new().read(&[LockObj::Nodes]), |scope| {
                rc_stream(try_stream! {
                    let nested = scope.transactional(
                        "inner",
                        LockRequest::new().read(&[LockObj::Nodes]).write(&[LockObj::Remotes]),
                        |inner| {
                            from_result(inner.with_tx(|tx| {
                                let name = RemoteName::new("offsite")?;
                                let remote = Remote::new(
                                    name.clone(),
                                    RemoteKind::Controller {
                                        url: "https://peer:3370".to_string(),
                                    },
                                );
                                tx.remotes_mut()?.insert(name, remote);
                                Ok(ApiCallRc::new())
                            }))
                        },
                    );
                    for await batch in nested {
                        yield batch?;
                    }
                    let held = scope.held_mode(LockObj::Remotes);
                    if held.is_some() {
                        Err::<(), _>(ApiError::implementation("nested lock leaked"))?;
                    }
                    let writable = scope.tx().is_writable();
                    if writable {
                        Err::<(), _>(ApiError::implementation("writability leaked"))?;
                    }
                })
            })
            .try_collect()
            .await;

        assert!(result.is_ok(), "{:?}", result);
        assert_eq!(driver.commit_count(), 1);
        assert_eq!(runner.store().snapshot().remotes.len(), 1);
    }

    #[tokio::test]
    async fn test_nested_scope_rejects_out_of_order_domain() {
        let (runner, _) = runner();
        let result: Result<Vec<ApiCallRc>, ApiError> = runner
            .transactional("outer", LockRequest::new().write(&[LockObj::Remotes]), |scope| {
                scope.transactional("inner", LockRequest::new().write(&[LockObj::Nodes]), |_| {
                    empty_stream()
                })
            })
            .try_collect()
            .await;
        assert!(matches!(result, Err(ApiError::Implementation(_))));
    }

    #[tokio::test]
    async fn test_dropping_stream_releases_locks() {
        let (runner, _) = runner();
        let mut stream = runner.transactional(
            "hanging",
            LockRequest::new().write(&[LockObj::Nodes]),
            |_| rc_stream(stream::pending()),
        );
        let _ = tokio::time::timeout(Duration::from_millis(20), stream.next()).await;
        drop(stream);

        let next = tokio::time::timeout(
            Duration::from_millis(200),
            runner
                .transactional("next", LockRequest::new().write(&[LockObj::Nodes]), |_| empty_stream())
                .try_collect::<Vec<_>>(),
        )
        .await;
        assert!(next.is_ok());
    }
}
