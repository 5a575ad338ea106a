// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Controller Context
//!
//! Shared services every API handler works with, plus the building blocks
//! operations are composed of: a transactional step, a propagation step
//! and the response mapping.

use crate::application::background::BackgroundRunner;
use crate::application::connection_notifier::ConnectionNotifier;
use crate::application::lock_manager::LockManager;
use crate::application::responses::{reporting_errors, ApiResponse, ResponseContext};
use crate::application::satellite_updates::{DeploymentMessages, SatelliteUpdates, UpdateTarget};
use crate::application::scope_runner::{error_stream, from_result, rc_stream, RcStream, ScopeRunner};
use crate::domain::api_rc::{ApiCallRc, RcEntry, ReturnCode};
use crate::domain::errors::ApiError;
use crate::domain::lock_domain::LockRequest;
use crate::domain::satellite::StateSerializer;
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::object_store::{ObjectStore, Transaction};
use crate::infrastructure::satellite::SatelliteRegistry;
use async_stream::try_stream;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

pub struct ControllerContext {
    pub lock_manager: Arc<LockManager>,
    pub store: Arc<ObjectStore>,
    pub runner: ScopeRunner,
    pub registry: Arc<SatelliteRegistry>,
    pub updates: Arc<SatelliteUpdates>,
    pub notifier: Arc<ConnectionNotifier>,
    pub background: BackgroundRunner,
    pub event_bus: EventBus,
}

impl ControllerContext {
    pub fn new(
        store: Arc<ObjectStore>,
        registry: Arc<SatelliteRegistry>,
        serializer: Arc<dyn StateSerializer>,
        event_bus: EventBus,
        satellite_timeout: Duration,
        max_concurrent_operations: usize,
    ) -> Arc<Self> {
        let lock_manager = Arc::new(LockManager::new());
        let runner = ScopeRunner::new(Arc::clone(&lock_manager), Arc::clone(&store));
        let background = BackgroundRunner::new(max_concurrent_operations);
        let updates = Arc::new(SatelliteUpdates::new(
            Arc::clone(&registry),
            serializer,
            satellite_timeout,
        ));
        let notifier = Arc::new(ConnectionNotifier::new(
            runner.clone(),
            Arc::clone(&registry),
            background.clone(),
        ));
        Arc::new(Self {
            lock_manager,
            store,
            runner,
            registry,
            updates,
            notifier,
            background,
            event_bus,
        })
    }

    /// Transactional step running synchronous work against the store
    pub fn step<F>(&self, description: impl Into<String>, locks: LockRequest, work: F) -> RcStream
    where
        F: FnOnce(&mut Transaction) -> Result<ApiCallRc, ApiError> + Send + 'static,
    {
        self.runner
            .transactional(description, locks, move |scope| from_result(scope.with_tx(work)))
    }

    /// Pushes the target's current state to its satellites under read locks
    pub fn propagate(
        &self,
        description: impl Into<String>,
        target: UpdateTarget,
        messages: DeploymentMessages,
    ) -> RcStream {
        let updates = Arc::clone(&self.updates);
        let locks = target.read_locks();
        self.runner.transactionless(description, locks, move |scope| {
            updates.update_satellites(&scope, target, messages)
        })
    }

    /// Like [`propagate`](Self::propagate), but unreachable satellites do not
    /// stop the surrounding operation
    pub fn notify(
        &self,
        description: impl Into<String>,
        target: UpdateTarget,
        messages: DeploymentMessages,
    ) -> RcStream {
        ignore_delayed(self.propagate(description, target, messages))
    }

    pub fn respond(&self, stream: RcStream, ctx: ResponseContext) -> ApiResponse {
        reporting_errors(stream, ctx)
    }
}

/// Ends the stream quietly when satellites are missing instead of failing it
pub fn ignore_delayed(stream: RcStream) -> RcStream {
    rc_stream(try_stream! {
        for await item in stream {
            match item {
                Ok(rc) => yield rc,
                Err(ApiError::Delayed(_)) => break,
                Err(e) => Err::<(), _>(e)?,
            }
        }
    })
}

/// `MODIFIED` when something changed, otherwise a note that nothing did
pub fn change_report(changed: bool, message: impl Into<String>) -> ApiCallRc {
    if changed {
        ApiCallRc::single(RcEntry::new(ReturnCode::MODIFIED, message))
    } else {
        ApiCallRc::single(RcEntry::new(ReturnCode::INFO_NO_PENDING_WORK, "No changes requested"))
    }
}

/// Reports a failed build of an operation chain as its only batch
pub fn flow(built: Result<RcStream, ApiError>) -> RcStream {
    built.unwrap_or_else(error_stream)
}

/// Builds the stream only once it is polled, after earlier steps ran
pub fn deferred<F>(build: F) -> RcStream
where
    F: FnOnce() -> RcStream + Send + 'static,
{
    rc_stream(stream::once(async move { build() }).flatten())
}

/// Value a step hands to a later step of the same chain
pub struct StepOutcome<T>(Arc<Mutex<Option<T>>>);

impl<T> Clone for StepOutcome<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<T> Default for StepOutcome<T> {
    fn default() -> Self {
        Self(Arc::new(Mutex::new(None)))
    }
}

impl<T> StepOutcome<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, value: T) {
        *self.0.lock() = Some(value);
    }

    pub fn take(&self) -> Option<T> {
        self.0.lock().take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::scope_runner::{sequence, single};

    #[tokio::test]
    async fn test_deferred_sees_earlier_outcome() {
        let outcome: StepOutcome<u32> = StepOutcome::new();
        let writer = outcome.clone();
        let first = rc_stream(stream::once(async move {
            writer.set(7);
            Ok(ApiCallRc::new())
        }));
        let second = deferred(move || {
            let value = outcome.take().unwrap_or_default();
            single(ApiCallRc::single(RcEntry::new(ReturnCode::MODIFIED, value.to_string())))
        });
        let batches: Vec<_> = sequence(vec![first, second]).collect().await;
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[1].as_ref().unwrap().entries[0].message, "7");
    }

    #[tokio::test]
    async fn test_ignore_delayed_stops_quietly() {
        let stream = sequence(vec![
            single(ApiCallRc::new()),
            error_stream(ApiError::Delayed(Vec::new())),
            single(ApiCallRc::new()),
        ]);
        let batches: Vec<_> = ignore_delayed(stream).collect().await;
        assert_eq!(batches.len(), 1);
        assert!(batches[0].is_ok());
    }
}
