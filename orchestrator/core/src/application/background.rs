// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Background Operations
//!
//! Runs follow-up streams that nobody waits for, mainly the steps resumed
//! by the connection notifier. Their result entries go to the log. The
//! number of streams running at once is bounded by a semaphore; shutdown
//! cancels whatever is still running.

use crate::application::responses::{reporting_errors, ResponseContext};
use crate::application::scope_runner::RcStream;
use crate::domain::api_rc::ApiCallRc;
use futures::StreamExt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct BackgroundRunner {
    permits: Arc<Semaphore>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl BackgroundRunner {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Number of spawned tasks that have not finished yet
    pub fn active_tasks(&self) -> usize {
        self.tracker.len()
    }

    /// Runs a result stream detached from the caller
    pub fn spawn(&self, description: impl Into<String>, stream: RcStream) {
        let runner = self.clone();
        let description = description.into();
        self.tracker.spawn(async move {
            runner.run(description, stream).await;
        });
    }

    /// Runs a future detached from the caller; it does not take a permit
    pub fn spawn_task<F>(&self, description: impl Into<String>, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let cancel = self.cancel.clone();
        let description = description.into();
        self.tracker.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => debug!(task = %description, "background task cancelled"),
                _ = task => {}
            }
        });
    }

    /// Drives a result stream to its end and returns what it reported
    pub async fn run(&self, description: String, stream: RcStream) -> Vec<ApiCallRc> {
        let _permit = match Arc::clone(&self.permits).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                warn!(operation = %description, "background runner closed, operation dropped");
                return Vec::new();
            }
        };
        metrics::gauge!("stork_background_operations").increment(1.0);
        let mut response = reporting_errors(stream, ResponseContext::new("running", description.clone()));
        let mut batches = Vec::new();
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!(operation = %description, "background operation cancelled");
                    break;
                }
                next = response.next() => match next {
                    Some(rc) => {
                        log_batch(&description, &rc);
                        batches.push(rc);
                    }
                    None => break,
                }
            }
        }
        metrics::gauge!("stork_background_operations").decrement(1.0);
        batches
    }

    /// Waits until every task spawned so far has finished
    pub async fn wait_idle(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    /// Cancels running operations and waits for them to stop
    pub async fn shutdown(&self) {
        info!(active = self.tracker.len(), "Stopping background operations");
        self.cancel.cancel();
        self.permits.close();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

fn log_batch(description: &str, rc: &ApiCallRc) {
    for entry in &rc.entries {
        if entry.code.is_error() {
            warn!(operation = %description, code = %entry.code, "{}", entry.message);
        } else if entry.code.is_warning() {
            info!(operation = %description, code = %entry.code, "{}", entry.message);
        } else {
            debug!(operation = %description, code = %entry.code, "{}", entry.message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::scope_runner::{rc_stream, single};
    use crate::domain::api_rc::{RcEntry, ReturnCode};
    use std::time::Duration;

    #[tokio::test]
    async fn test_run_collects_batches() {
        let runner = BackgroundRunner::new(2);
        let batches = runner
            .run(
                "test".to_string(),
                single(ApiCallRc::single(RcEntry::new(ReturnCode::CREATED, "done"))),
            )
            .await;
        assert_eq!(batches.len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_pending_work() {
        let runner = BackgroundRunner::new(2);
        runner.spawn("forever", rc_stream(futures::stream::pending()));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(runner.active_tasks(), 1);
        tokio::time::timeout(Duration::from_secs(1), runner.shutdown())
            .await
            .expect("shutdown must not hang");
        assert_eq!(runner.active_tasks(), 0);
    }

    #[tokio::test]
    async fn test_wait_idle_reopens() {
        let runner = BackgroundRunner::new(1);
        runner.spawn(
            "quick",
            single(ApiCallRc::single(RcEntry::new(ReturnCode::MODIFIED, "ok"))),
        );
        runner.wait_idle().await;
        assert_eq!(runner.active_tasks(), 0);
        runner.spawn("again", single(ApiCallRc::new()));
        runner.wait_idle().await;
    }
}
