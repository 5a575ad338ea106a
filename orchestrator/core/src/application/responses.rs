// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Response Mapping
//!
//! Converts an internal [`RcStream`] into what callers receive: a stream of
//! result batches that never fails. Errors become a final batch:
//!
//! - `Rc` is passed on as-is,
//! - `AccessDenied` is reported with its per-entity code,
//! - `Persistence` becomes `FAIL_SQL`,
//! - `Implementation` is logged and reported as `FAIL_IMPL_ERROR`,
//! - `Delayed` ends the stream silently; the remaining steps are resumed
//!   when the missing satellites reconnect.

use crate::application::scope_runner::RcStream;
use crate::domain::api_rc::{ApiCallRc, RcEntry, ReturnCode};
use crate::domain::errors::ApiError;
use async_stream::stream;
use futures::stream::{BoxStream, StreamExt};
use std::collections::BTreeMap;
use tracing::{debug, error};

/// Stream handed to API callers
pub type ApiResponse = BoxStream<'static, ApiCallRc>;

/// What an operation acts on, used to word error reports
#[derive(Debug, Clone)]
pub struct ResponseContext {
    operation: &'static str,
    object: String,
    obj_refs: BTreeMap<String, String>,
}

impl ResponseContext {
    /// `operation` is a verb in progressive form ("creating", "deleting")
    pub fn new(operation: &'static str, object: impl Into<String>) -> Self {
        Self {
            operation,
            object: object.into(),
            obj_refs: BTreeMap::new(),
        }
    }

    pub fn with_ref(mut self, kind: impl Into<String>, name: impl Into<String>) -> Self {
        self.obj_refs.insert(kind.into(), name.into());
        self
    }

    pub fn object(&self) -> &str {
        &self.object
    }

    fn annotate(&self, mut rc: ApiCallRc) -> ApiCallRc {
        for entry in &mut rc.entries {
            for (kind, name) in &self.obj_refs {
                entry
                    .obj_refs
                    .entry(kind.clone())
                    .or_insert_with(|| name.clone());
            }
        }
        rc
    }

    fn error_batch(&self, err: ApiError) -> ApiCallRc {
        let rc = match err {
            ApiError::Rc(rc) => rc,
            ApiError::AccessDenied { action, code } => ApiCallRc::single(
                RcEntry::new(
                    code,
                    format!("Access denied while {} {}", self.operation, self.object),
                )
                .with_cause(action),
            ),
            ApiError::Persistence(message) => ApiCallRc::single(
                RcEntry::new(
                    ReturnCode::FAIL_SQL,
                    format!("A database error occurred while {} {}", self.operation, self.object),
                )
                .with_cause(message)
                .with_correction("Retry the operation once the database is reachable"),
            ),
            ApiError::Implementation(message) => {
                error!(
                    operation = self.operation,
                    object = %self.object,
                    error = %message,
                    "Implementation error"
                );
                ApiCallRc::single(
                    RcEntry::new(
                        ReturnCode::FAIL_IMPL_ERROR,
                        format!("An internal error occurred while {} {}", self.operation, self.object),
                    )
                    .with_details("See the controller log for details"),
                )
            }
            ApiError::Delayed(nodes) => ApiCallRc::single(RcEntry::new(
                ReturnCode::WARN_NOT_CONNECTED,
                format!("Waiting for {} satellite(s) to reconnect", nodes.len()),
            )),
        };
        self.annotate(rc)
    }
}

/// Maps a result stream into a response that reports errors as its last batch
pub fn reporting_errors(stream: RcStream, ctx: ResponseContext) -> ApiResponse {
    stream! {
        let mut stream = stream;
        while let Some(item) = stream.next().await {
            match item {
                Ok(rc) => yield ctx.annotate(rc),
                Err(ApiError::Delayed(nodes)) => {
                    debug!(
                        operation = ctx.operation,
                        object = %ctx.object,
                        nodes = ?nodes,
                        "Operation continues when the satellites reconnect"
                    );
                    break;
                }
                Err(err) => {
                    yield ctx.error_batch(err);
                    break;
                }
            }
        }
    }
    .boxed()
}
