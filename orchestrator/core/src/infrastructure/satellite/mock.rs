// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use crate::domain::api_rc::ApiCallRc;
use crate::domain::names::NodeName;
use crate::domain::satellite::{PeerError, SatellitePeer, UpdatePayload};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::trace;

/// How a [`MockSatellite`] answers updates
#[derive(Debug, Clone)]
pub enum MockBehavior {
    /// Applies every update without remarks
    Ack,
    /// Answers every update with these entries
    Reply(ApiCallRc),
    /// Fails every round-trip
    Fail(PeerError),
    /// Never answers
    Hang,
}

/// In-process satellite that records every update it receives
pub struct MockSatellite {
    node_name: NodeName,
    behavior: Mutex<MockBehavior>,
    received: Mutex<Vec<UpdatePayload>>,
    closed: AtomicBool,
}

impl MockSatellite {
    pub fn new(node_name: NodeName) -> Self {
        Self::with_behavior(node_name, MockBehavior::Ack)
    }

    pub fn with_behavior(node_name: NodeName, behavior: MockBehavior) -> Self {
        Self {
            node_name,
            behavior: Mutex::new(behavior),
            received: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn set_behavior(&self, behavior: MockBehavior) {
        *self.behavior.lock() = behavior;
    }

    pub fn received(&self) -> Vec<UpdatePayload> {
        self.received.lock().clone()
    }

    pub fn received_count(&self) -> usize {
        self.received.lock().len()
    }

    /// Decoded JSON bodies of every update received so far
    pub fn received_json(&self) -> Vec<serde_json::Value> {
        self.received
            .lock()
            .iter()
            .filter_map(|p| serde_json::from_slice(&p.body).ok())
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SatellitePeer for MockSatellite {
    fn node_name(&self) -> &NodeName {
        &self.node_name
    }

    async fn api_call(&self, payload: UpdatePayload) -> Result<ApiCallRc, PeerError> {
        if self.is_closed() {
            return Err(PeerError::NotConnected);
        }
        trace!(node = %self.node_name, update_id = payload.update_id, target = %payload.target, "mock satellite received update");
        self.received.lock().push(payload);
        let behavior = self.behavior.lock().clone();
        match behavior {
            MockBehavior::Ack => Ok(ApiCallRc::new()),
            MockBehavior::Reply(rc) => Ok(rc),
            MockBehavior::Fail(err) => Err(err),
            MockBehavior::Hang => std::future::pending().await,
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn payload(id: u64) -> UpdatePayload {
        UpdatePayload {
            update_id: id,
            target: "test".to_string(),
            body: Bytes::from_static(b"{}"),
        }
    }

    #[tokio::test]
    async fn test_records_and_answers() {
        let mock = MockSatellite::new(NodeName::new("alpha").unwrap());
        assert!(mock.api_call(payload(1)).await.unwrap().is_empty());

        mock.set_behavior(MockBehavior::Fail(PeerError::ConnectionLost("reset".into())));
        assert!(mock.api_call(payload(2)).await.is_err());
        assert_eq!(mock.received_count(), 2);

        mock.close().await;
        assert_eq!(mock.api_call(payload(3)).await, Err(PeerError::NotConnected));
        assert_eq!(mock.received_count(), 2);
    }
}
