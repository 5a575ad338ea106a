// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Connection Notifier
//!
//! Resumes operations that stopped because a satellite was unreachable.
//!
//! When a satellite comes online, every registered [`ConnectionListener`]
//! is asked for follow-up streams for that node. Afterwards each resource
//! definition with a resource on the node is checked; if all of its
//! resources are on online satellites, the listeners are asked for
//! follow-ups for that resource definition as well.
//!
//! Listeners are consulted under read locks on every domain. The streams
//! they return only run after those locks are released and take their own
//! locks. Per resource definition at most one resumption runs at a time; a
//! trigger that arrives meanwhile schedules exactly one more pass once the
//! running one has finished.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Subscribes to:** `SatelliteEvent::Online` on the [`EventBus`]

use crate::application::background::BackgroundRunner;
use crate::application::scope_runner::{empty_stream, RcStream, ScopeRunner};
use crate::domain::errors::ApiError;
use crate::domain::events::SatelliteEvent;
use crate::domain::lock_domain::{LockMode, LockObj, LockRequest};
use crate::domain::names::{NodeName, ResourceName};
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::object_store::Transaction;
use crate::infrastructure::satellite::SatelliteRegistry;
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Source of follow-up work when satellites become reachable.
///
/// Both hooks run while read locks on every domain are held and must not
/// block; they only inspect `tx` and return cold streams.
pub trait ConnectionListener: Send + Sync {
    fn name(&self) -> &'static str;

    /// Every resource of `rsc_name` is on an online satellite
    fn resource_definition_connected(
        &self,
        _tx: &Transaction,
        _rsc_name: &ResourceName,
    ) -> Result<Vec<RcStream>, ApiError> {
        Ok(Vec::new())
    }

    /// The satellite of `node_name` finished its full sync
    fn node_connected(&self, _tx: &Transaction, _node_name: &NodeName) -> Result<Vec<RcStream>, ApiError> {
        Ok(Vec::new())
    }
}

type Listeners = Vec<Arc<dyn ConnectionListener>>;

pub struct ConnectionNotifier {
    runner: ScopeRunner,
    registry: Arc<SatelliteRegistry>,
    background: BackgroundRunner,
    listeners: RwLock<Vec<Weak<dyn ConnectionListener>>>,
    /// Resource definitions with a running resumption; the flag requests
    /// one more pass
    in_flight: Mutex<HashMap<ResourceName, bool>>,
}

impl ConnectionNotifier {
    pub fn new(runner: ScopeRunner, registry: Arc<SatelliteRegistry>, background: BackgroundRunner) -> Self {
        Self {
            runner,
            registry,
            background,
            listeners: RwLock::new(Vec::new()),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Listeners are consulted in registration order. Only a weak reference
    /// is kept.
    pub fn register(&self, listener: &Arc<dyn ConnectionListener>) {
        debug!(listener = listener.name(), "connection listener registered");
        self.listeners.write().push(Arc::downgrade(listener));
    }

    fn listeners(&self) -> Listeners {
        let mut listeners = self.listeners.write();
        listeners.retain(|l| l.strong_count() > 0);
        listeners.iter().filter_map(Weak::upgrade).collect()
    }

    /// Starts reacting to satellites coming online
    pub fn start(self: &Arc<Self>, event_bus: &EventBus, cancel: CancellationToken) -> JoinHandle<()> {
        let notifier = Arc::clone(self);
        let mut events = event_bus.satellite_events();
        tokio::spawn(async move {
            info!("Connection notifier started");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.next() => match event {
                        Some(SatelliteEvent::Online { node_name, .. }) => {
                            notifier.node_online(node_name).await;
                        }
                        Some(other) => {
                            debug!(node = %other.node_name(), "satellite event ignored by notifier");
                        }
                        None => break,
                    }
                }
            }
            info!("Connection notifier stopped");
        })
    }

    /// Collects the follow-ups for a node that just came online
    pub async fn node_online(self: &Arc<Self>, node_name: NodeName) {
        let listeners = self.listeners();
        let node = node_name.clone();
        let collected = self
            .read_state(format!("node '{}' connected", node_name), move |tx| {
                let follow_ups = ask(&listeners, |l| l.node_connected(tx, &node));
                let rsc_names: Vec<ResourceName> = tx
                    .rsc_dfns()
                    .map(|dfns| {
                        dfns.values()
                            .filter(|dfn| dfn.resources.contains_key(&node))
                            .map(|dfn| dfn.name.clone())
                            .collect()
                    })
                    .unwrap_or_default();
                (follow_ups, rsc_names)
            })
            .await;

        match collected {
            Ok((follow_ups, rsc_names)) => {
                for stream in follow_ups {
                    metrics::counter!("stork_resumptions_total", "trigger" => "node").increment(1);
                    self.background
                        .spawn(format!("resuming work for node '{}'", node_name), stream);
                }
                for rsc_name in rsc_names {
                    self.check_resource_definition(rsc_name);
                }
            }
            Err(e) => warn!(node = %node_name, error = %e, "Could not collect follow-ups"),
        }
    }

    /// Schedules a resumption pass for one resource definition
    pub fn check_resource_definition(self: &Arc<Self>, rsc_name: ResourceName) {
        {
            let mut in_flight = self.in_flight.lock();
            if let Some(rerun) = in_flight.get_mut(&rsc_name) {
                debug!(rsc = %rsc_name, "resumption already running, scheduling another pass");
                *rerun = true;
                return;
            }
            in_flight.insert(rsc_name.clone(), false);
        }
        let notifier = Arc::clone(self);
        let description = format!("resuming resource definition '{}'", rsc_name);
        self.background.spawn_task(description, async move {
            notifier.resume_resource_definition(rsc_name).await;
        });
    }

    async fn resume_resource_definition(self: Arc<Self>, rsc_name: ResourceName) {
        loop {
            let listeners = self.listeners();
            let registry = Arc::clone(&self.registry);
            let rsc = rsc_name.clone();
            let collected = self
                .read_state(format!("resource definition '{}' connected", rsc_name), move |tx| {
                    let connected = match tx.rsc_dfns() {
                        Ok(dfns) => dfns.get(&rsc).is_some_and(|dfn| {
                            !dfn.resources.is_empty()
                                && dfn.resources.keys().all(|node| registry.is_online(node))
                        }),
                        Err(_) => false,
                    };
                    if connected {
                        ask(&listeners, |l| l.resource_definition_connected(tx, &rsc))
                    } else {
                        Vec::new()
                    }
                })
                .await;

            match collected {
                Ok(follow_ups) => {
                    for stream in follow_ups {
                        metrics::counter!("stork_resumptions_total", "trigger" => "resource_definition")
                            .increment(1);
                        self.background
                            .run(format!("resuming resource definition '{}'", rsc_name), stream)
                            .await;
                    }
                }
                Err(e) => warn!(rsc = %rsc_name, error = %e, "Could not collect follow-ups"),
            }

            let rerun = {
                let mut in_flight = self.in_flight.lock();
                match in_flight.get_mut(&rsc_name) {
                    Some(rerun) if *rerun => {
                        *rerun = false;
                        true
                    }
                    _ => {
                        in_flight.remove(&rsc_name);
                        false
                    }
                }
            };
            if !rerun {
                break;
            }
        }
    }

    /// Runs `inspect` under read locks on every domain and returns its result
    async fn read_state<T, F>(&self, description: String, inspect: F) -> Result<T, ApiError>
    where
        T: Send + 'static,
        F: FnOnce(&Transaction) -> T + Send + 'static,
    {
        let slot = Arc::new(Mutex::new(None));
        let out = Arc::clone(&slot);
        let mut scope = self.runner.transactionless(
            description,
            LockRequest::all(LockMode::Read, &LockObj::ALL),
            move |scope| {
                let value = scope.with_tx(|tx| inspect(tx));
                *out.lock() = Some(value);
                empty_stream()
            },
        );
        while let Some(item) = scope.next().await {
            item?;
        }
        let value = slot.lock().take();
        value.ok_or_else(|| ApiError::implementation("inspection scope finished without a result"))
    }
}

/// Asks every listener, logging and skipping the ones that fail
fn ask<F>(listeners: &Listeners, mut hook: F) -> Vec<RcStream>
where
    F: FnMut(&dyn ConnectionListener) -> Result<Vec<RcStream>, ApiError>,
{
    let mut follow_ups = Vec::new();
    for listener in listeners {
        match hook(listener.as_ref()) {
            Ok(streams) => follow_ups.extend(streams),
            Err(e) => warn!(listener = listener.name(), error = %e, "Connection listener failed"),
        }
    }
    follow_ups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::lock_manager::LockManager;
    use crate::application::scope_runner::single;
    use crate::domain::api_rc::{ApiCallRc, RcEntry, ReturnCode};
    use crate::domain::flags::StateFlags;
    use crate::domain::names::ResourceGroupName;
    use crate::domain::resource::Resource;
    use crate::domain::resource_definition::ResourceDefinition;
    use crate::infrastructure::number_pools::NumberPools;
    use crate::infrastructure::object_store::ObjectStore;
    use crate::infrastructure::repositories::InMemoryPersistence;
    use crate::infrastructure::satellite::MockSatellite;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Semaphore;

    struct Counting {
        rsc_calls: AtomicUsize,
        node_calls: AtomicUsize,
    }

    impl ConnectionListener for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn resource_definition_connected(
            &self,
            _tx: &Transaction,
            _rsc_name: &ResourceName,
        ) -> Result<Vec<RcStream>, ApiError> {
            self.rsc_calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![single(ApiCallRc::single(RcEntry::new(ReturnCode::MODIFIED, "resumed")))])
        }

        fn node_connected(&self, _tx: &Transaction, _node_name: &NodeName) -> Result<Vec<RcStream>, ApiError> {
            self.node_calls.fetch_add(1, Ordering::SeqCst);
            Ok(Vec::new())
        }
    }

    fn name(n: &str) -> NodeName {
        NodeName::new(n).unwrap()
    }

    async fn setup(nodes: &[&str]) -> (Arc<ConnectionNotifier>, Arc<SatelliteRegistry>, EventBus, BackgroundRunner) {
        let bus = EventBus::new(64);
        let store = ObjectStore::new(
            Arc::new(InMemoryPersistence::new()),
            Arc::new(NumberPools::default()),
            bus.clone(),
        );
        let mut tx = store.begin(true);
        tx.attach(LockObj::ResourceDefinitions, LockMode::Write);
        let rsc = ResourceName::new("r1").unwrap();
        let mut dfn = ResourceDefinition::new(rsc.clone(), ResourceGroupName::new("DfltRscGrp").unwrap(), 7000);
        for n in nodes {
            dfn.resources
                .insert(name(n), Resource::new(name(n), rsc.clone(), StateFlags::empty()));
        }
        tx.rsc_dfns_mut().unwrap().insert(rsc, dfn);
        tx.commit().await.unwrap();

        let runner = ScopeRunner::new(Arc::new(LockManager::new()), store);
        let registry = Arc::new(SatelliteRegistry::new(bus.clone()));
        let background = BackgroundRunner::new(4);
        let notifier = Arc::new(ConnectionNotifier::new(runner, registry.clone(), background.clone()));
        (notifier, registry, bus, background)
    }

    fn bring_online(registry: &SatelliteRegistry, node: &str) {
        registry.connect(Arc::new(MockSatellite::new(name(node))));
        registry.mark_online(&name(node));
    }

    #[tokio::test]
    async fn test_resumes_only_when_fully_connected() {
        let (notifier, registry, bus, background) = setup(&["alpha", "bravo"]).await;
        let listener = Arc::new(Counting {
            rsc_calls: AtomicUsize::new(0),
            node_calls: AtomicUsize::new(0),
        });
        let as_dyn: Arc<dyn ConnectionListener> = listener.clone();
        notifier.register(&as_dyn);
        let handle = notifier.start(&bus, background.cancellation_token());

        bring_online(&registry, "alpha");
        tokio::time::sleep(Duration::from_millis(50)).await;
        background.wait_idle().await;
        assert_eq!(listener.node_calls.load(Ordering::SeqCst), 1);
        assert_eq!(listener.rsc_calls.load(Ordering::SeqCst), 0);

        bring_online(&registry, "bravo");
        tokio::time::sleep(Duration::from_millis(50)).await;
        background.wait_idle().await;
        assert_eq!(listener.rsc_calls.load(Ordering::SeqCst), 1);

        background.shutdown().await;
        let _ = handle.await;
    }

    #[tokio::test]
    async fn test_dropped_listener_is_skipped() {
        let (notifier, registry, _bus, background) = setup(&["alpha"]).await;
        let listener: Arc<dyn ConnectionListener> = Arc::new(Counting {
            rsc_calls: AtomicUsize::new(0),
            node_calls: AtomicUsize::new(0),
        });
        notifier.register(&listener);
        drop(listener);
        bring_online(&registry, "alpha");
        notifier.node_online(name("alpha")).await;
        background.wait_idle().await;
        assert!(notifier.listeners().is_empty());
    }

    /// Returns a stream that stays pending until the gate opens
    struct Gated {
        calls: AtomicUsize,
        gate: Arc<Semaphore>,
    }

    impl ConnectionListener for Gated {
        fn name(&self) -> &'static str {
            "gated"
        }

        fn resource_definition_connected(
            &self,
            _tx: &Transaction,
            _rsc_name: &ResourceName,
        ) -> Result<Vec<RcStream>, ApiError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let gate = Arc::clone(&self.gate);
            Ok(vec![futures::stream::once(async move {
                let _permit = gate.acquire().await;
                Ok(ApiCallRc::single(RcEntry::new(ReturnCode::MODIFIED, "resumed")))
            })
            .boxed()])
        }
    }

    #[tokio::test]
    async fn test_concurrent_triggers_coalesce() {
        let (notifier, registry, _bus, background) = setup(&["alpha"]).await;
        let listener = Arc::new(Gated {
            calls: AtomicUsize::new(0),
            gate: Arc::new(Semaphore::new(0)),
        });
        let as_dyn: Arc<dyn ConnectionListener> = listener.clone();
        notifier.register(&as_dyn);
        bring_online(&registry, "alpha");

        let rsc = ResourceName::new("r1").unwrap();
        notifier.check_resource_definition(rsc.clone());
        tokio::time::timeout(Duration::from_secs(2), async {
            while listener.calls.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("first pass must reach the listener");

        // the first pass is stuck in its follow-up stream
        for _ in 0..5 {
            notifier.check_resource_definition(rsc.clone());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(listener.calls.load(Ordering::SeqCst), 1);

        listener.gate.add_permits(1);
        background.wait_idle().await;
        assert_eq!(listener.calls.load(Ordering::SeqCst), 2);
        assert!(notifier.in_flight.lock().is_empty());
    }
}
