// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Shared harness: an in-memory controller whose satellites are mocks.

#![allow(dead_code)]

use futures::StreamExt;
use std::collections::BTreeMap;
use std::sync::Arc;
use stork_core::application::nodes::NodeSpec;
use stork_core::application::resource_definitions::ResourceDefinitionSpec;
use stork_core::application::resources::ResourceSpec;
use stork_core::application::storage_pools::StorPoolSpec;
use stork_core::application::volume_definitions::VolumeDefinitionSpec;
use stork_core::application::{ApiResponse, Controller};
use stork_core::domain::access::Principal;
use stork_core::domain::api_rc::{ApiCallRc, ReturnCode};
use stork_core::domain::controller_config::ControllerConfigSpec;
use stork_core::domain::names::{NodeName, ResourceName, StorPoolName};
use stork_core::domain::node::NodeType;
use stork_core::domain::satellite::SatellitePeer;
use stork_core::domain::storage_pool::DeviceProviderKind;
use stork_core::infrastructure::repositories::InMemoryPersistence;
use stork_core::infrastructure::satellite::MockBehavior;
use stork_core::infrastructure::{EventBus, MockSatellite, NumberPools, ObjectStore, SatelliteRegistry};

pub struct Harness {
    pub controller: Arc<Controller>,
    pub driver: Arc<InMemoryPersistence>,
    pub satellites: BTreeMap<String, Arc<MockSatellite>>,
}

pub async fn harness() -> Harness {
    let mut spec = ControllerConfigSpec::default();
    spec.satellite_timeout_secs = 2;
    let driver = Arc::new(InMemoryPersistence::new());
    let event_bus = EventBus::new(256);
    let store = ObjectStore::new(driver.clone(), Arc::new(NumberPools::default()), event_bus.clone());
    let registry = Arc::new(SatelliteRegistry::new(event_bus.clone()));
    let controller = Controller::new(store, registry, event_bus, &spec);
    controller.ensure_defaults().await.expect("default objects");
    Harness {
        controller,
        driver,
        satellites: BTreeMap::new(),
    }
}

pub fn admin() -> Principal {
    Principal::admin("tester")
}

pub fn node(name: &str) -> NodeName {
    NodeName::new(name).unwrap()
}

pub fn rsc(name: &str) -> ResourceName {
    ResourceName::new(name).unwrap()
}

pub async fn collect(response: ApiResponse) -> Vec<ApiCallRc> {
    response.collect().await
}

pub fn codes(batches: &[ApiCallRc]) -> Vec<ReturnCode> {
    batches.iter().flat_map(|rc| rc.codes()).collect()
}

pub fn has_errors(batches: &[ApiCallRc]) -> bool {
    batches.iter().any(ApiCallRc::has_errors)
}

impl Harness {
    /// Registers a satellite node; `online` also connects its mock peer
    pub async fn add_node(&mut self, name: &str, online: bool) {
        let batches = collect(self.controller.nodes.create(
            &admin(),
            NodeSpec {
                name: node(name),
                node_type: NodeType::Satellite,
                props: BTreeMap::new(),
            },
        ))
        .await;
        assert!(!has_errors(&batches), "node create failed: {:?}", batches);
        if online {
            self.connect(name);
        }
    }

    /// Connects the mock peer of `name` and completes its full sync
    pub fn connect(&mut self, name: &str) -> Arc<MockSatellite> {
        self.connect_with(name, MockBehavior::Ack)
    }

    pub fn connect_with(&mut self, name: &str, behavior: MockBehavior) -> Arc<MockSatellite> {
        let mock = Arc::new(MockSatellite::with_behavior(node(name), behavior));
        let peer: Arc<dyn SatellitePeer> = mock.clone();
        self.controller.ctx.registry.connect(peer);
        assert!(self.controller.ctx.registry.mark_online(&node(name)));
        self.satellites.insert(name.to_string(), Arc::clone(&mock));
        mock
    }

    pub fn satellite(&self, name: &str) -> Arc<MockSatellite> {
        Arc::clone(&self.satellites[name])
    }

    pub async fn add_stor_pool(&self, node_name: &str, pool: &str, provider: DeviceProviderKind) {
        let batches = collect(self.controller.storage_pools.create(
            &admin(),
            StorPoolSpec {
                node_name: node(node_name),
                name: StorPoolName::new(pool).unwrap(),
                provider,
                props: BTreeMap::new(),
            },
        ))
        .await;
        assert!(!has_errors(&batches), "storage pool create failed: {:?}", batches);
    }

    pub async fn add_definition(&self, name: &str) {
        let batches = collect(self.controller.resource_definitions.create(
            &admin(),
            ResourceDefinitionSpec {
                name: rsc(name),
                resource_group: None,
                tcp_port: None,
                props: BTreeMap::new(),
            },
        ))
        .await;
        assert!(!has_errors(&batches), "definition create failed: {:?}", batches);
    }

    pub async fn add_volume(&self, rsc_name: &str, size_kib: u64) {
        let batches = collect(self.controller.volume_definitions.create(
            &admin(),
            VolumeDefinitionSpec {
                rsc_name: rsc(rsc_name),
                number: None,
                size_kib,
                minor: None,
            },
        ))
        .await;
        assert!(!has_errors(&batches), "volume definition create failed: {:?}", batches);
    }

    /// Places a resource; `stor_pool` of `None` makes it diskless
    pub async fn add_resource(&self, node_name: &str, rsc_name: &str, stor_pool: Option<&str>) -> Vec<ApiCallRc> {
        let batches = collect(self.controller.resources.create(
            &admin(),
            ResourceSpec {
                node_name: node(node_name),
                rsc_name: rsc(rsc_name),
                stor_pool: stor_pool.map(|p| StorPoolName::new(p).unwrap()),
                diskless: stor_pool.is_none(),
            },
        ))
        .await;
        assert!(!has_errors(&batches), "resource create failed: {:?}", batches);
        batches
    }
}
