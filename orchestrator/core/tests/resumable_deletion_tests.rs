// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Deleting a resource definition while one of its satellites is offline
//! leaves it marked; the deletion finishes once that satellite comes back.

mod common;

use common::{admin, codes, collect, has_errors, harness, node, rsc, Harness};
use stork_core::domain::api_rc::ReturnCode;
use stork_core::domain::number_pool::PoolKind;
use stork_core::domain::satellite::PeerError;
use stork_core::infrastructure::satellite::MockBehavior;

async fn two_node_definition(bravo_online: bool) -> (Harness, u32) {
    let mut h = harness().await;
    h.add_node("alpha", true).await;
    h.add_node("bravo", bravo_online).await;
    h.add_definition("r1").await;
    h.add_resource("alpha", "r1", None).await;
    h.add_resource("bravo", "r1", None).await;
    let port = h.controller.ctx.store.snapshot().rsc_dfns[&rsc("r1")].tcp_port;
    (h, port)
}

#[tokio::test]
async fn test_delete_waits_for_offline_satellite() {
    let (mut h, port) = two_node_definition(false).await;

    let batches = collect(h.controller.resource_definitions.delete(&admin(), rsc("r1"))).await;
    assert!(!has_errors(&batches), "delete reported errors: {:?}", batches);

    let state = h.controller.ctx.store.snapshot();
    let dfn = state.rsc_dfns.get(&rsc("r1")).expect("definition kept until bravo confirms");
    assert!(dfn.is_deleting());
    assert!(dfn.resources.values().all(|r| r.is_deleting()));
    assert!(h.controller.ctx.store.pools().is_allocated(PoolKind::TcpPort, port));

    let bravo = h.connect("bravo");
    let notifier = h.controller.ctx.notifier.clone();
    tokio::join!(notifier.node_online(node("bravo")), notifier.node_online(node("bravo")));
    h.controller.ctx.background.wait_idle().await;

    assert!(!h.controller.ctx.store.snapshot().rsc_dfns.contains_key(&rsc("r1")));
    assert!(!h.controller.ctx.store.pools().is_allocated(PoolKind::TcpPort, port));
    assert_eq!(bravo.received_count(), 1);
}

#[tokio::test]
async fn test_flapping_satellite_keeps_definition_until_acknowledged() {
    let (mut h, port) = two_node_definition(false).await;
    collect(h.controller.resource_definitions.delete(&admin(), rsc("r1"))).await;

    let bravo = h.connect_with(
        "bravo",
        MockBehavior::Fail(PeerError::ConnectionLost("reset by peer".to_string())),
    );
    let notifier = h.controller.ctx.notifier.clone();
    notifier.node_online(node("bravo")).await;
    h.controller.ctx.background.wait_idle().await;

    assert!(h.controller.ctx.store.snapshot().rsc_dfns[&rsc("r1")].is_deleting());
    assert!(h.controller.ctx.store.pools().is_allocated(PoolKind::TcpPort, port));
    assert_eq!(bravo.received_count(), 1);

    bravo.set_behavior(MockBehavior::Ack);
    notifier.node_online(node("bravo")).await;
    h.controller.ctx.background.wait_idle().await;

    assert!(!h.controller.ctx.store.snapshot().rsc_dfns.contains_key(&rsc("r1")));
    assert!(!h.controller.ctx.store.pools().is_allocated(PoolKind::TcpPort, port));
    assert_eq!(bravo.received_count(), 2);
}

#[tokio::test]
async fn test_delete_with_all_satellites_online_finishes_immediately() {
    let (h, port) = two_node_definition(true).await;

    let batches = collect(h.controller.resource_definitions.delete(&admin(), rsc("r1"))).await;
    assert!(!has_errors(&batches), "delete reported errors: {:?}", batches);

    assert!(!h.controller.ctx.store.snapshot().rsc_dfns.contains_key(&rsc("r1")));
    assert!(!h.controller.ctx.store.pools().is_allocated(PoolKind::TcpPort, port));
}

#[tokio::test]
async fn test_second_delete_reports_in_progress() {
    let (h, _) = two_node_definition(false).await;
    collect(h.controller.resource_definitions.delete(&admin(), rsc("r1"))).await;

    let batches = collect(h.controller.resource_definitions.delete(&admin(), rsc("r1"))).await;
    assert!(!has_errors(&batches));
    assert!(codes(&batches).contains(&ReturnCode::WARN_DELETE_IN_PROGRESS));
}
