// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Evicting lost nodes, evacuating live ones and restoring both.

mod common;

use common::{admin, codes, collect, has_errors, harness, node, rsc, Harness};
use stork_core::domain::api_rc::ReturnCode;
use stork_core::domain::storage_pool::{DeviceProviderKind, DEFAULT_STOR_POOL};

/// `r1` diskful on alpha and bravo, with its tie-breaker on charlie
async fn three_nodes() -> Harness {
    let mut h = harness().await;
    for n in ["alpha", "bravo", "charlie"] {
        h.add_node(n, true).await;
        h.add_stor_pool(n, DEFAULT_STOR_POOL, DeviceProviderKind::LvmThin).await;
    }
    h.add_definition("r1").await;
    h.add_volume("r1", 1024 * 1024).await;
    h.add_resource("alpha", "r1", Some(DEFAULT_STOR_POOL)).await;
    h.add_resource("bravo", "r1", Some(DEFAULT_STOR_POOL)).await;
    h
}

fn node_flags(h: &Harness, name: &str) -> Vec<String> {
    h.controller.ctx.store.snapshot().nodes.nodes[&node(name)].flags.names()
}

fn holds_r1(h: &Harness, name: &str) -> bool {
    h.controller.ctx.store.snapshot().rsc_dfns[&rsc("r1")]
        .resources
        .contains_key(&node(name))
}

#[tokio::test]
async fn test_evacuation_moves_off_replicas_but_keeps_last_disk() {
    let h = three_nodes().await;
    assert!(holds_r1(&h, "charlie"), "tie-breaker expected on charlie");

    let batches = collect(h.controller.nodes.evacuate(&admin(), node("bravo"))).await;
    assert!(!has_errors(&batches), "evacuate reported errors: {:?}", batches);
    assert_eq!(node_flags(&h, "bravo"), vec!["EVACUATE"]);
    assert!(!holds_r1(&h, "bravo"));
    assert!(holds_r1(&h, "alpha"));

    let batches = collect(h.controller.nodes.evacuate(&admin(), node("alpha"))).await;
    assert!(codes(&batches).contains(&ReturnCode::WARN_EVACUATION_BLOCKED));
    assert!(!has_errors(&batches), "blocked evacuation is only a warning: {:?}", batches);
    assert!(holds_r1(&h, "alpha"));

    let batches = collect(h.controller.nodes.restore(&admin(), node("alpha"))).await;
    assert!(codes(&batches).contains(&ReturnCode::MODIFIED));
    assert!(node_flags(&h, "alpha").is_empty());
    assert_eq!(node_flags(&h, "bravo"), vec!["EVACUATE"]);
}

#[tokio::test]
async fn test_only_disconnected_nodes_can_be_evicted() {
    let h = three_nodes().await;
    let commits_before = h.driver.commit_count();

    let batches = collect(h.controller.nodes.evict(&admin(), node("bravo"))).await;
    assert!(codes(&batches).contains(&ReturnCode::FAIL_IN_USE));
    assert_eq!(h.driver.commit_count(), commits_before);

    h.controller.ctx.registry.forget(&node("bravo"));
    let batches = collect(h.controller.nodes.evict(&admin(), node("bravo"))).await;
    assert!(!has_errors(&batches), "evict reported errors: {:?}", batches);
    assert_eq!(node_flags(&h, "bravo"), vec!["EVICTED"]);
    assert!(holds_r1(&h, "bravo"), "eviction keeps the resources of the node");

    let batches = collect(h.controller.nodes.evict(&admin(), node("bravo"))).await;
    assert!(codes(&batches).contains(&ReturnCode::INFO_NO_PENDING_WORK));

    let batches = collect(h.controller.nodes.restore(&admin(), node("bravo"))).await;
    assert!(!has_errors(&batches), "restore reported errors: {:?}", batches);
    assert!(node_flags(&h, "bravo").is_empty());
}
