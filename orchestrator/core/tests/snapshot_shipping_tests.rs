// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Shipping snapshots between two resources of the same definition.

mod common;

use common::{admin, codes, collect, has_errors, harness, node, rsc, Harness};
use stork_core::application::snapshot_shipping::ShippingSpec;
use stork_core::domain::access::Principal;
use stork_core::domain::api_rc::ReturnCode;
use stork_core::domain::names::SnapshotName;
use stork_core::domain::number_pool::PoolKind;
use stork_core::domain::props::keys;
use stork_core::domain::snapshot::{SnapshotDefinition, SnapshotDefinitionFlag};
use stork_core::domain::storage_pool::{DeviceProviderKind, DEFAULT_STOR_POOL};

/// `r1` active on alpha and deactivated on bravo
async fn receiving_bravo() -> Harness {
    let mut h = harness().await;
    for n in ["alpha", "bravo"] {
        h.add_node(n, true).await;
        h.add_stor_pool(n, DEFAULT_STOR_POOL, DeviceProviderKind::LvmThin).await;
    }
    h.add_definition("r1").await;
    h.add_volume("r1", 1024 * 1024).await;
    h.add_resource("alpha", "r1", Some(DEFAULT_STOR_POOL)).await;
    h.add_resource("bravo", "r1", Some(DEFAULT_STOR_POOL)).await;
    let batches = collect(h.controller.resources.deactivate(&admin(), node("bravo"), rsc("r1"))).await;
    assert!(!has_errors(&batches), "deactivate reported errors: {:?}", batches);
    h
}

fn shipment() -> ShippingSpec {
    ShippingSpec {
        rsc_name: rsc("r1"),
        from_node: node("alpha"),
        to_node: node("bravo"),
    }
}

fn snapshot_dfn(h: &Harness, name: &str) -> SnapshotDefinition {
    h.controller.ctx.store.snapshot().rsc_dfns[&rsc("r1")].snapshot_dfns[&SnapshotName::new(name).unwrap()].clone()
}

#[tokio::test]
async fn test_shipment_blocks_target_until_finished() {
    let h = receiving_bravo().await;

    let batches = collect(h.controller.snapshot_shipping.ship(&admin(), shipment())).await;
    assert!(!has_errors(&batches), "ship reported errors: {:?}", batches);
    let snap_dfn = snapshot_dfn(&h, "ship_0");
    assert!(snap_dfn.is_shipping());
    assert!(snap_dfn.flags.is_set(SnapshotDefinitionFlag::Successful));
    let port: u32 = snap_dfn.props.get(keys::SHIPPING_PORT).unwrap().parse().unwrap();

    let batches = collect(h.controller.resources.activate(&admin(), node("bravo"), rsc("r1"))).await;
    assert!(codes(&batches).contains(&ReturnCode::FAIL_IN_USE));

    let batches = collect(h.controller.snapshot_shipping.ship(&admin(), shipment())).await;
    assert!(codes(&batches).contains(&ReturnCode::FAIL_EXISTS_SNAPSHOT_SHIPPING));

    let batches = collect(h.controller.snapshot_shipping.shipping_finished(
        &admin(),
        rsc("r1"),
        SnapshotName::new("ship_0").unwrap(),
        true,
    ))
    .await;
    assert!(has_errors(&batches), "only satellites report shipments");

    let batches = collect(h.controller.snapshot_shipping.shipping_finished(
        &Principal::System,
        rsc("r1"),
        SnapshotName::new("ship_0").unwrap(),
        true,
    ))
    .await;
    assert!(codes(&batches).contains(&ReturnCode::MODIFIED));
    let snap_dfn = snapshot_dfn(&h, "ship_0");
    assert!(!snap_dfn.is_shipping());
    assert!(snap_dfn.flags.is_set(SnapshotDefinitionFlag::Shipped));
    assert!(!h.controller.ctx.store.pools().is_allocated(PoolKind::ShippingPort, port));

    let batches = collect(h.controller.resources.activate(&admin(), node("bravo"), rsc("r1"))).await;
    assert!(!has_errors(&batches), "activate reported errors: {:?}", batches);
}

#[tokio::test]
async fn test_active_resource_cannot_receive() {
    let h = receiving_bravo().await;
    collect(h.controller.resources.activate(&admin(), node("bravo"), rsc("r1"))).await;

    let batches = collect(h.controller.snapshot_shipping.ship(&admin(), shipment())).await;
    assert!(codes(&batches).contains(&ReturnCode::FAIL_INVLD_SNAPSHOT_SHIPPING_TARGET));
    assert!(h.controller.ctx.store.snapshot().rsc_dfns[&rsc("r1")].snapshot_dfns.is_empty());
}

#[tokio::test]
async fn test_failed_shipment_is_not_marked_shipped() {
    let h = receiving_bravo().await;
    collect(h.controller.snapshot_shipping.ship(&admin(), shipment())).await;

    let batches = collect(h.controller.snapshot_shipping.shipping_finished(
        &Principal::System,
        rsc("r1"),
        SnapshotName::new("ship_0").unwrap(),
        false,
    ))
    .await;
    assert!(codes(&batches).contains(&ReturnCode::FAIL_SATELLITE));
    let snap_dfn = snapshot_dfn(&h, "ship_0");
    assert!(!snap_dfn.is_shipping());
    assert!(snap_dfn.flags.is_unset(SnapshotDefinitionFlag::Shipped));
}
