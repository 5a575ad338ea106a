// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Concurrent operations over overlapping lock sets, and all-or-nothing commits.

mod common;

use common::{admin, codes, collect, has_errors, harness, rsc};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use stork_core::application::lock_manager::LockManager;
use stork_core::application::remotes::RemoteSpec;
use stork_core::application::resource_definitions::ResourceDefinitionSpec;
use stork_core::application::resource_groups::ResourceGroupChange;
use stork_core::domain::api_rc::{ApiCallRc, ReturnCode};
use stork_core::domain::lock_domain::{LockMode, LockObj, LockRequest};
use stork_core::domain::names::{RemoteName, ResourceGroupName};
use stork_core::domain::number_pool::PoolKind;
use stork_core::domain::props::PropsChange;
use stork_core::domain::remote::RemoteKind;
use stork_core::domain::resource_definition::DEFAULT_RESOURCE_GROUP;
use tokio::task::JoinSet;

fn definition(name: &str) -> ResourceDefinitionSpec {
    ResourceDefinitionSpec {
        name: rsc(name),
        resource_group: None,
        tcp_port: None,
        props: BTreeMap::new(),
    }
}

/// Readers and writers currently inside one domain
#[derive(Default)]
struct Occupancy {
    readers: AtomicUsize,
    writers: AtomicUsize,
}

/// Up to four domains named in random order, each read or written at random
fn shuffled_request(rng: &mut StdRng) -> LockRequest {
    let mut domains = LockObj::ALL.to_vec();
    domains.shuffle(rng);
    let count = rng.random_range(1..=4);
    domains
        .into_iter()
        .take(count)
        .fold(LockRequest::new(), |request, obj| {
            if rng.random_bool(0.5) {
                request.write(&[obj])
            } else {
                request.read(&[obj])
            }
        })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shuffled_lock_requests_never_deadlock() {
    let manager = Arc::new(LockManager::new());
    let occupancy: Arc<Vec<Occupancy>> = Arc::new(LockObj::ALL.iter().map(|_| Occupancy::default()).collect());

    let mut tasks = JoinSet::new();
    for seed in 0..200u64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let request = shuffled_request(&mut rng);
        let hold = Duration::from_millis(rng.random_range(0..3));
        let manager = Arc::clone(&manager);
        let occupancy = Arc::clone(&occupancy);
        tasks.spawn(async move {
            let set = manager.acquire(&request).await;
            let held = set.held();
            assert!(
                held.windows(2).all(|w| w[0].0 < w[1].0),
                "locks taken out of order: {:?}",
                held
            );
            assert_eq!(held, request.iter().collect::<Vec<_>>());

            for (obj, mode) in &held {
                let slot = &occupancy[obj.index()];
                match mode {
                    LockMode::Write => {
                        assert_eq!(slot.writers.fetch_add(1, Ordering::SeqCst), 0, "{} written twice", obj);
                        assert_eq!(slot.readers.load(Ordering::SeqCst), 0, "{} read while written", obj);
                    }
                    LockMode::Read => {
                        slot.readers.fetch_add(1, Ordering::SeqCst);
                        assert_eq!(slot.writers.load(Ordering::SeqCst), 0, "{} written while read", obj);
                    }
                }
            }

            tokio::time::sleep(hold).await;
            tokio::task::yield_now().await;

            for (obj, mode) in &held {
                let slot = &occupancy[obj.index()];
                match mode {
                    LockMode::Write => slot.writers.fetch_sub(1, Ordering::SeqCst),
                    LockMode::Read => slot.readers.fetch_sub(1, Ordering::SeqCst),
                };
            }
            drop(set);
        });
    }

    tokio::time::timeout(Duration::from_secs(30), async {
        while let Some(joined) = tasks.join_next().await {
            joined.expect("lock task panicked");
        }
    })
    .await
    .expect("lock acquisition deadlocked");
}

#[tokio::test]
async fn test_mixed_operations_complete_without_deadlock() {
    let mut h = harness().await;
    h.add_node("alpha", true).await;
    let controller = h.controller.clone();

    let mut tasks: JoinSet<Vec<ApiCallRc>> = JoinSet::new();
    for i in 0..10 {
        let c = controller.clone();
        tasks.spawn(async move { collect(c.resource_definitions.create(&admin(), definition(&format!("res{}", i)))).await });

        let c = controller.clone();
        tasks.spawn(async move {
            let change = PropsChange::new().set(format!("Aux/key{}", i), "v");
            collect(c.controller_props.modify(&admin(), change)).await
        });

        let c = controller.clone();
        tasks.spawn(async move {
            let change = ResourceGroupChange {
                props: PropsChange::new().set("Aux/round", i.to_string()),
                ..ResourceGroupChange::default()
            };
            collect(c.resource_groups.modify(
                &admin(),
                ResourceGroupName::new(DEFAULT_RESOURCE_GROUP).unwrap(),
                change,
            ))
            .await
        });

        let c = controller.clone();
        tasks.spawn(async move {
            let spec = RemoteSpec {
                name: RemoteName::new(format!("s3-{}", i)).unwrap(),
                kind: RemoteKind::S3 {
                    endpoint: "s3.example.com".to_string(),
                    bucket: format!("bucket-{}", i),
                    region: "eu-west-1".to_string(),
                },
                props: BTreeMap::new(),
            };
            collect(c.remotes.create(&admin(), spec)).await
        });
    }

    let all = tokio::time::timeout(Duration::from_secs(30), async {
        let mut all = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            all.extend(joined.expect("operation task panicked"));
        }
        all
    })
    .await
    .expect("operations deadlocked");

    assert!(!has_errors(&all), "unexpected errors: {:?}", all);
    let state = controller.ctx.store.snapshot();
    assert_eq!(state.rsc_dfns.len(), 10);
    assert_eq!(state.remotes.len(), 10);
    assert_eq!(state.ctrl.props.len(), 10);
    assert_eq!(controller.ctx.store.pools().allocated_count(PoolKind::TcpPort), 10);
}

#[tokio::test]
async fn test_failed_commit_leaves_no_trace() {
    let h = harness().await;
    let commits_before = h.driver.commit_count();
    h.driver.fail_next_commit("disk full");

    let batches = collect(h.controller.resource_definitions.create(&admin(), definition("r1"))).await;
    assert!(codes(&batches).contains(&ReturnCode::FAIL_SQL));
    assert!(!h.controller.ctx.store.snapshot().rsc_dfns.contains_key(&rsc("r1")));
    assert_eq!(h.controller.ctx.store.pools().allocated_count(PoolKind::TcpPort), 0);
    assert_eq!(h.driver.commit_count(), commits_before);

    let batches = collect(h.controller.resource_definitions.create(&admin(), definition("r1"))).await;
    assert!(!has_errors(&batches));
    assert!(h.controller.ctx.store.snapshot().rsc_dfns.contains_key(&rsc("r1")));
    assert_eq!(h.controller.ctx.store.pools().allocated_count(PoolKind::TcpPort), 1);
    assert_eq!(h.driver.commit_count(), commits_before + 1);
}

#[tokio::test]
async fn test_rejected_operation_writes_nothing() {
    let h = harness().await;
    h.add_definition("r1").await;
    let commits_before = h.driver.commit_count();

    let batches = collect(h.controller.resource_definitions.create(&admin(), definition("r1"))).await;
    assert!(codes(&batches).contains(&ReturnCode::FAIL_EXISTS_RSC_DFN));
    assert_eq!(h.driver.commit_count(), commits_before);
    assert_eq!(h.controller.ctx.store.pools().allocated_count(PoolKind::TcpPort), 1);
}
