//! Integration test: fan-out reads, single-endpoint mutations, health accounting.

mod common;

use common::{bundle_trytes, client, client_with_timeout, hash_of, FakeNode};
use std::sync::Arc;
use std::time::Duration;
use tangle_confirmer::{ApiError, EndpointHealth, NodeError, MIN_WEIGHT_MAGNITUDE};

#[tokio::test(start_paused = true)]
async fn read_returns_the_successful_endpoint() {
    let health = Arc::new(EndpointHealth::new());
    let a = FakeNode::new("a");
    let b = FakeNode::new("b");
    let c = FakeNode::new("c");
    a.with(|s| s.fail_all = true);
    c.with(|s| s.fail_all = true);
    b.with(|s| s.delay = Duration::from_millis(300));
    let api = client(&[a.clone(), b.clone(), c.clone()], &health);

    let reply = api.select_tips(3).await.expect("one endpoint succeeds");
    assert_eq!(reply.endpoint, "b");
    assert_eq!(reply.value.trunk, hash_of('T'));
    assert!(reply.duration >= Duration::from_millis(300));

    // every endpoint received the identical request
    for n in [&a, &b, &c] {
        assert_eq!(n.with(|s| s.calls), 1);
    }
    let stats = health.stats("general");
    assert_eq!(stats.calls, 3);
    assert_eq!(stats.errors, 2);
}

#[tokio::test(start_paused = true)]
async fn first_success_wins_and_stragglers_still_report() {
    let health = Arc::new(EndpointHealth::new());
    let fast = FakeNode::new("fast");
    let slow = FakeNode::new("slow");
    slow.with(|s| s.delay = Duration::from_secs(5));
    let api = client(&[slow.clone(), fast.clone()], &health);

    let reply = api.check_consistency(&[hash_of('X')]).await.unwrap();
    assert_eq!(reply.endpoint, "fast");
    assert_eq!(health.stats("general").calls, 1);

    // the slow call is not abandoned; it completes and is accounted
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(health.stats("general").calls, 2);
    assert_eq!(slow.with(|s| s.consistency_checks), 1);
}

#[tokio::test(start_paused = true)]
async fn all_failing_returns_last_error() {
    let health = Arc::new(EndpointHealth::new());
    let a = FakeNode::new("a");
    let b = FakeNode::new("b");
    let c = FakeNode::new("c");
    for (n, ms) in [(&a, 100), (&b, 900), (&c, 400)] {
        n.with(|s| {
            s.fail_all = true;
            s.delay = Duration::from_millis(ms);
        });
    }
    let api = client(&[a, b, c], &health);

    match api.get_inclusion_states(&[hash_of('X')]).await {
        Err(ApiError::Call {
            endpoint, source, ..
        }) => {
            assert_eq!(endpoint, "b");
            assert!(matches!(source, NodeError::Node(_)));
        }
        other => panic!("expected call error, got {other:?}"),
    }
    let stats = health.stats("general");
    assert_eq!(stats.calls, 3);
    assert_eq!(stats.errors, 3);
}

#[tokio::test(start_paused = true)]
async fn slow_endpoint_times_out() {
    let health = Arc::new(EndpointHealth::new());
    let a = FakeNode::new("a");
    a.with(|s| s.delay = Duration::from_secs(10));
    let api = client_with_timeout("tipsel", &[a], &health, Duration::from_secs(2));

    match api.select_tips(3).await {
        Err(ApiError::Call { source, .. }) => {
            assert!(matches!(source, NodeError::Timeout(d) if d == Duration::from_secs(2)));
        }
        other => panic!("expected timeout, got {other:?}"),
    }
    assert_eq!(health.stats("tipsel").errors, 1);
}

#[tokio::test(start_paused = true)]
async fn mutations_go_to_first_endpoint_only() {
    let health = Arc::new(EndpointHealth::new());
    let a = FakeNode::new("a");
    let b = FakeNode::new("b");
    let api = client(&[a.clone(), b.clone()], &health);
    let trytes = bundle_trytes(&hash_of('B'), 2);

    let attached = api
        .attach_to_tangle(&hash_of('T'), &hash_of('R'), MIN_WEIGHT_MAGNITUDE, &trytes)
        .await
        .unwrap();
    assert_eq!(attached.endpoint, "a");
    assert_eq!(attached.value.len(), 2);
    api.store_and_broadcast(&attached.value).await.unwrap();

    assert_eq!(a.attach_calls().len(), 1);
    assert_eq!(a.attach_calls()[0].min_weight_magnitude, 14);
    assert_eq!(a.with(|s| s.broadcasts), 1);
    assert_eq!(b.with(|s| s.calls), 0);
}

#[tokio::test(start_paused = true)]
async fn bundle_confirmation_needs_an_included_transaction() {
    let health = Arc::new(EndpointHealth::new());
    let a = FakeNode::new("a");
    let api = client(&[a.clone()], &health);
    let bundle = hash_of('B');

    assert!(!api.is_bundle_confirmed(&bundle).await.unwrap().value);
    a.confirm(&bundle);
    assert!(api.is_bundle_confirmed(&bundle).await.unwrap().value);
}

#[tokio::test(start_paused = true)]
async fn balances_fan_out() {
    let health = Arc::new(EndpointHealth::new());
    let a = FakeNode::new("a");
    let api = client(&[a], &health);
    let reply = api.get_balances(&[hash_of('A'), hash_of('B')], 100).await.unwrap();
    assert_eq!(reply.value, vec![0, 0]);
}

#[tokio::test(start_paused = true)]
async fn node_shared_by_two_sets_is_counted_per_set() {
    let health = Arc::new(EndpointHealth::new());
    let a = FakeNode::new("a");
    let general = client(&[a.clone()], &health);
    let tipsel = client_with_timeout("tipsel", &[a.clone()], &health, Duration::from_secs(30));

    a.with(|s| {
        s.fail_ops.insert("check_consistency");
    });
    assert!(general.check_consistency(&[hash_of('T')]).await.is_err());
    tipsel.select_tips(3).await.unwrap();

    let g = health.stats("general");
    assert_eq!((g.calls, g.errors), (1, 1));
    let t = health.stats("tipsel");
    assert_eq!((t.calls, t.errors), (1, 0));
}
