use crate::{globalnetworksets::MAX_ATTEMPTS, FailFn, GlobalNetworkSetController, IpSetController};
use maplit::btreemap;
use pretty_assertions::assert_eq;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use threatfeed_controller_core::{
    fake::{FakeGlobalNetworkSets, FakeSetStore, FakeThreatFeeds, GnsCall, GnsOp},
    ClientError, FeedCacher, GlobalThreatFeed, IpSet, StoreError,
};
use threatfeed_controller_k8s_api::{GlobalNetworkSet, GlobalThreatFeedSpec};
use tokio::time::{self, Duration};
use tokio_util::sync::CancellationToken;

const PERIOD: Duration = Duration::from_secs(15);

fn mk_cacher(feeds: &FakeThreatFeeds, name: &str, token: &CancellationToken) -> FeedCacher {
    feeds.insert(GlobalThreatFeed::new(name, GlobalThreatFeedSpec::default()));
    let cacher = FeedCacher::new(name, Arc::new(feeds.clone()));
    cacher.run(token);
    cacher
}

fn mk_fail() -> (FailFn, Arc<AtomicUsize>) {
    let count = Arc::new(AtomicUsize::new(0));
    let fail: FailFn = Arc::new({
        let count = count.clone();
        move || {
            count.fetch_add(1, Ordering::SeqCst);
        }
    });
    (fail, count)
}

fn ips(nets: &[&str]) -> IpSet {
    IpSet(nets.iter().map(|s| s.to_string()).collect())
}

fn mk_gns(feed: &str, nets: &[&str]) -> GlobalNetworkSet {
    GlobalNetworkSet::for_feed(
        feed,
        &btreemap! { "level".to_string() => "high".to_string() },
        nets.iter().map(|s| s.to_string()).collect(),
    )
}

/// Lets spawned tasks run until they block on the clock.
async fn settle() {
    for _ in 0..100 {
        tokio::task::yield_now().await;
    }
}

fn error_types(feeds: &FakeThreatFeeds, name: &str) -> Vec<String> {
    feeds
        .feed(name)
        .and_then(|f| f.status)
        .map(|s| s.error_conditions.into_iter().map(|c| c.type_).collect())
        .unwrap_or_default()
}

// === set reconciliation ===

#[tokio::test(start_paused = true)]
async fn set_controller_waits_for_start() {
    let token = CancellationToken::new();
    let store = FakeSetStore::<IpSet>::default();
    store.insert("stale", ips(&["10.0.0.0/8"]), chrono::Utc::now());
    let ctrl = IpSetController::new(Arc::new(store.clone()), PERIOD);
    tokio::spawn(ctrl.clone().run(token.clone()));

    time::sleep(PERIOD * 4).await;
    assert!(store.deletes().is_empty(), "no GC before reconciliation starts");
    assert!(store.puts().is_empty());
    token.cancel();
}

#[tokio::test(start_paused = true)]
async fn set_controller_puts_once_for_identical_adds() {
    let token = CancellationToken::new();
    let feeds = FakeThreatFeeds::default();
    let cacher = mk_cacher(&feeds, "f", &token);
    let store = FakeSetStore::<IpSet>::default();
    let ctrl = IpSetController::new(Arc::new(store.clone()), PERIOD);
    let (fail, _) = mk_fail();

    ctrl.add("f", ips(&["1.2.3.4/32"]), fail.clone(), cacher.clone());
    ctrl.add("f", ips(&["1.2.3.4/32"]), fail, cacher);
    ctrl.start_reconciliation();
    tokio::spawn(ctrl.clone().run(token.clone()));

    // Two full ticks.
    time::sleep(PERIOD * 2 + Duration::from_secs(1)).await;
    assert_eq!(store.puts(), vec![("f".to_string(), ips(&["1.2.3.4/32"]))]);
    token.cancel();
}

#[tokio::test(start_paused = true)]
async fn set_controller_collects_garbage_except_no_gc() {
    let token = CancellationToken::new();
    let store = FakeSetStore::<IpSet>::default();
    store.insert("keep", ips(&["10.0.0.0/8"]), chrono::Utc::now());
    store.insert("gone", ips(&["11.0.0.0/8"]), chrono::Utc::now());
    let ctrl = IpSetController::new(Arc::new(store.clone()), PERIOD);

    ctrl.no_gc("keep");
    ctrl.start_reconciliation();
    tokio::spawn(ctrl.clone().run(token.clone()));
    settle().await;

    assert_eq!(store.names(), vec!["keep".to_string()]);
    assert_eq!(store.deletes(), vec!["gone".to_string()]);

    // Removing the exemption allows the next pass to collect it.
    ctrl.delete("keep");
    settle().await;
    assert!(store.names().is_empty());
    assert!(ctrl.not_gcable().is_empty());
    token.cancel();
}

#[tokio::test(start_paused = true)]
async fn set_controller_reports_put_failures() {
    let token = CancellationToken::new();
    let feeds = FakeThreatFeeds::default();
    let cacher = mk_cacher(&feeds, "f", &token);
    let store = FakeSetStore::<IpSet>::default();
    store.fail_next_put(StoreError::other("store unavailable"));
    let ctrl = IpSetController::new(Arc::new(store.clone()), PERIOD);
    let (fail, failures) = mk_fail();

    ctrl.add("f", ips(&["1.2.3.4/32"]), fail, cacher);
    ctrl.start_reconciliation();
    tokio::spawn(ctrl.clone().run(token.clone()));
    settle().await;

    assert_eq!(failures.load(Ordering::SeqCst), 1);
    assert_eq!(error_types(&feeds, "f"), vec!["LinseedSyncFailed".to_string()]);

    // Retried on the next tick, which clears the condition.
    time::sleep(PERIOD + Duration::from_secs(1)).await;
    assert_eq!(store.puts().len(), 2);
    assert_eq!(store.value("f"), Some(ips(&["1.2.3.4/32"])));
    assert!(error_types(&feeds, "f").is_empty());
    token.cancel();
}

#[tokio::test(start_paused = true)]
async fn set_controller_treats_missing_deletes_as_success() {
    let token = CancellationToken::new();
    let store = FakeSetStore::<IpSet>::default();
    store.insert("gone", ips(&["11.0.0.0/8"]), chrono::Utc::now());
    store.fail_next_delete(StoreError::NotFound("gone".to_string()));
    let ctrl = IpSetController::new(Arc::new(store.clone()), PERIOD);
    ctrl.start_reconciliation();
    tokio::spawn(ctrl.clone().run(token.clone()));
    settle().await;

    assert_eq!(store.deletes(), vec!["gone".to_string()]);
    token.cancel();
}

// === GlobalNetworkSet reconciliation ===

#[tokio::test(start_paused = true)]
async fn gns_created_updated_and_deleted() {
    let token = CancellationToken::new();
    let feeds = FakeThreatFeeds::default();
    let cacher = mk_cacher(&feeds, "f", &token);
    let client = FakeGlobalNetworkSets::default();
    let ctrl = GlobalNetworkSetController::new(Arc::new(client.clone()));
    tokio::spawn(ctrl.clone().run(client.watch(), token.clone()));
    ctrl.start_reconciliation();
    let (fail, _) = mk_fail();

    ctrl.add(mk_gns("f", &["1.2.3.4/32"]), fail.clone(), cacher.clone());
    settle().await;
    let created = client.get("threatfeed.f").expect("set must be created");
    assert_eq!(created.spec.nets, vec!["1.2.3.4/32".to_string()]);

    // Unchanged declarations are no-ops.
    ctrl.add(mk_gns("f", &["1.2.3.4/32"]), fail.clone(), cacher.clone());
    settle().await;
    assert_eq!(client.calls(), vec![GnsCall::Create("threatfeed.f".into())]);

    ctrl.add(mk_gns("f", &["5.6.7.8/32"]), fail, cacher);
    settle().await;
    assert_eq!(
        client.get("threatfeed.f").unwrap().spec.nets,
        vec!["5.6.7.8/32".to_string()]
    );

    ctrl.delete("threatfeed.f");
    settle().await;
    assert!(client.get("threatfeed.f").is_none());
    assert_eq!(
        client.calls(),
        vec![
            GnsCall::Create("threatfeed.f".into()),
            GnsCall::Update("threatfeed.f".into()),
            GnsCall::Delete("threatfeed.f".into()),
        ]
    );
    token.cancel();
}

#[tokio::test(start_paused = true)]
async fn gns_garbage_collection_honors_no_gc() {
    let token = CancellationToken::new();
    let client = FakeGlobalNetworkSets::default();
    client.insert(mk_gns("keep", &["1.0.0.0/8"]));
    client.insert(mk_gns("gone", &["2.0.0.0/8"]));
    let ctrl = GlobalNetworkSetController::new(Arc::new(client.clone()));
    ctrl.no_gc("threatfeed.keep");
    tokio::spawn(ctrl.clone().run(client.watch(), token.clone()));
    settle().await;
    assert!(client.calls().is_empty(), "no GC before reconciliation starts");

    ctrl.start_reconciliation();
    settle().await;
    assert_eq!(client.names(), vec!["threatfeed.keep".to_string()]);

    ctrl.delete("threatfeed.keep");
    settle().await;
    assert!(client.names().is_empty());
    token.cancel();
}

#[tokio::test(start_paused = true)]
async fn gns_recreated_when_removed_remotely() {
    let token = CancellationToken::new();
    let feeds = FakeThreatFeeds::default();
    let cacher = mk_cacher(&feeds, "f", &token);
    let client = FakeGlobalNetworkSets::default();
    let ctrl = GlobalNetworkSetController::new(Arc::new(client.clone()));
    tokio::spawn(ctrl.clone().run(client.watch(), token.clone()));
    ctrl.start_reconciliation();
    let (fail, _) = mk_fail();

    ctrl.add(mk_gns("f", &["1.2.3.4/32"]), fail, cacher);
    settle().await;
    client.delete_out_of_band("threatfeed.f");
    settle().await;

    assert!(client.get("threatfeed.f").is_some());
    token.cancel();
}

#[tokio::test(start_paused = true)]
async fn gns_failures_are_retried_then_reported() {
    let token = CancellationToken::new();
    let feeds = FakeThreatFeeds::default();
    let cacher = mk_cacher(&feeds, "f", &token);
    let client = FakeGlobalNetworkSets::default();
    for _ in 0..MAX_ATTEMPTS {
        client.fail_next(GnsOp::Create, ClientError::other("apiserver unavailable"));
    }
    let ctrl = GlobalNetworkSetController::new(Arc::new(client.clone()));
    tokio::spawn(ctrl.clone().run(client.watch(), token.clone()));
    ctrl.start_reconciliation();
    let (fail, failures) = mk_fail();

    ctrl.add(mk_gns("f", &["1.2.3.4/32"]), fail, cacher);
    time::sleep(Duration::from_secs(10)).await;

    assert_eq!(client.calls().len(), MAX_ATTEMPTS as usize);
    assert_eq!(failures.load(Ordering::SeqCst), 1);
    assert_eq!(
        error_types(&feeds, "f"),
        vec!["GlobalNetworkSetSyncFailed".to_string()]
    );
    assert!(client.get("threatfeed.f").is_none(), "key was dropped");
    token.cancel();
}

#[tokio::test(start_paused = true)]
async fn gns_invalid_objects_are_not_retried() {
    let token = CancellationToken::new();
    let feeds = FakeThreatFeeds::default();
    let cacher = mk_cacher(&feeds, "f", &token);
    let client = FakeGlobalNetworkSets::default();
    client.fail_next(GnsOp::Create, ClientError::Invalid("bad net".to_string()));
    let ctrl = GlobalNetworkSetController::new(Arc::new(client.clone()));
    tokio::spawn(ctrl.clone().run(client.watch(), token.clone()));
    ctrl.start_reconciliation();
    let (fail, failures) = mk_fail();

    ctrl.add(mk_gns("f", &["1.2.3.4/32"]), fail, cacher);
    time::sleep(Duration::from_secs(10)).await;

    assert_eq!(client.calls().len(), 1);
    assert_eq!(failures.load(Ordering::SeqCst), 1);
    token.cancel();
}

#[tokio::test(start_paused = true)]
async fn gns_delete_failures_do_not_notify() {
    let token = CancellationToken::new();
    let client = FakeGlobalNetworkSets::default();
    client.insert(mk_gns("gone", &["2.0.0.0/8"]));
    for _ in 0..MAX_ATTEMPTS {
        client.fail_next(GnsOp::Delete, ClientError::other("apiserver unavailable"));
    }
    let ctrl = GlobalNetworkSetController::new(Arc::new(client.clone()));
    tokio::spawn(ctrl.clone().run(client.watch(), token.clone()));
    ctrl.start_reconciliation();
    time::sleep(Duration::from_secs(10)).await;

    assert_eq!(client.calls().len(), MAX_ATTEMPTS as usize);
    assert_eq!(client.names(), vec!["threatfeed.gone".to_string()]);
    token.cancel();
}
