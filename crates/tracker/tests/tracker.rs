#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use fleet_core::{kinds, ClusterIdentity, ConnectionError, ObjectKey};
use fleet_store::{CacheConfig, IndexSpec};
use fleet_tracker::mock::{MockConnector, StaticResolver};
use fleet_tracker::{ConnectionTracker, TrackerConfig};
use tokio_util::sync::CancellationToken;

fn config() -> TrackerConfig {
    TrackerConfig {
        startup_timeout: Duration::from_secs(2),
        health_interval: Duration::from_secs(1),
        probe_timeout: Duration::from_millis(500),
        failure_threshold: 3,
        cache: CacheConfig {
            relist_backoff_base: Duration::from_millis(10),
            relist_backoff_max: Duration::from_millis(50),
            ..CacheConfig::default()
        },
        ..TrackerConfig::default()
    }
}

fn tracker(connector: &MockConnector, resolver: &StaticResolver, root: &CancellationToken) -> ConnectionTracker<MockConnector> {
    let indexes = vec![IndexSpec::new(kinds::node(), kinds::NODE_PROVIDER_ID_INDEX, kinds::index_node_by_provider_id)];
    ConnectionTracker::new(Arc::new(resolver.clone()), connector.clone(), config(), indexes, root)
}

fn node(name: &str, provider_id: &str) -> serde_json::Value {
    serde_json::json!({"metadata": {"name": name}, "spec": {"providerID": provider_id}})
}

#[tokio::test(start_paused = true)]
async fn concurrent_first_access_connects_once() {
    let connector = MockConnector::new();
    connector.set_delay(Duration::from_millis(200));
    let resolver = StaticResolver::new();
    let root = CancellationToken::new();
    let t = tracker(&connector, &resolver, &root);
    let id = ClusterIdentity::new("default", "c1").with_uid("u1");

    let calls = (0..16).map(|_| t.get_cache(&id));
    let results = futures::future::join_all(calls).await;
    assert!(results.iter().all(|r| r.is_ok()));
    assert_eq!(connector.connects(), 1);
    assert_eq!(resolver.calls(), 1);
    assert_eq!(t.len(), 1);

    // Different identities proceed independently
    let other = ClusterIdentity::new("default", "c2").with_uid("u2");
    t.get_client(&other).await.unwrap();
    assert_eq!(connector.connects(), 2);
    root.cancel();
}

#[tokio::test(start_paused = true)]
async fn remote_cache_serves_node_by_provider_id() {
    let connector = MockConnector::new();
    connector.cluster("default/c1").apply(&kinds::node(), node("worker-0", "aws:///eu-west-1a/i-0abc")).unwrap();
    let resolver = StaticResolver::new();
    let root = CancellationToken::new();
    let t = tracker(&connector, &resolver, &root);

    let cache = t.get_cache(&ClusterIdentity::new("default", "c1")).await.unwrap();
    assert!(cache.has_synced());
    let nodes = cache.list(&kinds::node(), kinds::NODE_PROVIDER_ID_INDEX, "aws://i-0abc");
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].key, ObjectKey::cluster_scoped("worker-0"));
    root.cancel();
}

#[tokio::test(start_paused = true)]
async fn invalidate_stops_watches_and_next_access_rebuilds() {
    let connector = MockConnector::new();
    let resolver = StaticResolver::new();
    let root = CancellationToken::new();
    let t = tracker(&connector, &resolver, &root);
    let id = ClusterIdentity::new("default", "c1");

    let first = t.get_cache(&id).await.unwrap();
    t.invalidate(&id);
    t.invalidate(&id);
    assert!(first.is_stopped());
    assert!(!t.contains(&id.key()));

    let second = t.get_cache(&id).await.unwrap();
    assert!(!second.is_stopped());
    assert_eq!(connector.connects(), 2);
    root.cancel();
}

#[tokio::test(start_paused = true)]
async fn recreated_cluster_gets_fresh_connection() {
    let connector = MockConnector::new();
    let resolver = StaticResolver::new();
    let root = CancellationToken::new();
    let t = tracker(&connector, &resolver, &root);

    let old = t.get_cache(&ClusterIdentity::new("default", "c1").with_uid("u1")).await.unwrap();
    let same = t.get_cache(&ClusterIdentity::new("default", "c1").with_uid("u1")).await.unwrap();
    assert_eq!(connector.connects(), 1);
    assert!(!same.is_stopped());

    let new = t.get_cache(&ClusterIdentity::new("default", "c1").with_uid("u2")).await.unwrap();
    assert!(old.is_stopped());
    assert!(!new.is_stopped());
    assert_eq!(connector.connects(), 2);
    root.cancel();
}

#[tokio::test(start_paused = true)]
async fn deleted_cluster_is_torn_down() {
    let connector = MockConnector::new();
    let resolver = StaticResolver::new();
    let root = CancellationToken::new();
    let t = tracker(&connector, &resolver, &root);
    let id = ClusterIdentity::new("default", "c1").with_uid("u1");

    let cache = t.get_cache(&id).await.unwrap();
    t.delete(&id.key());
    assert!(cache.is_stopped());
    assert!(t.is_empty());

    // Credentials are gone together with the cluster
    resolver.set_failing(true);
    let err = t.get_cache(&id).await.unwrap_err();
    assert!(matches!(err, ConnectionError::Credentials { .. }));
    root.cancel();
}

#[tokio::test(start_paused = true)]
async fn failures_are_not_cached() {
    let connector = MockConnector::new();
    connector.set_refusing(true);
    let resolver = StaticResolver::new();
    let root = CancellationToken::new();
    let t = tracker(&connector, &resolver, &root);
    let id = ClusterIdentity::new("default", "c1");

    assert!(matches!(t.get_client(&id).await, Err(ConnectionError::Unreachable { .. })));
    assert!(!t.contains(&id.key()));
    connector.set_refusing(false);
    assert!(t.get_client(&id).await.is_ok());
    assert_eq!(connector.connects(), 2);
    root.cancel();
}

#[tokio::test(start_paused = true)]
async fn concurrent_callers_share_one_failed_attempt() {
    let connector = MockConnector::new();
    connector.set_refusing(true);
    connector.set_delay(Duration::from_secs(1));
    let resolver = StaticResolver::new();
    let root = CancellationToken::new();
    let t = tracker(&connector, &resolver, &root);
    let id = ClusterIdentity::new("default", "c1").with_uid("u1");

    let started = tokio::time::Instant::now();
    let results = futures::future::join_all((0..16).map(|_| t.get_cache(&id))).await;
    assert!(results.iter().all(|r| matches!(r, Err(ConnectionError::Unreachable { .. }))));
    assert_eq!(connector.connects(), 1);
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(!t.contains(&id.key()));

    // The next access starts exactly one fresh attempt
    connector.set_refusing(false);
    t.get_cache(&id).await.unwrap();
    assert_eq!(connector.connects(), 2);
    root.cancel();
}

#[tokio::test(start_paused = true)]
async fn new_uid_does_not_join_pending_connection_of_old_uid() {
    let connector = MockConnector::new();
    connector.set_delay(Duration::from_millis(200));
    let resolver = StaticResolver::new();
    let root = CancellationToken::new();
    let t = tracker(&connector, &resolver, &root);

    let first = tokio::spawn({
        let t = t.clone();
        async move { t.connection(&ClusterIdentity::new("default", "c1").with_uid("u1")).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let conn = t.connection(&ClusterIdentity::new("default", "c1").with_uid("u2")).await.unwrap();
    assert_eq!(conn.identity().uid.as_deref(), Some("u2"));
    assert!(!conn.is_stopped());

    // The superseded attempt is discarded rather than handed out
    let old = first.await.unwrap();
    assert!(matches!(old, Err(ConnectionError::Unreachable { .. })));
    assert_eq!(connector.connects(), 2);
    assert_eq!(t.len(), 1);
    root.cancel();
}

#[tokio::test(start_paused = true)]
async fn unsynced_cache_times_out() {
    let connector = MockConnector::new();
    connector.cluster("default/c1").set_offline(true);
    let resolver = StaticResolver::new();
    let root = CancellationToken::new();
    let t = tracker(&connector, &resolver, &root);

    let err = t.get_cache(&ClusterIdentity::new("default", "c1")).await.unwrap_err();
    assert!(matches!(err, ConnectionError::StartupTimeout { .. }));
    assert!(t.is_empty());
    root.cancel();
}

#[tokio::test(start_paused = true)]
async fn repeated_probe_failures_evict_connection() {
    let connector = MockConnector::new();
    let resolver = StaticResolver::new();
    let root = CancellationToken::new();
    let t = tracker(&connector, &resolver, &root);
    let id = ClusterIdentity::new("default", "c1");

    let cache = t.get_cache(&id).await.unwrap();
    connector.set_healthy("default/c1", false);
    // Two failed probes stay below the threshold
    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert!(t.contains(&id.key()));
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(!t.contains(&id.key()));
    assert!(cache.is_stopped());

    connector.set_healthy("default/c1", true);
    t.get_cache(&id).await.unwrap();
    assert_eq!(connector.connects(), 2);
    root.cancel();
}

#[tokio::test(start_paused = true)]
async fn extra_index_is_applied_retroactively() {
    let connector = MockConnector::new();
    connector
        .cluster("default/c1")
        .apply(&kinds::node(), serde_json::json!({"metadata": {"name": "n1", "labels": {"pool": "a"}}}))
        .unwrap();
    let resolver = StaticResolver::new();
    let root = CancellationToken::new();
    let t = tracker(&connector, &resolver, &root);
    let id = ClusterIdentity::new("default", "c1");

    let by_pool = IndexSpec::new(kinds::node(), "pool", |o| o.label("pool").map(|p| p.to_string()).into_iter().collect());
    t.watch(&id, by_pool).await.unwrap();
    let cache = t.get_cache(&id).await.unwrap();
    assert_eq!(cache.list(&kinds::node(), "pool", "a").len(), 1);

    let err = t
        .watch(&id, IndexSpec::new(kinds::machine(), kinds::MACHINE_NODE_INDEX, kinds::index_machine_by_node_name))
        .await
        .unwrap_err();
    assert!(err.is_unsupported_kind());
    root.cancel();
}

#[tokio::test(start_paused = true)]
async fn shutdown_fails_fast() {
    let connector = MockConnector::new();
    let resolver = StaticResolver::new();
    let root = CancellationToken::new();
    let t = tracker(&connector, &resolver, &root);
    let id = ClusterIdentity::new("default", "c1");

    let cache = t.get_cache(&id).await.unwrap();
    t.shutdown();
    assert!(cache.is_stopped());
    assert_eq!(t.get_cache(&id).await.unwrap_err(), ConnectionError::ShuttingDown);
}
