//! In-memory resolver and connector backed by `fleet_store::mock::MockSource`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use fleet_core::{ClusterIdentity, ConnectionError, ResourceKind, WatchSource, WatchStream};
use fleet_store::mock::MockSource;

use crate::{ConnectionParams, Connector, CredentialResolver, Credentials, RemoteClient};

/// Resolver that hands out a bearer token per cluster unless told to fail.
#[derive(Clone, Default)]
pub struct StaticResolver {
    failing: Arc<AtomicBool>,
    calls: Arc<AtomicUsize>,
}

impl StaticResolver {
    pub fn new() -> Self { Self::default() }
    pub fn set_failing(&self, failing: bool) { self.failing.store(failing, Ordering::SeqCst) }
    pub fn calls(&self) -> usize { self.calls.load(Ordering::SeqCst) }
}

#[async_trait]
impl CredentialResolver for StaticResolver {
    async fn resolve(&self, cluster: &ClusterIdentity) -> Result<ConnectionParams, ConnectionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(ConnectionError::Credentials { cluster: cluster.to_string(), reason: "secret not found".into() });
        }
        Ok(ConnectionParams {
            endpoint: format!("https://{}.{}.example", cluster.name, cluster.namespace),
            auth: Credentials::BearerToken(format!("token-{}", cluster.name)),
            ca_bundle: None,
        })
    }
}

/// Client over one mock cluster.
#[derive(Clone)]
pub struct MockClient {
    pub source: MockSource,
    healthy: Arc<AtomicBool>,
}

impl WatchSource for MockClient {
    fn watch(&self, kind: &ResourceKind) -> WatchStream { self.source.watch(kind) }
}

#[async_trait]
impl RemoteClient for MockClient {
    async fn ping(&self) -> Result<(), ConnectionError> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ConnectionError::Unreachable { cluster: "mock".into(), reason: "probe refused".into() })
        }
    }
}

struct ClusterState {
    source: MockSource,
    healthy: Arc<AtomicBool>,
}

/// Connector over a set of named mock clusters. Unknown clusters are created
/// on first connect.
#[derive(Clone, Default)]
pub struct MockConnector {
    clusters: Arc<Mutex<BTreeMap<String, ClusterState>>>,
    connects: Arc<AtomicUsize>,
    delay: Arc<Mutex<Duration>>,
    refuse: Arc<AtomicBool>,
}

impl MockConnector {
    pub fn new() -> Self { Self::default() }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, ClusterState>> {
        self.clusters.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// API server fake for `cluster` ("namespace/name").
    pub fn cluster(&self, cluster: &str) -> MockSource {
        let mut clusters = self.lock();
        let st = clusters.entry(cluster.to_string()).or_insert_with(|| ClusterState {
            source: MockSource::new(),
            healthy: Arc::new(AtomicBool::new(true)),
        });
        st.source.clone()
    }

    pub fn set_healthy(&self, cluster: &str, healthy: bool) {
        self.cluster(cluster);
        if let Some(st) = self.lock().get(cluster) {
            st.healthy.store(healthy, Ordering::SeqCst);
        }
    }

    /// Delay every connect; widens the window for concurrent callers.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap_or_else(|p| p.into_inner()) = delay;
    }

    pub fn set_refusing(&self, refuse: bool) { self.refuse.store(refuse, Ordering::SeqCst) }

    pub fn connects(&self) -> usize { self.connects.load(Ordering::SeqCst) }
}

#[async_trait]
impl Connector for MockConnector {
    type Client = MockClient;

    async fn connect(&self, cluster: &ClusterIdentity, params: ConnectionParams) -> Result<MockClient, ConnectionError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap_or_else(|p| p.into_inner());
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.refuse.load(Ordering::SeqCst) {
            return Err(ConnectionError::Unreachable { cluster: cluster.to_string(), reason: format!("dial {}: refused", params.endpoint) });
        }
        let source = self.cluster(&cluster.to_string());
        let healthy = self.lock().get(&cluster.to_string()).map(|st| st.healthy.clone()).unwrap_or_default();
        Ok(MockClient { source, healthy })
    }
}
