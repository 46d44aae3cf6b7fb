//! Remote cluster connection tracker.
//!
//! Maps a cluster identity to one live `Connection` (client plus watch-fed
//! cache). Connections are created lazily on first access, single-flight per
//! identity, health-checked in the background and torn down on invalidation,
//! deletion, UID change or repeated probe failures.

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use fleet_core::{ClusterIdentity, ConnectionError, ObjectKey, ResourceKind, WatchSource};
use fleet_store::{Cache, CacheConfig, IndexSpec};
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use metrics::{counter, gauge};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[cfg(feature = "fixture")]
pub mod mock;

/// Material needed to open a client for one remote cluster.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionParams {
    pub endpoint: String,
    pub auth: Credentials,
    /// PEM bundle; `None` means the platform roots
    pub ca_bundle: Option<String>,
}

impl std::fmt::Debug for ConnectionParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionParams")
            .field("endpoint", &self.endpoint)
            .field("auth", &self.auth.kind())
            .field("ca_bundle", &self.ca_bundle.is_some())
            .finish()
    }
}

#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    BearerToken(String),
    ClientCertificate { cert_pem: String, key_pem: String },
    /// Complete kubeconfig document (YAML or JSON)
    Kubeconfig(String),
    None,
}

impl Credentials {
    pub fn kind(&self) -> &'static str {
        match self {
            Credentials::BearerToken(_) => "bearer-token",
            Credentials::ClientCertificate { .. } => "client-certificate",
            Credentials::Kubeconfig(_) => "kubeconfig",
            Credentials::None => "none",
        }
    }
}

/// Produces connection material for a cluster. Must tolerate concurrent calls.
#[async_trait]
pub trait CredentialResolver: Send + Sync + 'static {
    async fn resolve(&self, cluster: &ClusterIdentity) -> Result<ConnectionParams, ConnectionError>;
}

/// Client of one remote cluster: a watch source for its cache plus a cheap
/// liveness probe.
#[async_trait]
pub trait RemoteClient: WatchSource + Send + Sync + 'static {
    async fn ping(&self) -> Result<(), ConnectionError>;
}

/// Opens clients from resolved params.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Client: RemoteClient + Clone;

    async fn connect(&self, cluster: &ClusterIdentity, params: ConnectionParams) -> Result<Self::Client, ConnectionError>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrackerConfig {
    /// Kinds every remote cache watches
    pub kinds: Vec<ResourceKind>,
    pub startup_timeout: Duration,
    pub health_interval: Duration,
    pub probe_timeout: Duration,
    /// Consecutive failed probes before the connection is dropped
    pub failure_threshold: u32,
    pub cache: CacheConfig,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            kinds: fleet_core::kinds::default_remote_kinds(),
            startup_timeout: Duration::from_secs(30),
            health_interval: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(5),
            failure_threshold: 3,
            cache: CacheConfig::default(),
        }
    }
}

/// Live connection to one remote cluster.
pub struct Connection<C> {
    identity: ClusterIdentity,
    client: C,
    cache: Cache,
    failures: AtomicU32,
    cancel: CancellationToken,
}

impl<C> Connection<C> {
    pub fn identity(&self) -> &ClusterIdentity { &self.identity }
    pub fn client(&self) -> &C { &self.client }
    pub fn cache(&self) -> &Cache { &self.cache }
    pub fn is_stopped(&self) -> bool { self.cancel.is_cancelled() }

    fn stop(&self) {
        self.cancel.cancel();
    }
}

type Establishing<C> = Shared<BoxFuture<'static, Result<Arc<Connection<C>>, ConnectionError>>>;

/// One identity's connection. Every caller arriving while it is being
/// established awaits the same attempt and sees the same outcome.
struct Slot<C> {
    identity: ClusterIdentity,
    conn: Establishing<C>,
}

impl<C> Slot<C> {
    fn ready(&self) -> Option<&Arc<Connection<C>>> {
        match self.conn.peek() {
            Some(Ok(conn)) => Some(conn),
            _ => None,
        }
    }

    fn failed(&self) -> bool {
        matches!(self.conn.peek(), Some(Err(_)))
    }

    fn stop(&self) {
        if let Some(conn) = self.ready() {
            conn.stop();
        }
    }
}

type SlotRef<C> = Arc<Slot<C>>;

struct Inner<K: Connector> {
    resolver: Arc<dyn CredentialResolver>,
    connector: K,
    config: TrackerConfig,
    indexes: Vec<IndexSpec>,
    slots: Mutex<FxHashMap<ObjectKey, SlotRef<K::Client>>>,
    cancel: CancellationToken,
}

/// Owner of every remote connection. Cheap to clone.
pub struct ConnectionTracker<K: Connector> {
    inner: Arc<Inner<K>>,
}

impl<K: Connector> Clone for ConnectionTracker<K> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<K: Connector> ConnectionTracker<K> {
    /// Build the tracker and start its health loop. `indexes` are installed on
    /// every cache the tracker creates.
    pub fn new(
        resolver: Arc<dyn CredentialResolver>,
        connector: K,
        config: TrackerConfig,
        indexes: Vec<IndexSpec>,
        parent: &CancellationToken,
    ) -> Self {
        let inner = Arc::new(Inner {
            resolver,
            connector,
            config,
            indexes,
            slots: Mutex::new(FxHashMap::default()),
            cancel: parent.child_token(),
        });
        tokio::spawn(health_loop(Arc::downgrade(&inner)));
        Self { inner }
    }

    pub fn config(&self) -> &TrackerConfig { &self.inner.config }

    fn slots(&self) -> MutexGuard<'_, FxHashMap<ObjectKey, SlotRef<K::Client>>> {
        self.inner.slots.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub async fn get_client(&self, cluster: &ClusterIdentity) -> Result<K::Client, ConnectionError> {
        Ok(self.connection(cluster).await?.client.clone())
    }

    pub async fn get_cache(&self, cluster: &ClusterIdentity) -> Result<Cache, ConnectionError> {
        Ok(self.connection(cluster).await?.cache.clone())
    }

    /// Live connection for `cluster`, creating it if needed.
    pub async fn connection(&self, cluster: &ClusterIdentity) -> Result<Arc<Connection<K::Client>>, ConnectionError> {
        if self.inner.cancel.is_cancelled() {
            return Err(ConnectionError::ShuttingDown);
        }
        let key = cluster.key();
        let slot = {
            let mut slots = self.slots();
            let reuse = match slots.get(&key) {
                Some(slot) if uid_changed(&slot.identity, cluster) => {
                    info!(cluster = %cluster, "cluster recreated; dropping connection of previous uid");
                    slot.stop();
                    None
                }
                Some(slot) if slot.ready().is_some_and(|c| c.is_stopped()) => {
                    info!(cluster = %cluster, "dropping stale connection");
                    None
                }
                // A failed attempt is never handed out again
                Some(slot) if slot.failed() => None,
                Some(slot) => Some(slot.clone()),
                None => None,
            };
            match reuse {
                Some(slot) => slot,
                None => {
                    let slot = self.start(cluster);
                    slots.insert(key.clone(), slot.clone());
                    slot
                }
            }
        };

        let result = slot.conn.clone().await;
        let current = {
            let mut slots = self.slots();
            let current = slots.get(&key).is_some_and(|s| Arc::ptr_eq(s, &slot));
            if current && result.is_err() {
                slots.remove(&key);
            }
            current
        };
        let conn = result?;

        // Invalidated or replaced while we were connecting: the result is orphaned
        if !current || self.inner.cancel.is_cancelled() {
            conn.stop();
            if self.inner.cancel.is_cancelled() {
                return Err(ConnectionError::ShuttingDown);
            }
            return Err(ConnectionError::Unreachable {
                cluster: cluster.to_string(),
                reason: "connection invalidated while connecting".to_string(),
            });
        }
        Ok(conn)
    }

    fn start(&self, cluster: &ClusterIdentity) -> SlotRef<K::Client> {
        let inner = Arc::downgrade(&self.inner);
        let identity = cluster.clone();
        let conn = async move {
            let Some(inner) = inner.upgrade() else { return Err(ConnectionError::ShuttingDown) };
            ConnectionTracker { inner }.establish(&identity).await
        }
        .boxed()
        .shared();
        Arc::new(Slot { identity: cluster.clone(), conn })
    }

    async fn establish(&self, cluster: &ClusterIdentity) -> Result<Arc<Connection<K::Client>>, ConnectionError> {
        let started = std::time::Instant::now();
        let result = self.try_establish(cluster).await;
        match &result {
            Ok(_) => info!(cluster = %cluster, took_ms = %started.elapsed().as_millis(), "remote cluster connected"),
            Err(e) => {
                counter!("fleet_connection_failures_total", 1u64);
                warn!(cluster = %cluster, error = %e, "remote cluster connection failed");
            }
        }
        result
    }

    async fn try_establish(&self, cluster: &ClusterIdentity) -> Result<Arc<Connection<K::Client>>, ConnectionError> {
        let params = self.inner.resolver.resolve(cluster).await?;
        debug!(cluster = %cluster, endpoint = %params.endpoint, auth = params.auth.kind(), "credentials resolved");
        let client = self.inner.connector.connect(cluster, params).await?;
        let cancel = self.inner.cancel.child_token();
        let cache = Cache::spawn(
            &cluster.to_string(),
            Arc::new(client.clone()),
            self.inner.config.kinds.clone(),
            self.inner.indexes.clone(),
            &self.inner.config.cache,
            &cancel,
        )
        .map_err(|source| ConnectionError::Store { cluster: cluster.to_string(), source })?;

        if !cache.wait_for_sync(self.inner.config.startup_timeout).await {
            cancel.cancel();
            if self.inner.cancel.is_cancelled() {
                return Err(ConnectionError::ShuttingDown);
            }
            return Err(ConnectionError::StartupTimeout {
                cluster: cluster.to_string(),
                timeout: self.inner.config.startup_timeout,
            });
        }
        Ok(Arc::new(Connection { identity: cluster.clone(), client, cache, failures: AtomicU32::new(0), cancel }))
    }

    /// Drop the connection for `cluster` and stop its watches. Holders of
    /// existing handles keep them; the next access reconnects.
    pub fn invalidate(&self, cluster: &ClusterIdentity) {
        if self.remove(&cluster.key()) {
            info!(cluster = %cluster, "connection invalidated");
        }
    }

    /// Tear down the connection of a deleted cluster object.
    pub fn delete(&self, key: &ObjectKey) {
        if self.remove(key) {
            info!(cluster = %key, "cluster deleted; connection removed");
        }
    }

    fn remove(&self, key: &ObjectKey) -> bool {
        let slot = self.slots().remove(key);
        let Some(slot) = slot else { return false };
        slot.stop();
        gauge!("fleet_connections", self.len() as f64);
        true
    }

    /// Register another index on the cache of `cluster`, connecting first if
    /// needed. Existing objects are indexed before this returns.
    pub async fn watch(&self, cluster: &ClusterIdentity, spec: IndexSpec) -> Result<(), ConnectionError> {
        let cache = self.get_cache(cluster).await?;
        match cache.add_index(spec).await {
            Ok(()) => Ok(()),
            // Idempotent from the caller's point of view
            Err(fleet_core::StoreError::DuplicateIndex { .. }) => Ok(()),
            Err(source) => Err(ConnectionError::Store { cluster: cluster.to_string(), source }),
        }
    }

    /// Stop the health loop and every connection. Later calls fail with
    /// `ShuttingDown`.
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
        let drained: Vec<SlotRef<K::Client>> = self.slots().drain().map(|(_, s)| s).collect();
        for slot in drained {
            slot.stop();
        }
        gauge!("fleet_connections", 0.0);
        info!("connection tracker stopped");
    }

    pub fn is_shut_down(&self) -> bool { self.inner.cancel.is_cancelled() }

    /// Number of established connections.
    pub fn len(&self) -> usize {
        self.slots().values().filter(|s| s.ready().is_some()).count()
    }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn contains(&self, key: &ObjectKey) -> bool {
        self.slots().get(key).is_some_and(|s| s.ready().is_some())
    }
}

fn uid_changed(current: &ClusterIdentity, requested: &ClusterIdentity) -> bool {
    matches!((&current.uid, &requested.uid), (Some(a), Some(b)) if a != b)
}

async fn health_loop<K: Connector>(inner: std::sync::Weak<Inner<K>>) {
    let Some((interval, cancel)) = inner.upgrade().map(|i| (i.config.health_interval.max(Duration::from_millis(10)), i.cancel.clone())) else {
        return;
    };
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let Some(inner) = inner.upgrade() else { break };
        probe_all(&inner).await;
    }
    debug!("health loop stopped");
}

async fn probe_all<K: Connector>(inner: &Arc<Inner<K>>) {
    let live: Vec<(ObjectKey, SlotRef<K::Client>)> = {
        let slots = inner.slots.lock().unwrap_or_else(|p| p.into_inner());
        slots.iter().filter(|(_, s)| s.ready().is_some()).map(|(k, s)| (k.clone(), s.clone())).collect()
    };
    gauge!("fleet_connections", live.len() as f64);
    let probes = live.into_iter().filter_map(|(key, slot)| {
        let conn = slot.ready()?.clone();
        let timeout = inner.config.probe_timeout;
        Some(async move {
            let res = match tokio::time::timeout(timeout, conn.client.ping()).await {
                Ok(res) => res,
                Err(_) => Err(ConnectionError::Unreachable {
                    cluster: conn.identity.to_string(),
                    reason: format!("health probe timed out after {timeout:?}"),
                }),
            };
            (key, slot, conn, res)
        })
    });
    for (key, slot, conn, res) in futures::future::join_all(probes).await {
        match res {
            Ok(()) => conn.failures.store(0, Ordering::Relaxed),
            Err(e) => {
                let n = conn.failures.fetch_add(1, Ordering::Relaxed) + 1;
                counter!("fleet_connection_failures_total", 1u64);
                warn!(cluster = %conn.identity, error = %e, failures = n, "health probe failed");
                if n >= inner.config.failure_threshold {
                    let mut slots = inner.slots.lock().unwrap_or_else(|p| p.into_inner());
                    // Only evict the slot we probed; a newer one may have replaced it
                    if slots.get(&key).is_some_and(|s| Arc::ptr_eq(s, &slot)) {
                        slots.remove(&key);
                    }
                    drop(slots);
                    conn.stop();
                    warn!(cluster = %conn.identity, "connection removed after repeated probe failures");
                }
            }
        }
    }
}
