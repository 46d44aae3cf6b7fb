//! Fleet store: watch-fed, indexed in-RAM cache of a fixed set of kinds.
//!
//! One single-writer applier task owns the `CacheState`; per-kind pump tasks
//! feed it list+watch events. After every batch the applier swaps in a new
//! immutable snapshot, so readers never block on the writer or on I/O.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use fleet_core::{CachedObject, Change, ObjectKey, ResourceKind, StoreError, WatchEvent, WatchSource};
use futures::StreamExt;
use metrics::{counter, gauge};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[cfg(feature = "fixture")]
pub mod mock;
mod state;

pub use state::{CacheSnapshot, CacheState, IndexFn, IndexSpec, KindSnapshot};

/// Tuning for one cache instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheConfig {
    /// Capacity of the event channel between pumps and the applier
    pub queue_cap: usize,
    /// Upper bound of events folded into one published snapshot
    pub max_batch: usize,
    /// Capacity of the change broadcast
    pub change_buffer: usize,
    pub relist_backoff_base: Duration,
    pub relist_backoff_max: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            queue_cap: 2048,
            max_batch: 256,
            change_buffer: 4096,
            relist_backoff_base: Duration::from_millis(200),
            relist_backoff_max: Duration::from_secs(30),
        }
    }
}

enum Command {
    Event(ResourceKind, WatchEvent),
    AddIndex(IndexSpec, oneshot::Sender<Result<(), StoreError>>),
}

struct Inner {
    name: String,
    kinds: Vec<ResourceKind>,
    snap: ArcSwap<CacheSnapshot>,
    epoch_rx: watch::Receiver<u64>,
    synced_rx: watch::Receiver<bool>,
    cmd_tx: mpsc::Sender<Command>,
    changes: broadcast::Sender<Change>,
    cancel: CancellationToken,
}

/// Handle for readers. Cheap to clone; all clones observe the same cache.
#[derive(Clone)]
pub struct Cache {
    inner: Arc<Inner>,
}

impl Cache {
    /// Start pumps and the applier for `kinds`. `indexes` are installed before
    /// the first event is applied. Stops when `parent` is cancelled or `stop`
    /// is called.
    pub fn spawn(
        name: &str,
        source: Arc<dyn WatchSource>,
        kinds: Vec<ResourceKind>,
        indexes: Vec<IndexSpec>,
        config: &CacheConfig,
        parent: &CancellationToken,
    ) -> Result<Self, StoreError> {
        let mut state = CacheState::new(&kinds);
        for spec in indexes {
            state.add_index(spec)?;
        }

        let (cmd_tx, cmd_rx) = mpsc::channel::<Command>(config.queue_cap.max(1));
        let (epoch_tx, epoch_rx) = watch::channel(0u64);
        let (synced_tx, synced_rx) = watch::channel(kinds.is_empty());
        let (changes, _) = broadcast::channel(config.change_buffer.max(1));
        let cancel = parent.child_token();
        let inner = Arc::new(Inner {
            name: name.to_string(),
            kinds: kinds.clone(),
            snap: ArcSwap::from(state.freeze()),
            epoch_rx,
            synced_rx,
            cmd_tx: cmd_tx.clone(),
            changes: changes.clone(),
            cancel: cancel.clone(),
        });

        for kind in kinds {
            tokio::spawn(pump(
                inner.name.clone(),
                kind,
                source.clone(),
                cmd_tx.clone(),
                cancel.clone(),
                config.relist_backoff_base,
                config.relist_backoff_max,
            ));
        }
        drop(cmd_tx);

        let applier = Applier {
            inner: Arc::downgrade(&inner),
            name: name.to_string(),
            state,
            epoch_tx,
            synced_tx,
            changes,
            max_batch: config.max_batch.max(1),
        };
        tokio::spawn(applier.run(cmd_rx, cancel));
        info!(cache = %name, "cache started");
        Ok(Self { inner })
    }

    pub fn name(&self) -> &str { &self.inner.name }
    pub fn kinds(&self) -> &[ResourceKind] { &self.inner.kinds }

    pub fn watches(&self, kind: &ResourceKind) -> bool {
        self.inner.kinds.contains(kind)
    }

    /// Current consistent snapshot.
    pub fn snapshot(&self) -> Arc<CacheSnapshot> { self.inner.snap.load_full() }

    pub fn get(&self, kind: &ResourceKind, key: &ObjectKey) -> Option<Arc<CachedObject>> {
        self.inner.snap.load().get(kind, key)
    }

    pub fn list(&self, kind: &ResourceKind, index: &str, index_key: &str) -> Vec<Arc<CachedObject>> {
        self.inner.snap.load().list(kind, index, index_key)
    }

    /// Every object of `kind`, sorted by key.
    pub fn list_all(&self, kind: &ResourceKind) -> Vec<Arc<CachedObject>> {
        let snap = self.inner.snap.load();
        let mut out: Vec<Arc<CachedObject>> = snap.kind(kind).map(|k| k.objects().cloned().collect()).unwrap_or_default();
        out.sort_unstable_by(|a, b| a.key.cmp(&b.key));
        out
    }

    pub fn keys(&self, kind: &ResourceKind) -> Vec<ObjectKey> {
        let snap = self.inner.snap.load();
        snap.kind(kind).map(|k| k.keys().cloned().collect()).unwrap_or_default()
    }

    pub fn epoch(&self) -> u64 { *self.inner.epoch_rx.borrow() }
    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> { self.inner.epoch_rx.clone() }

    /// Change feed; receivers that fall behind observe `RecvError::Lagged`.
    pub fn subscribe(&self) -> broadcast::Receiver<Change> { self.inner.changes.subscribe() }

    pub fn has_synced(&self) -> bool { *self.inner.synced_rx.borrow() }

    /// Wait until every kind completed its first listing. False on timeout or
    /// if the cache stopped first.
    pub async fn wait_for_sync(&self, timeout: Duration) -> bool {
        let mut rx = self.inner.synced_rx.clone();
        let wait = async {
            loop {
                if *rx.borrow_and_update() {
                    return true;
                }
                let closed = tokio::select! {
                    changed = rx.changed() => changed.is_err(),
                    _ = self.inner.cancel.cancelled() => return false,
                };
                if closed {
                    return *rx.borrow();
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.unwrap_or(false)
    }

    /// Register an extra index on a watched kind. Applied to cached objects
    /// before this returns and to every later event.
    pub async fn add_index(&self, spec: IndexSpec) -> Result<(), StoreError> {
        if !self.watches(&spec.kind) {
            return Err(StoreError::UnsupportedKind { kind: spec.kind.gvk_key() });
        }
        let (tx, rx) = oneshot::channel();
        self.inner.cmd_tx.send(Command::AddIndex(spec, tx)).await.map_err(|_| StoreError::Stopped)?;
        rx.await.map_err(|_| StoreError::Stopped)?
    }

    /// Cancel pumps and the applier. The last snapshot stays readable.
    pub fn stop(&self) {
        if !self.inner.cancel.is_cancelled() {
            debug!(cache = %self.inner.name, "stopping cache");
            self.inner.cancel.cancel();
        }
    }

    pub fn is_stopped(&self) -> bool { self.inner.cancel.is_cancelled() }
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("name", &self.inner.name)
            .field("epoch", &self.epoch())
            .field("synced", &self.has_synced())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

struct Applier {
    inner: std::sync::Weak<Inner>,
    name: String,
    state: CacheState,
    epoch_tx: watch::Sender<u64>,
    synced_tx: watch::Sender<bool>,
    changes: broadcast::Sender<Change>,
    max_batch: usize,
}

impl Applier {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>, cancel: CancellationToken) {
        loop {
            let first = tokio::select! {
                _ = cancel.cancelled() => break,
                maybe = rx.recv() => match maybe {
                    Some(cmd) => cmd,
                    None => {
                        debug!(cache = %self.name, "command channel closed; applier exiting");
                        break;
                    }
                },
            };
            let mut changes = Vec::new();
            let mut replies = Vec::new();
            self.handle(first, &mut changes, &mut replies);
            // Fold whatever is already queued into the same snapshot
            let mut n = 1;
            while n < self.max_batch {
                match rx.try_recv() {
                    Ok(cmd) => self.handle(cmd, &mut changes, &mut replies),
                    Err(_) => break,
                }
                n += 1;
            }
            self.state.bump_epoch();
            if !self.publish(changes, replies) {
                break;
            }
        }
        info!(cache = %self.name, "applier stopped");
    }

    fn handle(
        &mut self,
        cmd: Command,
        changes: &mut Vec<Change>,
        replies: &mut Vec<(oneshot::Sender<Result<(), StoreError>>, Result<(), StoreError>)>,
    ) {
        match cmd {
            Command::Event(kind, ev) => {
                let restarted = matches!(ev, WatchEvent::Restarted(_));
                match self.state.apply(&kind, ev) {
                    Ok(c) => {
                        counter!("fleet_cache_apply_total", 1u64, "cache" => self.name.clone());
                        if restarted {
                            debug!(cache = %self.name, kind = %kind, changes = c.len(), "relist applied");
                        }
                        changes.extend(c);
                    }
                    Err(e) => warn!(cache = %self.name, kind = %kind, error = %e, "dropping event"),
                }
            }
            Command::AddIndex(spec, reply) => {
                let name = spec.name.clone();
                let res = self.state.add_index(spec);
                if res.is_ok() {
                    debug!(cache = %self.name, index = %name, "index registered");
                }
                replies.push((reply, res));
            }
        }
    }

    /// Returns false once every handle is gone.
    fn publish(
        &mut self,
        changes: Vec<Change>,
        replies: Vec<(oneshot::Sender<Result<(), StoreError>>, Result<(), StoreError>)>,
    ) -> bool {
        let Some(inner) = self.inner.upgrade() else { return false };
        let next = self.state.freeze();
        let epoch = next.epoch;
        let objects: usize = inner.kinds.iter().filter_map(|k| next.kind(k)).map(|k| k.len()).sum();
        inner.snap.store(next);
        for c in changes {
            // No subscribers is fine
            let _ = self.changes.send(c);
        }
        let _ = self.epoch_tx.send(epoch);
        let synced = self.state.synced();
        self.synced_tx.send_if_modified(|cur| {
            let changed = *cur != synced;
            *cur = synced;
            changed
        });
        gauge!("fleet_cache_objects", objects as f64, "cache" => self.name.clone());
        for (tx, res) in replies {
            let _ = tx.send(res);
        }
        true
    }
}

async fn pump(
    cache: String,
    kind: ResourceKind,
    source: Arc<dyn WatchSource>,
    tx: mpsc::Sender<Command>,
    cancel: CancellationToken,
    base: Duration,
    max: Duration,
) {
    let mut delay = base;
    loop {
        let mut stream = source.watch(&kind);
        debug!(cache = %cache, kind = %kind, "watch opened");
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return,
                next = stream.next() => next,
            };
            match next {
                Some(Ok(ev)) => {
                    if matches!(ev, WatchEvent::Restarted(_)) {
                        delay = base;
                    }
                    if tx.send(Command::Event(kind.clone(), ev)).await.is_err() {
                        return;
                    }
                }
                Some(Err(e)) => {
                    warn!(cache = %cache, kind = %kind, error = %e, "watch failed; relisting");
                    break;
                }
                None => {
                    debug!(cache = %cache, kind = %kind, "watch stream ended; relisting");
                    break;
                }
            }
        }
        drop(stream);
        counter!("fleet_watch_restarts_total", 1u64, "cache" => cache.clone(), "kind" => kind.gvk_key());
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
        delay = (delay * 2).min(max);
    }
}
