//! Per-kind reconcile scheduler.
//!
//! Feeds a bounded worker pool from the cache change feed, related-kind
//! mappers, explicit requests, requeue/backoff timers and a periodic resync.
//! At most one reconcile runs per key; a change that arrives while the key
//! runs schedules exactly one follow-up.

#![forbid(unsafe_code)]

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use fleet_core::{CachedObject, Change, ObjectKey, ReconcileError, ResourceKind, StoreError};
use fleet_store::Cache;
use futures::{FutureExt, StreamExt};
use metrics::{counter, histogram};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tokio_util::time::{delay_queue, DelayQueue};
use tracing::{debug, error, info, warn};

pub mod backoff;
pub mod queue;

pub use backoff::Backoff;
use queue::{Trigger, WorkQueue};

/// What a reconciler wants to happen next for its key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Nothing until the next change
    AwaitChange,
    /// Run again after the delay, even without changes
    Requeue(Duration),
}

#[derive(Debug, Clone)]
pub struct ReconcileRequest {
    pub kind: ResourceKind,
    pub key: ObjectKey,
    /// Current cached object; `None` once deleted
    pub object: Option<Arc<CachedObject>>,
}

#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    type Context: Send + Sync + 'static;

    async fn reconcile(&self, request: ReconcileRequest, ctx: Arc<Self::Context>) -> Result<Action, ReconcileError>;
}

/// Maps a change of a related kind to keys of the scheduled kind.
pub type Mapper = Arc<dyn Fn(&Change) -> Vec<ObjectKey> + Send + Sync>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Parallel reconciles for the kind
    pub concurrency: usize,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    /// Re-enqueue every cached key this often; `None` disables
    pub resync_period: Option<Duration>,
    pub shutdown_grace: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            backoff_base: Duration::from_millis(5),
            backoff_cap: Duration::from_secs(1000),
            resync_period: Some(Duration::from_secs(600)),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

/// Explicit trigger into a running scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
    name: Arc<str>,
    tx: mpsc::UnboundedSender<ObjectKey>,
}

impl SchedulerHandle {
    /// Enqueue `key` as if it changed. False once the scheduler is gone.
    pub fn enqueue(&self, key: ObjectKey) -> bool {
        self.tx.send(key).is_ok()
    }

    pub fn name(&self) -> &str { &self.name }
}

pub struct Scheduler<R: Reconciler> {
    name: Arc<str>,
    kind: ResourceKind,
    cache: Cache,
    reconciler: Arc<R>,
    ctx: Arc<R::Context>,
    config: SchedulerConfig,
    related: Vec<(ResourceKind, Mapper)>,
    tx: mpsc::UnboundedSender<ObjectKey>,
    rx: mpsc::UnboundedReceiver<ObjectKey>,
}

type Finished = (ObjectKey, Result<Result<Action, ReconcileError>, String>, Duration);

impl<R: Reconciler> Scheduler<R> {
    pub fn new(
        name: &str,
        kind: ResourceKind,
        cache: Cache,
        reconciler: R,
        ctx: Arc<R::Context>,
        config: SchedulerConfig,
    ) -> Result<Self, StoreError> {
        if !cache.watches(&kind) {
            return Err(StoreError::UnsupportedKind { kind: kind.gvk_key() });
        }
        let (tx, rx) = mpsc::unbounded_channel();
        Ok(Self { name: name.into(), kind, cache, reconciler: Arc::new(reconciler), ctx, config, related: Vec::new(), tx, rx })
    }

    /// Also reconcile the keys `mapper` returns for every change of `kind`.
    pub fn watches<F>(mut self, kind: ResourceKind, mapper: F) -> Result<Self, StoreError>
    where
        F: Fn(&Change) -> Vec<ObjectKey> + Send + Sync + 'static,
    {
        if !self.cache.watches(&kind) {
            return Err(StoreError::UnsupportedKind { kind: kind.gvk_key() });
        }
        self.related.push((kind, Arc::new(mapper)));
        Ok(self)
    }

    pub fn name(&self) -> &str { &self.name }
    pub fn kind(&self) -> &ResourceKind { &self.kind }

    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle { name: self.name.clone(), tx: self.tx.clone() }
    }

    /// Run until `shutdown` is cancelled, then drain in-flight work within the
    /// grace period.
    pub async fn run(self, shutdown: CancellationToken) {
        let Scheduler { name, kind, cache, reconciler, ctx, config, related, tx, mut rx } = self;
        drop(tx);
        let mut changes = cache.subscribe();
        let mut lp = Loop {
            name: name.clone(),
            kind: kind.clone(),
            cache,
            backoff: Backoff::new(config.backoff_base, config.backoff_cap),
            queue: WorkQueue::new(),
            timers: DelayQueue::new(),
            timer_keys: FxHashMap::default(),
        };
        let concurrency = config.concurrency.max(1);
        let mut workers: JoinSet<Finished> = JoinSet::new();
        let mut resync = config.resync_period.map(|p| {
            let mut i = tokio::time::interval_at(tokio::time::Instant::now() + p, p.max(Duration::from_millis(1)));
            i.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            i
        });
        let mut feed_open = true;
        let mut handles_open = true;

        info!(controller = %name, kind = %kind, concurrency, "scheduler started");
        lp.resync_all();

        loop {
            while workers.len() < concurrency {
                let Some(key) = lp.queue.pop() else { break };
                let request = ReconcileRequest { kind: kind.clone(), key: key.clone(), object: lp.cache.get(&kind, &key) };
                let reconciler = reconciler.clone();
                let ctx = ctx.clone();
                workers.spawn(async move {
                    let started = Instant::now();
                    let res = AssertUnwindSafe(reconciler.reconcile(request, ctx))
                        .catch_unwind()
                        .await
                        .map_err(|p| panic_message(p.as_ref()));
                    (key, res, started.elapsed())
                });
            }

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                Some(joined) = workers.join_next(), if !workers.is_empty() => match joined {
                    Ok((key, res, took)) => lp.complete(key, res, took),
                    Err(e) => error!(controller = %name, error = %e, "reconcile task failed"),
                },
                recv = changes.recv(), if feed_open => match recv {
                    Ok(change) => lp.route(&change, &related),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(controller = %name, missed, "change feed lagged; resyncing");
                        lp.resync_all();
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        warn!(controller = %name, "change feed closed");
                        feed_open = false;
                    }
                },
                key = rx.recv(), if handles_open => match key {
                    Some(key) => lp.enqueue_now(key, Trigger::Change),
                    None => handles_open = false,
                },
                Some(expired) = lp.timers.next(), if !lp.timers.is_empty() => {
                    let key = expired.into_inner();
                    lp.timer_keys.remove(&key);
                    lp.queue.enqueue(key, Trigger::Timer);
                }
                _ = tick(&mut resync) => {
                    debug!(controller = %name, "periodic resync");
                    lp.resync_all();
                }
            }
        }

        let in_flight = workers.len();
        if in_flight > 0 {
            info!(controller = %name, in_flight, grace = ?config.shutdown_grace, "draining reconciles");
            let drain = async {
                while let Some(joined) = workers.join_next().await {
                    if let Ok((key, res, took)) = joined {
                        lp.log_result(&key, &res, took);
                    }
                }
            };
            if tokio::time::timeout(config.shutdown_grace, drain).await.is_err() {
                warn!(controller = %name, remaining = workers.len(), "grace period elapsed; aborting reconciles");
                workers.abort_all();
                while workers.join_next().await.is_some() {}
            }
        }
        info!(controller = %name, "scheduler stopped");
    }
}

async fn tick(resync: &mut Option<tokio::time::Interval>) {
    match resync {
        Some(i) => {
            i.tick().await;
        }
        None => futures::future::pending::<()>().await,
    }
}

fn panic_message(p: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = p.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = p.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

struct Loop {
    name: Arc<str>,
    kind: ResourceKind,
    cache: Cache,
    backoff: Backoff,
    queue: WorkQueue<ObjectKey>,
    timers: DelayQueue<ObjectKey>,
    timer_keys: FxHashMap<ObjectKey, delay_queue::Key>,
}

impl Loop {
    fn cancel_timer(&mut self, key: &ObjectKey) {
        if let Some(k) = self.timer_keys.remove(key) {
            self.timers.remove(&k);
        }
    }

    fn schedule(&mut self, key: ObjectKey, after: Duration) {
        self.cancel_timer(&key);
        let k = self.timers.insert(key.clone(), after);
        self.timer_keys.insert(key, k);
    }

    /// Immediate enqueue; supersedes any pending timer for the key.
    fn enqueue_now(&mut self, key: ObjectKey, trigger: Trigger) {
        self.cancel_timer(&key);
        self.queue.enqueue(key, trigger);
    }

    fn route(&mut self, change: &Change, related: &[(ResourceKind, Mapper)]) {
        if change.kind == self.kind {
            self.enqueue_now(change.object.key.clone(), Trigger::Change);
        }
        for (kind, mapper) in related {
            if *kind == change.kind {
                for key in mapper(change) {
                    self.enqueue_now(key, Trigger::Change);
                }
            }
        }
    }

    /// Enqueue every cached key except those waiting on a timer.
    fn resync_all(&mut self) {
        let mut keys = self.cache.keys(&self.kind);
        keys.sort_unstable();
        for key in keys {
            if !self.timer_keys.contains_key(&key) {
                self.queue.enqueue(key, Trigger::Resync);
            }
        }
    }

    fn complete(&mut self, key: ObjectKey, res: Result<Result<Action, ReconcileError>, String>, took: Duration) {
        self.log_result(&key, &res, took);
        match res {
            Ok(Ok(Action::AwaitChange)) => self.queue.reset_failures(&key),
            Ok(Ok(Action::Requeue(after))) => {
                self.queue.reset_failures(&key);
                self.schedule(key.clone(), after);
            }
            Ok(Err(ReconcileError::Fatal(_))) => {
                self.queue.mark_fatal(&key);
                self.cancel_timer(&key);
            }
            Ok(Err(ReconcileError::Transient(_))) | Err(_) => {
                let failures = self.queue.record_failure(&key);
                let delay = self.backoff.delay(failures);
                debug!(controller = %self.name, key = %key, failures, delay = ?delay, "retrying with backoff");
                self.schedule(key.clone(), delay);
            }
        }
        if self.queue.finish(&key) {
            // A change arrived while running; it wins over any timer
            self.cancel_timer(&key);
        }
    }

    fn log_result(&self, key: &ObjectKey, res: &Result<Result<Action, ReconcileError>, String>, took: Duration) {
        let result = match res {
            Ok(Ok(Action::AwaitChange)) => "success",
            Ok(Ok(Action::Requeue(_))) => "requeue",
            Ok(Err(ReconcileError::Transient(_))) => "transient",
            Ok(Err(ReconcileError::Fatal(_))) => "fatal",
            Err(_) => "panic",
        };
        counter!("fleet_reconcile_total", 1u64, "controller" => self.name.to_string(), "result" => result);
        histogram!("fleet_reconcile_ms", took.as_secs_f64() * 1000.0, "controller" => self.name.to_string());
        match res {
            Ok(Ok(action)) => debug!(controller = %self.name, key = %key, ?action, "reconcile completed"),
            Ok(Err(e @ ReconcileError::Transient(_))) => warn!(controller = %self.name, key = %key, error = %e, "reconcile failed"),
            Ok(Err(e)) => error!(controller = %self.name, key = %key, error = %e, "reconcile failed permanently"),
            Err(msg) => error!(controller = %self.name, key = %key, panic = %msg, "reconciler panicked"),
        }
    }
}
