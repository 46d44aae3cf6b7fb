#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use fleet_core::{kinds, ObjectKey, ReconcileError};
use fleet_scheduler::{Action, Backoff, ReconcileRequest, Reconciler, Scheduler, SchedulerConfig};
use fleet_store::mock::MockSource;
use fleet_store::{Cache, CacheConfig};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy)]
enum Step {
    Done(Action),
    Transient,
    Fatal,
    Panic,
    Sleep(Duration),
}

#[derive(Default)]
struct Probe {
    calls: Mutex<Vec<(ObjectKey, bool, Instant)>>,
    running: Mutex<HashMap<ObjectKey, usize>>,
    max_per_key: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl Probe {
    fn calls_for(&self, key: &ObjectKey) -> Vec<(bool, Instant)> {
        self.calls.lock().unwrap().iter().filter(|(k, _, _)| k == key).map(|(_, o, t)| (*o, *t)).collect()
    }

    fn total(&self) -> usize { self.calls.lock().unwrap().len() }
}

struct Scripted {
    script: Box<dyn Fn(&ReconcileRequest, usize) -> Step + Send + Sync>,
}

impl Scripted {
    fn new(f: impl Fn(&ReconcileRequest, usize) -> Step + Send + Sync + 'static) -> Self {
        Self { script: Box::new(f) }
    }
}

#[async_trait]
impl Reconciler for Scripted {
    type Context = Probe;

    async fn reconcile(&self, req: ReconcileRequest, ctx: Arc<Probe>) -> Result<Action, ReconcileError> {
        let attempt = {
            let mut calls = ctx.calls.lock().unwrap();
            calls.push((req.key.clone(), req.object.is_some(), Instant::now()));
            calls.iter().filter(|(k, _, _)| *k == req.key).count()
        };
        let step = (self.script)(&req, attempt);
        if let Step::Panic = step {
            panic!("scripted panic for {}", req.key);
        }
        {
            let mut running = ctx.running.lock().unwrap();
            let n = running.entry(req.key.clone()).or_insert(0);
            *n += 1;
            ctx.max_per_key.fetch_max(*n, Ordering::SeqCst);
        }
        let active = ctx.active.fetch_add(1, Ordering::SeqCst) + 1;
        ctx.max_active.fetch_max(active, Ordering::SeqCst);
        let out = match step {
            Step::Done(a) => Ok(a),
            Step::Transient => Err(ReconcileError::transient("not ready")),
            Step::Fatal => Err(ReconcileError::fatal("invalid spec")),
            Step::Sleep(d) => {
                tokio::time::sleep(d).await;
                Ok(Action::AwaitChange)
            }
            Step::Panic => unreachable!(),
        };
        ctx.active.fetch_sub(1, Ordering::SeqCst);
        *ctx.running.lock().unwrap().get_mut(&req.key).unwrap() -= 1;
        out
    }
}

fn machine(name: &str) -> serde_json::Value {
    serde_json::json!({"metadata": {"name": name, "namespace": "default"}, "spec": {"clusterName": "c1"}})
}

fn key(name: &str) -> ObjectKey { ObjectKey::namespaced("default", name) }

async fn local_cache(src: &MockSource, root: &CancellationToken) -> Cache {
    let cache = Cache::spawn(
        "local",
        Arc::new(src.clone()),
        vec![kinds::machine(), kinds::node()],
        Vec::new(),
        &CacheConfig::default(),
        root,
    )
    .unwrap();
    assert!(cache.wait_for_sync(Duration::from_secs(5)).await);
    cache
}

fn config() -> SchedulerConfig {
    SchedulerConfig { resync_period: None, ..SchedulerConfig::default() }
}

fn start(
    cache: &Cache,
    reconciler: Scripted,
    cfg: SchedulerConfig,
    root: &CancellationToken,
) -> (Arc<Probe>, tokio::task::JoinHandle<()>) {
    let probe = Arc::new(Probe::default());
    let s = Scheduler::new("machine", kinds::machine(), cache.clone(), reconciler, probe.clone(), cfg).unwrap();
    (probe, tokio::spawn(s.run(root.child_token())))
}

async fn settle(d: Duration) { tokio::time::sleep(d).await }

#[tokio::test(start_paused = true)]
async fn reconciles_on_change_and_delete() {
    let src = MockSource::new();
    let root = CancellationToken::new();
    let cache = local_cache(&src, &root).await;
    let (probe, _task) = start(&cache, Scripted::new(|_, _| Step::Done(Action::AwaitChange)), config(), &root);
    settle(Duration::from_millis(10)).await;

    src.apply(&kinds::machine(), machine("m1")).unwrap();
    settle(Duration::from_millis(10)).await;
    src.delete(&kinds::machine(), &key("m1"));
    settle(Duration::from_millis(10)).await;

    let calls = probe.calls_for(&key("m1"));
    assert_eq!(calls.iter().map(|(present, _)| *present).collect::<Vec<_>>(), vec![true, false]);
    root.cancel();
}

#[tokio::test(start_paused = true)]
async fn changes_while_running_collapse_into_one_rerun() {
    let src = MockSource::new();
    src.apply(&kinds::machine(), machine("m1")).unwrap();
    let root = CancellationToken::new();
    let cache = local_cache(&src, &root).await;
    let (probe, _task) = start(&cache, Scripted::new(|_, _| Step::Sleep(Duration::from_secs(1))), config(), &root);
    settle(Duration::from_millis(100)).await;
    assert_eq!(probe.total(), 1);

    for i in 0..5 {
        let mut obj = machine("m1");
        obj["spec"]["version"] = serde_json::json!(format!("v1.{i}"));
        src.apply(&kinds::machine(), obj).unwrap();
        settle(Duration::from_millis(10)).await;
    }
    settle(Duration::from_secs(5)).await;
    assert_eq!(probe.total(), 2);
    assert_eq!(probe.max_per_key.load(Ordering::SeqCst), 1);
    root.cancel();
}

#[tokio::test(start_paused = true)]
async fn concurrency_is_bounded() {
    let src = MockSource::new();
    for i in 0..6 {
        src.apply(&kinds::machine(), machine(&format!("m{i}"))).unwrap();
    }
    let root = CancellationToken::new();
    let cache = local_cache(&src, &root).await;
    let cfg = SchedulerConfig { concurrency: 2, ..config() };
    let (probe, _task) = start(&cache, Scripted::new(|_, _| Step::Sleep(Duration::from_secs(1))), cfg, &root);
    settle(Duration::from_secs(10)).await;
    assert_eq!(probe.total(), 6);
    assert_eq!(probe.max_active.load(Ordering::SeqCst), 2);
    root.cancel();
}

#[tokio::test(start_paused = true)]
async fn requeue_after_runs_once_after_deadline() {
    let src = MockSource::new();
    src.apply(&kinds::machine(), machine("m1")).unwrap();
    let root = CancellationToken::new();
    let cache = local_cache(&src, &root).await;
    let script = |_: &ReconcileRequest, n: usize| {
        if n == 1 { Step::Done(Action::Requeue(Duration::from_secs(10))) } else { Step::Done(Action::AwaitChange) }
    };
    let (probe, _task) = start(&cache, Scripted::new(script), config(), &root);
    settle(Duration::from_secs(9)).await;
    assert_eq!(probe.total(), 1);
    settle(Duration::from_secs(30)).await;

    let calls = probe.calls_for(&key("m1"));
    assert_eq!(calls.len(), 2);
    assert!(calls[1].1 - calls[0].1 >= Duration::from_secs(10));
    root.cancel();
}

#[tokio::test(start_paused = true)]
async fn transient_errors_back_off_exponentially() {
    let src = MockSource::new();
    src.apply(&kinds::machine(), machine("m1")).unwrap();
    let root = CancellationToken::new();
    let cache = local_cache(&src, &root).await;
    let cfg = SchedulerConfig { backoff_base: Duration::from_millis(5), backoff_cap: Duration::from_millis(500), ..config() };
    let (probe, _task) = start(&cache, Scripted::new(|_, _| Step::Transient), cfg, &root);
    settle(Duration::from_secs(5)).await;

    let calls = probe.calls_for(&key("m1"));
    assert!(calls.len() >= 8, "only {} attempts", calls.len());
    let backoff = Backoff::new(Duration::from_millis(5), Duration::from_millis(500));
    let mut last_gap = Duration::ZERO;
    for (i, pair) in calls.windows(2).enumerate() {
        let gap = pair[1].1 - pair[0].1;
        assert!(gap >= backoff.delay(i as u32 + 1), "attempt {} came early", i + 2);
        assert!(gap >= last_gap);
        last_gap = gap;
    }
    assert!(last_gap <= Duration::from_millis(510));
    root.cancel();
}

#[tokio::test(start_paused = true)]
async fn fatal_keys_wait_for_next_change() {
    let src = MockSource::new();
    src.apply(&kinds::machine(), machine("m1")).unwrap();
    let root = CancellationToken::new();
    let cache = local_cache(&src, &root).await;
    let cfg = SchedulerConfig { resync_period: Some(Duration::from_secs(1)), ..config() };
    let (probe, _task) = start(&cache, Scripted::new(|_, _| Step::Fatal), cfg, &root);
    settle(Duration::from_secs(5)).await;
    assert_eq!(probe.total(), 1);

    src.apply(&kinds::machine(), machine("m1")).unwrap();
    settle(Duration::from_millis(100)).await;
    assert_eq!(probe.total(), 2);
    root.cancel();
}

#[tokio::test(start_paused = true)]
async fn periodic_resync_revisits_idle_keys() {
    let src = MockSource::new();
    src.apply(&kinds::machine(), machine("m1")).unwrap();
    src.apply(&kinds::machine(), machine("m2")).unwrap();
    let root = CancellationToken::new();
    let cache = local_cache(&src, &root).await;
    let cfg = SchedulerConfig { resync_period: Some(Duration::from_secs(60)), ..config() };
    let (probe, _task) = start(&cache, Scripted::new(|_, _| Step::Done(Action::AwaitChange)), cfg, &root);
    settle(Duration::from_secs(150)).await;
    assert_eq!(probe.calls_for(&key("m1")).len(), 3);
    assert_eq!(probe.calls_for(&key("m2")).len(), 3);
    root.cancel();
}

#[tokio::test(start_paused = true)]
async fn panicking_reconciler_is_retried() {
    let src = MockSource::new();
    src.apply(&kinds::machine(), machine("m1")).unwrap();
    let root = CancellationToken::new();
    let cache = local_cache(&src, &root).await;
    let script = |_: &ReconcileRequest, n: usize| if n == 1 { Step::Panic } else { Step::Done(Action::AwaitChange) };
    let (probe, task) = start(&cache, Scripted::new(script), config(), &root);
    settle(Duration::from_secs(1)).await;
    assert_eq!(probe.total(), 2);
    assert!(!task.is_finished());
    root.cancel();
}

#[tokio::test(start_paused = true)]
async fn related_changes_and_handles_trigger_reconciles() {
    let src = MockSource::new();
    src.apply(&kinds::machine(), machine("m1")).unwrap();
    let root = CancellationToken::new();
    let cache = local_cache(&src, &root).await;
    let probe = Arc::new(Probe::default());
    let s = Scheduler::new(
        "machine",
        kinds::machine(),
        cache.clone(),
        Scripted::new(|_, _| Step::Done(Action::AwaitChange)),
        probe.clone(),
        config(),
    )
    .unwrap()
    .watches(kinds::node(), |change| {
        change.object.label("machine").map(|m| vec![ObjectKey::namespaced("default", m)]).unwrap_or_default()
    })
    .unwrap();
    let handle = s.handle();
    tokio::spawn(s.run(root.child_token()));
    settle(Duration::from_millis(10)).await;
    assert_eq!(probe.total(), 1);

    src.apply(&kinds::node(), serde_json::json!({"metadata": {"name": "n1", "labels": {"machine": "m1"}}})).unwrap();
    settle(Duration::from_millis(10)).await;
    assert_eq!(probe.total(), 2);

    assert!(handle.enqueue(key("m1")));
    settle(Duration::from_millis(10)).await;
    assert_eq!(probe.total(), 3);
    root.cancel();
}

#[tokio::test(start_paused = true)]
async fn unwatched_kinds_are_rejected() {
    let src = MockSource::new();
    let root = CancellationToken::new();
    let cache = local_cache(&src, &root).await;
    let probe = Arc::new(Probe::default());
    let reconciler = Scripted::new(|_, _| Step::Done(Action::AwaitChange));
    assert!(Scheduler::new("pool", kinds::machine_pool(), cache.clone(), reconciler, probe, config()).is_err());
    root.cancel();
}

#[tokio::test(start_paused = true)]
async fn shutdown_aborts_after_grace() {
    let src = MockSource::new();
    src.apply(&kinds::machine(), machine("m1")).unwrap();
    let root = CancellationToken::new();
    let cache = local_cache(&src, &root).await;
    let cfg = SchedulerConfig { shutdown_grace: Duration::from_secs(5), ..config() };
    let (probe, task) = start(&cache, Scripted::new(|_, _| Step::Sleep(Duration::from_secs(3600))), cfg, &root);
    settle(Duration::from_millis(10)).await;
    assert_eq!(probe.active.load(Ordering::SeqCst), 1);

    let started = Instant::now();
    root.cancel();
    task.await.unwrap();
    let took = started.elapsed();
    assert!(took >= Duration::from_secs(5) && took < Duration::from_secs(6));
}
