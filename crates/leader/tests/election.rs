#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fleet_core::LeaseError;
use fleet_leader::mock::{InMemoryLeaseStore, TokioClock};
use fleet_leader::{LeaderConfig, LeaderCoordinator, LeaderState, LeaseRecord, LeaseStore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const LEASE: &str = "fleet-controller-leader";

#[derive(Default)]
struct Leaders {
    now: AtomicUsize,
    max: AtomicUsize,
    terms: AtomicUsize,
}

fn coordinator(store: &InMemoryLeaseStore, clock: &Arc<TokioClock>, id: &str) -> Arc<LeaderCoordinator> {
    let clock: Arc<dyn fleet_leader::Clock> = clock.clone();
    Arc::new(LeaderCoordinator::with_clock(Arc::new(store.clone()), clock, LeaderConfig::new(LEASE, "fleet-system", id)))
}

fn spawn_member(
    coord: Arc<LeaderCoordinator>,
    leaders: Arc<Leaders>,
    shutdown: CancellationToken,
) -> JoinHandle<Result<(), LeaseError>> {
    tokio::spawn(async move {
        coord
            .run_while_leading(shutdown, |leading| async move {
                let n = leaders.now.fetch_add(1, Ordering::SeqCst) + 1;
                leaders.max.fetch_max(n, Ordering::SeqCst);
                leaders.terms.fetch_add(1, Ordering::SeqCst);
                leading.cancelled().await;
                leaders.now.fetch_sub(1, Ordering::SeqCst);
            })
            .await
    })
}

#[tokio::test(start_paused = true)]
async fn one_leader_among_many_and_fast_failover_on_release() {
    let store = InMemoryLeaseStore::new();
    let clock = Arc::new(TokioClock::new());
    let leaders = Arc::new(Leaders::default());
    let mut members = BTreeMap::new();
    for id in ["a", "b", "c"] {
        let token = CancellationToken::new();
        let handle = spawn_member(coordinator(&store, &clock, id), leaders.clone(), token.clone());
        members.insert(id.to_string(), (token, handle));
    }
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(leaders.now.load(Ordering::SeqCst), 1);
    assert_eq!(leaders.terms.load(Ordering::SeqCst), 1);

    let first = store.holder(LEASE).unwrap();
    let (token, handle) = members.remove(&first).unwrap();
    token.cancel();
    assert!(handle.await.unwrap().is_ok());

    // Released leases are taken within one retry period, well before expiry
    tokio::time::sleep(Duration::from_secs(3)).await;
    let second = store.holder(LEASE).unwrap();
    assert_ne!(first, second);
    assert_eq!(leaders.now.load(Ordering::SeqCst), 1);
    assert_eq!(leaders.max.load(Ordering::SeqCst), 1);
    assert_eq!(leaders.terms.load(Ordering::SeqCst), 2);

    for (_, (token, _)) in members {
        token.cancel();
    }
}

#[tokio::test(start_paused = true)]
async fn backend_outage_loses_leadership_after_renew_deadline() {
    let store = InMemoryLeaseStore::new();
    let clock = Arc::new(TokioClock::new());
    let leaders = Arc::new(Leaders::default());
    let coord = coordinator(&store, &clock, "a");
    let handle = spawn_member(coord.clone(), leaders.clone(), CancellationToken::new());
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(coord.state(), LeaderState::Leading);

    store.set_failing(true);
    tokio::time::sleep(Duration::from_secs(8)).await;
    assert_eq!(coord.state(), LeaderState::Leading);
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert!(handle.is_finished());
    assert!(matches!(handle.await.unwrap(), Err(LeaseError::Lost { .. })));
    assert_eq!(leaders.now.load(Ordering::SeqCst), 0);
    assert_eq!(coord.state(), LeaderState::Standby);
}

#[tokio::test(start_paused = true)]
async fn foreign_holder_is_detected_on_next_renewal() {
    let store = InMemoryLeaseStore::new();
    let clock = Arc::new(TokioClock::new());
    let leaders = Arc::new(Leaders::default());
    let coord = coordinator(&store, &clock, "a");
    let mut states = coord.subscribe();
    let handle = spawn_member(coord.clone(), leaders.clone(), CancellationToken::new());
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(*states.borrow_and_update(), LeaderState::Leading);

    let now = fleet_leader::Clock::now(clock.as_ref());
    store.force(
        LEASE,
        LeaseRecord {
            holder: Some("intruder".into()),
            acquired_at: Some(now),
            renewed_at: Some(now),
            duration: Duration::from_secs(15),
            transitions: 1,
        },
    );
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(matches!(handle.await.unwrap(), Err(LeaseError::Lost { .. })));
    assert_eq!(*states.borrow(), LeaderState::Standby);
    assert_eq!(store.holder(LEASE).as_deref(), Some("intruder"));
}

#[tokio::test(start_paused = true)]
async fn crashed_holder_is_replaced_after_expiry() {
    let store = InMemoryLeaseStore::new();
    let clock = Arc::new(TokioClock::new());
    let leaders = Arc::new(Leaders::default());
    let crashed = spawn_member(coordinator(&store, &clock, "a"), leaders.clone(), CancellationToken::new());
    tokio::time::sleep(Duration::from_secs(1)).await;
    crashed.abort();
    let _ = crashed.await;
    assert_eq!(store.holder(LEASE).as_deref(), Some("a"));

    let standby = coordinator(&store, &clock, "b");
    let token = CancellationToken::new();
    let _member = spawn_member(standby.clone(), Arc::new(Leaders::default()), token.clone());
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(standby.state(), LeaderState::Acquiring);
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(standby.state(), LeaderState::Leading);

    let lease = store.get(LEASE).await.unwrap().unwrap();
    assert_eq!(lease.record.holder.as_deref(), Some("b"));
    assert_eq!(lease.record.transitions, 1);
    token.cancel();
}
