//! In-memory watch source for tests and single-process demos.
//!
//! Behaves like an API server for a handful of kinds: every `watch` call starts
//! with a full listing, later mutations are pushed to open streams, and the
//! source can be taken offline to simulate broken streams.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use fleet_core::{CachedObject, ObjectKey, ResourceKind, WatchError, WatchEvent, WatchSource, WatchStream};
use futures::StreamExt;
use tokio::sync::mpsc;

type Subscriber = (ResourceKind, mpsc::UnboundedSender<Result<WatchEvent, WatchError>>);

#[derive(Default)]
struct MockState {
    objects: BTreeMap<ResourceKind, BTreeMap<ObjectKey, CachedObject>>,
    subscribers: Vec<Subscriber>,
    offline: bool,
    watch_calls: usize,
    rv: u64,
}

#[derive(Clone, Default)]
pub struct MockSource {
    inner: Arc<Mutex<MockState>>,
}

impl MockSource {
    pub fn new() -> Self { Self::default() }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        // Poisoned state is still consistent: every mutation is a single insert or remove
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Create or update an object; returns the stored object.
    pub fn apply(&self, kind: &ResourceKind, mut raw: serde_json::Value) -> Result<CachedObject, WatchError> {
        let mut st = self.lock();
        st.rv += 1;
        let rv = st.rv.to_string();
        if let Some(meta) = raw.get_mut("metadata").and_then(|m| m.as_object_mut()) {
            meta.insert("resourceVersion".to_string(), serde_json::Value::String(rv));
        }
        let obj = CachedObject::from_raw(raw)?;
        st.objects.entry(kind.clone()).or_default().insert(obj.key.clone(), obj.clone());
        Self::broadcast(&mut st, kind, WatchEvent::Applied(obj.clone()));
        Ok(obj)
    }

    pub fn delete(&self, kind: &ResourceKind, key: &ObjectKey) -> Option<CachedObject> {
        let mut st = self.lock();
        let removed = st.objects.get_mut(kind).and_then(|m| m.remove(key));
        if let Some(obj) = &removed {
            Self::broadcast(&mut st, kind, WatchEvent::Deleted(obj.clone()));
        }
        removed
    }

    pub fn list(&self, kind: &ResourceKind) -> Vec<CachedObject> {
        self.lock().objects.get(kind).map(|m| m.values().cloned().collect()).unwrap_or_default()
    }

    /// While offline, open streams are ended and new watches fail immediately.
    /// Mutations still apply and are only visible through the next listing.
    pub fn set_offline(&self, offline: bool) {
        let mut st = self.lock();
        st.offline = offline;
        if offline {
            st.subscribers.clear();
        }
    }

    /// End every open stream; watchers must reopen and relist.
    pub fn break_streams(&self) {
        self.lock().subscribers.clear();
    }

    pub fn watch_calls(&self) -> usize { self.lock().watch_calls }

    pub fn open_streams(&self) -> usize {
        let mut st = self.lock();
        st.subscribers.retain(|(_, tx)| !tx.is_closed());
        st.subscribers.len()
    }

    fn broadcast(st: &mut MockState, kind: &ResourceKind, ev: WatchEvent) {
        st.subscribers.retain(|(k, tx)| k != kind || tx.send(Ok(ev.clone())).is_ok());
    }
}

impl WatchSource for MockSource {
    fn watch(&self, kind: &ResourceKind) -> WatchStream {
        let mut st = self.lock();
        st.watch_calls += 1;
        if st.offline {
            let err = WatchError::Stream(format!("{} unavailable", kind));
            return futures::stream::iter(vec![Err(err)]).boxed();
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let listing = st.objects.get(kind).map(|m| m.values().cloned().collect()).unwrap_or_default();
        let _ = tx.send(Ok(WatchEvent::Restarted(listing)));
        st.subscribers.push((kind.clone(), tx));
        futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) }).boxed()
    }
}
