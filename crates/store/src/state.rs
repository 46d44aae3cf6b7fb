//! Writer-side cache state and the immutable snapshots it freezes into.

use std::fmt;
use std::sync::Arc;

use fleet_core::kinds::IndexKeys;
use fleet_core::{CachedObject, Change, ChangeKind, ObjectKey, ResourceKind, StoreError, WatchEvent};
use rustc_hash::{FxHashMap, FxHashSet};

pub type IndexFn = Arc<dyn Fn(&CachedObject) -> IndexKeys + Send + Sync>;

/// Secondary index declaration: objects of `kind` are indexed under every key
/// `extract` returns for them.
#[derive(Clone)]
pub struct IndexSpec {
    pub kind: ResourceKind,
    pub name: String,
    pub extract: IndexFn,
}

impl IndexSpec {
    pub fn new<F>(kind: ResourceKind, name: &str, extract: F) -> Self
    where
        F: Fn(&CachedObject) -> IndexKeys + Send + Sync + 'static,
    {
        Self { kind, name: name.to_string(), extract: Arc::new(extract) }
    }
}

impl fmt::Debug for IndexSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexSpec").field("kind", &self.kind).field("name", &self.name).finish()
    }
}

/// Immutable view of one kind: primary mapping plus index tables.
#[derive(Clone, Default)]
pub struct KindSnapshot {
    objects: FxHashMap<ObjectKey, Arc<CachedObject>>,
    // index name -> index key -> object keys
    indexes: FxHashMap<String, FxHashMap<String, FxHashSet<ObjectKey>>>,
    synced: bool,
}

impl KindSnapshot {
    pub fn len(&self) -> usize { self.objects.len() }
    pub fn is_empty(&self) -> bool { self.objects.is_empty() }
    pub fn synced(&self) -> bool { self.synced }

    pub fn get(&self, key: &ObjectKey) -> Option<Arc<CachedObject>> {
        self.objects.get(key).cloned()
    }

    pub fn keys(&self) -> impl Iterator<Item = &ObjectKey> {
        self.objects.keys()
    }

    pub fn objects(&self) -> impl Iterator<Item = &Arc<CachedObject>> {
        self.objects.values()
    }

    /// Objects under `index_key`, sorted by key for stable output.
    pub fn list(&self, index: &str, index_key: &str) -> Vec<Arc<CachedObject>> {
        let Some(keys) = self.indexes.get(index).and_then(|t| t.get(index_key)) else {
            return Vec::new();
        };
        let mut keys: Vec<&ObjectKey> = keys.iter().collect();
        keys.sort_unstable();
        keys.into_iter().filter_map(|k| self.objects.get(k).cloned()).collect()
    }

    pub fn has_index(&self, index: &str) -> bool {
        self.indexes.contains_key(index)
    }

    /// Every (index key, object key) pair of one index.
    pub fn index_entries(&self, index: &str) -> Vec<(String, ObjectKey)> {
        let mut out = Vec::new();
        if let Some(table) = self.indexes.get(index) {
            for (ik, keys) in table {
                for k in keys {
                    out.push((ik.clone(), k.clone()));
                }
            }
        }
        out.sort_unstable();
        out
    }

    fn index_insert(&mut self, fns: &[(String, IndexFn)], obj: &CachedObject) {
        for (name, f) in fns {
            let table = self.indexes.entry(name.clone()).or_default();
            for ik in f(obj) {
                table.entry(ik).or_default().insert(obj.key.clone());
            }
        }
    }

    fn index_remove(&mut self, fns: &[(String, IndexFn)], obj: &CachedObject) {
        for (name, f) in fns {
            let Some(table) = self.indexes.get_mut(name) else { continue };
            for ik in f(obj) {
                if let Some(keys) = table.get_mut(&ik) {
                    keys.remove(&obj.key);
                    if keys.is_empty() {
                        table.remove(&ik);
                    }
                }
            }
        }
    }
}

/// Consistent view over every watched kind at one epoch.
#[derive(Clone, Default)]
pub struct CacheSnapshot {
    pub epoch: u64,
    kinds: FxHashMap<ResourceKind, Arc<KindSnapshot>>,
}

impl CacheSnapshot {
    pub fn kind(&self, kind: &ResourceKind) -> Option<&KindSnapshot> {
        self.kinds.get(kind).map(|k| k.as_ref())
    }

    pub fn get(&self, kind: &ResourceKind, key: &ObjectKey) -> Option<Arc<CachedObject>> {
        self.kind(kind)?.get(key)
    }

    pub fn list(&self, kind: &ResourceKind, index: &str, index_key: &str) -> Vec<Arc<CachedObject>> {
        self.kind(kind).map(|k| k.list(index, index_key)).unwrap_or_default()
    }

    pub fn synced(&self) -> bool {
        self.kinds.values().all(|k| k.synced)
    }
}

struct KindState {
    snap: Arc<KindSnapshot>,
    fns: Vec<(String, IndexFn)>,
}

/// Single-writer state: applies watch events and index registrations, then
/// freezes into a `CacheSnapshot` for readers.
pub struct CacheState {
    epoch: u64,
    kinds: FxHashMap<ResourceKind, KindState>,
}

impl CacheState {
    pub fn new(kinds: &[ResourceKind]) -> Self {
        let kinds = kinds
            .iter()
            .map(|k| (k.clone(), KindState { snap: Arc::new(KindSnapshot::default()), fns: Vec::new() }))
            .collect();
        Self { epoch: 0, kinds }
    }

    pub fn watches(&self, kind: &ResourceKind) -> bool {
        self.kinds.contains_key(kind)
    }

    fn kind_mut(&mut self, kind: &ResourceKind) -> Result<&mut KindState, StoreError> {
        self.kinds.get_mut(kind).ok_or_else(|| StoreError::UnsupportedKind { kind: kind.gvk_key() })
    }

    /// Register an index; existing objects are indexed immediately.
    pub fn add_index(&mut self, spec: IndexSpec) -> Result<(), StoreError> {
        let state = self.kind_mut(&spec.kind)?;
        if state.fns.iter().any(|(n, _)| *n == spec.name) {
            return Err(StoreError::DuplicateIndex { kind: spec.kind.gvk_key(), index: spec.name });
        }
        let single = [(spec.name.clone(), spec.extract.clone())];
        let snap = Arc::make_mut(&mut state.snap);
        snap.indexes.insert(spec.name.clone(), FxHashMap::default());
        let objects: Vec<Arc<CachedObject>> = snap.objects.values().cloned().collect();
        for obj in &objects {
            snap.index_insert(&single, obj);
        }
        state.fns.push((spec.name, spec.extract));
        Ok(())
    }

    /// Apply one event for `kind`, returning the visible changes it produced.
    pub fn apply(&mut self, kind: &ResourceKind, event: WatchEvent) -> Result<Vec<Change>, StoreError> {
        let state = self.kind_mut(kind)?;
        let fns = state.fns.clone();
        let snap = Arc::make_mut(&mut state.snap);
        let mut changes = Vec::new();
        match event {
            WatchEvent::Applied(obj) => {
                let obj = Arc::new(obj);
                if let Some(old) = snap.objects.insert(obj.key.clone(), obj.clone()) {
                    snap.index_remove(&fns, &old);
                }
                snap.index_insert(&fns, &obj);
                changes.push(Change { kind: kind.clone(), change: ChangeKind::Applied, object: obj });
            }
            WatchEvent::Deleted(obj) => {
                // Prefer the last cached state so index removal matches what was inserted
                let removed = snap.objects.remove(&obj.key);
                let last = match removed {
                    Some(old) => {
                        snap.index_remove(&fns, &old);
                        old
                    }
                    None => Arc::new(obj),
                };
                changes.push(Change { kind: kind.clone(), change: ChangeKind::Deleted, object: last });
            }
            WatchEvent::Restarted(list) => {
                let mut fresh: FxHashMap<ObjectKey, Arc<CachedObject>> = FxHashMap::default();
                for obj in list {
                    fresh.insert(obj.key.clone(), Arc::new(obj));
                }
                let mut gone: Vec<Arc<CachedObject>> =
                    snap.objects.values().filter(|o| !fresh.contains_key(&o.key)).cloned().collect();
                gone.sort_unstable_by(|a, b| a.key.cmp(&b.key));
                let mut applied: Vec<Arc<CachedObject>> = fresh
                    .values()
                    .filter(|o| match snap.objects.get(&o.key) {
                        Some(old) => old.resource_version.is_none() || old.resource_version != o.resource_version || old.raw != o.raw,
                        None => true,
                    })
                    .cloned()
                    .collect();
                applied.sort_unstable_by(|a, b| a.key.cmp(&b.key));

                snap.objects = fresh;
                for table in snap.indexes.values_mut() {
                    table.clear();
                }
                let objects: Vec<Arc<CachedObject>> = snap.objects.values().cloned().collect();
                for obj in &objects {
                    snap.index_insert(&fns, obj);
                }
                snap.synced = true;

                changes.extend(gone.into_iter().map(|o| Change { kind: kind.clone(), change: ChangeKind::Deleted, object: o }));
                changes.extend(applied.into_iter().map(|o| Change { kind: kind.clone(), change: ChangeKind::Applied, object: o }));
            }
        }
        Ok(changes)
    }

    pub fn bump_epoch(&mut self) {
        self.epoch = self.epoch.saturating_add(1);
    }

    pub fn synced(&self) -> bool {
        self.kinds.values().all(|k| k.snap.synced)
    }

    pub fn freeze(&self) -> Arc<CacheSnapshot> {
        Arc::new(CacheSnapshot {
            epoch: self.epoch,
            kinds: self.kinds.iter().map(|(k, s)| (k.clone(), s.snap.clone())).collect(),
        })
    }
}
