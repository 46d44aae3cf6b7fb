//! Per-kind work queue bookkeeping, independent of timers and tasks.

use std::collections::VecDeque;
use std::hash::Hash;

use rustc_hash::{FxHashMap, FxHashSet};

/// Why a key is being enqueued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Own or related object changed, or an explicit request
    Change,
    /// Requeue-after or backoff timer fired
    Timer,
    /// Periodic re-enqueue of every cached key
    Resync,
}

/// FIFO of ready keys plus the running, rerun-pending, failure and fatal
/// bookkeeping. A key is never both queued and running.
#[derive(Debug)]
pub struct WorkQueue<K> {
    ready: VecDeque<K>,
    queued: FxHashSet<K>,
    running: FxHashSet<K>,
    pending: FxHashSet<K>,
    failures: FxHashMap<K, u32>,
    fatal: FxHashSet<K>,
}

impl<K: Clone + Eq + Hash> Default for WorkQueue<K> {
    fn default() -> Self {
        Self {
            ready: VecDeque::new(),
            queued: FxHashSet::default(),
            running: FxHashSet::default(),
            pending: FxHashSet::default(),
            failures: FxHashMap::default(),
            fatal: FxHashSet::default(),
        }
    }
}

impl<K: Clone + Eq + Hash> WorkQueue<K> {
    pub fn new() -> Self { Self::default() }

    /// Returns true when the key became ready or got a rerun flagged.
    pub fn enqueue(&mut self, key: K, trigger: Trigger) -> bool {
        match trigger {
            Trigger::Change => {
                self.fatal.remove(&key);
            }
            Trigger::Resync => {
                if self.fatal.contains(&key) || self.running.contains(&key) {
                    return false;
                }
            }
            Trigger::Timer => {}
        }
        if self.running.contains(&key) {
            return self.pending.insert(key);
        }
        if !self.queued.insert(key.clone()) {
            return false;
        }
        self.ready.push_back(key);
        true
    }

    /// Next ready key, now marked running.
    pub fn pop(&mut self) -> Option<K> {
        let key = self.ready.pop_front()?;
        self.queued.remove(&key);
        self.running.insert(key.clone());
        Some(key)
    }

    /// Mark `key` finished. A rerun flagged while it ran is queued now and
    /// `true` is returned.
    pub fn finish(&mut self, key: &K) -> bool {
        self.running.remove(key);
        if self.pending.remove(key) {
            self.fatal.remove(key);
            if self.queued.insert(key.clone()) {
                self.ready.push_back(key.clone());
            }
            return true;
        }
        false
    }

    /// Count one more consecutive failure; returns the new count.
    pub fn record_failure(&mut self, key: &K) -> u32 {
        let n = self.failures.entry(key.clone()).or_insert(0);
        *n = n.saturating_add(1);
        *n
    }

    pub fn reset_failures(&mut self, key: &K) {
        self.failures.remove(key);
    }

    /// Park the key until its next change.
    pub fn mark_fatal(&mut self, key: &K) {
        self.failures.remove(key);
        self.fatal.insert(key.clone());
    }

    pub fn is_fatal(&self, key: &K) -> bool { self.fatal.contains(key) }
    pub fn is_running(&self, key: &K) -> bool { self.running.contains(key) }
    pub fn is_queued(&self, key: &K) -> bool { self.queued.contains(key) }
    pub fn has_pending(&self, key: &K) -> bool { self.pending.contains(key) }
    pub fn failures(&self, key: &K) -> u32 { self.failures.get(key).copied().unwrap_or(0) }
    pub fn ready_len(&self) -> usize { self.ready.len() }
    pub fn running_len(&self) -> usize { self.running.len() }
}
