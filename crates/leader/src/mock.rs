//! In-memory lease backend and a clock that follows tokio's (pausable) time.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_core::LeaseError;

use crate::{Clock, LeaseRecord, LeaseStore, VersionedLease};

#[derive(Clone, Default)]
pub struct InMemoryLeaseStore {
    leases: Arc<Mutex<BTreeMap<String, (LeaseRecord, u64)>>>,
    failing: Arc<AtomicBool>,
}

impl InMemoryLeaseStore {
    pub fn new() -> Self { Self::default() }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, (LeaseRecord, u64)>> {
        self.leases.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn check(&self) -> Result<(), LeaseError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(LeaseError::Backend("lease backend unavailable".to_string()));
        }
        Ok(())
    }

    /// Every call fails while set.
    pub fn set_failing(&self, failing: bool) { self.failing.store(failing, Ordering::SeqCst) }

    pub fn holder(&self, name: &str) -> Option<String> {
        self.lock().get(name).and_then(|(r, _)| r.holder.clone())
    }

    /// Overwrite the record unconditionally, as a foreign writer would.
    pub fn force(&self, name: &str, record: LeaseRecord) {
        let mut leases = self.lock();
        let version = leases.get(name).map(|(_, v)| v + 1).unwrap_or(1);
        leases.insert(name.to_string(), (record, version));
    }
}

#[async_trait]
impl LeaseStore for InMemoryLeaseStore {
    async fn get(&self, name: &str) -> Result<Option<VersionedLease>, LeaseError> {
        self.check()?;
        Ok(self.lock().get(name).map(|(record, v)| VersionedLease { record: record.clone(), version: v.to_string() }))
    }

    async fn create(&self, name: &str, record: &LeaseRecord) -> Result<bool, LeaseError> {
        self.check()?;
        let mut leases = self.lock();
        if leases.contains_key(name) {
            return Ok(false);
        }
        leases.insert(name.to_string(), (record.clone(), 1));
        Ok(true)
    }

    async fn replace(&self, name: &str, version: &str, record: &LeaseRecord) -> Result<bool, LeaseError> {
        self.check()?;
        let mut leases = self.lock();
        match leases.get_mut(name) {
            Some((current, v)) if v.to_string() == version => {
                *current = record.clone();
                *v += 1;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// Wall clock derived from tokio's clock, so paused-time tests can expire
/// leases deterministically.
#[derive(Debug, Clone)]
pub struct TokioClock {
    origin_wall: DateTime<Utc>,
    origin: tokio::time::Instant,
}

impl TokioClock {
    pub fn new() -> Self { Self { origin_wall: Utc::now(), origin: tokio::time::Instant::now() } }
}

impl Default for TokioClock {
    fn default() -> Self { Self::new() }
}

impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.origin.elapsed()).unwrap_or_else(|_| chrono::Duration::zero());
        self.origin_wall + elapsed
    }
}
