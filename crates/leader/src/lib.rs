//! Lease-based leader election.
//!
//! Acquisition is a conditional write against a versioned lease record:
//! create when absent, compare-and-swap on the version otherwise. The holder
//! renews every `retry_period`; a conflict, an observed foreign holder or no
//! successful renewal within `renew_deadline` ends leadership and cancels the
//! work running under it.

#![forbid(unsafe_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_core::LeaseError;
use metrics::gauge;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[cfg(feature = "fixture")]
pub mod mock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseRecord {
    pub holder: Option<String>,
    pub acquired_at: Option<DateTime<Utc>>,
    pub renewed_at: Option<DateTime<Utc>>,
    pub duration: Duration,
    pub transitions: u32,
}

impl LeaseRecord {
    pub fn expired_at(&self, now: DateTime<Utc>) -> bool {
        let Some(renewed) = self.renewed_at else { return true };
        let Ok(duration) = chrono::Duration::from_std(self.duration) else { return true };
        now > renewed + duration
    }
}

/// Record plus the opaque version used for compare-and-swap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedLease {
    pub record: LeaseRecord,
    pub version: String,
}

/// Backend for lease records. `create` and `replace` return `Ok(false)` on a
/// conflicting concurrent write.
#[async_trait]
pub trait LeaseStore: Send + Sync + 'static {
    async fn get(&self, name: &str) -> Result<Option<VersionedLease>, LeaseError>;
    async fn create(&self, name: &str, record: &LeaseRecord) -> Result<bool, LeaseError>;
    async fn replace(&self, name: &str, version: &str, record: &LeaseRecord) -> Result<bool, LeaseError>;
}

pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> { Utc::now() }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeaderState {
    Standby,
    Acquiring,
    Leading,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LeaderConfig {
    pub lease_name: String,
    pub namespace: String,
    pub identity: String,
    pub lease_duration: Duration,
    pub renew_deadline: Duration,
    pub retry_period: Duration,
}

impl LeaderConfig {
    pub fn new(lease_name: &str, namespace: &str, identity: &str) -> Self {
        Self {
            lease_name: lease_name.to_string(),
            namespace: namespace.to_string(),
            identity: identity.to_string(),
            lease_duration: Duration::from_secs(15),
            renew_deadline: Duration::from_secs(10),
            retry_period: Duration::from_secs(2),
        }
    }
}

pub struct LeaderCoordinator {
    store: Arc<dyn LeaseStore>,
    clock: Arc<dyn Clock>,
    config: LeaderConfig,
    state: watch::Sender<LeaderState>,
}

impl LeaderCoordinator {
    pub fn new(store: Arc<dyn LeaseStore>, config: LeaderConfig) -> Self {
        Self::with_clock(store, Arc::new(SystemClock), config)
    }

    pub fn with_clock(store: Arc<dyn LeaseStore>, clock: Arc<dyn Clock>, config: LeaderConfig) -> Self {
        let (state, _) = watch::channel(LeaderState::Standby);
        Self { store, clock, config, state }
    }

    pub fn config(&self) -> &LeaderConfig { &self.config }
    pub fn identity(&self) -> &str { &self.config.identity }
    pub fn state(&self) -> LeaderState { *self.state.borrow() }
    pub fn subscribe(&self) -> watch::Receiver<LeaderState> { self.state.subscribe() }

    fn set_state(&self, next: LeaderState) {
        self.state.send_replace(next);
        gauge!("fleet_leader", if next == LeaderState::Leading { 1.0 } else { 0.0 });
    }

    fn lost(&self) -> LeaseError {
        LeaseError::Lost { lease: self.config.lease_name.clone(), identity: self.config.identity.clone() }
    }

    /// One acquire-or-renew round. `Ok(true)` means we hold the lease now.
    pub async fn try_acquire_or_renew(&self) -> Result<bool, LeaseError> {
        let name = &self.config.lease_name;
        let now = self.clock.now();
        let Some(existing) = self.store.get(name).await? else {
            let record = LeaseRecord {
                holder: Some(self.config.identity.clone()),
                acquired_at: Some(now),
                renewed_at: Some(now),
                duration: self.config.lease_duration,
                transitions: 0,
            };
            let created = self.store.create(name, &record).await?;
            if created {
                info!(identity = %self.config.identity, lease = %name, "created lease");
            } else {
                debug!(identity = %self.config.identity, "lease creation conflict");
            }
            return Ok(created);
        };

        let held_by_us = existing.record.holder.as_deref() == Some(self.config.identity.as_str());
        if held_by_us {
            let mut record = existing.record.clone();
            record.renewed_at = Some(now);
            record.duration = self.config.lease_duration;
            let renewed = self.store.replace(name, &existing.version, &record).await?;
            if !renewed {
                warn!(identity = %self.config.identity, "lease renewal conflict");
            }
            return Ok(renewed);
        }

        let vacant = existing.record.holder.is_none();
        if !vacant && !existing.record.expired_at(now) {
            return Ok(false);
        }
        let record = LeaseRecord {
            holder: Some(self.config.identity.clone()),
            acquired_at: Some(now),
            renewed_at: Some(now),
            duration: self.config.lease_duration,
            transitions: existing.record.transitions.saturating_add(1),
        };
        let took = self.store.replace(name, &existing.version, &record).await?;
        if took {
            info!(
                identity = %self.config.identity,
                previous = existing.record.holder.as_deref().unwrap_or("<none>"),
                transitions = record.transitions,
                "took over lease"
            );
        }
        Ok(took)
    }

    /// Block until the lease is held. Returns false if `shutdown` fired first.
    pub async fn acquire(&self, shutdown: &CancellationToken) -> bool {
        self.set_state(LeaderState::Acquiring);
        info!(identity = %self.config.identity, lease = %self.config.lease_name, "waiting for leadership");
        loop {
            match self.try_acquire_or_renew().await {
                Ok(true) => {
                    info!(identity = %self.config.identity, "leadership acquired");
                    self.set_state(LeaderState::Leading);
                    return true;
                }
                Ok(false) => debug!(identity = %self.config.identity, "lease held by another instance"),
                Err(e) => warn!(identity = %self.config.identity, error = %e, "lease acquisition failed; retrying"),
            }
            tokio::select! {
                _ = shutdown.cancelled() => {
                    self.set_state(LeaderState::Standby);
                    return false;
                }
                _ = tokio::time::sleep(self.config.retry_period) => {}
            }
        }
    }

    /// Renew until `leading` is cancelled (Ok) or leadership is lost (Err).
    async fn renew_until_lost(&self, leading: &CancellationToken) -> Result<(), LeaseError> {
        let mut last_renewed = Instant::now();
        loop {
            tokio::select! {
                _ = leading.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.config.retry_period) => {}
            }
            let budget = self.config.renew_deadline.saturating_sub(last_renewed.elapsed());
            match tokio::time::timeout(budget, self.try_acquire_or_renew()).await {
                Ok(Ok(true)) => last_renewed = Instant::now(),
                Ok(Ok(false)) => {
                    warn!(identity = %self.config.identity, "lease taken by another instance");
                    return Err(self.lost());
                }
                Ok(Err(e)) => warn!(identity = %self.config.identity, error = %e, "lease renewal failed"),
                Err(_) => warn!(identity = %self.config.identity, "lease renewal timed out"),
            }
            if last_renewed.elapsed() >= self.config.renew_deadline {
                warn!(identity = %self.config.identity, deadline = ?self.config.renew_deadline, "renew deadline exceeded");
                return Err(self.lost());
            }
        }
    }

    /// Acquire the lease, then run `work` with a token that is cancelled on
    /// shutdown or on leadership loss. On loss the token is cancelled first,
    /// `work` is awaited and `LeaseError::Lost` returned. On shutdown the
    /// lease is released after `work` completes.
    pub async fn run_while_leading<F, Fut>(&self, shutdown: CancellationToken, work: F) -> Result<(), LeaseError>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()>,
    {
        if !self.acquire(&shutdown).await {
            return Ok(());
        }
        let leading = shutdown.child_token();
        let work = work(leading.clone());
        tokio::pin!(work);
        let renew = self.renew_until_lost(&leading);
        tokio::pin!(renew);

        let (work_done, lost) = tokio::select! {
            _ = &mut work => (true, None),
            res = &mut renew => (false, res.err()),
        };
        leading.cancel();
        if lost.is_some() {
            warn!(identity = %self.config.identity, "leadership lost; stopping components");
            self.set_state(LeaderState::Standby);
        }
        // Components stop before the lease is handed over
        if !work_done {
            work.await;
        }
        if let Some(err) = lost {
            return Err(err);
        }
        if let Err(e) = self.release().await {
            warn!(identity = %self.config.identity, error = %e, "releasing lease failed");
        }
        Ok(())
    }

    /// Clear the holder so a standby can take over without waiting for expiry.
    pub async fn release(&self) -> Result<(), LeaseError> {
        let name = &self.config.lease_name;
        let existing = self.store.get(name).await?;
        self.set_state(LeaderState::Standby);
        let Some(existing) = existing else { return Ok(()) };
        if existing.record.holder.as_deref() != Some(self.config.identity.as_str()) {
            debug!(identity = %self.config.identity, "not the lease holder; nothing to release");
            return Ok(());
        }
        let mut record = existing.record.clone();
        record.holder = None;
        record.renewed_at = None;
        if self.store.replace(name, &existing.version, &record).await? {
            info!(identity = %self.config.identity, "lease released");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_expiry_uses_renew_time_plus_duration() {
        let now = Utc::now();
        let rec = LeaseRecord {
            holder: Some("a".into()),
            acquired_at: Some(now),
            renewed_at: Some(now),
            duration: Duration::from_secs(15),
            transitions: 0,
        };
        assert!(!rec.expired_at(now + chrono::Duration::seconds(15)));
        assert!(rec.expired_at(now + chrono::Duration::seconds(16)));
        assert!(LeaseRecord { renewed_at: None, ..rec }.expired_at(now));
    }
}
