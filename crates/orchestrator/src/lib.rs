//! Fleet orchestrator: wires the local cache, the remote connection tracker,
//! the controller table and leader election into one manager.
//!
//! Startup order:
//! - local cache for every kind the enabled controllers watch, plus clusters
//! - wait for the first full listing
//! - schedulers for enabled controllers, under the lease when elected
//!
//! Controllers stop before the tracker and the local cache are torn down.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use fleet_core::{kinds, ResourceKind, WatchSource};
use fleet_leader::LeaderCoordinator;
use fleet_store::Cache;
use fleet_tracker::{ConnectionTracker, Connector};
use metrics::histogram;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub mod admission;
pub mod config;
pub mod controllers;

pub use admission::{Admission, RegistryError, WebhookRegistry};
pub use config::{Concurrency, FeatureGates, Gate, GateError, ManagerConfig};
pub use controllers::{
    builtin, local_indexes, remote_indexes, ClusterCacheReconciler, ControllerContext, ControllerEntry,
    NodeRefReconciler, StatusWriter, NODE_RETRY,
};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SetupError {
    #[error("controller {0} already registered")]
    DuplicateController(String),
}

pub struct Orchestrator<K: Connector> {
    config: ManagerConfig,
    local_source: Arc<dyn WatchSource>,
    tracker: ConnectionTracker<K>,
    status: Arc<dyn StatusWriter>,
    leader: Option<LeaderCoordinator>,
    controllers: Vec<ControllerEntry<K>>,
    webhooks: WebhookRegistry,
}

impl<K: Connector> Orchestrator<K> {
    /// Start from the built-in controller table.
    pub fn new(
        config: ManagerConfig,
        local_source: Arc<dyn WatchSource>,
        tracker: ConnectionTracker<K>,
        status: Arc<dyn StatusWriter>,
    ) -> Self {
        Self {
            config,
            local_source,
            tracker,
            status,
            leader: None,
            controllers: builtin(),
            webhooks: WebhookRegistry::new(),
        }
    }

    /// Run controllers only while holding the lease.
    pub fn with_leader(mut self, coordinator: LeaderCoordinator) -> Self {
        self.leader = Some(coordinator);
        self
    }

    pub fn register(&mut self, entry: ControllerEntry<K>) -> Result<(), SetupError> {
        if self.controllers.iter().any(|c| c.name() == entry.name()) {
            return Err(SetupError::DuplicateController(entry.name().to_string()));
        }
        self.controllers.push(entry);
        Ok(())
    }

    pub fn config(&self) -> &ManagerConfig { &self.config }
    pub fn tracker(&self) -> &ConnectionTracker<K> { &self.tracker }
    pub fn webhooks(&self) -> &WebhookRegistry { &self.webhooks }
    pub fn webhooks_mut(&mut self) -> &mut WebhookRegistry { &mut self.webhooks }

    /// Names of controllers whose gate is open, in table order.
    pub fn enabled_controllers(&self) -> Vec<&str> {
        self.controllers.iter().filter(|c| self.config.gates.allows(c.gate())).map(|c| c.name()).collect()
    }

    /// Kinds the local cache watches for the enabled controllers.
    pub fn local_kinds(&self) -> Vec<ResourceKind> {
        let mut out = vec![kinds::cluster()];
        for entry in self.controllers.iter().filter(|c| self.config.gates.allows(c.gate())) {
            for kind in entry.kinds() {
                if !out.contains(kind) {
                    out.push(kind.clone());
                }
            }
        }
        out
    }

    /// Run until `shutdown` fires. Errors on local cache startup failure and
    /// on leadership loss.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let local_kinds = self.local_kinds();
        let Orchestrator { config, local_source, tracker, status, leader, controllers, webhooks } = self;

        let t0 = Instant::now();
        let local = Cache::spawn("local", local_source, local_kinds, local_indexes(), &config.tracker.cache, &shutdown)
            .context("starting local cache")?;
        let synced = tokio::select! {
            _ = shutdown.cancelled() => None,
            ok = local.wait_for_sync(config.local_sync_timeout) => Some(ok),
        };
        match synced {
            None => {
                info!("shutdown before local cache sync");
                local.stop();
                tracker.shutdown();
                return Ok(());
            }
            Some(false) => {
                local.stop();
                tracker.shutdown();
                bail!("local cache did not sync within {:?}", config.local_sync_timeout);
            }
            Some(true) => {}
        }
        let sync_ms = t0.elapsed().as_millis();
        histogram!("fleet_local_sync_ms", sync_ms as f64);
        info!(kinds = local.kinds().len(), took_ms = %sync_ms, "local cache synced");

        let ctx = Arc::new(ControllerContext { tracker: tracker.clone(), local: local.clone(), status });
        let mut launches = Vec::new();
        for entry in controllers {
            if !config.gates.allows(entry.gate()) {
                info!(controller = %entry.name(), gate = ?entry.gate(), "controller disabled by feature gate");
                continue;
            }
            let name = entry.name().to_string();
            let scheduler = config.scheduler_for(entry.kind());
            let launch = entry
                .build(local.clone(), ctx.clone(), scheduler)
                .with_context(|| format!("building controller {name}"))?;
            launches.push(launch);
        }
        info!(controllers = launches.len(), webhooks = ?webhooks.paths(), port = config.webhook_port, "starting controllers");

        let work = move |token: CancellationToken| async move {
            futures::future::join_all(launches.into_iter().map(|launch| launch(token.clone()))).await;
        };
        let result = match &leader {
            Some(coordinator) => coordinator.run_while_leading(shutdown.clone(), work).await.context("leader election"),
            None => {
                work(shutdown.clone()).await;
                Ok(())
            }
        };
        if let Err(e) = &result {
            warn!(error = %e, "controllers stopped");
        }
        tracker.shutdown();
        local.stop();
        info!("orchestrator stopped");
        result
    }
}
