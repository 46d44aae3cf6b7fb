use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use fleet_core::{kinds, ResourceKind};
use fleet_leader::LeaderConfig;
use fleet_scheduler::SchedulerConfig;
use fleet_tracker::TrackerConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Optional subsystems switched on with `--feature-gates`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Gate {
    MachinePool,
    ClusterResourceSet,
    ClusterTopology,
}

impl Gate {
    pub const ALL: [Gate; 3] = [Gate::MachinePool, Gate::ClusterResourceSet, Gate::ClusterTopology];

    pub fn name(self) -> &'static str {
        match self {
            Gate::MachinePool => "MachinePool",
            Gate::ClusterResourceSet => "ClusterResourceSet",
            Gate::ClusterTopology => "ClusterTopology",
        }
    }
}

impl fmt::Display for Gate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.name()) }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GateError {
    #[error("unknown feature gate {0:?}")]
    Unknown(String),
    #[error("feature gate {gate}: expected true or false, got {value:?}")]
    BadValue { gate: String, value: String },
    #[error("malformed feature gate entry {0:?} (expected Name=bool)")]
    Malformed(String),
}

/// Gate values, all off unless enabled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureGates {
    pub machine_pool: bool,
    pub cluster_resource_set: bool,
    pub cluster_topology: bool,
}

impl FeatureGates {
    pub fn enabled(&self, gate: Gate) -> bool {
        match gate {
            Gate::MachinePool => self.machine_pool,
            Gate::ClusterResourceSet => self.cluster_resource_set,
            Gate::ClusterTopology => self.cluster_topology,
        }
    }

    pub fn set(&mut self, gate: Gate, on: bool) {
        match gate {
            Gate::MachinePool => self.machine_pool = on,
            Gate::ClusterResourceSet => self.cluster_resource_set = on,
            Gate::ClusterTopology => self.cluster_topology = on,
        }
    }

    /// Whether an item guarded by `gate` (if any) is active.
    pub fn allows(&self, gate: Option<Gate>) -> bool {
        gate.map_or(true, |g| self.enabled(g))
    }
}

/// `MachinePool=true,ClusterTopology=false`; blank input yields the defaults.
impl FromStr for FeatureGates {
    type Err = GateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut gates = FeatureGates::default();
        for entry in s.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (name, value) = entry.split_once('=').ok_or_else(|| GateError::Malformed(entry.to_string()))?;
            let (name, value) = (name.trim(), value.trim());
            let gate = Gate::ALL
                .into_iter()
                .find(|g| g.name() == name)
                .ok_or_else(|| GateError::Unknown(name.to_string()))?;
            let on = value
                .parse::<bool>()
                .map_err(|_| GateError::BadValue { gate: name.to_string(), value: value.to_string() })?;
            gates.set(gate, on);
        }
        Ok(gates)
    }
}

/// Parallel reconciles per controller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Concurrency {
    pub cluster: usize,
    pub machine: usize,
    pub machine_set: usize,
    pub machine_deployment: usize,
    pub machine_pool: usize,
    pub cluster_resource_set: usize,
    pub machine_health_check: usize,
}

impl Default for Concurrency {
    fn default() -> Self {
        Self {
            cluster: 10,
            machine: 10,
            machine_set: 10,
            machine_deployment: 10,
            machine_pool: 10,
            cluster_resource_set: 10,
            machine_health_check: 10,
        }
    }
}

impl Concurrency {
    /// Limit for `kind`; kinds without a dedicated flag use the cluster limit.
    pub fn for_kind(&self, kind: &ResourceKind) -> usize {
        match kind.kind.as_str() {
            "Cluster" => self.cluster,
            "Machine" => self.machine,
            "MachineSet" => self.machine_set,
            "MachineDeployment" => self.machine_deployment,
            "MachinePool" => self.machine_pool,
            "ClusterResourceSet" => self.cluster_resource_set,
            "MachineHealthCheck" => self.machine_health_check,
            _ => self.cluster,
        }
    }
}

/// Everything the manager needs, built once from flags.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManagerConfig {
    /// Restrict local watches to one namespace
    pub namespace: Option<String>,
    /// Only objects labelled with this watch-filter value are processed
    pub watch_filter: Option<String>,
    pub sync_period: Duration,
    /// Budget for the first listing of the local cache
    pub local_sync_timeout: Duration,
    pub concurrency: Concurrency,
    pub gates: FeatureGates,
    /// `None` runs controllers without leader election
    pub leader: Option<LeaderConfig>,
    pub tracker: TrackerConfig,
    pub scheduler: SchedulerConfig,
    pub webhook_port: u16,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            watch_filter: None,
            sync_period: Duration::from_secs(600),
            local_sync_timeout: Duration::from_secs(120),
            concurrency: Concurrency::default(),
            gates: FeatureGates::default(),
            leader: None,
            tracker: TrackerConfig::default(),
            scheduler: SchedulerConfig::default(),
            webhook_port: 9443,
        }
    }
}

impl ManagerConfig {
    /// Scheduler settings for one controller's kind.
    pub fn scheduler_for(&self, kind: &ResourceKind) -> SchedulerConfig {
        SchedulerConfig {
            concurrency: self.concurrency.for_kind(kind),
            resync_period: Some(self.sync_period),
            ..self.scheduler.clone()
        }
    }

    /// Label selector for local watches derived from `watch_filter`.
    pub fn label_selector(&self) -> Option<String> {
        self.watch_filter.as_ref().filter(|v| !v.is_empty()).map(|v| format!("{}={}", kinds::WATCH_LABEL, v))
    }
}
