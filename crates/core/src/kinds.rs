//! Well-known kinds and the index extractors registered on them.
//!
//! This module provides:
//! - Stable kind constants for the local fleet objects and remote nodes
//! - Index names used across the tracker and the local cache
//! - Extraction functions turning an object into its index keys

#![forbid(unsafe_code)]

use smallvec::SmallVec;

use crate::{CachedObject, ResourceKind};

/// Index keys extracted from one object; almost always zero or one.
pub type IndexKeys = SmallVec<[String; 2]>;

pub const FLEET_GROUP: &str = "cluster.x-k8s.io";
pub const ADDONS_GROUP: &str = "addons.cluster.x-k8s.io";
pub const FLEET_VERSION: &str = "v1alpha4";

/// Label carrying the owning cluster's name on fleet objects.
pub const CLUSTER_NAME_LABEL: &str = "cluster.x-k8s.io/cluster-name";
/// Label matched against `--watch-filter`.
pub const WATCH_LABEL: &str = "cluster.x-k8s.io/watch-filter";

// ---------------- Index names (stable) ----------------
pub const NODE_PROVIDER_ID_INDEX: &str = "spec.providerID";
pub const MACHINE_NODE_INDEX: &str = "status.nodeRef.name";
pub const MACHINE_PROVIDER_ID_INDEX: &str = "spec.providerID";

pub fn cluster() -> ResourceKind { ResourceKind::new(FLEET_GROUP, FLEET_VERSION, "Cluster") }
pub fn machine() -> ResourceKind { ResourceKind::new(FLEET_GROUP, FLEET_VERSION, "Machine") }
pub fn machine_set() -> ResourceKind { ResourceKind::new(FLEET_GROUP, FLEET_VERSION, "MachineSet") }
pub fn machine_deployment() -> ResourceKind { ResourceKind::new(FLEET_GROUP, FLEET_VERSION, "MachineDeployment") }
pub fn machine_pool() -> ResourceKind { ResourceKind::new(FLEET_GROUP, FLEET_VERSION, "MachinePool") }
pub fn machine_health_check() -> ResourceKind { ResourceKind::new(FLEET_GROUP, FLEET_VERSION, "MachineHealthCheck") }
pub fn cluster_resource_set() -> ResourceKind { ResourceKind::new(ADDONS_GROUP, FLEET_VERSION, "ClusterResourceSet") }
pub fn node() -> ResourceKind { ResourceKind::new("", "v1", "Node") }

/// Kinds every remote cache watches unless configured otherwise.
pub fn default_remote_kinds() -> Vec<ResourceKind> {
    vec![node()]
}

/// Provider IDs are compared after normalising the `provider:///id` and
/// `provider://id` spellings and dropping surrounding whitespace.
pub fn normalize_provider_id(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let (provider, rest) = trimmed.split_once("://")?;
    let id = rest.trim_start_matches('/');
    if provider.is_empty() || id.is_empty() {
        return None;
    }
    // Only the last path segment identifies the instance
    let id = id.rsplit('/').next().unwrap_or(id);
    Some(format!("{}://{}", provider, id))
}

/// Node → normalised `spec.providerID`.
pub fn index_node_by_provider_id(obj: &CachedObject) -> IndexKeys {
    obj.str_at(&["spec", "providerID"]).and_then(normalize_provider_id).into_iter().collect()
}

/// Machine → `status.nodeRef.name`.
pub fn index_machine_by_node_name(obj: &CachedObject) -> IndexKeys {
    obj.str_at(&["status", "nodeRef", "name"])
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .into_iter()
        .collect()
}

/// Machine → normalised `spec.providerID`.
pub fn index_machine_by_provider_id(obj: &CachedObject) -> IndexKeys {
    obj.str_at(&["spec", "providerID"]).and_then(normalize_provider_id).into_iter().collect()
}

/// MachinePool → every normalised entry of `spec.providerIDList`.
pub fn machine_pool_provider_ids(obj: &CachedObject) -> IndexKeys {
    obj.raw
        .get("spec")
        .and_then(|s| s.get("providerIDList"))
        .and_then(|l| l.as_array())
        .map(|l| l.iter().filter_map(|v| v.as_str()).filter_map(normalize_provider_id).collect())
        .unwrap_or_default()
}
