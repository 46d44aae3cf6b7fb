//! Fleet core types: object keys, cluster identities, cached objects and the
//! watch event model shared by the local cache and every remote cache.

#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;

use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

pub mod error;
pub mod kinds;

pub use error::{ConnectionError, LeaseError, ReconcileError, StoreError, WatchError};

/// A served resource kind, addressed by group/version/kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKind {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl ResourceKind {
    pub fn new(group: &str, version: &str, kind: &str) -> Self {
        Self { group: group.to_string(), version: version.to_string(), kind: kind.to_string() }
    }

    /// `v1/Kind` for the core group, `group/v1/Kind` otherwise.
    pub fn gvk_key(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.kind)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.kind)
        }
    }

    pub fn parse(key: &str) -> Option<Self> {
        let parts: Vec<&str> = key.split('/').collect();
        match parts.as_slice() {
            [version, kind] if !version.is_empty() && !kind.is_empty() => Some(Self::new("", version, kind)),
            [group, version, kind] if !version.is_empty() && !kind.is_empty() => Some(Self::new(group, version, kind)),
            _ => None,
        }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.gvk_key())
    }
}

/// Namespace/name of an object; cluster-scoped objects have no namespace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn namespaced(namespace: &str, name: &str) -> Self {
        Self { namespace: Some(namespace.to_string()), name: name.to_string() }
    }

    pub fn cluster_scoped(name: &str) -> Self {
        Self { namespace: None, name: name.to_string() }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Identity of a remote cluster: the namespace/name of its cluster object in
/// the local store plus the object's UID. Names can be recycled, UIDs cannot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ClusterIdentity {
    pub namespace: String,
    pub name: String,
    pub uid: Option<String>,
}

impl ClusterIdentity {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self { namespace: namespace.to_string(), name: name.to_string(), uid: None }
    }

    pub fn with_uid(mut self, uid: impl Into<String>) -> Self {
        self.uid = Some(uid.into());
        self
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::namespaced(&self.namespace, &self.name)
    }

    /// Build the identity from a cached cluster object.
    pub fn from_object(obj: &CachedObject) -> Result<Self, String> {
        let namespace = obj
            .key
            .namespace
            .clone()
            .ok_or_else(|| format!("cluster object {} is not namespaced", obj.key))?;
        if obj.key.name.is_empty() {
            return Err("cluster object has an empty name".to_string());
        }
        Ok(Self { namespace, name: obj.key.name.clone(), uid: obj.uid.clone() })
    }
}

impl fmt::Display for ClusterIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Last observed state of one object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CachedObject {
    pub key: ObjectKey,
    pub uid: Option<String>,
    pub resource_version: Option<String>,
    /// Raw object (managed fields stripped under the default feature)
    pub raw: serde_json::Value,
}

impl CachedObject {
    /// Shape a raw JSON object; requires `metadata.name`.
    pub fn from_raw(mut raw: serde_json::Value) -> Result<Self, WatchError> {
        strip_managed_fields(&mut raw);
        let meta = raw
            .get("metadata")
            .ok_or_else(|| WatchError::Decode("object missing metadata".to_string()))?;
        let name = meta
            .get("name")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| WatchError::Decode("object missing metadata.name".to_string()))?
            .to_string();
        let namespace = meta.get("namespace").and_then(|v| v.as_str()).map(|s| s.to_string());
        let uid = meta.get("uid").and_then(|v| v.as_str()).map(|s| s.to_string());
        let resource_version = meta.get("resourceVersion").and_then(|v| v.as_str()).map(|s| s.to_string());
        Ok(Self { key: ObjectKey { namespace, name }, uid, resource_version, raw })
    }

    /// Look up a nested string field by path segments.
    pub fn str_at(&self, path: &[&str]) -> Option<&str> {
        let mut cur = &self.raw;
        for seg in path {
            cur = cur.get(*seg)?;
        }
        cur.as_str()
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.raw.get("metadata")?.get("labels")?.get(key)?.as_str()
    }
}

#[cfg(feature = "strip-managed-fields")]
fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(obj) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        obj.remove("managedFields");
    }
}

#[cfg(not(feature = "strip-managed-fields"))]
fn strip_managed_fields(_v: &mut serde_json::Value) {}

/// One event from a list+watch stream of a single kind.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    Applied(CachedObject),
    Deleted(CachedObject),
    /// Full listing; replaces everything previously known for the kind.
    Restarted(Vec<CachedObject>),
}

pub type WatchStream = BoxStream<'static, Result<WatchEvent, WatchError>>;

/// Opens list+watch streams. Every stream returned starts with a `Restarted`
/// listing before incremental events.
pub trait WatchSource: Send + Sync {
    fn watch(&self, kind: &ResourceKind) -> WatchStream;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChangeKind {
    Applied,
    Deleted,
}

/// Applied change broadcast by a cache after it is visible to readers.
#[derive(Debug, Clone)]
pub struct Change {
    pub kind: ResourceKind,
    pub change: ChangeKind,
    pub object: Arc<CachedObject>,
}
