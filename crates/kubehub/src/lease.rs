//! `coordination.k8s.io/v1` Lease backend. Writes carry the read
//! resourceVersion, so a concurrent writer makes ours fail with 409.

use std::time::Duration;

use async_trait::async_trait;
use fleet_core::LeaseError;
use fleet_leader::{LeaseRecord, LeaseStore, VersionedLease};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, PostParams};
use kube::Client;
use tracing::debug;

#[derive(Clone)]
pub struct KubeLeaseStore {
    api: Api<Lease>,
    namespace: String,
}

impl KubeLeaseStore {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self { api: Api::namespaced(client, namespace), namespace: namespace.to_string() }
    }

    fn to_lease(&self, name: &str, version: Option<&str>, record: &LeaseRecord) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(self.namespace.clone()),
                resource_version: version.map(|v| v.to_string()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: record.holder.clone(),
                lease_duration_seconds: Some(record.duration.as_secs().min(i32::MAX as u64) as i32),
                acquire_time: record.acquired_at.map(MicroTime),
                renew_time: record.renewed_at.map(MicroTime),
                lease_transitions: Some(record.transitions.min(i32::MAX as u32) as i32),
                ..Default::default()
            }),
        }
    }
}

fn backend(e: kube::Error) -> LeaseError {
    LeaseError::Backend(e.to_string())
}

fn is_conflict(e: &kube::Error) -> bool {
    matches!(e, kube::Error::Api(ae) if ae.code == 409)
}

fn record_of(lease: &Lease) -> LeaseRecord {
    let spec = lease.spec.clone().unwrap_or_default();
    LeaseRecord {
        holder: spec.holder_identity.filter(|h| !h.is_empty()),
        acquired_at: spec.acquire_time.map(|t| t.0),
        renewed_at: spec.renew_time.map(|t| t.0),
        duration: Duration::from_secs(spec.lease_duration_seconds.unwrap_or(0).max(0) as u64),
        transitions: spec.lease_transitions.unwrap_or(0).max(0) as u32,
    }
}

#[async_trait]
impl LeaseStore for KubeLeaseStore {
    async fn get(&self, name: &str) -> Result<Option<VersionedLease>, LeaseError> {
        let Some(lease) = self.api.get_opt(name).await.map_err(backend)? else { return Ok(None) };
        let version = lease
            .metadata
            .resource_version
            .clone()
            .ok_or_else(|| LeaseError::Backend(format!("lease {name} missing resourceVersion")))?;
        Ok(Some(VersionedLease { record: record_of(&lease), version }))
    }

    async fn create(&self, name: &str, record: &LeaseRecord) -> Result<bool, LeaseError> {
        match self.api.create(&PostParams::default(), &self.to_lease(name, None, record)).await {
            Ok(_) => Ok(true),
            Err(e) if is_conflict(&e) => {
                debug!(lease = %name, "lease create conflict");
                Ok(false)
            }
            Err(e) => Err(backend(e)),
        }
    }

    async fn replace(&self, name: &str, version: &str, record: &LeaseRecord) -> Result<bool, LeaseError> {
        match self.api.replace(name, &PostParams::default(), &self.to_lease(name, Some(version), record)).await {
            Ok(_) => Ok(true),
            Err(e) if is_conflict(&e) => {
                debug!(lease = %name, "lease replace conflict");
                Ok(false)
            }
            Err(e) => Err(backend(e)),
        }
    }
}
