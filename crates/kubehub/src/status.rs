//! Status subresource writes for local fleet objects.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use fleet_core::{ObjectKey, ReconcileError, ResourceKind};
use fleet_orchestrator::StatusWriter;
use kube::api::{Api, Patch, PatchParams};
use kube::core::{ApiResource, DynamicObject};
use kube::Client;
use tracing::debug;

use crate::find_api_resource;

/// Merge-patches `status` through the API server. Discovery results are kept
/// per kind for the life of the writer.
#[derive(Clone)]
pub struct KubeStatusWriter {
    client: Client,
    resources: Arc<Mutex<HashMap<ResourceKind, (ApiResource, bool)>>>,
}

impl KubeStatusWriter {
    pub fn new(client: Client) -> Self {
        Self { client, resources: Arc::default() }
    }

    async fn resource(&self, kind: &ResourceKind) -> Result<(ApiResource, bool), ReconcileError> {
        let cached = self.resources.lock().unwrap_or_else(|p| p.into_inner()).get(kind).cloned();
        if let Some(found) = cached {
            return Ok(found);
        }
        let found = find_api_resource(self.client.clone(), kind).await.map_err(ReconcileError::transient)?;
        self.resources.lock().unwrap_or_else(|p| p.into_inner()).insert(kind.clone(), found.clone());
        Ok(found)
    }
}

fn classify(kind: &ResourceKind, key: &ObjectKey, err: kube::Error) -> ReconcileError {
    match err {
        // Invalid patch: retrying the same body cannot succeed
        kube::Error::Api(ae) if ae.code == 422 => ReconcileError::fatal(format!("{kind} {key}: {}", ae.message)),
        other => ReconcileError::transient(format!("{kind} {key}: {other}")),
    }
}

#[async_trait]
impl StatusWriter for KubeStatusWriter {
    async fn patch_status(&self, kind: &ResourceKind, key: &ObjectKey, status: serde_json::Value) -> Result<(), ReconcileError> {
        let (ar, namespaced) = self.resource(kind).await?;
        let api: Api<DynamicObject> = match (&key.namespace, namespaced) {
            (Some(ns), true) => Api::namespaced_with(self.client.clone(), ns, &ar),
            _ => Api::all_with(self.client.clone(), &ar),
        };
        let patch = serde_json::json!({ "status": status });
        api.patch_status(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| classify(kind, key, e))?;
        debug!(kind = %kind, object = %key, "status patched");
        Ok(())
    }
}
