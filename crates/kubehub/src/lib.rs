//! Fleet kubehub: kube-backed implementations of the watch source, remote
//! connector, kubeconfig-secret credential resolver, status writer and lease
//! store.

#![forbid(unsafe_code)]

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine;
use fleet_core::{CachedObject, ClusterIdentity, ConnectionError, ResourceKind, WatchError, WatchEvent, WatchSource, WatchStream};
use fleet_tracker::{ConnectionParams, Connector, CredentialResolver, Credentials, RemoteClient};
use futures::StreamExt;
use kube::{
    api::Api,
    config::{KubeConfigOptions, Kubeconfig},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    runtime::watcher::{self, Event},
    Client, Config,
};
use tracing::{debug, info};

mod lease;
mod status;

pub use lease::KubeLeaseStore;
pub use status::KubeStatusWriter;

/// Client for the management cluster from the ambient kubeconfig or
/// in-cluster service account.
pub async fn local_client() -> Result<Client> {
    let client = Client::try_default().await.context("building kube client")?;
    let version = client.apiserver_version().await.context("contacting API server")?;
    info!(version = %version.git_version, "connected to management cluster");
    Ok(client)
}

fn gvk_of(kind: &ResourceKind) -> GroupVersionKind {
    GroupVersionKind { group: kind.group.clone(), version: kind.version.clone(), kind: kind.kind.clone() }
}

async fn find_api_resource(client: Client, kind: &ResourceKind) -> Result<(ApiResource, bool), WatchError> {
    let gvk = gvk_of(kind);
    let discovery = Discovery::new(client)
        .filter(&[gvk.group.as_str()])
        .run()
        .await
        .map_err(|e| WatchError::Stream(format!("discovery for {kind}: {e}")))?;
    let (ar, caps) = discovery
        .resolve_gvk(&gvk)
        .ok_or_else(|| WatchError::Stream(format!("{kind} is not served")))?;
    Ok((ar, matches!(caps.scope, Scope::Namespaced)))
}

fn cached_from(obj: &DynamicObject) -> Result<CachedObject, WatchError> {
    let raw = serde_json::to_value(obj).map_err(|e| WatchError::Decode(e.to_string()))?;
    CachedObject::from_raw(raw)
}

fn event_from(ev: Result<Event<DynamicObject>, watcher::Error>) -> Result<WatchEvent, WatchError> {
    match ev {
        Ok(Event::Applied(o)) => cached_from(&o).map(WatchEvent::Applied),
        Ok(Event::Deleted(o)) => cached_from(&o).map(WatchEvent::Deleted),
        Ok(Event::Restarted(list)) => {
            debug!(count = list.len(), "watch restart");
            list.iter().map(cached_from).collect::<Result<Vec<_>, _>>().map(WatchEvent::Restarted)
        }
        Err(e) => Err(WatchError::Stream(e.to_string())),
    }
}

/// List+watch over a kube client, optionally restricted to one namespace and
/// a label selector.
#[derive(Clone)]
pub struct KubeWatchSource {
    client: Client,
    namespace: Option<String>,
    label_selector: Option<String>,
}

impl KubeWatchSource {
    pub fn new(client: Client) -> Self { Self { client, namespace: None, label_selector: None } }

    pub fn namespace(mut self, namespace: Option<String>) -> Self {
        self.namespace = namespace.filter(|ns| !ns.is_empty());
        self
    }

    pub fn label_selector(mut self, selector: Option<String>) -> Self {
        self.label_selector = selector.filter(|s| !s.is_empty());
        self
    }

    async fn api_for(&self, kind: &ResourceKind) -> Result<Api<DynamicObject>, WatchError> {
        let (ar, namespaced) = find_api_resource(self.client.clone(), kind).await?;
        Ok(match (&self.namespace, namespaced) {
            (Some(ns), true) => Api::namespaced_with(self.client.clone(), ns, &ar),
            _ => Api::all_with(self.client.clone(), &ar),
        })
    }
}

impl WatchSource for KubeWatchSource {
    fn watch(&self, kind: &ResourceKind) -> WatchStream {
        let this = self.clone();
        let kind = kind.clone();
        let mut cfg = watcher::Config::default();
        if let Some(sel) = &self.label_selector {
            cfg = cfg.labels(sel);
        }
        futures::stream::once(async move { this.api_for(&kind).await.map(|api| (api, kind)) })
            .map(move |res| match res {
                Ok((api, kind)) => {
                    info!(kind = %kind, "watcher started");
                    watcher::watcher(api, cfg.clone()).map(event_from).boxed()
                }
                Err(e) => futures::stream::iter(vec![Err(e)]).boxed(),
            })
            .flatten()
            .boxed()
    }
}

/// Kubeconfig document for resolved connection params.
pub fn kubeconfig_for(cluster: &ClusterIdentity, params: &ConnectionParams) -> Result<Kubeconfig, ConnectionError> {
    let bad = |reason: String| ConnectionError::Credentials { cluster: cluster.to_string(), reason };
    if let Credentials::Kubeconfig(doc) = &params.auth {
        return Kubeconfig::from_yaml(doc).map_err(|e| bad(format!("parsing kubeconfig: {e}")));
    }
    let b64 = base64::engine::general_purpose::STANDARD;
    let mut cluster_entry = serde_json::json!({ "server": params.endpoint });
    if let Some(ca) = &params.ca_bundle {
        cluster_entry["certificate-authority-data"] = b64.encode(ca.as_bytes()).into();
    }
    let user = match &params.auth {
        Credentials::BearerToken(token) => serde_json::json!({ "token": token }),
        Credentials::ClientCertificate { cert_pem, key_pem } => serde_json::json!({
            "client-certificate-data": b64.encode(cert_pem.as_bytes()),
            "client-key-data": b64.encode(key_pem.as_bytes()),
        }),
        Credentials::Kubeconfig(_) | Credentials::None => serde_json::json!({}),
    };
    let doc = serde_json::json!({
        "apiVersion": "v1",
        "kind": "Config",
        "clusters": [{ "name": "remote", "cluster": cluster_entry }],
        "users": [{ "name": "remote", "user": user }],
        "contexts": [{ "name": "remote", "context": { "cluster": "remote", "user": "remote" } }],
        "current-context": "remote",
    });
    serde_json::from_value(doc).map_err(|e| bad(format!("building kubeconfig: {e}")))
}

fn classify(cluster: &ClusterIdentity, err: kube::Error) -> ConnectionError {
    match err {
        kube::Error::Api(ae) if ae.code == 401 || ae.code == 403 => {
            ConnectionError::Unauthorized { cluster: cluster.to_string(), reason: ae.message }
        }
        other => ConnectionError::Unreachable { cluster: cluster.to_string(), reason: other.to_string() },
    }
}

/// Remote cluster client: kube client plus its watch source.
#[derive(Clone)]
pub struct KubeRemote {
    identity: ClusterIdentity,
    client: Client,
    source: KubeWatchSource,
}

impl KubeRemote {
    pub fn client(&self) -> &Client { &self.client }
}

impl WatchSource for KubeRemote {
    fn watch(&self, kind: &ResourceKind) -> WatchStream { self.source.watch(kind) }
}

#[async_trait]
impl RemoteClient for KubeRemote {
    async fn ping(&self) -> Result<(), ConnectionError> {
        self.client.apiserver_version().await.map(|_| ()).map_err(|e| classify(&self.identity, e))
    }
}

/// Opens kube clients for remote clusters.
#[derive(Debug, Clone)]
pub struct KubeConnector {
    pub connect_timeout: Duration,
}

impl Default for KubeConnector {
    fn default() -> Self { Self { connect_timeout: Duration::from_secs(10) } }
}

#[async_trait]
impl Connector for KubeConnector {
    type Client = KubeRemote;

    async fn connect(&self, cluster: &ClusterIdentity, params: ConnectionParams) -> Result<KubeRemote, ConnectionError> {
        let kubeconfig = kubeconfig_for(cluster, &params)?;
        let mut config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| ConnectionError::Credentials { cluster: cluster.to_string(), reason: e.to_string() })?;
        config.connect_timeout = Some(self.connect_timeout);
        let client = Client::try_from(config).map_err(|e| classify(cluster, e))?;
        let remote = KubeRemote { identity: cluster.clone(), client: client.clone(), source: KubeWatchSource::new(client) };
        remote.ping().await?;
        Ok(remote)
    }
}

/// Reads `<cluster>-kubeconfig` secrets (key `value`) from the cluster's
/// namespace in the management cluster.
#[derive(Clone)]
pub struct KubeconfigSecretResolver {
    client: Client,
}

pub const KUBECONFIG_SECRET_SUFFIX: &str = "-kubeconfig";
pub const KUBECONFIG_SECRET_KEY: &str = "value";

impl KubeconfigSecretResolver {
    pub fn new(client: Client) -> Self { Self { client } }
}

#[async_trait]
impl CredentialResolver for KubeconfigSecretResolver {
    async fn resolve(&self, cluster: &ClusterIdentity) -> Result<ConnectionParams, ConnectionError> {
        use k8s_openapi::api::core::v1::Secret;
        let bad = |reason: String| ConnectionError::Credentials { cluster: cluster.to_string(), reason };
        let name = format!("{}{}", cluster.name, KUBECONFIG_SECRET_SUFFIX);
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &cluster.namespace);
        let secret = api
            .get_opt(&name)
            .await
            .map_err(|e| bad(format!("reading secret {name}: {e}")))?
            .ok_or_else(|| bad(format!("secret {name} not found")))?;
        let bytes = secret
            .data
            .as_ref()
            .and_then(|d| d.get(KUBECONFIG_SECRET_KEY))
            .ok_or_else(|| bad(format!("secret {name} has no {KUBECONFIG_SECRET_KEY} key")))?;
        let doc = String::from_utf8(bytes.0.clone()).map_err(|e| bad(format!("secret {name}: {e}")))?;
        let kubeconfig = Kubeconfig::from_yaml(&doc).map_err(|e| bad(format!("parsing kubeconfig: {e}")))?;
        let endpoint = kubeconfig
            .clusters
            .first()
            .and_then(|c| c.cluster.as_ref())
            .and_then(|c| c.server.clone())
            .unwrap_or_default();
        Ok(ConnectionParams { endpoint, auth: Credentials::Kubeconfig(doc), ca_bundle: None })
    }
}
