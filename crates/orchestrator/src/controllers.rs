//! Controller table entries and the built-in controllers that need remote
//! cluster access.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleet_core::kinds::{self, CLUSTER_NAME_LABEL, NODE_PROVIDER_ID_INDEX};
use fleet_core::{CachedObject, Change, ClusterIdentity, ObjectKey, ReconcileError, ResourceKind, StoreError};
use fleet_scheduler::{Action, Mapper, ReconcileRequest, Reconciler, Scheduler, SchedulerConfig};
use fleet_store::{Cache, IndexSpec};
use fleet_tracker::{ConnectionTracker, Connector};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::Gate;

/// Writes the status subresource of local objects.
#[async_trait]
pub trait StatusWriter: Send + Sync + 'static {
    async fn patch_status(&self, kind: &ResourceKind, key: &ObjectKey, status: Value) -> Result<(), ReconcileError>;
}

/// Shared by every controller of one manager.
pub struct ControllerContext<K: Connector> {
    pub tracker: ConnectionTracker<K>,
    pub local: Cache,
    pub status: Arc<dyn StatusWriter>,
}

type BuildFn<K> = Box<
    dyn FnOnce(
            Cache,
            Arc<ControllerContext<K>>,
            SchedulerConfig,
            Vec<(ResourceKind, Mapper)>,
        ) -> Result<Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, ()> + Send>, StoreError>
        + Send,
>;

/// One row of the controller table: a named reconciler for a kind, optional
/// related-kind mappers and the gate that enables it.
pub struct ControllerEntry<K: Connector> {
    name: String,
    kind: ResourceKind,
    gate: Option<Gate>,
    related: Vec<(ResourceKind, Mapper)>,
    build: BuildFn<K>,
}

impl<K: Connector> ControllerEntry<K> {
    pub fn new<R>(name: &str, kind: ResourceKind, reconciler: R) -> Self
    where
        R: Reconciler<Context = ControllerContext<K>>,
    {
        let sched_name = name.to_string();
        let sched_kind = kind.clone();
        let build: BuildFn<K> = Box::new(move |cache, ctx, config, related| {
            let mut scheduler = Scheduler::new(&sched_name, sched_kind, cache, reconciler, ctx, config)?;
            for (kind, mapper) in related {
                scheduler = scheduler.watches(kind, move |c: &Change| mapper(c))?;
            }
            Ok(Box::new(move |token: CancellationToken| scheduler.run(token).boxed()))
        });
        Self { name: name.to_string(), kind, gate: None, related: Vec::new(), build }
    }

    pub fn gated(mut self, gate: Gate) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Also reconcile keys mapped from changes of `kind`.
    pub fn watches<F>(mut self, kind: ResourceKind, mapper: F) -> Self
    where
        F: Fn(&Change) -> Vec<ObjectKey> + Send + Sync + 'static,
    {
        self.related.push((kind, Arc::new(mapper)));
        self
    }

    pub fn name(&self) -> &str { &self.name }
    pub fn kind(&self) -> &ResourceKind { &self.kind }
    pub fn gate(&self) -> Option<Gate> { self.gate }

    /// Kinds the local cache must watch for this controller.
    pub fn kinds(&self) -> impl Iterator<Item = &ResourceKind> {
        std::iter::once(&self.kind).chain(self.related.iter().map(|(k, _)| k))
    }

    pub(crate) fn build(
        self,
        cache: Cache,
        ctx: Arc<ControllerContext<K>>,
        config: SchedulerConfig,
    ) -> Result<Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, ()> + Send>, StoreError> {
        (self.build)(cache, ctx, config, self.related)
    }
}

/// Table every manager starts from.
pub fn builtin<K: Connector>() -> Vec<ControllerEntry<K>> {
    vec![
        ControllerEntry::new("clustercache", kinds::cluster(), ClusterCacheReconciler::new()),
        ControllerEntry::new("machine-noderef", kinds::machine(), NodeRefReconciler::machine()),
        ControllerEntry::new("machinepool-noderef", kinds::machine_pool(), NodeRefReconciler::machine_pool())
            .gated(Gate::MachinePool),
    ]
}

/// Indexes on the local cache.
pub fn local_indexes() -> Vec<IndexSpec> {
    vec![
        IndexSpec::new(kinds::machine(), kinds::MACHINE_NODE_INDEX, kinds::index_machine_by_node_name),
        IndexSpec::new(kinds::machine(), kinds::MACHINE_PROVIDER_ID_INDEX, kinds::index_machine_by_provider_id),
    ]
}

/// Indexes on every remote cache.
pub fn remote_indexes() -> Vec<IndexSpec> {
    vec![node_provider_index()]
}

fn node_provider_index() -> IndexSpec {
    IndexSpec::new(kinds::node(), NODE_PROVIDER_ID_INDEX, kinds::index_node_by_provider_id)
}

/// Drops the remote connection once a cluster object is gone.
pub struct ClusterCacheReconciler<K>(PhantomData<fn() -> K>);

impl<K> ClusterCacheReconciler<K> {
    pub fn new() -> Self { Self(PhantomData) }
}

impl<K> Default for ClusterCacheReconciler<K> {
    fn default() -> Self { Self::new() }
}

#[async_trait]
impl<K: Connector> Reconciler for ClusterCacheReconciler<K> {
    type Context = ControllerContext<K>;

    async fn reconcile(&self, request: ReconcileRequest, ctx: Arc<Self::Context>) -> Result<Action, ReconcileError> {
        if request.object.is_none() {
            ctx.tracker.delete(&request.key);
        }
        Ok(Action::AwaitChange)
    }
}

/// Nodes may register after the machine reports its provider ID.
pub const NODE_RETRY: Duration = Duration::from_secs(20);

/// Links machines (or machine pools) to the remote nodes carrying their
/// provider IDs by writing `status.nodeRef` (`status.nodeRefs` for pools).
pub struct NodeRefReconciler<K> {
    pool: bool,
    _connector: PhantomData<fn() -> K>,
}

impl<K> NodeRefReconciler<K> {
    pub fn machine() -> Self { Self { pool: false, _connector: PhantomData } }
    pub fn machine_pool() -> Self { Self { pool: true, _connector: PhantomData } }

    fn provider_ids(&self, obj: &CachedObject) -> kinds::IndexKeys {
        if self.pool {
            kinds::machine_pool_provider_ids(obj)
        } else {
            kinds::index_machine_by_provider_id(obj)
        }
    }
}

fn node_ref(node: &CachedObject) -> Value {
    json!({ "apiVersion": "v1", "kind": "Node", "name": node.key.name, "uid": node.uid })
}

fn cluster_name(obj: &CachedObject) -> Option<&str> {
    obj.str_at(&["spec", "clusterName"]).or_else(|| obj.label(CLUSTER_NAME_LABEL)).filter(|s| !s.is_empty())
}

#[async_trait]
impl<K: Connector> Reconciler for NodeRefReconciler<K> {
    type Context = ControllerContext<K>;

    async fn reconcile(&self, request: ReconcileRequest, ctx: Arc<Self::Context>) -> Result<Action, ReconcileError> {
        let Some(obj) = request.object else { return Ok(Action::AwaitChange) };
        if obj.raw.pointer("/metadata/deletionTimestamp").is_some_and(|v| !v.is_null()) {
            return Ok(Action::AwaitChange);
        }
        let namespace = obj
            .key
            .namespace
            .as_deref()
            .ok_or_else(|| ReconcileError::fatal(format!("{} is not namespaced", obj.key)))?;
        let cluster = cluster_name(&obj).ok_or_else(|| ReconcileError::fatal(format!("{} has no cluster name", obj.key)))?;
        let ids = self.provider_ids(&obj);
        if ids.is_empty() {
            debug!(object = %obj.key, "no provider ID yet");
            return Ok(Action::AwaitChange);
        }

        let Some(cluster_obj) = ctx.local.get(&kinds::cluster(), &ObjectKey::namespaced(namespace, cluster)) else {
            debug!(object = %obj.key, cluster, "cluster not in cache yet");
            return Ok(Action::Requeue(NODE_RETRY));
        };
        let identity = ClusterIdentity::from_object(&cluster_obj).map_err(ReconcileError::fatal)?;
        ctx.tracker.watch(&identity, node_provider_index()).await?;
        let remote = ctx.tracker.get_cache(&identity).await?;

        let node_kind = kinds::node();
        let found: Vec<Value> = ids
            .iter()
            .filter_map(|id| remote.list(&node_kind, NODE_PROVIDER_ID_INDEX, id).first().map(|n| node_ref(n)))
            .collect();
        let missing = ids.len() - found.len();

        let (path, desired) = if self.pool {
            ("/status/nodeRefs", Value::Array(found))
        } else {
            match found.into_iter().next() {
                Some(r) => ("/status/nodeRef", r),
                None => {
                    info!(object = %obj.key, cluster = %identity, "node not found for provider ID; retrying");
                    return Ok(Action::Requeue(NODE_RETRY));
                }
            }
        };

        if obj.raw.pointer(path) != Some(&desired) {
            let status = if self.pool {
                json!({ "nodeRefs": desired, "readyReplicas": ids.len() - missing })
            } else {
                json!({ "nodeRef": desired })
            };
            ctx.status.patch_status(&request.kind, &request.key, status).await?;
            info!(object = %obj.key, cluster = %identity, "node reference updated");
        }
        if missing > 0 {
            return Ok(Action::Requeue(NODE_RETRY));
        }
        Ok(Action::AwaitChange)
    }
}
