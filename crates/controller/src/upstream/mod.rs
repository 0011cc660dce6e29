//! Upstream dispatcher: edge reports and queries into the store.
//!
//! One intake task receives from the message layer, decodes each message into
//! an [`Upstream`] variant and hands it to the bounded lane of its kind. Every
//! lane feeds a fixed pool of workers. On cancellation the intake stops first
//! and drops the lanes; workers finish what is queued and exit once their lane
//! is closed.

use std::future::Future;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Node;
use kedge_bus::{BusError, MessageLayer};
use kedge_core::payload::{NodeStatusRequest, PodStatusRequest};
use kedge_ops::ResourceStore;
use metrics::counter;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

mod classify;
mod handlers;

pub use classify::{classify, ClassifyError, Origin, QueryKind, Upstream};
pub use handlers::Handlers;

use crate::config::ControllerConfig;

/// Spawn `workers` tasks draining one bounded lane through `handler`.
fn spawn_pool<T, F, Fut>(
    set: &mut JoinSet<()>,
    kind: &'static str,
    workers: usize,
    capacity: usize,
    handler: F,
) -> mpsc::Sender<T>
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<T>(capacity.max(1));
    let rx = Arc::new(Mutex::new(rx));
    for worker in 0..workers.max(1) {
        let rx = Arc::clone(&rx);
        let handler = handler.clone();
        set.spawn(async move {
            loop {
                let next = rx.lock().await.recv().await;
                match next {
                    Some(item) => handler(item).await,
                    None => break,
                }
            }
            debug!(kind, worker, "upstream worker drained");
        });
    }
    tx
}

struct Lanes {
    pod_status: mpsc::Sender<(Origin, Vec<PodStatusRequest>)>,
    node_status: mpsc::Sender<NodeStatusWork>,
    query_configmap: mpsc::Sender<Origin>,
    query_secret: mpsc::Sender<Origin>,
    query_service: mpsc::Sender<Origin>,
    query_endpoints: mpsc::Sender<Origin>,
    query_node: mpsc::Sender<Origin>,
    update_node: mpsc::Sender<(Origin, Box<Node>)>,
    delete_pod: mpsc::Sender<(Origin, String)>,
}

enum NodeStatusWork {
    Register(Origin, Box<Node>),
    Update(Origin, Box<NodeStatusRequest>),
}

impl Lanes {
    fn spawn(set: &mut JoinSet<()>, handlers: &Handlers, config: &ControllerConfig) -> Self {
        let caps = &config.capacities;
        let workers = &config.workers;

        let h = handlers.clone();
        let pod_status = spawn_pool(set, "update_pod_status", workers.update_pod_status, caps.update_pod_status, move |(o, reqs): (Origin, Vec<PodStatusRequest>)| {
            let h = h.clone();
            async move { h.pod_status(o, reqs).await }
        });
        let h = handlers.clone();
        let node_status = spawn_pool(set, "update_node_status", workers.update_node_status, caps.update_node_status, move |work: NodeStatusWork| {
            let h = h.clone();
            async move {
                match work {
                    NodeStatusWork::Register(o, node) => h.node_register(o, *node).await,
                    NodeStatusWork::Update(o, req) => h.node_status(o, *req).await,
                }
            }
        });
        let query = |set: &mut JoinSet<()>, kind: QueryKind, name: &'static str, n: usize, cap: usize| {
            let h = handlers.clone();
            spawn_pool(set, name, n, cap, move |o: Origin| {
                let h = h.clone();
                async move { h.query(kind, o).await }
            })
        };
        let query_configmap = query(set, QueryKind::ConfigMap, "query_configmap", workers.query_configmap, caps.query_configmap);
        let query_secret = query(set, QueryKind::Secret, "query_secret", workers.query_secret, caps.query_secret);
        let query_service = query(set, QueryKind::Service, "query_service", workers.query_service, caps.query_service);
        let query_endpoints = query(set, QueryKind::Endpoints, "query_endpoints", workers.query_endpoints, caps.query_endpoints);
        let h = handlers.clone();
        let query_node = spawn_pool(set, "query_node", workers.query_node, caps.query_node, move |o: Origin| {
            let h = h.clone();
            async move { h.node_query(o).await }
        });
        let h = handlers.clone();
        let update_node = spawn_pool(set, "update_node", workers.update_node, caps.update_node, move |(o, node): (Origin, Box<Node>)| {
            let h = h.clone();
            async move { h.node_update(o, *node).await }
        });
        let h = handlers.clone();
        let delete_pod = spawn_pool(set, "delete_pod", workers.delete_pod, caps.delete_pod, move |(o, uid): (Origin, String)| {
            let h = h.clone();
            async move { h.pod_delete(o, uid).await }
        });

        Self {
            pod_status,
            node_status,
            query_configmap,
            query_secret,
            query_service,
            query_endpoints,
            query_node,
            update_node,
            delete_pod,
        }
    }

    /// Hand a request to its lane, waiting for room.
    async fn route(&self, req: Upstream, handlers: &Handlers) -> bool {
        match req {
            Upstream::PodStatus(o, reqs) => self.pod_status.send((o, reqs)).await.is_ok(),
            Upstream::NodeRegister(o, node) => self.node_status.send(NodeStatusWork::Register(o, node)).await.is_ok(),
            Upstream::NodeStatus(o, r) => self.node_status.send(NodeStatusWork::Update(o, r)).await.is_ok(),
            Upstream::Query(QueryKind::ConfigMap, o) => self.query_configmap.send(o).await.is_ok(),
            Upstream::Query(QueryKind::Secret, o) => self.query_secret.send(o).await.is_ok(),
            Upstream::Query(QueryKind::Service, o) => self.query_service.send(o).await.is_ok(),
            Upstream::Query(QueryKind::Endpoints, o) => self.query_endpoints.send(o).await.is_ok(),
            Upstream::NodeQuery(o) => self.query_node.send(o).await.is_ok(),
            Upstream::NodeUpdate(o, node) => self.update_node.send((o, node)).await.is_ok(),
            Upstream::PodDelete(o, uid) => self.delete_pod.send((o, uid)).await.is_ok(),
            Upstream::EdgeResponse(msg) => {
                handlers.edge_response(&msg);
                true
            }
        }
    }
}

pub struct UpstreamController {
    layer: Arc<dyn MessageLayer>,
    handlers: Handlers,
    config: Arc<ControllerConfig>,
}

impl UpstreamController {
    pub fn new(store: Arc<dyn ResourceStore>, layer: Arc<dyn MessageLayer>, config: Arc<ControllerConfig>) -> Self {
        let handlers = Handlers::new(store, Arc::clone(&layer), Arc::clone(&config));
        Self { layer, handlers, config }
    }

    /// Run intake and worker pools until `cancel` fires or the receive endpoint goes away.
    pub async fn run(self, cancel: CancellationToken) {
        let mut pools = JoinSet::new();
        let lanes = Lanes::spawn(&mut pools, &self.handlers, &self.config);
        info!(receive = %self.config.modules.receive, "upstream controller started");

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break,
                msg = self.layer.receive() => msg,
            };
            let msg = match next {
                Ok(m) => m,
                Err(BusError::Cancelled(_)) | Err(BusError::UnknownModule(_)) | Err(BusError::Closed(_)) => break,
                Err(e) => {
                    warn!(error = %e, "upstream receive failed");
                    continue;
                }
            };
            let (id, source, resource) = (msg.id().to_string(), msg.source().to_string(), msg.resource().to_string());
            match classify(msg) {
                Ok(req) => {
                    let kind = req.kind();
                    counter!("upstream_messages_total", 1u64, "kind" => kind);
                    if !lanes.route(req, &self.handlers).await {
                        warn!(msg_id = %id, kind, "worker lane closed; message dropped");
                    }
                }
                Err(e) => {
                    counter!("upstream_dropped_total", 1u64, "reason" => e.reason());
                    warn!(msg_id = %id, source = %source, resource = %resource, error = %e, "upstream message dropped");
                }
            }
        }

        drop(lanes);
        while pools.join_next().await.is_some() {}
        info!("upstream controller stopped");
    }
}
