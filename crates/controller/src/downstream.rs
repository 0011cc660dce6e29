//! Downstream dispatcher: store events fanned out to the nodes that own them.
//!
//! One task per watched kind turns informer events into messages and hands
//! them to the message layer in arrival order. Pods go to the node they are
//! bound to; configmaps and secrets go to every node the location cache says
//! depends on them. Services and endpoints are only cached here and shipped
//! as part of a node's readiness snapshot.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::{ConfigMap, Endpoints, Node, Pod, Secret, Service};
use kedge_bus::MessageLayer;
use kedge_core::constants::*;
use kedge_core::{resource, Message, Operation};
use kedge_kubehub::{Event, ObjectCache};
use kedge_ops::ResourceStore;
use kedge_store::{is_edge_labeled, LocationCache};
use kube::{Resource, ResourceExt};
use metrics::counter;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Placeholder segments used by the list-shaped bootstrap resources.
const LIST_NAMESPACE: &str = "namespace";
const SERVICE_LIST_NAME: &str = "service";
const ENDPOINTS_LIST_NAME: &str = "endpoints";

/// Informer caches the dispatcher reads when building snapshots.
#[derive(Clone, Default)]
pub struct DownstreamCaches {
    pub pods: ObjectCache<Pod>,
    pub services: ObjectCache<Service>,
    pub endpoints: ObjectCache<Endpoints>,
}

/// Receiving ends of the informer channels, one per kind.
pub struct DownstreamStreams {
    pub pods: mpsc::Receiver<Event<Pod>>,
    pub configmaps: mpsc::Receiver<Event<ConfigMap>>,
    pub secrets: mpsc::Receiver<Event<Secret>>,
    pub nodes: mpsc::Receiver<Event<Node>>,
    pub services: mpsc::Receiver<Event<Service>>,
    pub endpoints: mpsc::Receiver<Event<Endpoints>>,
}

pub struct Downstream {
    layer: Arc<dyn MessageLayer>,
    location: Arc<LocationCache>,
    caches: DownstreamCaches,
}

fn skipped(kind: &'static str, reason: &'static str) {
    counter!("downstream_skipped_total", 1u64, "kind" => kind, "reason" => reason);
}

fn node_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|cs| cs.iter().find(|c| c.type_ == "Ready"))
        .is_some_and(|c| c.status == "True")
}

fn selects(selector: &BTreeMap<String, String>, pod: &Pod) -> bool {
    let labels = pod.labels();
    selector.iter().all(|(k, v)| labels.get(k) == Some(v))
}

fn sorted<K: Resource>(mut objs: Vec<K>) -> Vec<K> {
    objs.sort_by(|a, b| (a.meta().namespace.as_deref(), a.meta().name.as_deref()).cmp(&(b.meta().namespace.as_deref(), b.meta().name.as_deref())));
    objs
}

/// One resource message from the edge controller, or `None` (logged) when it cannot be built.
fn build<T: Serialize>(
    node: &str,
    namespace: &str,
    resource_type: &str,
    name: &str,
    op: Operation,
    content: &T,
    rv: Option<String>,
) -> Option<Message> {
    let target = match resource::build_resource(node, namespace, resource_type, name) {
        Ok(r) => r,
        Err(e) => {
            warn!(node, ns = %namespace, kind = resource_type, name, error = %e, "cannot address downstream message");
            return None;
        }
    };
    match Message::new()
        .build_router(MODULE_EDGE_CONTROLLER, GROUP_RESOURCE, target, op)
        .with_resource_version(rv)
        .fill_typed(content)
    {
        Ok(m) => Some(m),
        Err(e) => {
            warn!(node, kind = resource_type, name, error = %e, "cannot encode downstream message");
            None
        }
    }
}

impl Downstream {
    pub fn new(layer: Arc<dyn MessageLayer>, location: Arc<LocationCache>, caches: DownstreamCaches) -> Self {
        Self { layer, location, caches }
    }

    pub fn location(&self) -> &LocationCache {
        &self.location
    }

    /// Seed the edge-node set and the location cache from the store.
    pub async fn initial_locating(&self, store: &dyn ResourceStore) -> Result<()> {
        let nodes = store.list_edge_nodes().await.context("listing edge nodes")?;
        for node in &nodes {
            self.location.update_edge_node(&node.name_any());
        }
        let pods = store.list_pods().await.context("listing pods")?;
        let mut located = 0usize;
        for pod in &pods {
            let on_edge = pod
                .spec
                .as_ref()
                .and_then(|s| s.node_name.as_deref())
                .is_some_and(|n| self.location.is_edge_node(n));
            if on_edge {
                self.location.add_or_update_pod(pod);
                located += 1;
            }
        }
        info!(edge_nodes = nodes.len(), pods = located, "initial locating done");
        Ok(())
    }

    pub fn on_pod(&self, ev: Event<Pod>) -> Vec<Message> {
        let pod = ev.object();
        let Some(node) = pod.spec.as_ref().and_then(|s| s.node_name.as_deref()).filter(|n| !n.is_empty()) else {
            skipped("pod", "unbound");
            return Vec::new();
        };
        if !self.location.is_edge_node(node) {
            skipped("pod", "not_edge");
            return Vec::new();
        }
        let op = match &ev {
            Event::Added(_) => Operation::Insert,
            Event::Modified { .. } => Operation::Update,
            Event::Deleted(_) => Operation::Delete,
        };
        if op != Operation::Delete {
            self.location.add_or_update_pod(pod);
        }
        let ns = pod.namespace().unwrap_or_default();
        build(node, &ns, RESOURCE_TYPE_POD, &pod.name_any(), op, pod, pod.resource_version())
            .into_iter()
            .collect()
    }

    pub fn on_configmap(&self, ev: Event<ConfigMap>) -> Vec<Message> {
        let cm = ev.object();
        let (ns, name) = (cm.namespace().unwrap_or_default(), cm.name_any());
        let nodes = self.location.configmap_nodes(&ns, &name);
        if matches!(ev, Event::Deleted(_)) {
            self.location.delete_configmap(&ns, &name);
        }
        self.fanout(&ev, nodes, RESOURCE_TYPE_CONFIGMAP)
    }

    pub fn on_secret(&self, ev: Event<Secret>) -> Vec<Message> {
        let secret = ev.object();
        let (ns, name) = (secret.namespace().unwrap_or_default(), secret.name_any());
        let nodes = self.location.secret_nodes(&ns, &name);
        if matches!(ev, Event::Deleted(_)) {
            self.location.delete_secret(&ns, &name);
        }
        self.fanout(&ev, nodes, RESOURCE_TYPE_SECRET)
    }

    /// Added is sent as update; the edge applies both the same way.
    fn fanout<K: Resource + Serialize>(&self, ev: &Event<K>, nodes: Vec<String>, resource_type: &'static str) -> Vec<Message> {
        let obj = ev.object();
        let op = match ev {
            Event::Deleted(_) => Operation::Delete,
            _ => Operation::Update,
        };
        let ns = obj.meta().namespace.clone().unwrap_or_default();
        let name = obj.meta().name.clone().unwrap_or_default();
        if nodes.is_empty() {
            skipped(resource_type, "no_dependents");
        }
        debug!(kind = resource_type, ns = %ns, name = %name, nodes = nodes.len(), operation = %op, "fanning out");
        nodes
            .iter()
            .filter_map(|n| build(n, &ns, resource_type, &name, op, obj, obj.meta().resource_version.clone()))
            .collect()
    }

    pub fn on_node(&self, ev: Event<Node>) -> Vec<Message> {
        match ev {
            Event::Deleted(node) => {
                let name = node.name_any();
                self.location.delete_node(&name);
                info!(node = %name, "edge node deleted");
                build(&name, LIST_NAMESPACE, RESOURCE_TYPE_NODE, &name, Operation::Delete, &serde_json::Value::Null, None)
                    .into_iter()
                    .collect()
            }
            Event::Added(node) => self.track_node(&node, false),
            Event::Modified { old, new } => {
                let was_ready = old.as_ref().is_some_and(node_ready);
                self.track_node(&new, was_ready)
            }
        }
    }

    fn track_node(&self, node: &Node, was_ready: bool) -> Vec<Message> {
        let name = node.name_any();
        if !is_edge_labeled(node) {
            if self.location.delete_node(&name) {
                info!(node = %name, "node lost the edge label");
            }
            skipped("node", "not_edge");
            return Vec::new();
        }
        if self.location.update_edge_node(&name) {
            info!(node = %name, "edge node tracked");
        }
        if node_ready(node) && !was_ready {
            info!(node = %name, "edge node ready; sending snapshot");
            return self.snapshot(&name);
        }
        Vec::new()
    }

    /// Services, their selected pods and endpoints for a node that just became ready.
    pub fn snapshot(&self, node: &str) -> Vec<Message> {
        let services = sorted(self.caches.services.list());
        let mut out = Vec::new();
        out.extend(build(node, LIST_NAMESPACE, RESOURCE_TYPE_SERVICE_LIST, SERVICE_LIST_NAME, Operation::Update, &services, None));

        let pods = sorted(self.caches.pods.list());
        for svc in &services {
            let Some(selector) = svc.spec.as_ref().and_then(|s| s.selector.as_ref()).filter(|s| !s.is_empty()) else {
                continue;
            };
            let svc_ns = svc.namespace().unwrap_or_default();
            let selected: Vec<&Pod> = pods
                .iter()
                .filter(|p| p.namespace().unwrap_or_default() == svc_ns && selects(selector, p))
                .collect();
            out.extend(build(node, &svc_ns, RESOURCE_TYPE_POD_LIST, &svc.name_any(), Operation::Update, &selected, None));
        }

        let endpoints = sorted(self.caches.endpoints.list());
        out.extend(build(node, LIST_NAMESPACE, RESOURCE_TYPE_ENDPOINTS_LIST, ENDPOINTS_LIST_NAME, Operation::Update, &endpoints, None));
        out
    }

    /// Services and endpoints are answered on demand; their informers only keep the caches warm.
    pub fn on_service(&self, ev: Event<Service>) -> Vec<Message> {
        debug!(name = %ev.object().name_any(), event = ev.type_label(), "service cached");
        Vec::new()
    }

    pub fn on_endpoints(&self, ev: Event<Endpoints>) -> Vec<Message> {
        debug!(name = %ev.object().name_any(), event = ev.type_label(), "endpoints cached");
        Vec::new()
    }

    /// Send in order; gives up early only when `cancel` fires.
    pub async fn dispatch(&self, kind: &'static str, msgs: Vec<Message>, cancel: &CancellationToken) -> bool {
        for msg in msgs {
            let (op, resource) = (msg.operation(), msg.resource().to_string());
            let sent = tokio::select! {
                _ = cancel.cancelled() => return false,
                res = self.layer.send(msg) => res,
            };
            match sent {
                Ok(()) => {
                    counter!("downstream_messages_total", 1u64, "kind" => kind, "operation" => op.as_str());
                    debug!(kind, operation = %op, resource = %resource, "downstream message sent");
                }
                Err(e) => warn!(kind, operation = %op, resource = %resource, error = %e, "downstream send failed"),
            }
        }
        true
    }

    async fn pump<K: Send + 'static>(
        self: Arc<Self>,
        kind: &'static str,
        mut rx: mpsc::Receiver<Event<K>>,
        handle: fn(&Self, Event<K>) -> Vec<Message>,
        cancel: CancellationToken,
    ) {
        loop {
            let ev = tokio::select! {
                _ = cancel.cancelled() => break,
                ev = rx.recv() => match ev {
                    Some(ev) => ev,
                    None => break,
                },
            };
            let msgs = handle(self.as_ref(), ev);
            if !self.dispatch(kind, msgs, &cancel).await {
                break;
            }
        }
        debug!(kind, "downstream loop stopped");
    }

    /// One loop per kind; each ends on cancellation or when its informer goes away.
    pub fn spawn(self: &Arc<Self>, set: &mut JoinSet<()>, streams: DownstreamStreams, cancel: &CancellationToken) {
        set.spawn(Arc::clone(self).pump(RESOURCE_TYPE_POD, streams.pods, Self::on_pod, cancel.clone()));
        set.spawn(Arc::clone(self).pump(RESOURCE_TYPE_CONFIGMAP, streams.configmaps, Self::on_configmap, cancel.clone()));
        set.spawn(Arc::clone(self).pump(RESOURCE_TYPE_SECRET, streams.secrets, Self::on_secret, cancel.clone()));
        set.spawn(Arc::clone(self).pump(RESOURCE_TYPE_NODE, streams.nodes, Self::on_node, cancel.clone()));
        set.spawn(Arc::clone(self).pump(RESOURCE_TYPE_SERVICE, streams.services, Self::on_service, cancel.clone()));
        set.spawn(Arc::clone(self).pump(RESOURCE_TYPE_ENDPOINTS, streams.endpoints, Self::on_endpoints, cancel.clone()));
    }
}
