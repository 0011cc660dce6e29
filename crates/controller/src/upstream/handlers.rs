use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use k8s_openapi::api::core::v1::{Node, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::chrono::Utc;
use kedge_bus::MessageLayer;
use kedge_core::constants::*;
use kedge_core::payload::{NodeStatusRequest, PodStatusRequest};
use kedge_core::{resource, Message, Operation};
use kedge_ops::{ResourceStore, StoreError};
use metrics::{counter, histogram};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::classify::{Origin, QueryKind};
use crate::config::ControllerConfig;
use crate::normalize;

/// Store-side handling of each upstream request kind.
#[derive(Clone)]
pub struct Handlers {
    store: Arc<dyn ResourceStore>,
    layer: Arc<dyn MessageLayer>,
    config: Arc<ControllerConfig>,
}

fn observe(kind: &'static str, started: Instant) {
    histogram!("upstream_store_ms", started.elapsed().as_secs_f64() * 1000.0, "kind" => kind);
}

impl Handlers {
    pub fn new(store: Arc<dyn ResourceStore>, layer: Arc<dyn MessageLayer>, config: Arc<ControllerConfig>) -> Self {
        Self { store, layer, config }
    }

    async fn respond(&self, origin: &Origin, resource_type: &str, content: serde_json::Value, rv: Option<String>) {
        let target = match resource::build_resource(&origin.node_id, &origin.namespace, resource_type, &origin.name) {
            Ok(r) => r,
            Err(e) => {
                warn!(msg_id = %origin.msg.id(), error = %e, "cannot address response");
                return;
            }
        };
        let resp = Message::new_response(&origin.msg, content)
            .with_source(MODULE_EDGE_CONTROLLER)
            .with_resource(target)
            .with_resource_version(rv);
        if let Err(e) = self.layer.response(resp).await {
            warn!(msg_id = %origin.msg.id(), error = %e, "response failed");
        }
    }

    async fn respond_object<T: Serialize>(&self, origin: &Origin, resource_type: &str, obj: &T, rv: Option<String>) {
        match serde_json::to_value(obj) {
            Ok(v) => self.respond(origin, resource_type, v, rv).await,
            Err(e) => warn!(msg_id = %origin.msg.id(), error = %e, "cannot encode response"),
        }
    }

    /// Tell the origin node to drop a pod the store no longer has.
    async fn compensating_delete(&self, origin: &Origin, name: &str) {
        let target = match resource::build_resource(&origin.node_id, &origin.namespace, RESOURCE_TYPE_POD, name) {
            Ok(r) => r,
            Err(e) => {
                warn!(msg_id = %origin.msg.id(), error = %e, "cannot address compensating delete");
                return;
            }
        };
        let stub = Pod {
            metadata: ObjectMeta { name: Some(name.to_string()), namespace: Some(origin.namespace.clone()), ..Default::default() },
            ..Default::default()
        };
        let msg = match Message::new()
            .build_router(MODULE_EDGE_CONTROLLER, GROUP_RESOURCE, target, Operation::Delete)
            .fill_typed(&stub)
        {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "cannot encode pod stub");
                return;
            }
        };
        info!(msg_id = %origin.msg.id(), node = %origin.node_id, ns = %origin.namespace, pod = %name, "pod gone from store; asking edge to delete it");
        counter!("upstream_compensating_deletes_total", 1u64);
        if let Err(e) = self.layer.send(msg).await {
            warn!(msg_id = %origin.msg.id(), error = %e, "compensating delete not sent");
        }
    }

    pub async fn pod_status(&self, origin: Origin, requests: Vec<PodStatusRequest>) {
        for req in requests {
            let name = if req.name.is_empty() { origin.name.clone() } else { req.name.clone() };
            if name.is_empty() {
                warn!(msg_id = %origin.msg.id(), "pod status without a pod name");
                continue;
            }
            let started = Instant::now();
            let stored = match self.store.get_pod(&origin.namespace, &name).await {
                Ok(p) => p,
                Err(e) if e.is_not_found() => {
                    self.compensating_delete(&origin, &name).await;
                    continue;
                }
                Err(e) => {
                    warn!(msg_id = %origin.msg.id(), ns = %origin.namespace, pod = %name, error = %e, "pod lookup failed");
                    continue;
                }
            };
            let status = normalize::merge_pod_status(&stored, req.status, Utc::now());
            match self.store.patch_pod_status(&origin.namespace, &name, &status).await {
                Ok(updated) => {
                    debug!(msg_id = %origin.msg.id(), ns = %origin.namespace, pod = %name, "pod status patched");
                    if normalize::should_purge(&updated, &status) {
                        let uid = updated.metadata.uid.as_deref();
                        match self.store.delete_pod(&origin.namespace, &name, uid, Some(0)).await {
                            Ok(()) => info!(ns = %origin.namespace, pod = %name, "finished pod removed"),
                            Err(e) => warn!(ns = %origin.namespace, pod = %name, error = %e, "finished pod delete failed"),
                        }
                    }
                }
                Err(e) if e.is_not_found() => self.compensating_delete(&origin, &name).await,
                Err(e) => warn!(msg_id = %origin.msg.id(), ns = %origin.namespace, pod = %name, error = %e, "pod status patch failed"),
            }
            observe("update_pod_status", started);
        }
    }

    pub async fn node_register(&self, origin: Origin, mut node: Node) {
        let name = origin.name.clone();
        let result = match self.store.get_node(&name).await {
            Ok(_) => {
                info!(node = %name, "node already registered");
                RESPONSE_OK.to_string()
            }
            Err(e) if e.is_not_found() => {
                node.metadata.name = Some(name.clone());
                match self.store.create_node(&node).await {
                    Ok(_) => {
                        info!(node = %name, "node registered");
                        RESPONSE_OK.to_string()
                    }
                    Err(e) => format!("create node {name} error: {e}, register node failed"),
                }
            }
            Err(e) => format!("get node {name} info error: {e}, register node failed"),
        };
        if result != RESPONSE_OK {
            warn!(msg_id = %origin.msg.id(), node = %name, reason = %result, "node registration failed");
        }
        self.respond(&origin, RESOURCE_TYPE_NODE, serde_json::Value::String(result), None).await;
    }

    pub async fn node_status(&self, origin: Origin, req: NodeStatusRequest) {
        let started = Instant::now();
        let name = origin.name.clone();
        let stored = match self.store.get_node(&name).await {
            Ok(n) => n,
            Err(e) => {
                warn!(msg_id = %origin.msg.id(), node = %name, error = %e, "node status dropped");
                return;
            }
        };

        let mut status = req.status;
        if !self.config.edge_site {
            normalize::refresh_stale_heartbeats(&mut status, self.config.node_update_frequency, Utc::now());
        }
        status.volumes_attached = stored.status.as_ref().and_then(|s| s.volumes_attached.clone());

        match normalize::extended_resource_annotations(&req.extend_resources) {
            Ok(annotations) if !annotations.is_empty() => {
                if let Err(e) = self.store.patch_node_metadata(&name, &BTreeMap::new(), &annotations).await {
                    warn!(node = %name, error = %e, "extended resource annotations not written");
                }
            }
            Ok(_) => {}
            Err(e) => warn!(node = %name, error = %e, "extended resources not encodable"),
        }

        match self.store.patch_node_status(&name, &status).await {
            Ok(node) => {
                debug!(msg_id = %origin.msg.id(), node = %name, "node status patched");
                let rv = node.metadata.resource_version.clone();
                self.respond(&origin, RESOURCE_TYPE_NODE, serde_json::Value::String(RESPONSE_OK.to_string()), rv).await;
            }
            Err(e) => warn!(msg_id = %origin.msg.id(), node = %name, error = %e, "node status patch failed"),
        }
        observe("update_node_status", started);
    }

    pub async fn query(&self, kind: QueryKind, origin: Origin) {
        let (ns, name) = (origin.namespace.as_str(), origin.name.as_str());
        let resource_type = kind.resource_type();
        let started = Instant::now();
        let res = match kind {
            QueryKind::ConfigMap => self.store.get_configmap(ns, name).await.and_then(encode),
            QueryKind::Secret => self.store.get_secret(ns, name).await.and_then(encode),
            QueryKind::Service => self.store.get_service(ns, name).await.and_then(encode),
            QueryKind::Endpoints => self.store.get_endpoints(ns, name).await.and_then(encode),
        };
        observe("query", started);
        match res {
            Ok((obj, rv)) => self.respond(&origin, resource_type, obj, rv).await,
            Err(e) if e.is_not_found() => {
                warn!(msg_id = %origin.msg.id(), kind = resource_type, ns = %ns, name = %name, "queried object not found");
                counter!("upstream_dropped_total", 1u64, "reason" => "not_found");
            }
            Err(e) => warn!(msg_id = %origin.msg.id(), kind = resource_type, ns = %ns, name = %name, error = %e, "query failed"),
        }
    }

    pub async fn node_query(&self, origin: Origin) {
        match self.store.get_node(&origin.name).await {
            Ok(node) => {
                let rv = node.metadata.resource_version.clone();
                self.respond_object(&origin, RESOURCE_TYPE_NODE, &node, rv).await;
            }
            Err(e) => warn!(msg_id = %origin.msg.id(), node = %origin.name, error = %e, "node query failed"),
        }
    }

    pub async fn node_update(&self, origin: Origin, node: Node) {
        let labels = node.metadata.labels.unwrap_or_default();
        let annotations = node.metadata.annotations.unwrap_or_default();
        match self.store.patch_node_metadata(&origin.name, &labels, &annotations).await {
            Ok(updated) => {
                let rv = updated.metadata.resource_version.clone();
                self.respond(&origin, RESOURCE_TYPE_NODE, serde_json::Value::String(RESPONSE_OK.to_string()), rv).await;
            }
            Err(e) => warn!(msg_id = %origin.msg.id(), node = %origin.name, error = %e, "node update failed"),
        }
    }

    pub async fn pod_delete(&self, origin: Origin, uid: String) {
        let uid = Some(uid.as_str()).filter(|u| !u.is_empty());
        match self.store.delete_pod(&origin.namespace, &origin.name, uid, Some(0)).await {
            Ok(()) => info!(ns = %origin.namespace, pod = %origin.name, "pod removed on edge request"),
            Err(e) if e.is_not_found() => debug!(ns = %origin.namespace, pod = %origin.name, "pod already gone"),
            Err(e) => warn!(ns = %origin.namespace, pod = %origin.name, error = %e, "pod delete failed"),
        }
    }

    pub fn edge_response(&self, msg: &Message) {
        match msg.content.as_str() {
            Some(RESPONSE_OK) => debug!(parent = %msg.parent_id(), resource = %msg.resource(), "edge acknowledged"),
            _ => warn!(msg_id = %msg.id(), parent = %msg.parent_id(), source = %msg.source(), resource = %msg.resource(), content = %msg.content, "edge reported failure"),
        }
    }
}

fn encode<K: Serialize + kube::Resource>(obj: K) -> Result<(serde_json::Value, Option<String>), StoreError> {
    let rv = obj.meta().resource_version.clone();
    let v = serde_json::to_value(&obj).map_err(|e| StoreError::Other(e.to_string()))?;
    Ok((v, rv))
}
