use std::collections::BTreeMap;
use std::time::Instant;

use k8s_openapi::api::core::v1::{ConfigMap, Endpoints, Node, NodeStatus, Pod, PodStatus, Secret, Service};
use kedge_core::constants::EDGE_NODE_LABEL;
use kedge_kubehub::crd::Device;
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams, Preconditions},
    Client,
};
use metrics::{counter, histogram};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::{ResourceStore, StoreError, StoreResult};

/// [`ResourceStore`] backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn get_namespaced<K>(&self, kind: &'static str, namespace: &str, name: &str) -> StoreResult<K>
    where
        K: kube::Resource<DynamicType = (), Scope = k8s_openapi::NamespaceResourceScope> + Clone + DeserializeOwned + std::fmt::Debug,
    {
        let started = Instant::now();
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        let res = api.get(name).await.map_err(|e| map_err(kind, namespace, name, e));
        observe(kind, "get", started, res.is_ok());
        res
    }
}

fn map_err(kind: &'static str, namespace: &str, name: &str, e: kube::Error) -> StoreError {
    match &e {
        kube::Error::Api(ae) if ae.code == 404 => StoreError::not_found(kind, namespace, name),
        kube::Error::Api(ae) if ae.code == 409 => StoreError::Conflict {
            kind,
            namespace: namespace.to_string(),
            name: name.to_string(),
            message: ae.message.clone(),
        },
        _ => StoreError::Api(e),
    }
}

fn observe(kind: &'static str, op: &'static str, started: Instant, ok: bool) {
    histogram!("store_request_ms", started.elapsed().as_secs_f64() * 1000.0, "kind" => kind, "op" => op);
    if !ok {
        counter!("store_request_errors_total", 1u64, "kind" => kind, "op" => op);
    }
}

#[async_trait::async_trait]
impl ResourceStore for KubeStore {
    async fn get_pod(&self, namespace: &str, name: &str) -> StoreResult<Pod> {
        self.get_namespaced("pod", namespace, name).await
    }

    async fn list_pods(&self) -> StoreResult<Vec<Pod>> {
        let started = Instant::now();
        let api: Api<Pod> = Api::all(self.client.clone());
        let res = api.list(&ListParams::default()).await.map(|l| l.items).map_err(StoreError::Api);
        observe("pod", "list", started, res.is_ok());
        res
    }

    async fn patch_pod_status(&self, namespace: &str, name: &str, status: &PodStatus) -> StoreResult<Pod> {
        let started = Instant::now();
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let body = serde_json::json!({ "status": status });
        let res = api
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&body))
            .await
            .map_err(|e| map_err("pod", namespace, name, e));
        observe("pod", "patch_status", started, res.is_ok());
        res
    }

    async fn delete_pod(&self, namespace: &str, name: &str, uid: Option<&str>, grace_seconds: Option<u32>) -> StoreResult<()> {
        let started = Instant::now();
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let dp = DeleteParams {
            grace_period_seconds: grace_seconds,
            preconditions: uid.filter(|u| !u.is_empty()).map(|u| Preconditions { uid: Some(u.to_string()), resource_version: None }),
            ..Default::default()
        };
        let res = api.delete(name, &dp).await.map(|_| ()).map_err(|e| map_err("pod", namespace, name, e));
        observe("pod", "delete", started, res.is_ok());
        debug!(ns = %namespace, pod = %name, grace = ?grace_seconds, "pod delete issued");
        res
    }

    async fn get_node(&self, name: &str) -> StoreResult<Node> {
        let started = Instant::now();
        let api: Api<Node> = Api::all(self.client.clone());
        let res = api.get(name).await.map_err(|e| map_err("node", "", name, e));
        observe("node", "get", started, res.is_ok());
        res
    }

    async fn list_edge_nodes(&self) -> StoreResult<Vec<Node>> {
        let started = Instant::now();
        let api: Api<Node> = Api::all(self.client.clone());
        let res = api
            .list(&ListParams::default().labels(EDGE_NODE_LABEL))
            .await
            .map(|l| l.items)
            .map_err(StoreError::Api);
        observe("node", "list", started, res.is_ok());
        res
    }

    async fn create_node(&self, node: &Node) -> StoreResult<Node> {
        let started = Instant::now();
        let api: Api<Node> = Api::all(self.client.clone());
        let name = node.metadata.name.clone().unwrap_or_default();
        let res = api.create(&PostParams::default(), node).await.map_err(|e| map_err("node", "", &name, e));
        observe("node", "create", started, res.is_ok());
        res
    }

    async fn patch_node_status(&self, name: &str, status: &NodeStatus) -> StoreResult<Node> {
        let started = Instant::now();
        let api: Api<Node> = Api::all(self.client.clone());
        let body = serde_json::json!({ "status": status });
        let res = api
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&body))
            .await
            .map_err(|e| map_err("node", "", name, e));
        observe("node", "patch_status", started, res.is_ok());
        res
    }

    async fn patch_node_metadata(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
        annotations: &BTreeMap<String, String>,
    ) -> StoreResult<Node> {
        let started = Instant::now();
        let api: Api<Node> = Api::all(self.client.clone());
        let body = serde_json::json!({ "metadata": { "labels": labels, "annotations": annotations } });
        let res = api
            .patch(name, &PatchParams::default(), &Patch::Merge(&body))
            .await
            .map_err(|e| map_err("node", "", name, e));
        observe("node", "patch", started, res.is_ok());
        res
    }

    async fn get_configmap(&self, namespace: &str, name: &str) -> StoreResult<ConfigMap> {
        self.get_namespaced("configmap", namespace, name).await
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> StoreResult<Secret> {
        self.get_namespaced("secret", namespace, name).await
    }

    async fn get_service(&self, namespace: &str, name: &str) -> StoreResult<Service> {
        self.get_namespaced("service", namespace, name).await
    }

    async fn get_endpoints(&self, namespace: &str, name: &str) -> StoreResult<Endpoints> {
        self.get_namespaced("endpoints", namespace, name).await
    }

    async fn patch_device(&self, namespace: &str, name: &str, body: &serde_json::Value) -> StoreResult<()> {
        let started = Instant::now();
        let api: Api<Device> = Api::namespaced(self.client.clone(), namespace);
        let res = api
            .patch(name, &PatchParams::default(), &Patch::Merge(body))
            .await
            .map(|_| ())
            .map_err(|e| map_err("device", namespace, name, e));
        observe("device", "patch", started, res.is_ok());
        res
    }
}
