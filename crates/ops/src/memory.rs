//! In-RAM [`ResourceStore`] that records every mutation.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use k8s_openapi::api::core::v1::{ConfigMap, Endpoints, Node, NodeStatus, Pod, PodStatus, Secret, Service};
use kedge_core::constants::EDGE_NODE_LABEL;
use kedge_kubehub::crd::Device;
use serde::{de::DeserializeOwned, Serialize};

use crate::{ResourceStore, StoreError, StoreResult};

/// A merge patch that was applied.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedPatch {
    pub kind: &'static str,
    pub namespace: String,
    pub name: String,
    pub body: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedDelete {
    pub namespace: String,
    pub name: String,
    pub uid: Option<String>,
    pub grace_seconds: Option<u32>,
}

type Key = (String, String);

#[derive(Default)]
struct State {
    pods: BTreeMap<Key, Pod>,
    nodes: BTreeMap<String, Node>,
    configmaps: BTreeMap<Key, ConfigMap>,
    secrets: BTreeMap<Key, Secret>,
    services: BTreeMap<Key, Service>,
    endpoints: BTreeMap<Key, Endpoints>,
    devices: BTreeMap<Key, Device>,
    patches: Vec<RecordedPatch>,
    deletes: Vec<RecordedDelete>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

fn meta_key(meta: &k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta) -> Key {
    key(meta.namespace.as_deref().unwrap_or_default(), meta.name.as_deref().unwrap_or_default())
}

/// RFC 7386 JSON merge patch.
pub fn merge_patch(target: &mut serde_json::Value, patch: &serde_json::Value) {
    match patch {
        serde_json::Value::Object(fields) => {
            if !target.is_object() {
                *target = serde_json::Value::Object(Default::default());
            }
            if let serde_json::Value::Object(map) = target {
                for (k, v) in fields {
                    if v.is_null() {
                        map.remove(k);
                    } else {
                        merge_patch(map.entry(k.clone()).or_insert(serde_json::Value::Null), v);
                    }
                }
            }
        }
        other => *target = other.clone(),
    }
}

fn apply<T: Serialize + DeserializeOwned>(obj: &T, body: &serde_json::Value) -> StoreResult<T> {
    let mut raw = serde_json::to_value(obj).map_err(|e| StoreError::Other(e.to_string()))?;
    merge_patch(&mut raw, body);
    serde_json::from_value(raw).map_err(|e| StoreError::Other(e.to_string()))
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn put_pod(&self, pod: Pod) {
        self.lock().pods.insert(meta_key(&pod.metadata), pod);
    }

    pub fn put_node(&self, node: Node) {
        self.lock().nodes.insert(node.metadata.name.clone().unwrap_or_default(), node);
    }

    pub fn put_configmap(&self, cm: ConfigMap) {
        self.lock().configmaps.insert(meta_key(&cm.metadata), cm);
    }

    pub fn put_secret(&self, secret: Secret) {
        self.lock().secrets.insert(meta_key(&secret.metadata), secret);
    }

    pub fn put_service(&self, svc: Service) {
        self.lock().services.insert(meta_key(&svc.metadata), svc);
    }

    pub fn put_endpoints(&self, ep: Endpoints) {
        self.lock().endpoints.insert(meta_key(&ep.metadata), ep);
    }

    pub fn put_device(&self, device: Device) {
        self.lock().devices.insert(meta_key(&device.metadata), device);
    }

    pub fn pod(&self, namespace: &str, name: &str) -> Option<Pod> {
        self.lock().pods.get(&key(namespace, name)).cloned()
    }

    pub fn node(&self, name: &str) -> Option<Node> {
        self.lock().nodes.get(name).cloned()
    }

    pub fn device(&self, namespace: &str, name: &str) -> Option<Device> {
        self.lock().devices.get(&key(namespace, name)).cloned()
    }

    pub fn patches(&self) -> Vec<RecordedPatch> {
        self.lock().patches.clone()
    }

    pub fn deletes(&self) -> Vec<RecordedDelete> {
        self.lock().deletes.clone()
    }

    fn record(state: &mut State, kind: &'static str, namespace: &str, name: &str, body: serde_json::Value) {
        state.patches.push(RecordedPatch { kind, namespace: namespace.to_string(), name: name.to_string(), body });
    }
}

#[async_trait::async_trait]
impl ResourceStore for MemoryStore {
    async fn get_pod(&self, namespace: &str, name: &str) -> StoreResult<Pod> {
        self.pod(namespace, name).ok_or_else(|| StoreError::not_found("pod", namespace, name))
    }

    async fn list_pods(&self) -> StoreResult<Vec<Pod>> {
        Ok(self.lock().pods.values().cloned().collect())
    }

    async fn patch_pod_status(&self, namespace: &str, name: &str, status: &PodStatus) -> StoreResult<Pod> {
        let body = serde_json::json!({ "status": status });
        let mut state = self.lock();
        let current = state.pods.get(&key(namespace, name)).ok_or_else(|| StoreError::not_found("pod", namespace, name))?;
        let next = apply(current, &body)?;
        state.pods.insert(key(namespace, name), next.clone());
        Self::record(&mut state, "pod", namespace, name, body);
        Ok(next)
    }

    async fn delete_pod(&self, namespace: &str, name: &str, uid: Option<&str>, grace_seconds: Option<u32>) -> StoreResult<()> {
        let mut state = self.lock();
        let k = key(namespace, name);
        let current = state.pods.get(&k).ok_or_else(|| StoreError::not_found("pod", namespace, name))?;
        if let Some(uid) = uid.filter(|u| !u.is_empty()) {
            if current.metadata.uid.as_deref() != Some(uid) {
                return Err(StoreError::Conflict {
                    kind: "pod",
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                    message: format!("uid precondition failed: {uid}"),
                });
            }
        }
        state.pods.remove(&k);
        state.deletes.push(RecordedDelete {
            namespace: namespace.to_string(),
            name: name.to_string(),
            uid: uid.map(str::to_string),
            grace_seconds,
        });
        Ok(())
    }

    async fn get_node(&self, name: &str) -> StoreResult<Node> {
        self.node(name).ok_or_else(|| StoreError::not_found("node", "", name))
    }

    async fn list_edge_nodes(&self) -> StoreResult<Vec<Node>> {
        Ok(self
            .lock()
            .nodes
            .values()
            .filter(|n| n.metadata.labels.as_ref().is_some_and(|l| l.contains_key(EDGE_NODE_LABEL)))
            .cloned()
            .collect())
    }

    async fn create_node(&self, node: &Node) -> StoreResult<Node> {
        let name = node.metadata.name.clone().unwrap_or_default();
        let mut state = self.lock();
        if state.nodes.contains_key(&name) {
            return Err(StoreError::Conflict {
                kind: "node",
                namespace: String::new(),
                name: name.clone(),
                message: "already exists".to_string(),
            });
        }
        state.nodes.insert(name, node.clone());
        Ok(node.clone())
    }

    async fn patch_node_status(&self, name: &str, status: &NodeStatus) -> StoreResult<Node> {
        let body = serde_json::json!({ "status": status });
        let mut state = self.lock();
        let current = state.nodes.get(name).ok_or_else(|| StoreError::not_found("node", "", name))?;
        let next = apply(current, &body)?;
        state.nodes.insert(name.to_string(), next.clone());
        Self::record(&mut state, "node", "", name, body);
        Ok(next)
    }

    async fn patch_node_metadata(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
        annotations: &BTreeMap<String, String>,
    ) -> StoreResult<Node> {
        let body = serde_json::json!({ "metadata": { "labels": labels, "annotations": annotations } });
        let mut state = self.lock();
        let current = state.nodes.get(name).ok_or_else(|| StoreError::not_found("node", "", name))?;
        let next = apply(current, &body)?;
        state.nodes.insert(name.to_string(), next.clone());
        Self::record(&mut state, "node", "", name, body);
        Ok(next)
    }

    async fn get_configmap(&self, namespace: &str, name: &str) -> StoreResult<ConfigMap> {
        self.lock().configmaps.get(&key(namespace, name)).cloned().ok_or_else(|| StoreError::not_found("configmap", namespace, name))
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> StoreResult<Secret> {
        self.lock().secrets.get(&key(namespace, name)).cloned().ok_or_else(|| StoreError::not_found("secret", namespace, name))
    }

    async fn get_service(&self, namespace: &str, name: &str) -> StoreResult<Service> {
        self.lock().services.get(&key(namespace, name)).cloned().ok_or_else(|| StoreError::not_found("service", namespace, name))
    }

    async fn get_endpoints(&self, namespace: &str, name: &str) -> StoreResult<Endpoints> {
        self.lock().endpoints.get(&key(namespace, name)).cloned().ok_or_else(|| StoreError::not_found("endpoints", namespace, name))
    }

    async fn patch_device(&self, namespace: &str, name: &str, body: &serde_json::Value) -> StoreResult<()> {
        let mut state = self.lock();
        let current = state.devices.get(&key(namespace, name)).ok_or_else(|| StoreError::not_found("device", namespace, name))?;
        let next = apply(current, body)?;
        state.devices.insert(key(namespace, name), next);
        Self::record(&mut state, "device", namespace, name, body.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    #[test]
    fn merge_patch_follows_rfc7386() {
        let mut target = serde_json::json!({"a": "b", "c": {"d": "e", "f": "g"}, "list": [1, 2]});
        merge_patch(&mut target, &serde_json::json!({"a": "z", "c": {"f": null}, "list": [3]}));
        assert_eq!(target, serde_json::json!({"a": "z", "c": {"d": "e"}, "list": [3]}));
    }

    #[tokio::test]
    async fn pod_status_patch_is_recorded() {
        let store = MemoryStore::new();
        store.put_pod(Pod {
            metadata: ObjectMeta { name: Some("p".into()), namespace: Some("ns".into()), ..Default::default() },
            ..Default::default()
        });
        let status = PodStatus { phase: Some("Running".into()), ..Default::default() };
        let pod = store.patch_pod_status("ns", "p", &status).await.unwrap();
        assert_eq!(pod.status.unwrap().phase.as_deref(), Some("Running"));
        assert_eq!(store.patches().len(), 1);
        assert!(store.get_pod("ns", "ghost").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn uid_precondition_guards_delete() {
        let store = MemoryStore::new();
        store.put_pod(Pod {
            metadata: ObjectMeta { name: Some("p".into()), namespace: Some("ns".into()), uid: Some("u1".into()), ..Default::default() },
            ..Default::default()
        });
        assert!(matches!(store.delete_pod("ns", "p", Some("other"), Some(0)).await, Err(StoreError::Conflict { .. })));
        store.delete_pod("ns", "p", Some("u1"), Some(0)).await.unwrap();
        assert_eq!(store.deletes()[0].grace_seconds, Some(0));
        assert!(store.pod("ns", "p").is_none());
    }
}
