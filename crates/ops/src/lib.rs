//! Kedge Ops: typed operations against the authoritative store.
//!
//! Controllers only see the [`ResourceStore`] trait. [`KubeStore`] talks to the
//! API server; [`memory::MemoryStore`] keeps everything in RAM and records
//! every mutation.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{ConfigMap, Endpoints, Node, NodeStatus, Pod, PodStatus, Secret, Service};
use thiserror::Error;

mod kube_store;
pub mod memory;

pub use kube_store::KubeStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} {namespace}/{name} not found")]
    NotFound { kind: &'static str, namespace: String, name: String },
    #[error("conflict on {kind} {namespace}/{name}: {message}")]
    Conflict { kind: &'static str, namespace: String, name: String, message: String },
    #[error("store request failed: {0}")]
    Api(#[source] kube::Error),
    #[error("{0}")]
    Other(String),
}

impl StoreError {
    pub fn not_found(kind: &'static str, namespace: &str, name: &str) -> Self {
        StoreError::NotFound { kind, namespace: namespace.to_string(), name: name.to_string() }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// The slice of the store API the controllers use. Patches are JSON merge patches.
#[async_trait::async_trait]
pub trait ResourceStore: Send + Sync {
    async fn get_pod(&self, namespace: &str, name: &str) -> StoreResult<Pod>;
    async fn list_pods(&self) -> StoreResult<Vec<Pod>>;
    async fn patch_pod_status(&self, namespace: &str, name: &str, status: &PodStatus) -> StoreResult<Pod>;
    /// Delete with an optional UID precondition; `grace_seconds = Some(0)` deletes immediately.
    async fn delete_pod(&self, namespace: &str, name: &str, uid: Option<&str>, grace_seconds: Option<u32>) -> StoreResult<()>;

    async fn get_node(&self, name: &str) -> StoreResult<Node>;
    /// Nodes carrying the edge label.
    async fn list_edge_nodes(&self) -> StoreResult<Vec<Node>>;
    async fn create_node(&self, node: &Node) -> StoreResult<Node>;
    async fn patch_node_status(&self, name: &str, status: &NodeStatus) -> StoreResult<Node>;
    /// Merge labels and annotations into the node's metadata.
    async fn patch_node_metadata(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
        annotations: &BTreeMap<String, String>,
    ) -> StoreResult<Node>;

    async fn get_configmap(&self, namespace: &str, name: &str) -> StoreResult<ConfigMap>;
    async fn get_secret(&self, namespace: &str, name: &str) -> StoreResult<Secret>;
    async fn get_service(&self, namespace: &str, name: &str) -> StoreResult<Service>;
    async fn get_endpoints(&self, namespace: &str, name: &str) -> StoreResult<Endpoints>;

    /// Apply `body` (e.g. `{"status": {...}}`) to a device as `application/merge-patch+json`.
    async fn patch_device(&self, namespace: &str, name: &str, body: &serde_json::Value) -> StoreResult<()>;
}
