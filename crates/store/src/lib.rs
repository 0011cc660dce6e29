//! Kedge store – the location cache.
//!
//! Two independent indexes map `(namespace, name)` of a configmap or secret to
//! the set of edge nodes running a pod that references it. Entries only grow
//! through pod observations; they shrink when the configmap/secret itself is
//! deleted. The cache also holds the set of known edge nodes.
//!
//! Each index is split into namespace buckets (FNV-1a of the namespace), each
//! behind its own `RwLock`, so writers for different namespaces do not contend.

#![forbid(unsafe_code)]

use std::sync::{PoisonError, RwLock};

use k8s_openapi::api::core::v1::{Node, Pod, PodSpec};
use kedge_core::constants::EDGE_NODE_LABEL;
use metrics::gauge;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

mod shard;

pub use shard::NamespacePlanner;

/// Default number of namespace buckets per index.
pub const DEFAULT_SHARDS: usize = 16;

type Key = (String, String);

struct DependencyIndex {
    kind: &'static str,
    planner: NamespacePlanner,
    shards: Vec<RwLock<FxHashMap<Key, FxHashSet<String>>>>,
}

impl DependencyIndex {
    fn new(kind: &'static str, buckets: usize) -> Self {
        let planner = NamespacePlanner::new(buckets);
        let shards = (0..planner.buckets()).map(|_| RwLock::new(FxHashMap::default())).collect();
        Self { kind, planner, shards }
    }

    fn shard(&self, namespace: &str) -> &RwLock<FxHashMap<Key, FxHashSet<String>>> {
        &self.shards[self.planner.plan(namespace)]
    }

    fn add(&self, namespace: &str, name: &str, node: &str) {
        let mut guard = self.shard(namespace).write().unwrap_or_else(PoisonError::into_inner);
        let inserted = guard
            .entry((namespace.to_string(), name.to_string()))
            .or_default()
            .insert(node.to_string());
        if inserted {
            debug!(kind = self.kind, ns = %namespace, name = %name, node = %node, "dependency located");
        }
    }

    fn nodes(&self, namespace: &str, name: &str) -> Vec<String> {
        let guard = self.shard(namespace).read().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<String> = guard
            .get(&(namespace.to_string(), name.to_string()))
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        out.sort_unstable();
        out
    }

    fn remove(&self, namespace: &str, name: &str) -> bool {
        let mut guard = self.shard(namespace).write().unwrap_or_else(PoisonError::into_inner);
        guard.remove(&(namespace.to_string(), name.to_string())).is_some()
    }

    fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.read().unwrap_or_else(PoisonError::into_inner).len())
            .sum()
    }
}

fn push(set: &mut FxHashSet<String>, name: Option<&String>) {
    if let Some(n) = name.filter(|n| !n.is_empty()) {
        set.insert(n.clone());
    }
}

/// Configmaps and secrets a pod spec depends on.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PodDependencies {
    pub configmaps: Vec<String>,
    pub secrets: Vec<String>,
}

impl PodDependencies {
    /// Walk volumes (including projected sources), `envFrom`, `env[].valueFrom`
    /// of every container and init container, and image pull secrets.
    pub fn of(spec: &PodSpec) -> Self {
        let mut cms = FxHashSet::default();
        let mut secrets = FxHashSet::default();

        for vol in spec.volumes.iter().flatten() {
            if let Some(cm) = &vol.config_map {
                push(&mut cms, cm.name.as_ref());
            }
            if let Some(s) = &vol.secret {
                push(&mut secrets, s.secret_name.as_ref());
            }
            if let Some(projected) = &vol.projected {
                for src in projected.sources.iter().flatten() {
                    if let Some(cm) = &src.config_map {
                        push(&mut cms, cm.name.as_ref());
                    }
                    if let Some(s) = &src.secret {
                        push(&mut secrets, s.name.as_ref());
                    }
                }
            }
        }

        let containers = spec.containers.iter().chain(spec.init_containers.iter().flatten());
        for c in containers {
            for from in c.env_from.iter().flatten() {
                if let Some(cm) = &from.config_map_ref {
                    push(&mut cms, cm.name.as_ref());
                }
                if let Some(s) = &from.secret_ref {
                    push(&mut secrets, s.name.as_ref());
                }
            }
            for var in c.env.iter().flatten() {
                let Some(source) = &var.value_from else { continue };
                if let Some(cm) = &source.config_map_key_ref {
                    push(&mut cms, cm.name.as_ref());
                }
                if let Some(s) = &source.secret_key_ref {
                    push(&mut secrets, s.name.as_ref());
                }
            }
        }

        for pull in spec.image_pull_secrets.iter().flatten() {
            push(&mut secrets, pull.name.as_ref());
        }

        let mut configmaps: Vec<String> = cms.into_iter().collect();
        let mut secrets: Vec<String> = secrets.into_iter().collect();
        configmaps.sort_unstable();
        secrets.sort_unstable();
        Self { configmaps, secrets }
    }
}

/// Whether a node carries the edge role label.
pub fn is_edge_labeled(node: &Node) -> bool {
    node.metadata.labels.as_ref().is_some_and(|l| l.contains_key(EDGE_NODE_LABEL))
}

pub struct LocationCache {
    configmaps: DependencyIndex,
    secrets: DependencyIndex,
    edge_nodes: RwLock<FxHashSet<String>>,
}

impl Default for LocationCache {
    fn default() -> Self {
        Self::with_shards(DEFAULT_SHARDS)
    }
}

impl LocationCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_shards(shards: usize) -> Self {
        Self {
            configmaps: DependencyIndex::new("configmap", shards),
            secrets: DependencyIndex::new("secret", shards),
            edge_nodes: RwLock::new(FxHashSet::default()),
        }
    }

    /// Union the pod's node into the set of every configmap and secret it
    /// references. Pods not yet bound to a node are ignored.
    pub fn add_or_update_pod(&self, pod: &Pod) {
        let Some(spec) = pod.spec.as_ref() else { return };
        let Some(node) = spec.node_name.as_deref().filter(|n| !n.is_empty()) else { return };
        let namespace = pod.metadata.namespace.as_deref().unwrap_or_default();
        let deps = PodDependencies::of(spec);
        for cm in &deps.configmaps {
            self.configmaps.add(namespace, cm, node);
        }
        for s in &deps.secrets {
            self.secrets.add(namespace, s, node);
        }
        gauge!("location_cache_keys", self.configmaps.len() as f64, "kind" => "configmap");
        gauge!("location_cache_keys", self.secrets.len() as f64, "kind" => "secret");
    }

    pub fn configmap_nodes(&self, namespace: &str, name: &str) -> Vec<String> {
        self.configmaps.nodes(namespace, name)
    }

    pub fn secret_nodes(&self, namespace: &str, name: &str) -> Vec<String> {
        self.secrets.nodes(namespace, name)
    }

    pub fn delete_configmap(&self, namespace: &str, name: &str) {
        if self.configmaps.remove(namespace, name) {
            debug!(ns = %namespace, name = %name, "configmap dropped from location cache");
        }
    }

    pub fn delete_secret(&self, namespace: &str, name: &str) {
        if self.secrets.remove(namespace, name) {
            debug!(ns = %namespace, name = %name, "secret dropped from location cache");
        }
    }

    pub fn is_edge_node(&self, node: &str) -> bool {
        self.edge_nodes.read().unwrap_or_else(PoisonError::into_inner).contains(node)
    }

    /// Register `node` as an edge node. Returns `true` when it was not known before.
    pub fn update_edge_node(&self, node: &str) -> bool {
        let added = self.edge_nodes.write().unwrap_or_else(PoisonError::into_inner).insert(node.to_string());
        if added {
            gauge!("location_cache_edge_nodes", self.edge_node_count() as f64);
        }
        added
    }

    pub fn delete_node(&self, node: &str) -> bool {
        let removed = self.edge_nodes.write().unwrap_or_else(PoisonError::into_inner).remove(node);
        if removed {
            gauge!("location_cache_edge_nodes", self.edge_node_count() as f64);
        }
        removed
    }

    pub fn edge_nodes(&self) -> Vec<String> {
        let mut out: Vec<String> = self.edge_nodes.read().unwrap_or_else(PoisonError::into_inner).iter().cloned().collect();
        out.sort_unstable();
        out
    }

    fn edge_node_count(&self) -> usize {
        self.edge_nodes.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}
