//! Typed informer adapters.
//!
//! A watcher stream per kind is folded through an [`Adapter`] which keeps a
//! normalized copy of every object (resource version, generation and managed
//! fields cleared) and turns raw `Applied/Deleted/Restarted` into
//! `Added/Modified/Deleted`, dropping events that carry no semantic change.

use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::sync::{Arc, PoisonError, RwLock};

use anyhow::Result;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{ConfigMap, Endpoints, Node, Pod, Secret, Service};
use kube::{
    api::Api,
    runtime::{
        watcher::{self, Event as WatchEvent},
        WatchStreamExt,
    },
    Resource, ResourceExt,
};
use metrics::counter;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::crd::{Device, DeviceModel};

/// Uniform event handed to dispatchers.
#[derive(Debug, Clone, PartialEq)]
pub enum Event<K> {
    Added(K),
    /// `old` is the normalized cached copy; absent when an `Added` was promoted.
    Modified { old: Option<K>, new: K },
    Deleted(K),
}

impl<K> Event<K> {
    pub fn object(&self) -> &K {
        match self {
            Event::Added(o) | Event::Deleted(o) => o,
            Event::Modified { new, .. } => new,
        }
    }

    pub fn type_label(&self) -> &'static str {
        match self {
            Event::Added(_) => "added",
            Event::Modified { .. } => "modified",
            Event::Deleted(_) => "deleted",
        }
    }
}

/// `(namespace, name)`; namespace is empty for cluster-scoped kinds.
pub type ObjectKey = (String, String);

pub fn key_of<K: Resource>(obj: &K) -> ObjectKey {
    let meta = obj.meta();
    (meta.namespace.clone().unwrap_or_default(), meta.name.clone().unwrap_or_default())
}

/// Clear the fields that change on every write without changing meaning.
pub fn normalize<K: Resource>(obj: &mut K) {
    let meta = obj.meta_mut();
    meta.resource_version = None;
    meta.generation = None;
    meta.managed_fields = None;
}

/// Per-kind behavior of the adapter.
pub trait Watched: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static {
    const KIND: &'static str;

    /// Whether `new` differs from `old` in a way consumers care about. Both are normalized.
    fn changed(old: &Self, new: &Self) -> bool;

    /// Deliver an `Added` carrying a deletion timestamp as `Modified`.
    fn deleting_is_modified() -> bool {
        false
    }
}

impl Watched for Pod {
    const KIND: &'static str = "pod";

    fn changed(old: &Self, new: &Self) -> bool {
        old.metadata != new.metadata || old.spec != new.spec
    }

    fn deleting_is_modified() -> bool {
        true
    }
}

impl Watched for Device {
    const KIND: &'static str = "device";

    fn changed(old: &Self, new: &Self) -> bool {
        old.metadata != new.metadata || old.spec != new.spec || old.status != new.status
    }
}

impl Watched for DeviceModel {
    const KIND: &'static str = "devicemodel";

    fn changed(old: &Self, new: &Self) -> bool {
        old.metadata != new.metadata || old.spec != new.spec
    }
}

fn ready_status(node: &Node) -> Option<&str> {
    node.status
        .as_ref()?
        .conditions
        .as_ref()?
        .iter()
        .find(|c| c.type_ == "Ready")
        .map(|c| c.status.as_str())
}

impl Watched for Node {
    const KIND: &'static str = "node";

    /// Only readiness flips and label changes are forwarded; heartbeats are not.
    fn changed(old: &Self, new: &Self) -> bool {
        ready_status(old) != ready_status(new) || old.metadata.labels != new.metadata.labels
    }
}

macro_rules! exact_match_kind {
    ($ty:ty, $kind:literal) => {
        impl Watched for $ty {
            const KIND: &'static str = $kind;

            fn changed(old: &Self, new: &Self) -> bool {
                old != new
            }
        }
    };
}

exact_match_kind!(ConfigMap, "configmap");
exact_match_kind!(Secret, "secret");
exact_match_kind!(Service, "service");
exact_match_kind!(Endpoints, "endpoints");

/// Normalized snapshots keyed by `(namespace, name)`. Reads hand out clones.
#[derive(Clone)]
pub struct ObjectCache<K> {
    inner: Arc<RwLock<HashMap<ObjectKey, K>>>,
}

impl<K: Clone> Default for ObjectCache<K> {
    fn default() -> Self {
        Self { inner: Arc::new(RwLock::new(HashMap::new())) }
    }
}

impl<K: Clone> ObjectCache<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, namespace: &str, name: &str) -> Option<K> {
        let guard = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        guard.get(&(namespace.to_string(), name.to_string())).cloned()
    }

    pub fn insert(&self, key: ObjectKey, obj: K) -> Option<K> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner).insert(key, obj)
    }

    pub fn remove(&self, key: &ObjectKey) -> Option<K> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner).remove(key)
    }

    /// Mutate a cached object in place; returns the updated clone.
    pub fn update<F: FnOnce(&mut K)>(&self, namespace: &str, name: &str, f: F) -> Option<K> {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let obj = guard.get_mut(&(namespace.to_string(), name.to_string()))?;
        f(obj);
        Some(obj.clone())
    }

    /// First cached object called `name`, in whichever namespace holds it.
    pub fn find_name(&self, name: &str) -> Option<(ObjectKey, K)> {
        let guard = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        guard.iter().find(|((_, n), _)| n == name).map(|(k, v)| (k.clone(), v.clone()))
    }

    pub fn list(&self) -> Vec<K> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn keys(&self) -> Vec<ObjectKey> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).keys().cloned().collect()
    }
}

/// Folds raw watch events into filtered [`Event`]s.
pub struct Adapter<K: Watched> {
    cache: ObjectCache<K>,
}

impl<K: Watched> Adapter<K> {
    pub fn new(cache: ObjectCache<K>) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &ObjectCache<K> {
        &self.cache
    }

    pub fn applied(&mut self, obj: K) -> Option<Event<K>> {
        let key = key_of(&obj);
        let mut snapshot = obj.clone();
        normalize(&mut snapshot);
        match self.cache.insert(key, snapshot) {
            None if K::deleting_is_modified() && obj.meta().deletion_timestamp.is_some() => {
                Some(Event::Modified { old: None, new: obj })
            }
            None => Some(Event::Added(obj)),
            Some(prev) => {
                let mut current = obj.clone();
                normalize(&mut current);
                if K::changed(&prev, &current) {
                    Some(Event::Modified { old: Some(prev), new: obj })
                } else {
                    counter!("informer_filtered_total", 1u64, "kind" => K::KIND);
                    None
                }
            }
        }
    }

    pub fn deleted(&mut self, obj: K) -> Event<K> {
        self.cache.remove(&key_of(&obj));
        Event::Deleted(obj)
    }

    /// Relist: every listed object is applied, cached objects missing from the list are deleted.
    pub fn restarted(&mut self, list: Vec<K>) -> Vec<Event<K>> {
        let seen: HashSet<ObjectKey> = list.iter().map(key_of).collect();
        let mut out: Vec<Event<K>> = list.into_iter().filter_map(|o| self.applied(o)).collect();
        for key in self.cache.keys() {
            if !seen.contains(&key) {
                if let Some(gone) = self.cache.remove(&key) {
                    out.push(Event::Deleted(gone));
                }
            }
        }
        out
    }
}

/// Api scoped to `namespace` when given, cluster-wide otherwise.
pub fn scoped_api<K>(client: kube::Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<DynamicType = (), Scope = k8s_openapi::NamespaceResourceScope>,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

/// Run list+watch for `K` until cancelled, pushing filtered events into `tx`.
pub async fn run_informer<K: Watched>(
    api: Api<K>,
    config: watcher::Config,
    cache: ObjectCache<K>,
    tx: mpsc::Sender<Event<K>>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut adapter = Adapter::new(cache);
    let stream = watcher::watcher(api, config).default_backoff();
    futures::pin_mut!(stream);
    info!(kind = K::KIND, "informer started");
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            ev = stream.next() => ev,
        };
        let events = match next {
            None => {
                warn!(kind = K::KIND, "watch stream ended");
                break;
            }
            Some(Err(e)) => {
                warn!(kind = K::KIND, error = %e, "watch error; backing off");
                continue;
            }
            Some(Ok(WatchEvent::Applied(o))) => adapter.applied(o).into_iter().collect::<Vec<_>>(),
            Some(Ok(WatchEvent::Deleted(o))) => vec![adapter.deleted(o)],
            Some(Ok(WatchEvent::Restarted(list))) => {
                debug!(kind = K::KIND, count = list.len(), "watch restart");
                adapter.restarted(list)
            }
        };
        for ev in events {
            counter!("informer_events_total", 1u64, "kind" => K::KIND, "type" => ev.type_label());
            debug!(kind = K::KIND, event = ev.type_label(), name = %ev.object().name_any(), "informer event");
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                sent = tx.send(ev) => {
                    if sent.is_err() {
                        debug!(kind = K::KIND, "event receiver dropped; informer exiting");
                        return Ok(());
                    }
                }
            }
        }
    }
    info!(kind = K::KIND, "informer stopped");
    Ok(())
}

/// Spawn [`run_informer`] and hand back the receiving end of its bounded channel.
pub fn spawn_informer<K: Watched>(
    api: Api<K>,
    config: watcher::Config,
    cache: ObjectCache<K>,
    capacity: usize,
    cancel: CancellationToken,
) -> (mpsc::Receiver<Event<K>>, tokio::task::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let handle = tokio::spawn(async move {
        if let Err(e) = run_informer(api, config, cache, tx, cancel).await {
            error!(kind = K::KIND, error = ?e, "informer failed; its events have stopped");
            counter!("informer_failures_total", 1u64, "kind" => K::KIND);
        }
    });
    (rx, handle)
}

/// Await an informer task, reporting a panic or abort instead of discarding it.
pub async fn join_informer(kind: &'static str, handle: tokio::task::JoinHandle<()>) {
    match handle.await {
        Ok(()) => {}
        Err(e) if e.is_panic() => {
            error!(kind, "informer panicked; its events have stopped");
            counter!("informer_failures_total", 1u64, "kind" => kind);
        }
        Err(e) => warn!(kind, error = %e, "informer task aborted"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{Container, NodeCondition, NodeStatus, PodSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};

    fn pod(name: &str, rv: &str, image: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some("ns".into()),
                resource_version: Some(rv.into()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container { name: "c".into(), image: Some(image.into()), ..Default::default() }],
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn panicked_informer_is_joined_not_propagated() {
        let handle = tokio::spawn(async { panic!("watch stream exploded") });
        join_informer(<Pod as Watched>::KIND, handle).await;
        let aborted = tokio::spawn(std::future::pending::<()>());
        aborted.abort();
        join_informer(<Pod as Watched>::KIND, aborted).await;
    }

    #[test]
    fn pod_added_then_modified() {
        let mut a = Adapter::new(ObjectCache::new());
        assert!(matches!(a.applied(pod("p", "1", "nginx:1")), Some(Event::Added(_))));
        match a.applied(pod("p", "2", "nginx:2")) {
            Some(Event::Modified { old: Some(old), new }) => {
                assert_eq!(old.metadata.resource_version, None);
                assert_eq!(new.metadata.resource_version.as_deref(), Some("2"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn pod_resource_version_bump_is_filtered() {
        let mut a = Adapter::new(ObjectCache::new());
        a.applied(pod("p", "1", "nginx:1"));
        assert!(a.applied(pod("p", "7", "nginx:1")).is_none());
        let mut status_only = pod("p", "8", "nginx:1");
        status_only.status = Some(Default::default());
        assert!(a.applied(status_only).is_none(), "status changes are not pod changes");
    }

    #[test]
    fn deleting_pod_on_add_is_modified() {
        let mut a = Adapter::new(ObjectCache::new());
        let mut p = pod("p", "1", "nginx");
        p.metadata.deletion_timestamp = Some(Time(chrono_now()));
        assert!(matches!(a.applied(p), Some(Event::Modified { old: None, .. })));
    }

    fn chrono_now() -> k8s_openapi::chrono::DateTime<k8s_openapi::chrono::Utc> {
        k8s_openapi::chrono::Utc::now()
    }

    #[test]
    fn relist_emits_deletes_for_vanished_objects() {
        let cache = ObjectCache::new();
        let mut a = Adapter::new(cache.clone());
        a.applied(pod("a", "1", "x"));
        a.applied(pod("b", "1", "x"));
        let events = a.restarted(vec![pod("a", "2", "x")]);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], Event::Deleted(p) if p.metadata.name.as_deref() == Some("b")));
        assert_eq!(cache.len(), 1);
    }

    fn node(ready: &str, heartbeat: i64) -> Node {
        Node {
            metadata: ObjectMeta { name: Some("edge-1".into()), ..Default::default() },
            status: Some(NodeStatus {
                conditions: Some(vec![NodeCondition {
                    type_: "Ready".into(),
                    status: ready.into(),
                    last_heartbeat_time: Some(Time(k8s_openapi::chrono::DateTime::from_timestamp(heartbeat, 0).unwrap_or_default())),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn node_heartbeats_are_ignored() {
        let mut a = Adapter::new(ObjectCache::new());
        assert!(matches!(a.applied(node("False", 1)), Some(Event::Added(_))));
        assert!(a.applied(node("False", 2)).is_none());
        assert!(matches!(a.applied(node("True", 3)), Some(Event::Modified { .. })));
    }

    #[test]
    fn cache_update_suppresses_echo() {
        let cache = ObjectCache::new();
        let mut a = Adapter::new(cache.clone());
        let mut cm = ConfigMap { metadata: ObjectMeta { name: Some("cm".into()), namespace: Some("ns".into()), ..Default::default() }, ..Default::default() };
        a.applied(cm.clone());
        cache.update("ns", "cm", |c| c.data = Some([("k".to_string(), "v".to_string())].into()));
        cm.data = Some([("k".to_string(), "v".to_string())].into());
        cm.metadata.resource_version = Some("9".into());
        assert!(a.applied(cm).is_none());
    }
}
