#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, Endpoints, Node, NodeCondition, NodeStatus, Pod, PodSpec, Secret,
    Service, ServiceSpec, Volume,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kedge_bus::{ContextMessageLayer, ContextModules, MessageBus, MessageLayer};
use kedge_controller::{Downstream, DownstreamCaches, DownstreamStreams};
use kedge_core::prelude::*;
use kedge_kubehub::Event;
use kedge_ops::memory::MemoryStore;
use kedge_store::LocationCache;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

fn meta(ns: &str, name: &str) -> ObjectMeta {
    ObjectMeta { name: Some(name.into()), namespace: Some(ns.into()), ..Default::default() }
}

fn pod_on(node: &str, name: &str, cm: &str) -> Pod {
    let mut m = meta("ns", name);
    m.resource_version = Some("11".into());
    m.labels = Some(BTreeMap::from([("app".to_string(), "web".to_string())]));
    Pod {
        metadata: m,
        spec: Some(PodSpec {
            node_name: Some(node.into()),
            volumes: Some(vec![Volume {
                name: "cfg".into(),
                config_map: Some(ConfigMapVolumeSource { name: Some(cm.into()), ..Default::default() }),
                ..Default::default()
            }]),
            containers: vec![Container { name: "c".into(), ..Default::default() }],
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn edge_node(name: &str, ready: &str) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(name.into()),
            labels: Some(BTreeMap::from([(EDGE_NODE_LABEL.to_string(), String::new())])),
            ..Default::default()
        },
        status: Some(NodeStatus {
            conditions: Some(vec![NodeCondition { type_: "Ready".into(), status: ready.into(), ..Default::default() }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn dispatcher(caches: DownstreamCaches) -> (Arc<Downstream>, MessageBus) {
    let bus = MessageBus::new(64);
    bus.register(MODULE_CLOUDHUB).unwrap();
    let layer: Arc<dyn MessageLayer> = Arc::new(ContextMessageLayer::new(bus.clone(), ContextModules::default()));
    let location = Arc::new(LocationCache::new());
    (Arc::new(Downstream::new(layer, location, caches)), bus)
}

#[test]
fn configmap_change_reaches_the_dependent_node() {
    let (d, _bus) = dispatcher(DownstreamCaches::default());
    d.location().update_edge_node("A");
    let placed = d.on_pod(Event::Added(pod_on("A", "P1", "cm1")));
    assert_eq!(placed.len(), 1);
    assert_eq!(placed[0].operation(), Operation::Insert);
    assert_eq!(placed[0].resource(), "node/A/ns/pod/P1");

    let mut cm = ConfigMap { metadata: meta("ns", "cm1"), ..Default::default() };
    cm.data = Some(BTreeMap::from([("k".to_string(), "v2".to_string())]));
    let out = d.on_configmap(Event::Modified { old: None, new: cm.clone() });
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].resource(), "node/A/ns/configmap/cm1");
    assert_eq!(out[0].operation(), Operation::Update);
    assert_eq!(out[0].source(), MODULE_EDGE_CONTROLLER);
    assert_eq!(out[0].group(), GROUP_RESOURCE);
    assert_eq!(out[0].content, serde_json::to_value(&cm).unwrap());
}

#[test]
fn configmap_delete_drops_the_dependency() {
    let (d, _bus) = dispatcher(DownstreamCaches::default());
    d.location().update_edge_node("A");
    d.on_pod(Event::Added(pod_on("A", "P1", "cm1")));
    let cm = ConfigMap { metadata: meta("ns", "cm1"), ..Default::default() };

    let added = d.on_configmap(Event::Added(cm.clone()));
    assert_eq!(added[0].operation(), Operation::Update, "added is promoted to update");
    let deleted = d.on_configmap(Event::Deleted(cm.clone()));
    assert_eq!(deleted[0].operation(), Operation::Delete);
    assert!(d.location().configmap_nodes("ns", "cm1").is_empty());
    assert!(d.on_configmap(Event::Modified { old: None, new: cm }).is_empty());
}

#[test]
fn secret_without_dependents_is_not_sent() {
    let (d, _bus) = dispatcher(DownstreamCaches::default());
    let s = Secret { metadata: meta("ns", "s1"), ..Default::default() };
    assert!(d.on_secret(Event::Added(s)).is_empty());
}

#[test]
fn pods_off_the_edge_are_dropped() {
    let (d, _bus) = dispatcher(DownstreamCaches::default());
    assert!(d.on_pod(Event::Added(pod_on("cloud-1", "P1", "cm1"))).is_empty());
    assert!(d.location().configmap_nodes("ns", "cm1").is_empty());
    let mut unbound = pod_on("", "P2", "cm1");
    unbound.spec.as_mut().unwrap().node_name = None;
    assert!(d.on_pod(Event::Added(unbound)).is_empty());
}

#[test]
fn same_pod_update_twice_yields_same_message() {
    let (d, _bus) = dispatcher(DownstreamCaches::default());
    d.location().update_edge_node("A");
    let p = pod_on("A", "P1", "cm1");
    let first = d.on_pod(Event::Modified { old: None, new: p.clone() });
    let second = d.on_pod(Event::Modified { old: None, new: p });
    assert_eq!(first[0].router, second[0].router);
    assert_eq!(first[0].content, second[0].content);
    assert_eq!(first[0].resource_version(), Some("11"));
    assert_eq!(d.location().configmap_nodes("ns", "cm1"), vec!["A"]);
}

#[test]
fn pod_delete_keeps_location_entries() {
    let (d, _bus) = dispatcher(DownstreamCaches::default());
    d.location().update_edge_node("A");
    let p = pod_on("A", "P1", "cm1");
    d.on_pod(Event::Added(p.clone()));
    let out = d.on_pod(Event::Deleted(p));
    assert_eq!(out[0].operation(), Operation::Delete);
    assert_eq!(d.location().configmap_nodes("ns", "cm1"), vec!["A"]);
}

#[test]
fn node_turning_ready_gets_a_snapshot() {
    let caches = DownstreamCaches::default();
    let svc = Service {
        metadata: meta("ns", "web"),
        spec: Some(ServiceSpec {
            selector: Some(BTreeMap::from([("app".to_string(), "web".to_string())])),
            ..Default::default()
        }),
        ..Default::default()
    };
    caches.services.insert(("ns".into(), "web".into()), svc);
    caches.endpoints.insert(("ns".into(), "web".into()), Endpoints { metadata: meta("ns", "web"), ..Default::default() });
    caches.pods.insert(("ns".into(), "P1".into()), pod_on("A", "P1", "cm1"));
    let (d, _bus) = dispatcher(caches);

    assert!(d.on_node(Event::Added(edge_node("A", "False"))).is_empty());
    assert!(d.location().is_edge_node("A"));

    let out = d.on_node(Event::Modified { old: Some(edge_node("A", "False")), new: edge_node("A", "True") });
    let resources: Vec<&str> = out.iter().map(|m| m.resource()).collect();
    assert_eq!(
        resources,
        vec!["node/A/namespace/servicelist/service", "node/A/ns/podlist/web", "node/A/namespace/endpointslist/endpoints"]
    );
    assert!(out.iter().all(|m| m.operation() == Operation::Update));
    let pods: Vec<Pod> = out[1].content_as().unwrap();
    assert_eq!(pods.len(), 1);

    let again = d.on_node(Event::Modified { old: Some(edge_node("A", "True")), new: edge_node("A", "True") });
    assert!(again.is_empty(), "already ready");
}

#[test]
fn node_delete_leaves_the_edge_set() {
    let (d, _bus) = dispatcher(DownstreamCaches::default());
    d.on_node(Event::Added(edge_node("A", "True")));
    let out = d.on_node(Event::Deleted(edge_node("A", "True")));
    assert!(!d.location().is_edge_node("A"));
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].resource(), "node/A/namespace/node/A");
    assert_eq!(out[0].operation(), Operation::Delete);
}

#[tokio::test]
async fn initial_locating_seeds_the_cache() {
    let store = MemoryStore::new();
    store.put_node(edge_node("A", "True"));
    store.put_node(Node { metadata: ObjectMeta { name: Some("cloud".into()), ..Default::default() }, ..Default::default() });
    store.put_pod(pod_on("A", "P1", "cm1"));
    store.put_pod(pod_on("cloud", "P2", "cm2"));
    let (d, _bus) = dispatcher(DownstreamCaches::default());

    d.initial_locating(&store).await.unwrap();
    assert_eq!(d.location().edge_nodes(), vec!["A"]);
    assert_eq!(d.location().configmap_nodes("ns", "cm1"), vec!["A"]);
    assert!(d.location().configmap_nodes("ns", "cm2").is_empty());
}

#[tokio::test]
async fn loops_deliver_in_order_and_stop_on_cancel() {
    let (d, bus) = dispatcher(DownstreamCaches::default());
    d.location().update_edge_node("A");

    let (pod_tx, pods) = mpsc::channel(1);
    let (cm_tx, configmaps) = mpsc::channel(1);
    let (_s, secrets) = mpsc::channel(1);
    let (_n, nodes) = mpsc::channel(1);
    let (_sv, services) = mpsc::channel(1);
    let (_e, endpoints) = mpsc::channel(1);
    let cancel = CancellationToken::new();
    let mut set = JoinSet::new();
    d.spawn(&mut set, DownstreamStreams { pods, configmaps, secrets, nodes, services, endpoints }, &cancel);

    pod_tx.send(Event::Added(pod_on("A", "P1", "cm1"))).await.unwrap();
    let first = tokio::time::timeout(Duration::from_secs(2), bus.receive(MODULE_CLOUDHUB)).await.unwrap().unwrap();
    assert_eq!(first.resource(), "node/A/ns/pod/P1");

    cm_tx.send(Event::Modified { old: None, new: ConfigMap { metadata: meta("ns", "cm1"), ..Default::default() } }).await.unwrap();
    let second = tokio::time::timeout(Duration::from_secs(2), bus.receive(MODULE_CLOUDHUB)).await.unwrap().unwrap();
    assert_eq!(second.resource(), "node/A/ns/configmap/cm1");

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(2), async { while set.join_next().await.is_some() {} }).await.unwrap();
}
