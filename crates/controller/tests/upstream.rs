#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::{ConfigMap, Node, Pod, PodCondition, PodStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use k8s_openapi::chrono::{TimeZone, Utc};
use kedge_bus::{ContextMessageLayer, ContextModules, MessageBus, MessageLayer};
use kedge_controller::{ControllerConfig, UpstreamController};
use kedge_core::prelude::*;
use kedge_ops::memory::MemoryStore;
use kedge_ops::ResourceStore;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct Harness {
    bus: MessageBus,
    store: Arc<MemoryStore>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Harness {
    fn start(store: MemoryStore) -> Self {
        let bus = MessageBus::new(64);
        bus.register(MODULE_CLOUDHUB).unwrap();
        bus.register(MODULE_EDGE_CONTROLLER).unwrap();
        let store = Arc::new(store);
        let layer: Arc<dyn MessageLayer> = Arc::new(ContextMessageLayer::new(bus.clone(), ContextModules::default()));
        let dyn_store: Arc<dyn ResourceStore> = store.clone();
        let controller = UpstreamController::new(dyn_store, layer, Arc::new(ControllerConfig::default()));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(controller.run(cancel.clone()));
        Self { bus, store, cancel, task }
    }

    async fn edge_sends(&self, resource: &str, op: Operation, content: serde_json::Value) -> Message {
        let msg = Message::new().build_router("edged", GROUP_RESOURCE, resource, op).fill_body(content);
        self.bus.send(MODULE_EDGE_CONTROLLER, msg.clone()).await.unwrap();
        msg
    }

    async fn next_to_hub(&self) -> Message {
        tokio::time::timeout(Duration::from_secs(2), self.bus.receive(MODULE_CLOUDHUB))
            .await
            .expect("hub got nothing")
            .unwrap()
    }

    async fn stop(self) {
        self.cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), self.task).await.unwrap().unwrap();
    }
}

async fn eventually<F: Fn() -> bool>(check: F) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}

fn meta(ns: &str, name: &str) -> ObjectMeta {
    ObjectMeta { name: Some(name.into()), namespace: Some(ns.into()), uid: Some(format!("uid-{name}")), ..Default::default() }
}

fn node(name: &str) -> Node {
    Node { metadata: ObjectMeta { name: Some(name.into()), resource_version: Some("7".into()), ..Default::default() }, ..Default::default() }
}

#[tokio::test]
async fn unchanged_condition_keeps_stored_transition_time() {
    let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    let store = MemoryStore::new();
    store.put_pod(Pod {
        metadata: meta("ns", "pod1"),
        status: Some(PodStatus {
            conditions: Some(vec![PodCondition {
                type_: "Ready".into(),
                status: "True".into(),
                last_transition_time: Some(Time(t0)),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    });
    let h = Harness::start(store);

    h.edge_sends(
        "node/edge-1/ns/podstatus/pod1",
        Operation::Update,
        json!({"uid": "uid-pod1", "name": "pod1", "status": {"conditions": [
            {"type": "Ready", "status": "True", "lastTransitionTime": "2024-06-01T12:00:00Z"}
        ]}}),
    )
    .await;

    let store = h.store.clone();
    eventually(|| !store.patches().is_empty()).await;
    let pod = h.store.pod("ns", "pod1").unwrap();
    let cond = &pod.status.unwrap().conditions.unwrap()[0];
    assert_eq!(cond.last_transition_time, Some(Time(t0)));
    h.stop().await;
}

#[tokio::test]
async fn status_for_missing_pod_sends_compensating_delete() {
    let h = Harness::start(MemoryStore::new());
    h.edge_sends("node/edge-1/ns/podstatus/ghost", Operation::Update, json!({"name": "ghost", "status": {}})).await;

    let out = h.next_to_hub().await;
    assert_eq!(out.resource(), "node/edge-1/ns/pod/ghost");
    assert_eq!(out.operation(), Operation::Delete);
    assert_eq!(out.source(), MODULE_EDGE_CONTROLLER);
    let stub: Pod = out.content_as().unwrap();
    assert_eq!(stub.metadata.name.as_deref(), Some("ghost"));
    assert_eq!(stub.metadata.namespace.as_deref(), Some("ns"));
    assert!(h.store.patches().is_empty());
    h.stop().await;
}

#[tokio::test]
async fn node_status_is_patched_and_acknowledged() {
    let store = MemoryStore::new();
    store.put_node(node("edge-1"));
    let h = Harness::start(store);

    let req = h
        .edge_sends(
            "node/edge-1/default/nodestatus/edge-1",
            Operation::Update,
            json!({"status": {"conditions": [{"type": "Ready", "status": "True"}]}, "extendResources": {}}),
        )
        .await;

    let resp = h.next_to_hub().await;
    assert_eq!(resp.operation(), Operation::Response);
    assert_eq!(resp.parent_id(), req.id());
    assert_eq!(resp.content, json!("OK"));
    assert_eq!(resp.resource(), "node/edge-1/default/node/edge-1");
    assert_eq!(resp.resource_version(), Some("7"));

    let stored = h.store.node("edge-1").unwrap();
    let cond = &stored.status.unwrap().conditions.unwrap()[0];
    assert!(cond.last_heartbeat_time.is_some(), "missing heartbeat is filled in");
    h.stop().await;
}

#[tokio::test]
async fn configmap_query_returns_the_object() {
    let store = MemoryStore::new();
    let mut cm = ConfigMap { metadata: meta("ns", "cm1"), ..Default::default() };
    cm.metadata.resource_version = Some("42".into());
    cm.data = Some(BTreeMap::from([("k".to_string(), "v".to_string())]));
    store.put_configmap(cm);
    let h = Harness::start(store);

    let req = h.edge_sends("node/edge-1/ns/configmap/cm1", Operation::Query, serde_json::Value::Null).await;
    let resp = h.next_to_hub().await;
    assert_eq!(resp.parent_id(), req.id());
    assert_eq!(resp.resource(), "node/edge-1/ns/configmap/cm1");
    assert_eq!(resp.resource_version(), Some("42"));
    let got: ConfigMap = resp.content_as().unwrap();
    assert_eq!(got.data.unwrap()["k"], "v");
    h.stop().await;
}

#[tokio::test]
async fn register_creates_the_node_once() {
    let h = Harness::start(MemoryStore::new());
    h.edge_sends("node/edge-2/default/nodestatus/edge-2", Operation::Insert, json!({"metadata": {"labels": {"a": "b"}}})).await;
    assert_eq!(h.next_to_hub().await.content, json!("OK"));
    assert!(h.store.node("edge-2").is_some());

    h.edge_sends("node/edge-2/default/nodestatus/edge-2", Operation::Insert, json!({"metadata": {}})).await;
    assert_eq!(h.next_to_hub().await.content, json!("OK"));
    h.stop().await;
}

#[tokio::test]
async fn node_metadata_update_merges_labels() {
    let store = MemoryStore::new();
    store.put_node(node("edge-1"));
    let h = Harness::start(store);
    h.edge_sends("node/edge-1/default/node/edge-1", Operation::Update, json!({"metadata": {"labels": {"zone": "z1"}}})).await;
    assert_eq!(h.next_to_hub().await.content, json!("OK"));
    let labels = h.store.node("edge-1").unwrap().metadata.labels.unwrap();
    assert_eq!(labels["zone"], "z1");
    h.stop().await;
}

#[tokio::test]
async fn finished_terminating_pod_is_purged() {
    let store = MemoryStore::new();
    let mut pod = Pod { metadata: meta("ns", "done"), ..Default::default() };
    pod.metadata.deletion_timestamp = Some(Time(Utc::now()));
    store.put_pod(pod);
    let h = Harness::start(store);

    h.edge_sends(
        "node/edge-1/ns/podstatus",
        Operation::Update,
        json!([{"name": "done", "status": {"phase": "Succeeded", "containerStatuses": [
            {"name": "c", "image": "i", "imageID": "", "ready": false, "restartCount": 0, "state": {"terminated": {"exitCode": 0}}}
        ]}}]),
    )
    .await;

    let store = h.store.clone();
    eventually(|| !store.deletes().is_empty()).await;
    let del = &h.store.deletes()[0];
    assert_eq!((del.name.as_str(), del.uid.as_deref(), del.grace_seconds), ("done", Some("uid-done"), Some(0)));
    h.stop().await;
}

#[tokio::test]
async fn edge_pod_delete_uses_uid_precondition() {
    let store = MemoryStore::new();
    store.put_pod(Pod { metadata: meta("ns", "p"), ..Default::default() });
    let h = Harness::start(store);
    h.edge_sends("node/edge-1/ns/pod/p", Operation::Delete, json!("uid-other")).await;
    h.edge_sends("node/edge-1/ns/pod/p", Operation::Delete, json!("uid-p")).await;

    let store = h.store.clone();
    eventually(|| store.pod("ns", "p").is_none()).await;
    assert_eq!(h.store.deletes().len(), 1);
    h.stop().await;
}

#[tokio::test]
async fn malformed_messages_do_not_stop_intake() {
    let store = MemoryStore::new();
    store.put_node(node("edge-1"));
    let h = Harness::start(store);
    h.edge_sends("garbage", Operation::Update, json!({})).await;
    h.edge_sends("node/edge-1/ns/rule/r", Operation::Update, json!({})).await;
    h.edge_sends("node/edge-1/default/node/edge-1", Operation::Query, serde_json::Value::Null).await;
    let resp = h.next_to_hub().await;
    let got: Node = resp.content_as().unwrap();
    assert_eq!(got.metadata.name.as_deref(), Some("edge-1"));
    h.stop().await;
}
