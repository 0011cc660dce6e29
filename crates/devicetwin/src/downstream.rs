//! Device CRD events turned into membership and twin messages for the bound node.

use std::collections::BTreeMap;
use std::sync::Arc;

use kedge_bus::MessageLayer;
use kedge_core::constants::*;
use kedge_core::{resource, Message, Operation};
use kedge_kubehub::crd::{Device, DeviceModel, Twin};
use kedge_kubehub::Event;
use kube::ResourceExt;
use metrics::counter;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::types::{BaseMessage, DeviceTwinUpdate, EdgeDevice, MembershipUpdate, MsgTwin, TWIN_DEFAULT_TYPE, TWIN_DELETED};

const DESCRIPTION_LABEL: &str = "description";

/// Resource version as the cloud twin version; unparsable versions count as 0.
fn cloud_version(device: &Device) -> i64 {
    let rv = device.resource_version().unwrap_or_default();
    match rv.parse::<i64>() {
        Ok(v) => v,
        Err(_) => {
            warn!(device = %device.name_any(), rv = %rv, "resource version is not numeric");
            0
        }
    }
}

fn desired(twin: &Twin) -> (String, String) {
    match twin.desired.as_ref() {
        Some(d) => (
            d.value.clone(),
            d.metadata.get("type").cloned().unwrap_or_else(|| TWIN_DEFAULT_TYPE.to_string()),
        ),
        None => (String::new(), TWIN_DEFAULT_TYPE.to_string()),
    }
}

/// Every twin of `device` as an expected value.
pub fn expected_twins(device: &Device) -> BTreeMap<String, MsgTwin> {
    let version = cloud_version(device);
    device
        .twins()
        .iter()
        .map(|t| {
            let (value, kind) = desired(t);
            (t.property_name.clone(), MsgTwin::expected(&value, &kind, version))
        })
        .collect()
}

/// Expected values for the new twin set plus tombstones for properties that disappeared.
pub fn twin_delta(old: &Device, new: &Device) -> BTreeMap<String, MsgTwin> {
    let version = cloud_version(new);
    let mut out = expected_twins(new);
    for gone in old.twins().iter().filter(|t| !new.twins().iter().any(|n| n.property_name == t.property_name)) {
        let (value, _) = desired(gone);
        out.insert(gone.property_name.clone(), MsgTwin::expected(&value, TWIN_DELETED, version));
    }
    out
}

/// Same properties with the same desired values; reported values are edge-owned and ignored.
pub fn desired_unchanged(old: &Device, new: &Device) -> bool {
    let key = |t: &Twin| (t.property_name.clone(), t.desired.clone());
    old.twins().iter().map(key).eq(new.twins().iter().map(key))
}

pub fn edge_device(device: &Device) -> EdgeDevice {
    EdgeDevice {
        id: device.name_any(),
        name: device.name_any(),
        description: device.labels().get(DESCRIPTION_LABEL).cloned().unwrap_or_default(),
        twin: expected_twins(device),
    }
}

fn build<T: Serialize>(resource: Result<String, resource::PathError>, op: Operation, content: &T) -> Option<Message> {
    let target = match resource {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "cannot address device message");
            return None;
        }
    };
    match Message::new().build_router(MODULE_DEVICE_CONTROLLER, GROUP_TWIN, target, op).fill_typed(content) {
        Ok(m) => Some(m),
        Err(e) => {
            warn!(error = %e, "cannot encode device message");
            None
        }
    }
}

fn skipped(reason: &'static str) {
    counter!("downstream_skipped_total", 1u64, "kind" => "device", "reason" => reason);
}

pub struct DeviceDownstream {
    layer: Arc<dyn MessageLayer>,
}

impl DeviceDownstream {
    pub fn new(layer: Arc<dyn MessageLayer>) -> Self {
        Self { layer }
    }

    pub fn on_device(&self, ev: Event<Device>) -> Vec<Message> {
        match ev {
            Event::Added(d) | Event::Modified { old: None, new: d } => self.added(&d),
            Event::Modified { old: Some(old), new } => self.updated(&old, &new),
            Event::Deleted(d) => self.deleted(&d),
        }
    }

    /// Models are only cached; devices carry everything the edge needs.
    pub fn on_device_model(&self, ev: Event<DeviceModel>) -> Vec<Message> {
        debug!(model = %ev.object().name_any(), event = ev.type_label(), "device model cached");
        Vec::new()
    }

    fn added(&self, device: &Device) -> Vec<Message> {
        let Some(node) = device.bound_node() else {
            warn!(device = %device.name_any(), "device has no node binding; skipped");
            skipped("unbound");
            return Vec::new();
        };
        let membership = MembershipUpdate { base: BaseMessage::fresh(), added: vec![edge_device(device)], removed: Vec::new() };
        let mut out: Vec<Message> = build(resource::membership_resource(node), Operation::Update, &membership).into_iter().collect();
        out.extend(build(
            resource::build_device_resource(node, RESOURCE_TYPE_DEVICE, &device.name_any()),
            Operation::Insert,
            device,
        ));
        info!(device = %device.name_any(), node, "device added to node");
        out
    }

    fn deleted(&self, device: &Device) -> Vec<Message> {
        let Some(node) = device.bound_node() else {
            skipped("unbound");
            return Vec::new();
        };
        let membership = MembershipUpdate { base: BaseMessage::fresh(), added: Vec::new(), removed: vec![edge_device(device)] };
        let mut out: Vec<Message> = build(resource::membership_resource(node), Operation::Update, &membership).into_iter().collect();
        out.extend(build(
            resource::build_device_resource(node, RESOURCE_TYPE_DEVICE, &device.name_any()),
            Operation::Delete,
            device,
        ));
        info!(device = %device.name_any(), node, "device removed from node");
        out
    }

    fn updated(&self, old: &Device, new: &Device) -> Vec<Message> {
        if old.bound_node() != new.bound_node() {
            let mut out = self.deleted(old);
            out.extend(self.added(new));
            return out;
        }
        if desired_unchanged(old, new) {
            skipped("twins_unchanged");
            return Vec::new();
        }
        let Some(node) = new.bound_node() else {
            skipped("unbound");
            return Vec::new();
        };
        let update = DeviceTwinUpdate { base: BaseMessage::fresh(), twin: twin_delta(old, new) };
        debug!(device = %new.name_any(), node, properties = update.twin.len(), "twin update");
        build(resource::twin_resource(node, &new.name_any(), TWIN_CLOUD_UPDATED), Operation::Update, &update)
            .into_iter()
            .collect()
    }

    pub async fn dispatch(&self, msgs: Vec<Message>, cancel: &CancellationToken) -> bool {
        for msg in msgs {
            let resource = msg.resource().to_string();
            let sent = tokio::select! {
                _ = cancel.cancelled() => return false,
                res = self.layer.send(msg) => res,
            };
            match sent {
                Ok(()) => counter!("downstream_messages_total", 1u64, "kind" => "device"),
                Err(e) => warn!(resource = %resource, error = %e, "device message not sent"),
            }
        }
        true
    }

    /// Consume device and model events until cancelled or both informers are gone.
    pub async fn run(
        self,
        mut devices: mpsc::Receiver<Event<Device>>,
        mut models: mpsc::Receiver<Event<DeviceModel>>,
        cancel: CancellationToken,
    ) {
        let (mut devices_open, mut models_open) = (true, true);
        while devices_open || models_open {
            let msgs = tokio::select! {
                _ = cancel.cancelled() => break,
                ev = devices.recv(), if devices_open => match ev {
                    Some(ev) => self.on_device(ev),
                    None => { devices_open = false; continue; }
                },
                ev = models.recv(), if models_open => match ev {
                    Some(ev) => self.on_device_model(ev),
                    None => { models_open = false; continue; }
                },
            };
            if !self.dispatch(msgs, &cancel).await {
                break;
            }
        }
        debug!("device downstream stopped");
    }
}
