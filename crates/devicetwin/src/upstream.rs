//! Edge twin reports merged into device status.

use std::collections::BTreeMap;
use std::sync::Arc;

use kedge_bus::{BusError, MessageLayer};
use kedge_core::constants::*;
use kedge_core::{resource, ContentError, Message, PathError};
use kedge_kubehub::crd::{Device, DeviceStatus, Twin, TwinProperty};
use kedge_kubehub::ObjectCache;
use kedge_ops::ResourceStore;
use metrics::counter;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::types::{DeviceTwinUpdate, MsgTwin};

#[derive(Debug, Error)]
pub enum TwinError {
    #[error(transparent)]
    Path(#[from] PathError),
    #[error(transparent)]
    Content(#[from] ContentError),
    #[error("resource {0} is not handled by the device controller")]
    Unsupported(String),
}

/// A decoded `twin/edge_updated` report.
#[derive(Debug, Clone)]
pub struct TwinReport {
    pub msg: Message,
    pub node_id: String,
    pub device_id: String,
    pub update: DeviceTwinUpdate,
}

/// Classify a message received by the device controller.
pub fn classify(msg: Message) -> Result<Option<TwinReport>, TwinError> {
    if msg.is_response() {
        debug!(parent = %msg.parent_id(), content = %msg.content, "edge acknowledged device message");
        return Ok(None);
    }
    let device_id = resource::device_id(msg.resource())?.to_string();
    let suffix = format!("/{RESOURCE_TYPE_TWIN}/{TWIN_EDGE_UPDATED}");
    if !msg.resource().ends_with(&suffix) {
        return Err(TwinError::Unsupported(msg.resource().to_string()));
    }
    let node_id = resource::node_id(msg.resource())?.to_string();
    let update: DeviceTwinUpdate = msg.content_as()?;
    let mut msg = msg;
    msg.content = serde_json::Value::Null;
    Ok(Some(TwinReport { msg, node_id, device_id, update }))
}

/// Fold reported values into `status`, creating a twin entry for properties not yet listed.
/// Properties without an actual value are left alone. Returns how many twins changed.
pub fn merge_reported(status: &mut DeviceStatus, twins: &BTreeMap<String, MsgTwin>) -> usize {
    let mut merged = 0;
    for (name, twin) in twins {
        let Some(value) = twin.actual_value() else { continue };
        let mut metadata = BTreeMap::new();
        if let Some(meta) = twin.actual.as_ref().and_then(|a| a.metadata.as_ref()) {
            metadata.insert("timestamp".to_string(), meta.timestamp.to_string());
        }
        if let Some(meta) = twin.metadata.as_ref() {
            metadata.insert("type".to_string(), meta.kind.clone());
        }
        let reported = Some(TwinProperty { value: value.to_string(), metadata });
        match status.twins.iter().position(|t| &t.property_name == name) {
            Some(i) => status.twins[i].reported = reported,
            None => status.twins.push(Twin { property_name: name.clone(), desired: None, reported }),
        }
        merged += 1;
    }
    merged
}

#[derive(Clone)]
pub struct TwinHandler {
    store: Arc<dyn ResourceStore>,
    layer: Arc<dyn MessageLayer>,
    devices: ObjectCache<Device>,
}

impl TwinHandler {
    pub fn new(store: Arc<dyn ResourceStore>, layer: Arc<dyn MessageLayer>, devices: ObjectCache<Device>) -> Self {
        Self { store, layer, devices }
    }

    pub async fn handle(&self, report: TwinReport) {
        let Some(((ns, name), device)) = self.devices.find_name(&report.device_id) else {
            warn!(msg_id = %report.msg.id(), device = %report.device_id, "reported device is not cached; dropped");
            counter!("upstream_dropped_total", 1u64, "reason" => "unknown_device");
            return;
        };
        let mut status = device.status.clone().unwrap_or_default();
        let merged = merge_reported(&mut status, &report.update.twin);
        if merged == 0 {
            debug!(msg_id = %report.msg.id(), ns = %ns, device = %name, "report carried no values; nothing to patch");
            return;
        }

        // The informer echo of this patch must compare equal to the cache.
        self.devices.update(&ns, &name, |d| d.status = Some(status.clone()));

        let body = serde_json::json!({ "status": status });
        if let Err(e) = self.store.patch_device(&ns, &name, &body).await {
            warn!(msg_id = %report.msg.id(), ns = %ns, device = %name, error = %e, "device status patch failed");
            return;
        }
        debug!(msg_id = %report.msg.id(), ns = %ns, device = %name, merged, "device status patched");

        let target = match resource::build_device_resource(&report.node_id, RESOURCE_TYPE_TWIN, "") {
            Ok(r) => r,
            Err(e) => {
                warn!(msg_id = %report.msg.id(), error = %e, "cannot address twin response");
                return;
            }
        };
        let resp = Message::new_response(&report.msg, serde_json::Value::String(RESPONSE_OK.to_string()))
            .with_source(MODULE_DEVICE_CONTROLLER)
            .with_resource(target);
        if let Err(e) = self.layer.response(resp).await {
            warn!(msg_id = %report.msg.id(), error = %e, "twin response failed");
        }
    }
}

/// Intake plus a worker pool for device status reports.
pub struct DeviceUpstream {
    layer: Arc<dyn MessageLayer>,
    handler: TwinHandler,
    workers: usize,
    capacity: usize,
}

impl DeviceUpstream {
    pub fn new(handler: TwinHandler, layer: Arc<dyn MessageLayer>, workers: usize, capacity: usize) -> Self {
        Self { layer, handler, workers: workers.max(1), capacity: capacity.max(1) }
    }

    pub async fn run(self, cancel: CancellationToken) {
        let (tx, rx) = mpsc::channel::<TwinReport>(self.capacity);
        let rx = Arc::new(Mutex::new(rx));
        let mut pool = JoinSet::new();
        for _ in 0..self.workers {
            let rx = Arc::clone(&rx);
            let handler = self.handler.clone();
            pool.spawn(async move {
                loop {
                    let next = rx.lock().await.recv().await;
                    match next {
                        Some(report) => handler.handle(report).await,
                        None => break,
                    }
                }
            });
        }
        info!(workers = self.workers, "device upstream started");

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break,
                msg = self.layer.receive() => msg,
            };
            let msg = match next {
                Ok(m) => m,
                Err(BusError::Cancelled(_)) | Err(BusError::UnknownModule(_)) | Err(BusError::Closed(_)) => break,
                Err(e) => {
                    warn!(error = %e, "device receive failed");
                    continue;
                }
            };
            let id = msg.id().to_string();
            match classify(msg) {
                Ok(Some(report)) => {
                    counter!("upstream_messages_total", 1u64, "kind" => "update_device_status");
                    if tx.send(report).await.is_err() {
                        warn!(msg_id = %id, "device worker lane closed");
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    counter!("upstream_dropped_total", 1u64, "reason" => "unsupported");
                    warn!(msg_id = %id, error = %e, "device message dropped");
                }
            }
        }

        drop(tx);
        while pool.join_next().await.is_some() {}
        info!("device upstream stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kedge_core::Operation;
    use serde_json::json;

    #[test]
    fn only_edge_updates_are_accepted() {
        let ok = Message::new()
            .build_router("twin", GROUP_TWIN, "node/a/device/d1/twin/edge_updated", Operation::Update)
            .fill_body(json!({"twin": {}}));
        let report = classify(ok).unwrap().unwrap();
        assert_eq!((report.node_id.as_str(), report.device_id.as_str()), ("a", "d1"));

        let other = Message::new().build_router("twin", GROUP_TWIN, "node/a/device/d1/twin/get", Operation::Query);
        assert!(matches!(classify(other), Err(TwinError::Unsupported(_))));
        let membership = Message::new().build_router("twin", GROUP_TWIN, "node/a/membership", Operation::Query);
        assert!(matches!(classify(membership), Err(TwinError::Path(_))));
    }

    #[test]
    fn unlisted_properties_are_created_and_valueless_ones_ignored() {
        let mut status = DeviceStatus {
            twins: vec![Twin { property_name: "t".into(), ..Default::default() }, Twin { property_name: "h".into(), ..Default::default() }],
        };
        let twins: BTreeMap<String, MsgTwin> = serde_json::from_value(json!({
            "t": {"actual": {"value": "1"}},
            "h": {"metadata": {"type": "int"}},
            "x": {"actual": {"value": "9"}}
        }))
        .unwrap();
        assert_eq!(merge_reported(&mut status, &twins), 2);
        assert_eq!(status.twins[0].reported.as_ref().unwrap().value, "1");
        assert!(status.twins[0].reported.as_ref().unwrap().metadata.is_empty());
        assert!(status.twins[1].reported.is_none());
        assert_eq!(status.twins.len(), 3);
        assert_eq!(status.twins[2].property_name, "x");
        assert!(status.twins[2].desired.is_none());
        assert_eq!(status.twins[2].reported.as_ref().unwrap().value, "9");
    }
}
