//! Kedge devicetwin – the device controller module.
//!
//! Device CRDs are mirrored to their bound node as membership and twin
//! messages; twin values reported by the edge are merged back into the
//! device status.

#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::Result;
use kedge_bus::{ChannelCapacities, ContextMessageLayer, ContextModules, MessageBus, MessageLayer};
use kedge_core::constants::{MODULE_CLOUDHUB, MODULE_DEVICE_CONTROLLER};
use kedge_kubehub::crd::{Device, DeviceModel};
use kedge_kubehub::informer::scoped_api;
use kedge_kubehub::{join_informer, spawn_informer, ObjectCache, Watched};
use kedge_ops::ResourceStore;
use kube::runtime::watcher;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::info;

pub mod downstream;
pub mod types;
pub mod upstream;

pub use downstream::DeviceDownstream;
pub use upstream::{DeviceUpstream, TwinHandler};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub modules: ContextModules,
    pub capacities: ChannelCapacities,
    pub update_device_status_workers: usize,
    /// Namespace to watch; `None` watches all.
    pub namespace: Option<String>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            modules: ContextModules {
                send: MODULE_CLOUDHUB.to_string(),
                receive: MODULE_DEVICE_CONTROLLER.to_string(),
                response: MODULE_CLOUDHUB.to_string(),
            },
            capacities: ChannelCapacities::default(),
            update_device_status_workers: 1,
            namespace: None,
        }
    }
}

pub struct DeviceController {
    client: kube::Client,
    store: Arc<dyn ResourceStore>,
    bus: MessageBus,
    config: DeviceConfig,
}

impl DeviceController {
    pub fn new(client: kube::Client, store: Arc<dyn ResourceStore>, bus: MessageBus, config: DeviceConfig) -> Self {
        Self { client, store, bus, config }
    }
}

#[async_trait::async_trait]
impl kedge_registry::Module for DeviceController {
    fn name(&self) -> &str {
        MODULE_DEVICE_CONTROLLER
    }

    fn group(&self) -> &str {
        MODULE_DEVICE_CONTROLLER
    }

    async fn start(&self, cancel: CancellationToken) -> Result<()> {
        let layer: Arc<dyn MessageLayer> = Arc::new(ContextMessageLayer::new(self.bus.clone(), self.config.modules.clone()));
        let ns = self.config.namespace.as_deref();
        let caps = &self.config.capacities;
        let devices = ObjectCache::<Device>::new();

        let (device_events, device_informer) = spawn_informer(
            scoped_api::<Device>(self.client.clone(), ns),
            watcher::Config::default(),
            devices.clone(),
            caps.device_event,
            cancel.clone(),
        );
        let (model_events, model_informer) = spawn_informer(
            scoped_api::<DeviceModel>(self.client.clone(), ns),
            watcher::Config::default(),
            ObjectCache::new(),
            caps.device_model_event,
            cancel.clone(),
        );

        let downstream = DeviceDownstream::new(Arc::clone(&layer));
        let handler = TwinHandler::new(Arc::clone(&self.store), Arc::clone(&layer), devices);
        let upstream = DeviceUpstream::new(handler, layer, self.config.update_device_status_workers, caps.update_device_status);
        info!(namespace = ?self.config.namespace, "device controller started");

        tokio::join!(
            downstream.run(device_events, model_events, cancel.clone()),
            upstream.run(cancel.clone()),
        );
        tokio::join!(
            join_informer(<Device as Watched>::KIND, device_informer),
            join_informer(<DeviceModel as Watched>::KIND, model_informer),
        );
        info!("device controller stopped");
        Ok(())
    }

    async fn stop(&self) {
        self.bus.cleanup(&self.config.modules.receive);
    }
}
