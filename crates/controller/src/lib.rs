//! Kedge controller – the edge controller module.
//!
//! Downstream, informer events are fanned out to the edge nodes that own the
//! objects. Upstream, edge reports and queries are classified and written to
//! the store through bounded worker pools.

#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::Result;
use k8s_openapi::api::core::v1::{ConfigMap, Endpoints, Node, Pod, Secret, Service};
use kedge_bus::{ContextMessageLayer, MessageBus, MessageLayer};
use kedge_core::constants::{EDGE_NODE_LABEL, MODULE_EDGE_CONTROLLER};
use kedge_kubehub::informer::scoped_api;
use kedge_kubehub::{join_informer, spawn_informer, ObjectCache, Watched};
use kedge_ops::ResourceStore;
use kedge_store::LocationCache;
use kube::api::Api;
use kube::runtime::watcher;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub mod config;
pub mod downstream;
pub mod normalize;
pub mod upstream;

pub use config::{ControllerConfig, WorkerCounts};
pub use downstream::{Downstream, DownstreamCaches, DownstreamStreams};
pub use upstream::UpstreamController;

pub struct EdgeController {
    client: kube::Client,
    store: Arc<dyn ResourceStore>,
    bus: MessageBus,
    location: Arc<LocationCache>,
    config: Arc<ControllerConfig>,
}

impl EdgeController {
    pub fn new(
        client: kube::Client,
        store: Arc<dyn ResourceStore>,
        bus: MessageBus,
        location: Arc<LocationCache>,
        config: ControllerConfig,
    ) -> Self {
        Self { client, store, bus, location, config: Arc::new(config) }
    }

    fn streams(
        &self,
        caches: &DownstreamCaches,
        set: &mut JoinSet<()>,
        cancel: &CancellationToken,
    ) -> DownstreamStreams {
        let ns = self.config.namespace.as_deref();
        let caps = &self.config.capacities;
        let client = self.client.clone();

        let (pods, h) = spawn_informer(
            scoped_api::<Pod>(client.clone(), ns),
            watcher::Config::default(),
            caches.pods.clone(),
            caps.pod_event,
            cancel.clone(),
        );
        set.spawn(join_informer(<Pod as Watched>::KIND, h));
        let (configmaps, h) = spawn_informer(
            scoped_api::<ConfigMap>(client.clone(), ns),
            watcher::Config::default(),
            ObjectCache::new(),
            caps.configmap_event,
            cancel.clone(),
        );
        set.spawn(join_informer(<ConfigMap as Watched>::KIND, h));
        let (secrets, h) = spawn_informer(
            scoped_api::<Secret>(client.clone(), ns),
            watcher::Config::default(),
            ObjectCache::new(),
            caps.secret_event,
            cancel.clone(),
        );
        set.spawn(join_informer(<Secret as Watched>::KIND, h));
        let (nodes, h) = spawn_informer(
            Api::<Node>::all(client.clone()),
            watcher::Config::default().labels(EDGE_NODE_LABEL),
            ObjectCache::new(),
            caps.node_event,
            cancel.clone(),
        );
        set.spawn(join_informer(<Node as Watched>::KIND, h));
        let (services, h) = spawn_informer(
            scoped_api::<Service>(client.clone(), ns),
            watcher::Config::default(),
            caches.services.clone(),
            caps.service_event,
            cancel.clone(),
        );
        set.spawn(join_informer(<Service as Watched>::KIND, h));
        let (endpoints, h) = spawn_informer(
            scoped_api::<Endpoints>(client, ns),
            watcher::Config::default(),
            caches.endpoints.clone(),
            caps.endpoints_event,
            cancel.clone(),
        );
        set.spawn(join_informer(<Endpoints as Watched>::KIND, h));

        DownstreamStreams { pods, configmaps, secrets, nodes, services, endpoints }
    }
}

#[async_trait::async_trait]
impl kedge_registry::Module for EdgeController {
    fn name(&self) -> &str {
        MODULE_EDGE_CONTROLLER
    }

    fn group(&self) -> &str {
        MODULE_EDGE_CONTROLLER
    }

    async fn start(&self, cancel: CancellationToken) -> Result<()> {
        let layer: Arc<dyn MessageLayer> = Arc::new(ContextMessageLayer::new(self.bus.clone(), self.config.modules.clone()));
        let caches = DownstreamCaches::default();
        let downstream = Arc::new(Downstream::new(Arc::clone(&layer), Arc::clone(&self.location), caches.clone()));
        downstream.initial_locating(self.store.as_ref()).await?;

        let mut tasks = JoinSet::new();
        let streams = self.streams(&caches, &mut tasks, &cancel);
        downstream.spawn(&mut tasks, streams, &cancel);

        let upstream = UpstreamController::new(Arc::clone(&self.store), layer, Arc::clone(&self.config));
        tasks.spawn(upstream.run(cancel.clone()));
        info!(namespace = ?self.config.namespace, "edge controller started");

        while let Some(res) = tasks.join_next().await {
            if let Err(e) = res {
                error!(error = %e, panicked = e.is_panic(), "edge controller task failed");
            }
        }
        info!("edge controller stopped");
        Ok(())
    }

    async fn stop(&self) {
        self.bus.cleanup(&self.config.modules.receive);
    }
}
