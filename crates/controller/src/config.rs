use std::time::Duration;

use kedge_bus::{ChannelCapacities, ContextModules};
use serde::{Deserialize, Serialize};

/// Workers per upstream kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkerCounts {
    pub update_pod_status: usize,
    pub update_node_status: usize,
    pub query_configmap: usize,
    pub query_secret: usize,
    pub query_service: usize,
    pub query_endpoints: usize,
    pub query_node: usize,
    pub update_node: usize,
    pub delete_pod: usize,
}

impl Default for WorkerCounts {
    fn default() -> Self {
        Self {
            update_pod_status: 1,
            update_node_status: 1,
            query_configmap: 4,
            query_secret: 4,
            query_service: 4,
            query_endpoints: 4,
            query_node: 4,
            update_node: 1,
            delete_pod: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    pub modules: ContextModules,
    pub capacities: ChannelCapacities,
    pub workers: WorkerCounts,
    /// Keep edge-reported heartbeat times as they are.
    pub edge_site: bool,
    /// Heartbeats older than this are rewritten to now.
    pub node_update_frequency: Duration,
    /// Namespace to watch; `None` watches all.
    pub namespace: Option<String>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            modules: ContextModules::default(),
            capacities: ChannelCapacities::default(),
            workers: WorkerCounts::default(),
            edge_site: false,
            node_update_frequency: Duration::from_secs(10),
            namespace: None,
        }
    }
}
