use serde::{Deserialize, Serialize};

/// Channel capacities per resource kind.
///
/// Upstream request kinds buffer generously; informer event channels default
/// to 1 so a slow dispatcher pushes back on its informer immediately.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChannelCapacities {
    pub update_pod_status: usize,
    pub update_node_status: usize,
    pub query_configmap: usize,
    pub query_secret: usize,
    pub query_service: usize,
    pub query_endpoints: usize,
    pub query_node: usize,
    pub update_node: usize,
    pub delete_pod: usize,
    pub update_device_status: usize,
    pub pod_event: usize,
    pub configmap_event: usize,
    pub secret_event: usize,
    pub service_event: usize,
    pub endpoints_event: usize,
    pub node_event: usize,
    pub device_event: usize,
    pub device_model_event: usize,
    /// Inbox of each module registered on the bus.
    pub module_inbox: usize,
}

impl Default for ChannelCapacities {
    fn default() -> Self {
        Self {
            update_pod_status: 1024,
            update_node_status: 1024,
            query_configmap: 1024,
            query_secret: 1024,
            query_service: 1024,
            query_endpoints: 1024,
            query_node: 1024,
            update_node: 1024,
            delete_pod: 1024,
            update_device_status: 1024,
            pod_event: 1,
            configmap_event: 1,
            secret_event: 1,
            service_event: 1,
            endpoints_event: 1,
            node_event: 1,
            device_event: 1,
            device_model_event: 1,
            module_inbox: 1024,
        }
    }
}
