//! Well-known names shared by the hub and the controllers.

// Groups
pub const GROUP_RESOURCE: &str = "resource";
pub const GROUP_TWIN: &str = "twin";

// Sources / module names
pub const MODULE_CLOUDHUB: &str = "cloudhub";
pub const MODULE_EDGE_CONTROLLER: &str = "edgecontroller";
pub const MODULE_DEVICE_CONTROLLER: &str = "devicecontroller";

// Resource types
pub const RESOURCE_NODE: &str = "node";
pub const RESOURCE_TYPE_POD: &str = "pod";
pub const RESOURCE_TYPE_CONFIGMAP: &str = "configmap";
pub const RESOURCE_TYPE_SECRET: &str = "secret";
pub const RESOURCE_TYPE_SERVICE: &str = "service";
pub const RESOURCE_TYPE_ENDPOINTS: &str = "endpoints";
pub const RESOURCE_TYPE_NODE: &str = "node";
pub const RESOURCE_TYPE_POD_STATUS: &str = "podstatus";
pub const RESOURCE_TYPE_NODE_STATUS: &str = "nodestatus";
pub const RESOURCE_TYPE_SERVICE_LIST: &str = "servicelist";
pub const RESOURCE_TYPE_ENDPOINTS_LIST: &str = "endpointslist";
pub const RESOURCE_TYPE_POD_LIST: &str = "podlist";
pub const RESOURCE_TYPE_MEMBERSHIP: &str = "membership";
pub const RESOURCE_TYPE_DEVICE: &str = "device";
pub const RESOURCE_TYPE_TWIN: &str = "twin";

// Twin sub-types under node/<n>/device/<id>/twin/<sub>
pub const TWIN_CLOUD_UPDATED: &str = "cloud_updated";
pub const TWIN_EDGE_UPDATED: &str = "edge_updated";

/// Label that marks a node as an edge node.
pub const EDGE_NODE_LABEL: &str = "node-role.kubernetes.io/edge";

/// Reply content for a successful upstream request.
pub const RESPONSE_OK: &str = "OK";

/// Extended resource name reserved for GPUs and the annotation it is mirrored into.
pub const GPU_RESOURCE_NAME: &str = "nvidia.com/gpu";
pub const GPU_STATUS_ANNOTATION: &str = "huawei.com/gpu-status";
