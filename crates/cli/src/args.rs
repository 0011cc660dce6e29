use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser};
use kedge_bus::{ChannelCapacities, ContextModules};
use kedge_controller::{ControllerConfig, WorkerCounts};
use kedge_core::constants::{MODULE_CLOUDHUB, MODULE_DEVICE_CONTROLLER, MODULE_EDGE_CONTROLLER};
use kedge_devicetwin::DeviceConfig;
use kedge_hub::{HubConfig, TlsFiles};
use kedge_kubehub::KubeSettings;

#[derive(Parser, Debug)]
#[command(name = "cloudcore", version, about = "Cloud side of the Kedge edge fabric")]
pub struct Cli {
    #[command(flatten)]
    pub hub: HubArgs,
    #[command(flatten)]
    pub kube: KubeArgs,
    #[command(flatten)]
    pub controller: ControllerArgs,
    #[command(flatten)]
    pub channels: ChannelArgs,
    #[command(flatten)]
    pub workers: WorkerArgs,
}

#[derive(Args, Debug)]
pub struct HubArgs {
    /// WebSocket listen address
    #[arg(long, env = "CLOUDCORE_ADDRESS", default_value = "0.0.0.0:10000")]
    pub address: SocketAddr,
    /// Workload and liveness endpoints
    #[arg(long, env = "CLOUDCORE_HTTP_ADDRESS", default_value = "0.0.0.0:10002")]
    pub http_address: SocketAddr,
    /// Maximum concurrently connected nodes
    #[arg(long, env = "CLOUDCORE_NODE_LIMIT", default_value_t = 1000)]
    pub node_limit: usize,
    /// Seconds between keepalive pings
    #[arg(long, env = "CLOUDCORE_KEEPALIVE_INTERVAL", default_value_t = 30)]
    pub keepalive_interval: u64,
    /// Seconds a frame write may take
    #[arg(long, env = "CLOUDCORE_WRITE_TIMEOUT", default_value_t = 10)]
    pub write_timeout: u64,
    /// Seconds a TLS handshake may take
    #[arg(long, env = "CLOUDCORE_HANDSHAKE_TIMEOUT", default_value_t = 30)]
    pub handshake_timeout: u64,
    /// Per-node outbound queue capacity
    #[arg(long, env = "CLOUDCORE_OUTBOUND_QUEUE", default_value_t = 1024)]
    pub outbound_queue: usize,
    /// CA bundle for client certificates (PEM)
    #[arg(long, env = "CLOUDCORE_CA")]
    pub ca: PathBuf,
    /// Server certificate chain (PEM)
    #[arg(long, env = "CLOUDCORE_CERT")]
    pub cert: PathBuf,
    /// Server private key (PEM)
    #[arg(long, env = "CLOUDCORE_KEY")]
    pub key: PathBuf,
}

impl HubArgs {
    pub fn config(&self) -> HubConfig {
        HubConfig {
            address: self.address,
            http_address: self.http_address,
            node_limit: self.node_limit,
            keepalive_interval: Duration::from_secs(self.keepalive_interval),
            write_timeout: Duration::from_secs(self.write_timeout),
            handshake_timeout: Duration::from_secs(self.handshake_timeout),
            outbound_queue: self.outbound_queue,
        }
    }

    pub fn tls_files(&self) -> TlsFiles {
        TlsFiles { ca: self.ca.clone(), cert: self.cert.clone(), key: self.key.clone() }
    }
}

#[derive(Args, Debug)]
pub struct KubeArgs {
    /// API server URL; overrides the kubeconfig cluster
    #[arg(long = "kube-master", env = "CLOUDCORE_KUBE_MASTER")]
    pub master: Option<String>,
    #[arg(long = "kube-kubeconfig", env = "CLOUDCORE_KUBE_KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,
    /// Namespace to watch (default: all)
    #[arg(long = "kube-namespace", env = "CLOUDCORE_KUBE_NAMESPACE")]
    pub namespace: Option<String>,
    #[arg(long = "kube-content-type", env = "CLOUDCORE_KUBE_CONTENT_TYPE", default_value = "application/vnd.kubernetes.protobuf")]
    pub content_type: String,
    #[arg(long = "kube-qps", env = "CLOUDCORE_KUBE_QPS", default_value_t = 100.0)]
    pub qps: f32,
    #[arg(long = "kube-burst", env = "CLOUDCORE_KUBE_BURST", default_value_t = 200)]
    pub burst: u32,
    /// Seconds after which an edge heartbeat is considered stale
    #[arg(long = "kube-node-update-frequency", env = "CLOUDCORE_KUBE_NODE_UPDATE_FREQUENCY", default_value_t = 10)]
    pub node_update_frequency: u64,
}

impl KubeArgs {
    pub fn settings(&self) -> KubeSettings {
        KubeSettings {
            master: self.master.clone(),
            kubeconfig: self.kubeconfig.clone(),
            namespace: self.namespace.clone(),
            content_type: self.content_type.clone(),
            qps: self.qps,
            burst: self.burst,
        }
    }
}

#[derive(Args, Debug)]
pub struct ControllerArgs {
    /// Keep heartbeat times reported by edge nodes unchanged
    #[arg(long, env = "CLOUDCORE_EDGE_SITE")]
    pub edge_site: bool,
    #[arg(long, env = "CLOUDCORE_SEND_MODULE", default_value = MODULE_CLOUDHUB)]
    pub send_module: String,
    #[arg(long, env = "CLOUDCORE_RECEIVE_MODULE", default_value = MODULE_EDGE_CONTROLLER)]
    pub receive_module: String,
    #[arg(long, env = "CLOUDCORE_RESPONSE_MODULE", default_value = MODULE_CLOUDHUB)]
    pub response_module: String,
}

impl ControllerArgs {
    pub fn modules(&self) -> ContextModules {
        ContextModules {
            send: self.send_module.clone(),
            receive: self.receive_module.clone(),
            response: self.response_module.clone(),
        }
    }
}

#[derive(Args, Debug)]
pub struct ChannelArgs {
    #[arg(long, env = "CLOUDCORE_UPDATE_POD_STATUS_BUFFER", default_value_t = 1024)]
    pub update_pod_status_buffer: usize,
    #[arg(long, env = "CLOUDCORE_UPDATE_NODE_STATUS_BUFFER", default_value_t = 1024)]
    pub update_node_status_buffer: usize,
    #[arg(long, env = "CLOUDCORE_QUERY_CONFIGMAP_BUFFER", default_value_t = 1024)]
    pub query_configmap_buffer: usize,
    #[arg(long, env = "CLOUDCORE_QUERY_SECRET_BUFFER", default_value_t = 1024)]
    pub query_secret_buffer: usize,
    #[arg(long, env = "CLOUDCORE_QUERY_SERVICE_BUFFER", default_value_t = 1024)]
    pub query_service_buffer: usize,
    #[arg(long, env = "CLOUDCORE_QUERY_ENDPOINTS_BUFFER", default_value_t = 1024)]
    pub query_endpoints_buffer: usize,
    #[arg(long, env = "CLOUDCORE_UPDATE_DEVICE_STATUS_BUFFER", default_value_t = 1024)]
    pub update_device_status_buffer: usize,
    #[arg(long, env = "CLOUDCORE_POD_EVENT_BUFFER", default_value_t = 1)]
    pub pod_event_buffer: usize,
    #[arg(long, env = "CLOUDCORE_CONFIGMAP_EVENT_BUFFER", default_value_t = 1)]
    pub configmap_event_buffer: usize,
    #[arg(long, env = "CLOUDCORE_SECRET_EVENT_BUFFER", default_value_t = 1)]
    pub secret_event_buffer: usize,
    #[arg(long, env = "CLOUDCORE_SERVICE_EVENT_BUFFER", default_value_t = 1)]
    pub service_event_buffer: usize,
    #[arg(long, env = "CLOUDCORE_ENDPOINTS_EVENT_BUFFER", default_value_t = 1)]
    pub endpoints_event_buffer: usize,
    #[arg(long, env = "CLOUDCORE_NODE_EVENT_BUFFER", default_value_t = 1)]
    pub node_event_buffer: usize,
    #[arg(long, env = "CLOUDCORE_DEVICE_EVENT_BUFFER", default_value_t = 1)]
    pub device_event_buffer: usize,
    #[arg(long, env = "CLOUDCORE_DEVICE_MODEL_EVENT_BUFFER", default_value_t = 1)]
    pub device_model_event_buffer: usize,
    /// Inbox capacity of each bus module
    #[arg(long, env = "CLOUDCORE_MODULE_INBOX", default_value_t = 1024)]
    pub module_inbox: usize,
}

impl ChannelArgs {
    pub fn capacities(&self) -> ChannelCapacities {
        ChannelCapacities {
            update_pod_status: self.update_pod_status_buffer,
            update_node_status: self.update_node_status_buffer,
            query_configmap: self.query_configmap_buffer,
            query_secret: self.query_secret_buffer,
            query_service: self.query_service_buffer,
            query_endpoints: self.query_endpoints_buffer,
            update_device_status: self.update_device_status_buffer,
            pod_event: self.pod_event_buffer,
            configmap_event: self.configmap_event_buffer,
            secret_event: self.secret_event_buffer,
            service_event: self.service_event_buffer,
            endpoints_event: self.endpoints_event_buffer,
            node_event: self.node_event_buffer,
            device_event: self.device_event_buffer,
            device_model_event: self.device_model_event_buffer,
            module_inbox: self.module_inbox,
            ..ChannelCapacities::default()
        }
    }
}

#[derive(Args, Debug)]
pub struct WorkerArgs {
    #[arg(long, env = "CLOUDCORE_UPDATE_POD_STATUS_WORKERS", default_value_t = 1)]
    pub update_pod_status_workers: usize,
    #[arg(long, env = "CLOUDCORE_UPDATE_NODE_STATUS_WORKERS", default_value_t = 1)]
    pub update_node_status_workers: usize,
    #[arg(long, env = "CLOUDCORE_QUERY_CONFIGMAP_WORKERS", default_value_t = 4)]
    pub query_configmap_workers: usize,
    #[arg(long, env = "CLOUDCORE_QUERY_SECRET_WORKERS", default_value_t = 4)]
    pub query_secret_workers: usize,
    #[arg(long, env = "CLOUDCORE_QUERY_SERVICE_WORKERS", default_value_t = 4)]
    pub query_service_workers: usize,
    #[arg(long, env = "CLOUDCORE_QUERY_ENDPOINTS_WORKERS", default_value_t = 4)]
    pub query_endpoints_workers: usize,
    #[arg(long, env = "CLOUDCORE_UPDATE_DEVICE_STATUS_WORKERS", default_value_t = 1)]
    pub update_device_status_workers: usize,
}

impl WorkerArgs {
    pub fn counts(&self) -> WorkerCounts {
        WorkerCounts {
            update_pod_status: self.update_pod_status_workers,
            update_node_status: self.update_node_status_workers,
            query_configmap: self.query_configmap_workers,
            query_secret: self.query_secret_workers,
            query_service: self.query_service_workers,
            query_endpoints: self.query_endpoints_workers,
            ..WorkerCounts::default()
        }
    }
}

impl Cli {
    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            modules: self.controller.modules(),
            capacities: self.channels.capacities(),
            workers: self.workers.counts(),
            edge_site: self.controller.edge_site,
            node_update_frequency: Duration::from_secs(self.kube.node_update_frequency),
            namespace: self.kube.namespace.clone(),
        }
    }

    pub fn device_config(&self) -> DeviceConfig {
        DeviceConfig {
            capacities: self.channels.capacities(),
            update_device_status_workers: self.workers.update_device_status_workers,
            namespace: self.kube.namespace.clone(),
            ..DeviceConfig::default()
        }
    }

    /// Bus inboxes every module expects to exist.
    pub fn bus_modules(&self) -> Vec<String> {
        let mut names = vec![
            MODULE_CLOUDHUB.to_string(),
            self.controller.receive_module.clone(),
            MODULE_DEVICE_CONTROLLER.to_string(),
            self.controller.send_module.clone(),
            self.controller.response_module.clone(),
        ];
        names.sort();
        names.dedup();
        names
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.kube.node_update_frequency == 0 {
            anyhow::bail!("kube node update frequency must be non-zero");
        }
        if self.channels.module_inbox == 0 {
            anyhow::bail!("module inbox capacity must be non-zero");
        }
        Ok(())
    }
}
