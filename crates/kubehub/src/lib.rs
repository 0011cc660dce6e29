//! Kedge kubehub – kube client wiring, device custom resources and informer adapters

#![forbid(unsafe_code)]

use std::path::PathBuf;

use anyhow::{Context, Result};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use serde::{Deserialize, Serialize};
use tracing::info;

pub mod crd;
pub mod informer;

pub use informer::{join_informer, spawn_informer, Event, ObjectCache, Watched};

/// How to reach the authoritative store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KubeSettings {
    /// API server URL; overrides the kubeconfig cluster.
    pub master: Option<String>,
    pub kubeconfig: Option<PathBuf>,
    /// Namespace to watch; `None` watches all.
    pub namespace: Option<String>,
    pub content_type: String,
    pub qps: f32,
    pub burst: u32,
}

impl Default for KubeSettings {
    fn default() -> Self {
        Self {
            master: None,
            kubeconfig: None,
            namespace: None,
            content_type: "application/vnd.kubernetes.protobuf".to_string(),
            qps: 100.0,
            burst: 200,
        }
    }
}

/// Build a client from an explicit kubeconfig, falling back to in-cluster/default inference.
pub async fn client(settings: &KubeSettings) -> Result<Client> {
    let mut config = match &settings.kubeconfig {
        Some(path) => {
            let kc = Kubeconfig::read_from(path).with_context(|| format!("reading kubeconfig {}", path.display()))?;
            Config::from_custom_kubeconfig(kc, &KubeConfigOptions::default())
                .await
                .context("loading kubeconfig")?
        }
        None => Config::infer().await.context("inferring kube config")?,
    };
    if let Some(master) = settings.master.as_deref().filter(|m| !m.is_empty()) {
        config.cluster_url = master.parse().with_context(|| format!("parsing kube master url {master}"))?;
    }
    info!(
        cluster = %config.cluster_url,
        namespace = ?settings.namespace,
        content_type = %settings.content_type,
        qps = settings.qps,
        burst = settings.burst,
        "kube client configured"
    );
    Client::try_from(config).context("building kube client")
}
