use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::HubError;

/// PEM files the hub terminates TLS with.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TlsFiles {
    /// CA bundle client certificates must chain to.
    pub ca: PathBuf,
    pub cert: PathBuf,
    pub key: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HubConfig {
    /// WebSocket listener.
    pub address: SocketAddr,
    /// Workload and liveness endpoints; plain HTTP.
    pub http_address: SocketAddr,
    pub node_limit: usize,
    pub keepalive_interval: Duration,
    pub write_timeout: Duration,
    pub handshake_timeout: Duration,
    /// Capacity of each node's outbound queue.
    pub outbound_queue: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            address: SocketAddr::from(([0, 0, 0, 0], 10000)),
            http_address: SocketAddr::from(([0, 0, 0, 0], 10002)),
            node_limit: 1000,
            keepalive_interval: Duration::from_secs(30),
            write_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(30),
            outbound_queue: 1024,
        }
    }
}

impl HubConfig {
    pub fn validate(&self) -> Result<(), HubError> {
        if self.node_limit == 0 {
            return Err(HubError::Config("node limit must be at least 1"));
        }
        if self.outbound_queue == 0 {
            return Err(HubError::Config("outbound queue must hold at least one message"));
        }
        let zero = [
            (self.keepalive_interval, "keepalive interval must be non-zero"),
            (self.write_timeout, "write timeout must be non-zero"),
            (self.handshake_timeout, "handshake timeout must be non-zero"),
        ];
        for (d, why) in zero {
            if d.is_zero() {
                return Err(HubError::Config(why));
            }
        }
        Ok(())
    }

    /// Silence after which a session is considered dead.
    pub fn keepalive_deadline(&self) -> Duration {
        self.keepalive_interval * 2
    }
}
