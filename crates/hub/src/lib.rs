//! Kedge hub – per-node WebSocket sessions over mutual TLS.
//!
//! Edge nodes connect to `/{project_id}/{node_id}/events`. Admission checks
//! the path, the node limit and the client certificate's subject alternative
//! names before upgrading. Each session runs a read loop (frames into the
//! controller inboxes), a write loop (the node's outbound queue onto the
//! socket) and a keepalive task; whichever fails first tears the session down.
//! Messages the controllers address to `node/<id>/...` arrive on the
//! `cloudhub` inbox and are routed to that node's queue.

#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

pub mod config;
mod dispatch;
pub mod event;
pub mod registry;
pub mod route;
mod server;
mod session;
pub mod tls;

pub use config::{HubConfig, TlsFiles};
pub use event::{HubEvent, HubEventKind};
pub use registry::SessionRegistry;
pub use server::{Hub, EVENTS_PATH, LIVENESS_PATH, WORKLOAD_PATH};
pub use session::SessionState;
pub use tls::{load_server_config, PeerIdentity};

#[derive(Debug, Error)]
pub enum HubError {
    #[error("reading {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no certificate in {}", .0.display())]
    NoCertificate(PathBuf),
    #[error("no private key in {}", .0.display())]
    NoPrivateKey(PathBuf),
    #[error(transparent)]
    Tls(#[from] rustls::Error),
    #[error("client certificate verifier: {0}")]
    Verifier(String),
    #[error("peer certificate: {0}")]
    Certificate(String),
    #[error("binding {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid hub config: {0}")]
    Config(&'static str),
}
