use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, State};
use axum::http::{StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Extension, Router};
use hyper::body::Incoming;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use kedge_bus::{BusError, MessageBus};
use kedge_core::constants::MODULE_CLOUDHUB;
use metrics::counter;
use rustls::ServerConfig;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Semaphore};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use tracing::{debug, info, warn};

use crate::config::HubConfig;
use crate::dispatch::Lanes;
use crate::event::HubEvent;
use crate::registry::SessionRegistry;
use crate::session::{self, Admitted};
use crate::tls::PeerIdentity;
use crate::HubError;

pub const EVENTS_PATH: &str = "/{project_id}/{node_id}/events";
pub const WORKLOAD_PATH: &str = "/workload";
pub const LIVENESS_PATH: &str = "/liveness";

const EVENT_BUFFER: usize = 256;

pub(crate) struct Shared {
    pub config: HubConfig,
    pub bus: MessageBus,
    pub registry: SessionRegistry,
    slots: Arc<Semaphore>,
    events: broadcast::Sender<HubEvent>,
    root: CancellationToken,
    next_id: AtomicU64,
}

impl Shared {
    pub(crate) fn next_session_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Parent of every session's teardown token.
    pub(crate) fn root(&self) -> &CancellationToken {
        &self.root
    }

    pub(crate) fn publish(&self, ev: HubEvent) {
        // No subscribers is fine.
        let _ = self.events.send(ev);
    }
}

/// The cloud hub: session server, outbound dispatcher and auxiliary endpoints.
pub struct Hub {
    shared: Arc<Shared>,
    tls: Arc<ServerConfig>,
}

impl Hub {
    pub fn new(config: HubConfig, tls: Arc<ServerConfig>, bus: MessageBus) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let shared = Shared {
            slots: Arc::new(Semaphore::new(config.node_limit)),
            config,
            bus,
            registry: SessionRegistry::new(),
            events,
            root: CancellationToken::new(),
            next_id: AtomicU64::new(0),
        };
        Self { shared: Arc::new(shared), tls }
    }

    pub fn config(&self) -> &HubConfig {
        &self.shared.config
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.shared.registry
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HubEvent> {
        self.shared.events.subscribe()
    }

    /// Node-limit slots not held by a session.
    pub fn available_slots(&self) -> usize {
        self.shared.slots.available_permits()
    }

    /// Bind the WebSocket and auxiliary listeners.
    pub async fn bind(&self) -> Result<(TcpListener, TcpListener), HubError> {
        let bind = |addr: SocketAddr| async move { TcpListener::bind(addr).await.map_err(|source| HubError::Bind { addr, source }) };
        let ws = bind(self.shared.config.address).await?;
        let aux = bind(self.shared.config.http_address).await?;
        Ok((ws, aux))
    }

    /// Session endpoint. The peer identity is attached per connection.
    pub fn router(&self) -> Router {
        Router::new().route(EVENTS_PATH, get(events)).fallback(unknown_path).with_state(Arc::clone(&self.shared))
    }

    pub fn aux_router(&self) -> Router {
        Router::new()
            .route(WORKLOAD_PATH, get(workload))
            .route(LIVENESS_PATH, get(liveness))
            .with_state(Arc::clone(&self.shared))
    }

    /// Accept TLS connections until `cancel`, then tear every session down.
    pub async fn serve(&self, listener: TcpListener, cancel: CancellationToken) -> Result<()> {
        let acceptor = TlsAcceptor::from(Arc::clone(&self.tls));
        let app = self.router();
        let handshake = self.shared.config.handshake_timeout;
        let local = listener.local_addr().context("hub listener address")?;
        info!(addr = %local, node_limit = self.shared.config.node_limit, "hub listening");

        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                res = listener.accept() => res,
            };
            let (tcp, remote) = match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            };
            tokio::spawn(serve_connection(acceptor.clone(), tcp, remote, app.clone(), handshake));
        }

        self.shared.root.cancel();
        self.drain(self.shared.config.write_timeout * 2).await;
        info!(addr = %local, "hub stopped");
        Ok(())
    }

    async fn drain(&self, grace: Duration) {
        let all = u32::try_from(self.shared.config.node_limit).unwrap_or(u32::MAX);
        match tokio::time::timeout(grace, self.shared.slots.acquire_many(all)).await {
            Ok(_) => debug!("all sessions closed"),
            Err(_) => warn!(open = self.shared.registry.len(), "sessions still open after shutdown grace"),
        }
    }

    pub async fn serve_aux(&self, listener: TcpListener, cancel: CancellationToken) -> Result<()> {
        let local = listener.local_addr().context("auxiliary listener address")?;
        info!(addr = %local, "auxiliary endpoints listening");
        axum::serve(listener, self.aux_router())
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await
            .context("auxiliary endpoints")
    }

    /// Move messages from the `cloudhub` inbox onto node queues until cancelled.
    /// A saturated node holds back only its own messages.
    pub async fn dispatch(&self, cancel: CancellationToken) {
        let mut lanes = Lanes::new(self.shared.registry.clone(), self.shared.config.outbound_queue);
        info!("hub dispatcher started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                reserved = lanes.ready() => lanes.resume(reserved),
                next = self.shared.bus.receive(MODULE_CLOUDHUB) => match next {
                    Ok(msg) => lanes.offer(msg),
                    Err(BusError::Cancelled(_) | BusError::UnknownModule(_) | BusError::Closed(_)) => break,
                    Err(e) => warn!(error = %e, "hub receive failed"),
                },
            }
        }
        lanes.abandon();
        info!("hub dispatcher stopped");
    }
}

async fn serve_connection(acceptor: TlsAcceptor, tcp: TcpStream, remote: SocketAddr, app: Router, handshake: Duration) {
    // Handshake failures are routine (scanners, expired certs) and stay at debug.
    let tls = match tokio::time::timeout(handshake, acceptor.accept(tcp)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            debug!(remote = %remote, error = %e, "tls handshake failed");
            counter!("hub_sessions_rejected_total", 1u64, "reason" => "tls");
            return;
        }
        Err(_) => {
            debug!(remote = %remote, "tls handshake timed out");
            counter!("hub_sessions_rejected_total", 1u64, "reason" => "tls_timeout");
            return;
        }
    };
    let peer = match PeerIdentity::from_chain(tls.get_ref().1.peer_certificates()) {
        Ok(peer) => peer,
        Err(e) => {
            debug!(remote = %remote, error = %e, "unreadable peer certificate");
            counter!("hub_sessions_rejected_total", 1u64, "reason" => "tls");
            return;
        }
    };
    let app = app.layer(Extension(peer));
    let service = hyper::service::service_fn(move |req: Request<Incoming>| app.clone().oneshot(req));
    if let Err(e) = auto::Builder::new(TokioExecutor::new()).serve_connection_with_upgrades(TokioIo::new(tls), service).await {
        debug!(remote = %remote, error = %e, "connection ended with error");
    }
}

fn reject(status: StatusCode, reason: &'static str) -> Response {
    counter!("hub_sessions_rejected_total", 1u64, "reason" => reason);
    (status, reason).into_response()
}

async fn events(
    State(shared): State<Arc<Shared>>,
    Extension(peer): Extension<PeerIdentity>,
    Path((project_id, node_id)): Path<(String, String)>,
    ws: WebSocketUpgrade,
) -> Response {
    if project_id.is_empty() || node_id.is_empty() {
        return reject(StatusCode::BAD_REQUEST, "bad_path");
    }
    let Ok(permit) = Arc::clone(&shared.slots).try_acquire_owned() else {
        info!(node = %node_id, limit = shared.config.node_limit, "node limit reached; connection refused");
        return reject(StatusCode::TOO_MANY_REQUESTS, "node_limit");
    };
    if !peer.claims(&node_id) {
        warn!(node = %node_id, dns = ?peer.dns_names, uris = ?peer.uris, "certificate does not name the node");
        return reject(StatusCode::FORBIDDEN, "identity");
    }
    debug!(node = %node_id, project = %project_id, "upgrading");
    let admitted = Admitted { node_id, project_id, permit };
    ws.on_upgrade(move |socket| session::run(socket, admitted, shared))
}

async fn unknown_path(uri: Uri) -> Response {
    debug!(path = %uri.path(), "no session endpoint at path");
    reject(StatusCode::BAD_REQUEST, "bad_path")
}

async fn workload(State(shared): State<Arc<Shared>>) -> Response {
    if shared.root.is_cancelled() {
        return (StatusCode::INTERNAL_SERVER_ERROR, "hub is not serving").into_response();
    }
    format!("{:.6}", shared.registry.busiest_queue() as f64).into_response()
}

async fn liveness(State(shared): State<Arc<Shared>>) -> &'static str {
    if shared.root.is_cancelled() {
        "0"
    } else {
        "1"
    }
}

#[async_trait::async_trait]
impl kedge_registry::Module for Hub {
    fn name(&self) -> &str {
        MODULE_CLOUDHUB
    }

    fn group(&self) -> &str {
        MODULE_CLOUDHUB
    }

    async fn start(&self, cancel: CancellationToken) -> Result<()> {
        let (ws, aux) = self.bind().await?;
        let (served, aux_served, ()) =
            tokio::join!(self.serve(ws, cancel.clone()), self.serve_aux(aux, cancel.clone()), self.dispatch(cancel.clone()));
        served?;
        aux_served?;
        Ok(())
    }

    async fn stop(&self) {
        self.shared.root.cancel();
        self.shared.bus.cleanup(MODULE_CLOUDHUB);
    }
}
