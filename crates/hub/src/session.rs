//! One edge node's connection: read loop, write loop and keepalive.

use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use kedge_bus::MessageBus;
use kedge_core::{ContentError, Message};
use metrics::{counter, gauge, histogram};
use tokio::sync::{mpsc, OwnedSemaphorePermit};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::event::HubEvent;
use crate::registry::SessionHandle;
use crate::route;
use crate::server::Shared;

pub(crate) const REASON_SUPERSEDED: &str = "superseded";
const REASON_SHUTDOWN: &str = "shutdown";
const REASON_PEER_CLOSED: &str = "peer_closed";
const REASON_READ_ERROR: &str = "read_error";
const REASON_WRITE_ERROR: &str = "write_error";
const REASON_WRITE_TIMEOUT: &str = "write_timeout";
const REASON_KEEPALIVE: &str = "keepalive_timeout";
const REASON_TASK_EXIT: &str = "task_exit";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Handshaking,
    Connected,
    Draining,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Handshaking => "handshaking",
            SessionState::Connected => "connected",
            SessionState::Draining => "draining",
            SessionState::Closed => "closed",
        }
    }
}

/// Session shutdown trigger. The first caller's reason sticks; later calls are no-ops.
#[derive(Clone)]
pub(crate) struct Teardown {
    token: CancellationToken,
    reason: Arc<OnceLock<&'static str>>,
}

impl Teardown {
    pub(crate) fn child_of(parent: &CancellationToken) -> Self {
        Self { token: parent.child_token(), reason: Arc::new(OnceLock::new()) }
    }

    pub(crate) fn close(&self, reason: &'static str) {
        let _ = self.reason.set(reason);
        self.token.cancel();
    }

    pub(crate) fn reason(&self) -> &'static str {
        self.reason.get().copied().unwrap_or(REASON_SHUTDOWN)
    }

    pub(crate) async fn closed(&self) {
        self.token.cancelled().await
    }
}

#[derive(Clone)]
struct LastSeen(Arc<Mutex<Instant>>);

impl LastSeen {
    fn now() -> Self {
        Self(Arc::new(Mutex::new(Instant::now())))
    }

    fn touch(&self) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn idle(&self) -> Duration {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).elapsed()
    }
}

pub(crate) struct Admitted {
    pub node_id: String,
    pub project_id: String,
    pub permit: OwnedSemaphorePermit,
}

/// Drive an upgraded socket until the session closes. The node-limit permit is held throughout.
pub(crate) async fn run(socket: WebSocket, admitted: Admitted, shared: Arc<Shared>) {
    let Admitted { node_id, project_id, permit } = admitted;
    let id = shared.next_session_id();
    let teardown = Teardown::child_of(shared.root());
    let (outbound_tx, outbound_rx) = mpsc::channel(shared.config.outbound_queue);
    let handle = SessionHandle { id, project_id: project_id.clone(), outbound: outbound_tx, teardown: teardown.clone() };

    if let Some(old) = shared.registry.insert(&node_id, handle) {
        info!(node = %node_id, session = id, old_session = old.id, "superseding existing session");
        old.teardown.close(REASON_SUPERSEDED);
    }
    let mut state = SessionState::Connected;
    gauge!("hub_sessions", shared.registry.len() as f64);
    info!(node = %node_id, project = %project_id, session = id, state = state.as_str(), "session connected");
    shared.publish(HubEvent::connected(&node_id, &project_id));

    let seen = LastSeen::now();
    let (sink, stream) = socket.split();
    let (ping_tx, ping_rx) = mpsc::channel(1);
    let mut tasks = JoinSet::new();
    tasks.spawn(read_loop(stream, node_id.clone(), shared.bus.clone(), seen.clone(), teardown.clone()));
    tasks.spawn(write_loop(sink, outbound_rx, ping_rx, node_id.clone(), shared.config.write_timeout, teardown.clone()));
    tasks.spawn(keepalive(ping_tx, seen, node_id.clone(), shared.config.keepalive_interval, teardown.clone()));

    tokio::select! {
        _ = teardown.closed() => {}
        _ = tasks.join_next() => teardown.close(REASON_TASK_EXIT),
    }
    state = SessionState::Draining;
    debug!(node = %node_id, session = id, state = state.as_str(), reason = teardown.reason(), "session draining");
    while let Some(res) = tasks.join_next().await {
        if let Err(e) = res {
            warn!(node = %node_id, session = id, error = %e, "session task failed");
        }
    }

    shared.registry.remove(&node_id, id);
    drop(permit);
    state = SessionState::Closed;
    let reason = teardown.reason();
    gauge!("hub_sessions", shared.registry.len() as f64);
    counter!("hub_session_closed_total", 1u64, "reason" => reason);
    info!(node = %node_id, session = id, state = state.as_str(), reason, "session closed");
    shared.publish(HubEvent::disconnected(&node_id, &project_id, reason));
}

fn decode(frame: &WsMessage) -> Option<Result<Message, ContentError>> {
    let raw: &[u8] = match frame {
        WsMessage::Text(t) => t.as_str().as_bytes(),
        WsMessage::Binary(b) => &b[..],
        _ => return None,
    };
    Some(serde_json::from_slice(raw).map_err(ContentError::Decode))
}

async fn read_loop(mut stream: SplitStream<WebSocket>, node_id: String, bus: MessageBus, seen: LastSeen, teardown: Teardown) {
    loop {
        let next = tokio::select! {
            _ = teardown.closed() => return,
            next = stream.next() => next,
        };
        let frame = match next {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                warn!(node = %node_id, error = %e, "read failed");
                teardown.close(REASON_READ_ERROR);
                return;
            }
            None => {
                teardown.close(REASON_PEER_CLOSED);
                return;
            }
        };
        seen.touch();
        if let WsMessage::Close(_) = frame {
            debug!(node = %node_id, "peer sent close");
            teardown.close(REASON_PEER_CLOSED);
            return;
        }
        let msg = match decode(&frame) {
            None => continue,
            Some(Ok(msg)) => msg,
            Some(Err(e)) => {
                warn!(node = %node_id, error = %e, "undecodable frame dropped");
                continue;
            }
        };
        counter!("hub_frames_in_total", 1u64);
        let Some((module, msg)) = route::inbound(&node_id, msg) else { continue };
        let (msg_id, resource) = (msg.id().to_string(), msg.resource().to_string());
        let sent = tokio::select! {
            _ = teardown.closed() => return,
            res = bus.send(module, msg) => res,
        };
        match sent {
            Ok(()) => debug!(node = %node_id, msg_id = %msg_id, resource = %resource, module, "frame routed"),
            Err(e) => warn!(node = %node_id, msg_id = %msg_id, resource = %resource, module, error = %e, "frame not routed"),
        }
    }
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, WsMessage>,
    mut outbound: mpsc::Receiver<Message>,
    mut pings: mpsc::Receiver<()>,
    node_id: String,
    write_timeout: Duration,
    teardown: Teardown,
) {
    loop {
        let (frame, data) = tokio::select! {
            biased;
            _ = teardown.closed() => break,
            Some(()) = pings.recv() => (WsMessage::Ping(Bytes::new()), false),
            next = outbound.recv() => match next {
                Some(msg) => {
                    let msg_id = msg.id().to_string();
                    match route::outbound(msg) {
                        Ok(json) => (WsMessage::Text(json.into()), true),
                        Err(e) => {
                            warn!(node = %node_id, msg_id = %msg_id, error = %e, "outbound message not encodable; dropped");
                            counter!("hub_dropped_messages_total", 1u64, "reason" => "encode");
                            continue;
                        }
                    }
                }
                None => break,
            },
        };
        let started = Instant::now();
        match tokio::time::timeout(write_timeout, sink.send(frame)).await {
            Ok(Ok(())) => {
                if data {
                    counter!("hub_frames_out_total", 1u64);
                    histogram!("hub_write_ms", started.elapsed().as_secs_f64() * 1000.0);
                }
            }
            Ok(Err(e)) => {
                warn!(node = %node_id, error = %e, "write failed");
                teardown.close(REASON_WRITE_ERROR);
                break;
            }
            Err(_) => {
                warn!(node = %node_id, timeout_ms = write_timeout.as_millis() as u64, "write timed out");
                teardown.close(REASON_WRITE_TIMEOUT);
                break;
            }
        }
    }

    outbound.close();
    let mut dropped = 0u64;
    while let Ok(msg) = outbound.try_recv() {
        debug!(node = %node_id, msg_id = %msg.id(), resource = %msg.resource(), "pending message dropped");
        dropped += 1;
    }
    if dropped > 0 {
        warn!(node = %node_id, dropped, "outbound queue discarded on teardown");
        counter!("hub_dropped_messages_total", dropped, "reason" => "teardown");
    }
    let _ = tokio::time::timeout(write_timeout, sink.close()).await;
}

async fn keepalive(pings: mpsc::Sender<()>, seen: LastSeen, node_id: String, interval: Duration, teardown: Teardown) {
    let deadline = interval * 2;
    let mut tick = tokio::time::interval_at(Instant::now() + interval, interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = teardown.closed() => return,
            _ = tick.tick() => {}
        }
        let idle = seen.idle();
        if idle >= deadline {
            warn!(node = %node_id, idle_ms = idle.as_millis() as u64, "keepalive expired");
            teardown.close(REASON_KEEPALIVE);
            return;
        }
        // A ping still queued means the writer is busy; skipping is fine.
        let _ = pings.try_send(());
    }
}
