//! Outbound fan-out from the `cloudhub` inbox onto node queues.
//!
//! A full node queue never stalls the loop. The node's messages are parked in
//! order behind a single pending reservation on its queue and resume as the
//! session's writer frees room; other nodes keep flowing meanwhile.

use std::collections::{HashMap, VecDeque};

use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use kedge_core::Message;
use metrics::{counter, gauge};
use tokio::sync::mpsc::error::{SendError, TrySendError};
use tokio::sync::mpsc::{OwnedPermit, Sender};
use tracing::{debug, warn};

use crate::registry::SessionRegistry;

type Reserved = (String, Result<OwnedPermit<Message>, SendError<()>>);

pub(crate) struct Lanes {
    registry: SessionRegistry,
    /// Messages a saturated node may have parked before new ones are dropped.
    backlog_limit: usize,
    parked: HashMap<String, VecDeque<Message>>,
    waiting: FuturesUnordered<BoxFuture<'static, Reserved>>,
}

impl Lanes {
    pub(crate) fn new(registry: SessionRegistry, backlog_limit: usize) -> Self {
        Self { registry, backlog_limit: backlog_limit.max(1), parked: HashMap::new(), waiting: FuturesUnordered::new() }
    }

    /// Route one message to its node without waiting on the node's queue.
    pub(crate) fn offer(&mut self, msg: Message) {
        let node = match msg.node_id() {
            Ok(n) => n.to_string(),
            Err(e) => {
                warn!(msg_id = %msg.id(), resource = %msg.resource(), error = %e, "outbound message names no node; dropped");
                counter!("hub_dropped_messages_total", 1u64, "reason" => "no_node");
                return;
            }
        };
        if let Some(backlog) = self.parked.get_mut(&node) {
            if backlog.len() >= self.backlog_limit {
                warn!(node = %node, msg_id = %msg.id(), resource = %msg.resource(), parked = backlog.len(), "node saturated; dropped");
                counter!("hub_dropped_messages_total", 1u64, "reason" => "saturated");
            } else {
                backlog.push_back(msg);
            }
            return;
        }
        let Some(queue) = self.registry.sender(&node) else {
            debug!(node = %node, msg_id = %msg.id(), resource = %msg.resource(), "node not connected; dropped");
            counter!("hub_dropped_messages_total", 1u64, "reason" => "not_connected");
            return;
        };
        match queue.try_send(msg) {
            Ok(()) => {}
            Err(TrySendError::Full(msg)) => {
                debug!(node = %node, msg_id = %msg.id(), "node queue full; parking");
                self.parked.insert(node.clone(), VecDeque::from([msg]));
                self.wait_for_room(node, queue);
            }
            Err(TrySendError::Closed(msg)) => {
                warn!(node = %node, msg_id = %msg.id(), resource = %msg.resource(), "session closed before delivery; dropped");
                counter!("hub_dropped_messages_total", 1u64, "reason" => "closed");
            }
        }
    }

    /// Next node whose queue has room again. Pending forever while nothing is parked.
    pub(crate) async fn ready(&mut self) -> Reserved {
        match self.waiting.next().await {
            Some(reserved) => reserved,
            None => std::future::pending().await,
        }
    }

    /// Move parked messages for `node` onto its queue, parking again if it fills up.
    pub(crate) fn resume(&mut self, (node, reserved): Reserved) {
        let Some(mut backlog) = self.parked.remove(&node) else { return };
        let permit = match reserved {
            Ok(permit) => permit,
            Err(_) => {
                warn!(node = %node, dropped = backlog.len(), "session closed with parked messages");
                counter!("hub_dropped_messages_total", backlog.len() as u64, "reason" => "closed");
                return;
            }
        };
        let Some(first) = backlog.pop_front() else { return };
        let queue = permit.send(first);
        while let Some(msg) = backlog.pop_front() {
            match queue.try_send(msg) {
                Ok(()) => {}
                Err(TrySendError::Full(msg)) => {
                    backlog.push_front(msg);
                    self.parked.insert(node.clone(), backlog);
                    self.wait_for_room(node, queue);
                    return;
                }
                Err(TrySendError::Closed(_)) => {
                    let dropped = backlog.len() as u64 + 1;
                    warn!(node = %node, dropped, "session closed with parked messages");
                    counter!("hub_dropped_messages_total", dropped, "reason" => "closed");
                    return;
                }
            }
        }
        gauge!("hub_parked_nodes", self.parked.len() as f64);
    }

    /// Count whatever is still parked as dropped.
    pub(crate) fn abandon(&mut self) {
        let dropped: usize = self.parked.drain().map(|(_, backlog)| backlog.len()).sum();
        self.waiting = FuturesUnordered::new();
        if dropped > 0 {
            warn!(dropped, "parked messages discarded on shutdown");
            counter!("hub_dropped_messages_total", dropped as u64, "reason" => "shutdown");
        }
        gauge!("hub_parked_nodes", 0.0);
    }

    fn wait_for_room(&mut self, node: String, queue: Sender<Message>) {
        gauge!("hub_parked_nodes", self.parked.len() as f64);
        self.waiting.push(async move { (node, queue.reserve_owned().await) }.boxed());
    }
}
