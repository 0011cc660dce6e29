//! Kedge bus – named, bounded in-process channels between modules.
//!
//! Each registered module owns one inbox. `send` applies backpressure when the
//! inbox is full; `receive` is single-consumer and fails with `Cancelled` once
//! the module has been cleaned up.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use kedge_core::constants::{MODULE_CLOUDHUB, MODULE_EDGE_CONTROLLER};
use kedge_core::Message;
use metrics::counter;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

mod capacities;

pub use capacities::ChannelCapacities;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BusError {
    #[error("module {0} is being cleaned up")]
    Cancelled(String),
    #[error("module {0} is not registered")]
    UnknownModule(String),
    #[error("module {0} inbox closed")]
    Closed(String),
    #[error("module {0} is already registered")]
    AlreadyRegistered(String),
}

struct Inbox {
    tx: mpsc::Sender<Message>,
    rx: Mutex<mpsc::Receiver<Message>>,
    cancel: CancellationToken,
}

/// Directory of module inboxes. Cheap to clone.
#[derive(Clone)]
pub struct MessageBus {
    modules: Arc<RwLock<HashMap<String, Arc<Inbox>>>>,
    default_capacity: usize,
}

impl MessageBus {
    pub fn new(default_capacity: usize) -> Self {
        Self { modules: Arc::new(RwLock::new(HashMap::new())), default_capacity: default_capacity.max(1) }
    }

    pub fn register(&self, module: &str) -> Result<(), BusError> {
        self.register_with_capacity(module, self.default_capacity)
    }

    pub fn register_with_capacity(&self, module: &str, capacity: usize) -> Result<(), BusError> {
        let mut guard = self.modules.write().unwrap_or_else(PoisonError::into_inner);
        if guard.contains_key(module) {
            return Err(BusError::AlreadyRegistered(module.to_string()));
        }
        let (tx, rx) = mpsc::channel(capacity.max(1));
        guard.insert(module.to_string(), Arc::new(Inbox { tx, rx: Mutex::new(rx), cancel: CancellationToken::new() }));
        debug!(module, capacity, "module inbox registered");
        Ok(())
    }

    fn inbox(&self, module: &str) -> Result<Arc<Inbox>, BusError> {
        let guard = self.modules.read().unwrap_or_else(PoisonError::into_inner);
        guard.get(module).cloned().ok_or_else(|| BusError::UnknownModule(module.to_string()))
    }

    /// Enqueue into `module`'s inbox, waiting while it is full.
    pub async fn send(&self, module: &str, msg: Message) -> Result<(), BusError> {
        let inbox = self.inbox(module)?;
        tokio::select! {
            biased;
            _ = inbox.cancel.cancelled() => Err(BusError::Cancelled(module.to_string())),
            res = inbox.tx.send(msg) => {
                res.map_err(|_| BusError::Closed(module.to_string()))?;
                counter!("bus_messages_total", 1u64, "module" => module.to_string());
                Ok(())
            }
        }
    }

    /// Next message for `module`. Concurrent callers are served one at a time.
    pub async fn receive(&self, module: &str) -> Result<Message, BusError> {
        let inbox = self.inbox(module)?;
        if inbox.cancel.is_cancelled() {
            return Err(BusError::Cancelled(module.to_string()));
        }
        let mut rx = tokio::select! {
            biased;
            _ = inbox.cancel.cancelled() => return Err(BusError::Cancelled(module.to_string())),
            rx = inbox.rx.lock() => rx,
        };
        tokio::select! {
            biased;
            _ = inbox.cancel.cancelled() => Err(BusError::Cancelled(module.to_string())),
            msg = rx.recv() => msg.ok_or_else(|| BusError::Closed(module.to_string())),
        }
    }

    /// Cancel pending and future receives for `module` and forget it.
    pub fn cleanup(&self, module: &str) {
        let removed = self.modules.write().unwrap_or_else(PoisonError::into_inner).remove(module);
        if let Some(inbox) = removed {
            inbox.cancel.cancel();
            debug!(module, "module inbox cleaned up");
        }
    }

    /// Messages waiting in `module`'s inbox.
    pub fn depth(&self, module: &str) -> Option<usize> {
        let inbox = self.inbox(module).ok()?;
        Some(inbox.tx.max_capacity() - inbox.tx.capacity())
    }
}

/// Module names a controller talks to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContextModules {
    pub send: String,
    pub receive: String,
    pub response: String,
}

impl Default for ContextModules {
    fn default() -> Self {
        Self {
            send: MODULE_CLOUDHUB.to_string(),
            receive: MODULE_EDGE_CONTROLLER.to_string(),
            response: MODULE_CLOUDHUB.to_string(),
        }
    }
}

/// The three endpoints a controller uses.
#[async_trait::async_trait]
pub trait MessageLayer: Send + Sync {
    async fn send(&self, msg: Message) -> Result<(), BusError>;
    async fn receive(&self) -> Result<Message, BusError>;
    async fn response(&self, msg: Message) -> Result<(), BusError>;
}

/// `MessageLayer` backed by a `MessageBus` and a set of context module names.
#[derive(Clone)]
pub struct ContextMessageLayer {
    bus: MessageBus,
    modules: ContextModules,
}

impl ContextMessageLayer {
    pub fn new(bus: MessageBus, modules: ContextModules) -> Self {
        Self { bus, modules }
    }

    pub fn modules(&self) -> &ContextModules {
        &self.modules
    }
}

#[async_trait::async_trait]
impl MessageLayer for ContextMessageLayer {
    async fn send(&self, msg: Message) -> Result<(), BusError> {
        self.bus.send(&self.modules.send, msg).await
    }

    async fn receive(&self) -> Result<Message, BusError> {
        self.bus.receive(&self.modules.receive).await
    }

    async fn response(&self, msg: Message) -> Result<(), BusError> {
        self.bus.send(&self.modules.response, msg).await
    }
}
