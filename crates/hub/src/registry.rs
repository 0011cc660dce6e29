use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use kedge_core::Message;
use tokio::sync::mpsc;

use crate::session::Teardown;

#[derive(Clone)]
pub(crate) struct SessionHandle {
    pub id: u64,
    pub project_id: String,
    pub outbound: mpsc::Sender<Message>,
    pub teardown: Teardown,
}

/// Connected sessions by node id.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<Mutex<HashMap<String, SessionHandle>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handle` for `node_id`, returning the session it replaces.
    pub(crate) fn insert(&self, node_id: &str, handle: SessionHandle) -> Option<SessionHandle> {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        guard.insert(node_id.to_string(), handle)
    }

    /// Remove `node_id` only while it still maps to session `id`.
    pub(crate) fn remove(&self, node_id: &str, id: u64) -> bool {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.get(node_id) {
            Some(h) if h.id == id => {
                guard.remove(node_id);
                true
            }
            _ => false,
        }
    }

    pub fn sender(&self, node_id: &str) -> Option<mpsc::Sender<Message>> {
        let guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        guard.get(node_id).map(|h| h.outbound.clone())
    }

    pub fn project(&self, node_id: &str) -> Option<String> {
        let guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        guard.get(node_id).map(|h| h.project_id.clone())
    }

    pub fn is_connected(&self, node_id: &str) -> bool {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).contains_key(node_id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn nodes(&self) -> Vec<String> {
        let mut nodes: Vec<String> = self.inner.lock().unwrap_or_else(PoisonError::into_inner).keys().cloned().collect();
        nodes.sort();
        nodes
    }

    /// Depth of the fullest outbound queue.
    pub fn busiest_queue(&self) -> usize {
        let guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        guard.values().map(|h| h.outbound.max_capacity() - h.outbound.capacity()).max().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    fn handle(id: u64, cap: usize) -> (SessionHandle, mpsc::Receiver<Message>) {
        let (outbound, rx) = mpsc::channel(cap);
        (SessionHandle { id, project_id: "p".into(), outbound, teardown: Teardown::child_of(&CancellationToken::new()) }, rx)
    }

    #[test]
    fn stale_session_cannot_remove_its_successor() {
        let reg = SessionRegistry::new();
        let (first, _rx1) = handle(1, 4);
        let (second, _rx2) = handle(2, 4);
        assert!(reg.insert("edge-1", first).is_none());
        let replaced = reg.insert("edge-1", second).unwrap();
        assert_eq!(replaced.id, 1);
        assert!(!reg.remove("edge-1", 1));
        assert!(reg.is_connected("edge-1"));
        assert!(reg.remove("edge-1", 2));
        assert!(reg.is_empty());
    }

    #[tokio::test]
    async fn busiest_queue_reports_max_depth() {
        let reg = SessionRegistry::new();
        let (a, _rx_a) = handle(1, 8);
        let (b, _rx_b) = handle(2, 8);
        reg.insert("a", a);
        reg.insert("b", b);
        assert_eq!(reg.busiest_queue(), 0);
        let tx = reg.sender("b").unwrap();
        for _ in 0..3 {
            tx.send(Message::new()).await.unwrap();
        }
        reg.sender("a").unwrap().send(Message::new()).await.unwrap();
        assert_eq!(reg.busiest_queue(), 3);
        assert_eq!(reg.nodes(), vec!["a".to_string(), "b".to_string()]);
    }
}
