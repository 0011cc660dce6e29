//! Connection notices.

use kedge_core::constants::{GROUP_RESOURCE, MODULE_CLOUDHUB, RESOURCE_NODE};
use kedge_core::message::now_millis;
use kedge_core::{Message, Operation};
use serde_json::json;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubEventKind {
    Connected,
    Disconnected,
}

impl HubEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HubEventKind::Connected => "connected",
            HubEventKind::Disconnected => "disconnected",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubEvent {
    pub kind: HubEventKind,
    pub node_id: String,
    pub project_id: String,
    pub timestamp: i64,
    /// Why the session ended; only set on disconnect.
    pub reason: Option<&'static str>,
}

impl HubEvent {
    pub fn connected(node_id: &str, project_id: &str) -> Self {
        Self {
            kind: HubEventKind::Connected,
            node_id: node_id.to_string(),
            project_id: project_id.to_string(),
            timestamp: now_millis(),
            reason: None,
        }
    }

    pub fn disconnected(node_id: &str, project_id: &str, reason: &'static str) -> Self {
        Self {
            kind: HubEventKind::Disconnected,
            node_id: node_id.to_string(),
            project_id: project_id.to_string(),
            timestamp: now_millis(),
            reason: Some(reason),
        }
    }

    /// The notice as a bus message on `node/<id>`.
    pub fn to_message(&self) -> Message {
        let op = match self.kind {
            HubEventKind::Connected => Operation::Connect,
            HubEventKind::Disconnected => Operation::Disconnect,
        };
        Message::new()
            .build_router(MODULE_CLOUDHUB, GROUP_RESOURCE, format!("{RESOURCE_NODE}/{}", self.node_id), op)
            .fill_body(json!({
                "event_type": self.kind.as_str(),
                "timestamp": self.timestamp,
                "client_id": self.node_id,
            }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notice_message() {
        let ev = HubEvent::disconnected("edge-1", "p", "keepalive_timeout");
        let msg = ev.to_message();
        assert_eq!(msg.operation(), Operation::Disconnect);
        assert_eq!(msg.resource(), "node/edge-1");
        assert_eq!(msg.content["event_type"], "disconnected");
        assert_eq!(msg.content["client_id"], "edge-1");
        assert_eq!(msg.content["timestamp"], ev.timestamp);
    }
}
