//! Message envelope exchanged between the hub, the controllers and edge nodes.
//!
//! Wire form (one JSON object per WebSocket frame):
//! `{"header":{"msg_id","parent_msg_id","timestamp","resourceversion"},"route":{"source","group","resource","operation"},"content":...}`

use std::fmt;

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::payload::{self, ContentError};
use crate::resource::{self, PathError};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Insert,
    Update,
    Delete,
    Query,
    Response,
    Publish,
    /// Edge liveness beacon; consumed by the hub.
    Keepalive,
    Connect,
    Disconnect,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Insert => "insert",
            Operation::Update => "update",
            Operation::Delete => "delete",
            Operation::Query => "query",
            Operation::Response => "response",
            Operation::Publish => "publish",
            Operation::Keepalive => "keepalive",
            Operation::Connect => "connect",
            Operation::Disconnect => "disconnect",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageHeader {
    #[serde(rename = "msg_id")]
    pub id: String,
    #[serde(rename = "parent_msg_id", default)]
    pub parent_id: String,
    /// Milliseconds since the Unix epoch.
    #[serde(default)]
    pub timestamp: i64,
    #[serde(rename = "resourceversion", default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub sync: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageRoute {
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub resource: String,
    pub operation: Operation,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub header: MessageHeader,
    #[serde(rename = "route")]
    pub router: MessageRoute,
    #[serde(default)]
    pub content: serde_json::Value,
}

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn fresh_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

impl Default for Message {
    fn default() -> Self {
        Self::new()
    }
}

impl Message {
    /// Fresh message: new id, current timestamp, empty route and content.
    pub fn new() -> Self {
        Self {
            header: MessageHeader {
                id: fresh_id(),
                parent_id: String::new(),
                timestamp: now_millis(),
                resource_version: None,
                sync: false,
            },
            router: MessageRoute {
                source: String::new(),
                group: String::new(),
                resource: String::new(),
                operation: Operation::Publish,
            },
            content: serde_json::Value::Null,
        }
    }

    pub fn build_router(mut self, source: &str, group: &str, resource: impl Into<String>, operation: Operation) -> Self {
        self.router.source = source.to_string();
        self.router.group = group.to_string();
        self.router.resource = resource.into();
        self.router.operation = operation;
        self
    }

    pub fn fill_body(mut self, content: serde_json::Value) -> Self {
        self.content = content;
        self
    }

    /// Serialize `content` into the body.
    pub fn fill_typed<T: Serialize>(mut self, content: &T) -> Result<Self, ContentError> {
        self.content = serde_json::to_value(content).map_err(ContentError::Encode)?;
        Ok(self)
    }

    pub fn with_resource_version(mut self, rv: Option<String>) -> Self {
        self.header.resource_version = rv.filter(|s| !s.is_empty());
        self
    }

    /// Response to `parent`: fresh id, `parent_id = parent.id`, same group and resource.
    pub fn new_response(parent: &Message, result: serde_json::Value) -> Self {
        let mut msg = Message::new().build_router(
            &parent.router.source,
            &parent.router.group,
            parent.router.resource.clone(),
            Operation::Response,
        );
        msg.header.parent_id = parent.header.id.clone();
        msg.content = result;
        msg
    }

    /// Error response to `parent`; content carries the reason verbatim.
    pub fn new_error(parent: &Message, reason: impl Into<String>) -> Self {
        Self::new_response(parent, serde_json::Value::String(reason.into()))
    }

    /// Override the source of a built message (responses inherit the request's).
    pub fn with_source(mut self, source: &str) -> Self {
        self.router.source = source.to_string();
        self
    }

    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.router.resource = resource.into();
        self
    }

    pub fn id(&self) -> &str { &self.header.id }
    pub fn parent_id(&self) -> &str { &self.header.parent_id }
    pub fn source(&self) -> &str { &self.router.source }
    pub fn group(&self) -> &str { &self.router.group }
    pub fn resource(&self) -> &str { &self.router.resource }
    pub fn operation(&self) -> Operation { self.router.operation }
    pub fn resource_version(&self) -> Option<&str> { self.header.resource_version.as_deref() }

    pub fn is_response(&self) -> bool {
        self.router.operation == Operation::Response
    }

    pub fn node_id(&self) -> Result<&str, PathError> {
        resource::node_id(&self.router.resource)
    }

    pub fn resource_type(&self) -> Result<&str, PathError> {
        resource::resource_type(&self.router.resource)
    }

    /// Decode the body into a typed payload.
    pub fn content_as<T: DeserializeOwned>(&self) -> Result<T, ContentError> {
        payload::decode(&self.content)
    }

    pub fn to_json(&self) -> Result<String, ContentError> {
        serde_json::to_string(self).map_err(ContentError::Encode)
    }

    pub fn from_json(raw: &str) -> Result<Self, ContentError> {
        serde_json::from_str(raw).map_err(ContentError::Decode)
    }

    /// Compact description for logs.
    pub fn describe(&self) -> String {
        format!(
            "id: {}, parent_id: {}, group: {}, source: {}, resource: {}, operation: {}",
            self.header.id, self.header.parent_id, self.router.group, self.router.source, self.router.resource, self.router.operation
        )
    }
}
