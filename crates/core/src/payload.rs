//! Typed message bodies for the core resource family.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{NodeStatus, PodStatus};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ContentError {
    #[error("decoding message content: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("encoding message content: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("message content is empty")]
    Empty,
}

/// Decode a body. Edge agents sometimes ship JSON documents as a JSON string,
/// so a string body is parsed a second time when direct decoding fails.
pub fn decode<T: DeserializeOwned>(content: &serde_json::Value) -> Result<T, ContentError> {
    if content.is_null() {
        return Err(ContentError::Empty);
    }
    match serde_json::from_value::<T>(content.clone()) {
        Ok(v) => Ok(v),
        Err(first) => match content.as_str() {
            Some(raw) => serde_json::from_str(raw).map_err(ContentError::Decode),
            None => Err(ContentError::Decode(first)),
        },
    }
}

/// One pod status report from an edge node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PodStatusRequest {
    #[serde(rename = "UID", alias = "uid", default)]
    pub uid: String,
    #[serde(rename = "Name", alias = "name", default)]
    pub name: String,
    #[serde(rename = "Status", alias = "status", default)]
    pub status: PodStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExtendResource {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<Quantity>,
}

/// Node heartbeat report from an edge node.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NodeStatusRequest {
    #[serde(rename = "UID", alias = "uid", default)]
    pub uid: String,
    #[serde(default)]
    pub status: NodeStatus,
    #[serde(rename = "extendResources", default)]
    pub extend_resources: BTreeMap<String, Vec<ExtendResource>>,
}
