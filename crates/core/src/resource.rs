//! Resource-path grammar.
//!
//! ```text
//! node/<node-id>/<namespace>/<resource-type>[/<resource-name>]
//! node/<node-id>/device/<device-id>/twin/<sub-type>
//! node/<node-id>/membership
//! ```

use thiserror::Error;

use crate::constants::{RESOURCE_NODE, RESOURCE_TYPE_DEVICE, RESOURCE_TYPE_MEMBERSHIP, RESOURCE_TYPE_TWIN};

pub const SEP: char = '/';

const NODE_ID_INDEX: usize = 1;
const NAMESPACE_INDEX: usize = 2;
const RESOURCE_TYPE_INDEX: usize = 3;
const RESOURCE_NAME_INDEX: usize = 4;
const DEVICE_MARKER_INDEX: usize = 2;
const DEVICE_ID_INDEX: usize = 3;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("resource path too short: segment {index} missing in {resource:?}")]
    PathTooShort { index: usize, resource: String },
    #[error("not a device resource: {0:?}")]
    NotADeviceResource(String),
    #[error("resource path does not start with node/: {0:?}")]
    MissingNodePrefix(String),
    #[error("required parameter is not set: {0}")]
    RequiredFieldMissing(&'static str),
}

fn segments(resource: &str) -> Result<Vec<&str>, PathError> {
    let parts: Vec<&str> = resource.split(SEP).collect();
    if parts.first().copied() != Some(RESOURCE_NODE) {
        return Err(PathError::MissingNodePrefix(resource.to_string()));
    }
    Ok(parts)
}

fn segment(resource: &str, index: usize) -> Result<&str, PathError> {
    let parts = segments(resource)?;
    match parts.get(index) {
        Some(s) if !s.is_empty() => Ok(s),
        _ => Err(PathError::PathTooShort { index, resource: resource.to_string() }),
    }
}

pub fn node_id(resource: &str) -> Result<&str, PathError> {
    segment(resource, NODE_ID_INDEX)
}

pub fn namespace(resource: &str) -> Result<&str, PathError> {
    segment(resource, NAMESPACE_INDEX)
}

pub fn resource_type(resource: &str) -> Result<&str, PathError> {
    segment(resource, RESOURCE_TYPE_INDEX)
}

pub fn resource_name(resource: &str) -> Result<&str, PathError> {
    segment(resource, RESOURCE_NAME_INDEX)
}

/// Device id of `node/<n>/device/<id>/...`.
pub fn device_id(resource: &str) -> Result<&str, PathError> {
    let parts = segments(resource)?;
    match parts.get(DEVICE_MARKER_INDEX) {
        Some(&RESOURCE_TYPE_DEVICE) => {}
        Some(_) => return Err(PathError::NotADeviceResource(resource.to_string())),
        None => return Err(PathError::PathTooShort { index: DEVICE_MARKER_INDEX, resource: resource.to_string() }),
    }
    match parts.get(DEVICE_ID_INDEX) {
        Some(s) if !s.is_empty() => Ok(s),
        _ => Err(PathError::PathTooShort { index: DEVICE_ID_INDEX, resource: resource.to_string() }),
    }
}

fn require(value: &str, field: &'static str) -> Result<(), PathError> {
    if value.is_empty() {
        Err(PathError::RequiredFieldMissing(field))
    } else {
        Ok(())
    }
}

/// `node/<node>/<namespace>/<type>[/<name>]`
pub fn build_resource(node_id: &str, namespace: &str, resource_type: &str, resource_name: &str) -> Result<String, PathError> {
    require(node_id, "node id")?;
    require(namespace, "namespace")?;
    require(resource_type, "resource type")?;
    let mut out = format!("{RESOURCE_NODE}/{node_id}/{namespace}/{resource_type}");
    if !resource_name.is_empty() {
        out.push(SEP);
        out.push_str(resource_name);
    }
    Ok(out)
}

/// `node/<node>/<type>[/<id>]`, used for the device family.
pub fn build_device_resource(node_id: &str, resource_type: &str, resource_id: &str) -> Result<String, PathError> {
    require(node_id, "node id")?;
    require(resource_type, "resource type")?;
    let mut out = format!("{RESOURCE_NODE}/{node_id}/{resource_type}");
    if !resource_id.is_empty() {
        out.push(SEP);
        out.push_str(resource_id);
    }
    Ok(out)
}

pub fn membership_resource(node_id: &str) -> Result<String, PathError> {
    build_device_resource(node_id, RESOURCE_TYPE_MEMBERSHIP, "")
}

/// `node/<node>/device/<device>/twin/<sub_type>`
pub fn twin_resource(node_id: &str, device_id: &str, sub_type: &str) -> Result<String, PathError> {
    require(device_id, "device id")?;
    require(sub_type, "twin sub-type")?;
    let base = build_device_resource(node_id, RESOURCE_TYPE_DEVICE, device_id)?;
    Ok(format!("{base}/{RESOURCE_TYPE_TWIN}/{sub_type}"))
}

/// Absolute form of a node-relative resource received from an edge node.
pub fn prefix_node(node_id: &str, relative: &str) -> String {
    format!("{RESOURCE_NODE}/{node_id}/{relative}")
}

/// Node-relative form of an absolute resource, or `None` when it has fewer than three segments.
pub fn trim_node(resource: &str) -> Option<&str> {
    let mut it = resource.splitn(3, SEP);
    match (it.next(), it.next(), it.next()) {
        (Some(RESOURCE_NODE), Some(_), Some(rest)) => Some(rest),
        _ => None,
    }
}

/// Parsed view of a namespaced resource path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRef {
    pub node_id: String,
    pub namespace: String,
    pub resource_type: String,
    pub resource_name: Option<String>,
}

impl ResourceRef {
    pub fn parse(resource: &str) -> Result<Self, PathError> {
        Ok(Self {
            node_id: node_id(resource)?.to_string(),
            namespace: namespace(resource)?.to_string(),
            resource_type: resource_type(resource)?.to_string(),
            resource_name: resource_name(resource).ok().map(str::to_string),
        })
    }

    pub fn build(&self) -> Result<String, PathError> {
        build_resource(&self.node_id, &self.namespace, &self.resource_type, self.resource_name.as_deref().unwrap_or(""))
    }

    pub fn name(&self) -> &str {
        self.resource_name.as_deref().unwrap_or("")
    }
}
