//! Resource rewriting and inbound routing between the socket and the bus.

use kedge_core::constants::*;
use kedge_core::{resource, ContentError, Message, Operation};
use tracing::warn;

/// Controller module an inbound message belongs to.
pub fn target_module(msg: &Message) -> &'static str {
    const DEVICE_FAMILY: [&str; 3] = [RESOURCE_TYPE_MEMBERSHIP, RESOURCE_TYPE_DEVICE, RESOURCE_TYPE_TWIN];
    if msg.group() == GROUP_TWIN {
        return MODULE_DEVICE_CONTROLLER;
    }
    // node/<id>/<namespace or device-family type>/<type>/...
    let mut segs = msg.resource().split(resource::SEP).skip(2);
    let first = segs.next().unwrap_or_default();
    let second = segs.next().unwrap_or_default();
    if DEVICE_FAMILY.contains(&first) || DEVICE_FAMILY.contains(&second) {
        MODULE_DEVICE_CONTROLLER
    } else {
        MODULE_EDGE_CONTROLLER
    }
}

/// Make an edge frame absolute and pick its destination. Keepalives yield `None`.
pub fn inbound(node_id: &str, mut msg: Message) -> Option<(&'static str, Message)> {
    if msg.operation() == Operation::Keepalive {
        return None;
    }
    msg.router.resource = resource::prefix_node(node_id, &msg.router.resource);
    Some((target_module(&msg), msg))
}

/// Wire frame for an outbound message, with the `node/<id>/` prefix removed.
pub fn outbound(mut msg: Message) -> Result<String, ContentError> {
    match resource::trim_node(msg.resource()).map(str::to_string) {
        Some(relative) => msg.router.resource = relative,
        None => warn!(msg_id = %msg.id(), resource = %msg.resource(), "outbound resource not node-scoped; sent unchanged"),
    }
    msg.to_json()
}
