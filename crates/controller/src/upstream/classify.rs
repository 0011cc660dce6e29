//! Decode an edge message into the typed request its worker pool consumes.

use k8s_openapi::api::core::v1::Node;
use kedge_core::constants::*;
use kedge_core::payload::{NodeStatusRequest, PodStatusRequest};
use kedge_core::{resource, ContentError, Message, Operation, PathError};
use thiserror::Error;

/// Addressing shared by every upstream request. `msg` keeps header and route;
/// its content has already been decoded into the request body.
#[derive(Debug, Clone)]
pub struct Origin {
    pub msg: Message,
    pub node_id: String,
    pub namespace: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    ConfigMap,
    Secret,
    Service,
    Endpoints,
}

impl QueryKind {
    pub fn resource_type(&self) -> &'static str {
        match self {
            QueryKind::ConfigMap => RESOURCE_TYPE_CONFIGMAP,
            QueryKind::Secret => RESOURCE_TYPE_SECRET,
            QueryKind::Service => RESOURCE_TYPE_SERVICE,
            QueryKind::Endpoints => RESOURCE_TYPE_ENDPOINTS,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Upstream {
    PodStatus(Origin, Vec<PodStatusRequest>),
    NodeRegister(Origin, Box<Node>),
    NodeStatus(Origin, Box<NodeStatusRequest>),
    Query(QueryKind, Origin),
    NodeQuery(Origin),
    NodeUpdate(Origin, Box<Node>),
    /// Body is the pod UID used as delete precondition.
    PodDelete(Origin, String),
    /// Reply from the edge to an earlier cloud request.
    EdgeResponse(Message),
}

impl Upstream {
    pub fn kind(&self) -> &'static str {
        match self {
            Upstream::PodStatus(..) => "update_pod_status",
            Upstream::NodeRegister(..) | Upstream::NodeStatus(..) => "update_node_status",
            Upstream::Query(QueryKind::ConfigMap, _) => "query_configmap",
            Upstream::Query(QueryKind::Secret, _) => "query_secret",
            Upstream::Query(QueryKind::Service, _) => "query_service",
            Upstream::Query(QueryKind::Endpoints, _) => "query_endpoints",
            Upstream::NodeQuery(_) => "query_node",
            Upstream::NodeUpdate(..) => "update_node",
            Upstream::PodDelete(..) => "delete_pod",
            Upstream::EdgeResponse(_) => "response",
        }
    }
}

#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error(transparent)]
    Path(#[from] PathError),
    #[error(transparent)]
    Content(#[from] ContentError),
    #[error("unsupported {operation} on resource type {resource_type}")]
    Unsupported { resource_type: String, operation: Operation },
}

impl ClassifyError {
    pub fn reason(&self) -> &'static str {
        match self {
            ClassifyError::Path(_) => "bad_path",
            ClassifyError::Content(_) => "bad_content",
            ClassifyError::Unsupported { .. } => "unsupported",
        }
    }
}

fn origin(mut msg: Message, name_required: bool) -> Result<Origin, ClassifyError> {
    let node_id = resource::node_id(msg.resource())?.to_string();
    let namespace = resource::namespace(msg.resource())?.to_string();
    let name = if name_required {
        resource::resource_name(msg.resource())?.to_string()
    } else {
        resource::resource_name(msg.resource()).unwrap_or_default().to_string()
    };
    msg.content = serde_json::Value::Null;
    Ok(Origin { msg, node_id, namespace, name })
}

/// Pod status content is a list when the resource has no name, one request otherwise.
fn pod_statuses(msg: &Message) -> Result<Vec<PodStatusRequest>, ContentError> {
    if resource::resource_name(msg.resource()).is_err() {
        msg.content_as()
    } else {
        Ok(vec![msg.content_as()?])
    }
}

pub fn classify(msg: Message) -> Result<Upstream, ClassifyError> {
    if msg.is_response() {
        return Ok(Upstream::EdgeResponse(msg));
    }
    let resource_type = resource::resource_type(msg.resource())?.to_string();
    let op = msg.operation();
    let unsupported = || ClassifyError::Unsupported { resource_type: resource_type.clone(), operation: op };

    match (resource_type.as_str(), op) {
        (RESOURCE_TYPE_POD_STATUS, Operation::Update) => {
            let body = pod_statuses(&msg)?;
            Ok(Upstream::PodStatus(origin(msg, false)?, body))
        }
        (RESOURCE_TYPE_NODE_STATUS, Operation::Insert) => {
            let node: Node = msg.content_as()?;
            Ok(Upstream::NodeRegister(origin(msg, true)?, Box::new(node)))
        }
        (RESOURCE_TYPE_NODE_STATUS, Operation::Update) => {
            let req: NodeStatusRequest = msg.content_as()?;
            Ok(Upstream::NodeStatus(origin(msg, true)?, Box::new(req)))
        }
        (RESOURCE_TYPE_CONFIGMAP, Operation::Query) => Ok(Upstream::Query(QueryKind::ConfigMap, origin(msg, true)?)),
        (RESOURCE_TYPE_SECRET, Operation::Query) => Ok(Upstream::Query(QueryKind::Secret, origin(msg, true)?)),
        (RESOURCE_TYPE_SERVICE, Operation::Query) => Ok(Upstream::Query(QueryKind::Service, origin(msg, true)?)),
        (RESOURCE_TYPE_ENDPOINTS, Operation::Query) => Ok(Upstream::Query(QueryKind::Endpoints, origin(msg, true)?)),
        (RESOURCE_TYPE_NODE, Operation::Query) => Ok(Upstream::NodeQuery(origin(msg, true)?)),
        (RESOURCE_TYPE_NODE, Operation::Update) => {
            let node: Node = msg.content_as()?;
            Ok(Upstream::NodeUpdate(origin(msg, true)?, Box::new(node)))
        }
        (RESOURCE_TYPE_POD, Operation::Delete) => {
            let uid: String = msg.content_as()?;
            Ok(Upstream::PodDelete(origin(msg, true)?, uid))
        }
        _ => Err(unsupported()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn edge(resource: &str, op: Operation, content: serde_json::Value) -> Message {
        Message::new().build_router("edged", GROUP_RESOURCE, resource, op).fill_body(content)
    }

    #[test]
    fn pod_status_single_and_batch() {
        let one = edge("node/a/ns/podstatus/p", Operation::Update, json!({"name": "p", "uid": "u", "status": {"phase": "Running"}}));
        match classify(one).unwrap() {
            Upstream::PodStatus(o, reqs) => {
                assert_eq!((o.node_id.as_str(), o.namespace.as_str(), o.name.as_str()), ("a", "ns", "p"));
                assert_eq!(reqs.len(), 1);
                assert!(o.msg.content.is_null());
            }
            other => panic!("unexpected {other:?}"),
        }
        let batch = edge("node/a/ns/podstatus", Operation::Update, json!([{"name": "p1"}, {"name": "p2"}]));
        match classify(batch).unwrap() {
            Upstream::PodStatus(o, reqs) => {
                assert_eq!(o.name, "");
                assert_eq!(reqs.iter().map(|r| r.name.as_str()).collect::<Vec<_>>(), vec!["p1", "p2"]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn queries_need_a_name() {
        let q = edge("node/a/ns/configmap/cm1", Operation::Query, serde_json::Value::Null);
        assert!(matches!(classify(q).unwrap(), Upstream::Query(QueryKind::ConfigMap, _)));
        let nameless = edge("node/a/ns/secret", Operation::Query, serde_json::Value::Null);
        assert!(matches!(classify(nameless), Err(ClassifyError::Path(PathError::PathTooShort { index: 4, .. }))));
    }

    #[test]
    fn unknown_type_is_unsupported() {
        let m = edge("node/a/ns/rulestatus/r", Operation::Update, json!({}));
        let err = classify(m).unwrap_err();
        assert_eq!(err.reason(), "unsupported");
        let m = edge("node/a/ns/configmap/cm", Operation::Delete, json!({}));
        assert!(matches!(classify(m), Err(ClassifyError::Unsupported { .. })));
    }

    #[test]
    fn responses_short_circuit() {
        let m = edge("node/a/ns/pod/p", Operation::Response, json!("OK"));
        assert!(matches!(classify(m).unwrap(), Upstream::EdgeResponse(_)));
    }

    #[test]
    fn pod_delete_takes_uid_string() {
        let m = edge("node/a/ns/pod/p", Operation::Delete, json!("uid-1"));
        match classify(m).unwrap() {
            Upstream::PodDelete(o, uid) => {
                assert_eq!(o.name, "p");
                assert_eq!(uid, "uid-1");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
