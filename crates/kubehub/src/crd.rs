//! Device and DeviceModel custom resources (devices.kubeedge.io/v1alpha2).

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{LocalObjectReference, NodeSelector};
use kube::CustomResource;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[kube(
    group = "devices.kubeedge.io",
    version = "v1alpha2",
    kind = "Device",
    plural = "devices",
    namespaced,
    status = "DeviceStatus",
    schema = "disabled",
    derive = "PartialEq",
    derive = "Default"
)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_model_ref: Option<LocalObjectReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<NodeSelector>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub property_visitors: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatus {
    #[serde(default)]
    pub twins: Vec<Twin>,
}

/// One twin property: cloud-owned `desired`, edge-owned `reported`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Twin {
    pub property_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desired: Option<TwinProperty>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reported: Option<TwinProperty>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TwinProperty {
    #[serde(default)]
    pub value: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl Device {
    /// Node the device is bound to: first value of the first match expression
    /// of the first node-selector term.
    pub fn bound_node(&self) -> Option<&str> {
        self.spec
            .node_selector
            .as_ref()?
            .node_selector_terms
            .first()?
            .match_expressions
            .as_ref()?
            .first()?
            .values
            .as_ref()?
            .first()
            .map(String::as_str)
            .filter(|s| !s.is_empty())
    }

    pub fn twins(&self) -> &[Twin] {
        self.status.as_ref().map(|s| s.twins.as_slice()).unwrap_or(&[])
    }
}

#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[kube(
    group = "devices.kubeedge.io",
    version = "v1alpha2",
    kind = "DeviceModel",
    plural = "devicemodels",
    namespaced,
    schema = "disabled",
    derive = "PartialEq",
    derive = "Default"
)]
#[serde(rename_all = "camelCase")]
pub struct DeviceModelSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub properties: Vec<DeviceProperty>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DeviceProperty {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{NodeSelectorRequirement, NodeSelectorTerm};

    pub(crate) fn selector(node: &str) -> NodeSelector {
        NodeSelector {
            node_selector_terms: vec![NodeSelectorTerm {
                match_expressions: Some(vec![NodeSelectorRequirement {
                    key: "".into(),
                    operator: "In".into(),
                    values: Some(vec![node.to_string()]),
                }]),
                match_fields: None,
            }],
        }
    }

    #[test]
    fn bound_node_reads_first_selector_value() {
        let mut d = Device::new("sensor", DeviceSpec { node_selector: Some(selector("edge-1")), ..Default::default() });
        assert_eq!(d.bound_node(), Some("edge-1"));
        d.spec.node_selector = None;
        assert_eq!(d.bound_node(), None);
    }

    #[test]
    fn status_twins_use_camel_case() {
        let raw = serde_json::json!({
            "apiVersion": "devices.kubeedge.io/v1alpha2",
            "kind": "Device",
            "metadata": {"name": "d", "namespace": "default"},
            "spec": {},
            "status": {"twins": [{"propertyName": "temperature", "desired": {"value": "20", "metadata": {"type": "int"}}}]}
        });
        let d: Device = serde_json::from_value(raw).unwrap();
        assert_eq!(d.twins()[0].property_name, "temperature");
        assert_eq!(d.twins()[0].desired.as_ref().unwrap().metadata["type"], "int");
        assert!(d.twins()[0].reported.is_none());
    }
}
