//! Device payloads exchanged with edge nodes.

use std::collections::BTreeMap;

use kedge_core::message::now_millis;
use serde::{Deserialize, Serialize};

/// Metadata type carried by a twin the cloud removed.
pub const TWIN_DELETED: &str = "deleted";
/// Metadata type assumed when the desired value does not name one.
pub const TWIN_DEFAULT_TYPE: &str = "string";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BaseMessage {
    #[serde(default)]
    pub event_id: String,
    #[serde(default)]
    pub timestamp: i64,
}

impl BaseMessage {
    pub fn fresh() -> Self {
        Self { event_id: uuid::Uuid::new_v4().to_string(), timestamp: now_millis() }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValueMetadata {
    #[serde(default)]
    pub timestamp: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TypeMetadata {
    #[serde(rename = "type", default)]
    pub kind: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TwinValue {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ValueMetadata>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TwinVersion {
    pub cloud: i64,
    pub edge: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MsgTwin {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<TwinValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual: Option<TwinValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optional: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<TypeMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_version: Option<TwinVersion>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_version: Option<TwinVersion>,
}

impl MsgTwin {
    /// Cloud-side desired value as the edge expects it.
    pub fn expected(value: &str, kind: &str, cloud_version: i64) -> Self {
        Self {
            expected: Some(TwinValue {
                value: Some(value.to_string()),
                metadata: Some(ValueMetadata { timestamp: now_millis() }),
            }),
            actual: None,
            optional: Some(false),
            metadata: Some(TypeMetadata { kind: kind.to_string() }),
            expected_version: Some(TwinVersion { cloud: cloud_version, edge: 0 }),
            actual_version: None,
        }
    }

    /// Reported value, when the edge sent one.
    pub fn actual_value(&self) -> Option<&str> {
        self.actual.as_ref()?.value.as_deref()
    }
}

/// A device as listed in a membership update.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EdgeDevice {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub twin: BTreeMap<String, MsgTwin>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MembershipUpdate {
    #[serde(flatten)]
    pub base: BaseMessage,
    #[serde(rename = "added_devices", default, skip_serializing_if = "Vec::is_empty")]
    pub added: Vec<EdgeDevice>,
    #[serde(rename = "removed_devices", default, skip_serializing_if = "Vec::is_empty")]
    pub removed: Vec<EdgeDevice>,
}

/// Twin changes for one device, in either direction.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceTwinUpdate {
    #[serde(flatten)]
    pub base: BaseMessage,
    #[serde(default)]
    pub twin: BTreeMap<String, MsgTwin>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn edge_report_decodes_without_envelope_fields() {
        let raw = json!({"twin": {"temperature": {"actual": {"value": "22.4", "metadata": {"timestamp": 1700000000}}, "metadata": {"type": "float"}}}});
        let update: DeviceTwinUpdate = serde_json::from_value(raw).unwrap();
        let t = &update.twin["temperature"];
        assert_eq!(t.actual_value(), Some("22.4"));
        assert_eq!(t.metadata.as_ref().unwrap().kind, "float");
        assert_eq!(update.base.event_id, "");
    }

    #[test]
    fn membership_only_carries_its_side() {
        let m = MembershipUpdate {
            base: BaseMessage { event_id: "e".into(), timestamp: 1 },
            added: vec![EdgeDevice { id: "d".into(), name: "d".into(), ..Default::default() }],
            removed: Vec::new(),
        };
        assert_eq!(
            serde_json::to_value(&m).unwrap(),
            json!({"event_id": "e", "timestamp": 1, "added_devices": [{"id": "d", "name": "d"}]})
        );
    }
}
