//! Request and response models.

use crate::registry::FlowId;
use crate::runtime::FlowSnapshot;
use crate::topology::{ConfigBag, DeviceRequest, PodDeclaration};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The flow definition inside a create request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowParams {
    /// Pods in declaration order.
    pub pods: Vec<PodDeclaration>,
}

/// A request to create a flow.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CreateFlowRequest {
    /// Caller-chosen id; generated when absent.
    pub id: Option<String>,
    /// Owning workspace.
    pub workspace_id: Option<String>,
    /// The flow definition.
    pub params: FlowParams,
    /// Inbound port per pod name, overriding the declared one.
    pub ports: BTreeMap<String, u16>,
    /// Environment passed to every replica.
    pub envs: BTreeMap<String, String>,
    /// Accelerator requests for owned pods that declare none.
    pub device_requests: Vec<DeviceRequest>,
}

/// A request to rolling-update one pod.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RollingUpdateRequest {
    /// Target pod.
    pub pod_name: String,
    /// Dump to reload from; merged into `uses_with` as `dump_path`.
    #[serde(default)]
    pub dump_path: Option<String>,
    /// Executor configuration to apply.
    #[serde(default)]
    pub uses_with: Option<ConfigBag>,
}

impl RollingUpdateRequest {
    /// Creates a request with no configuration.
    #[must_use]
    pub fn new(pod_name: impl Into<String>) -> Self {
        Self {
            pod_name: pod_name.into(),
            ..Self::default()
        }
    }

    /// Sets the dump path.
    #[must_use]
    pub fn with_dump_path(mut self, dump_path: impl Into<String>) -> Self {
        self.dump_path = Some(dump_path.into());
        self
    }

    /// Sets one executor parameter.
    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.uses_with
            .get_or_insert_with(ConfigBag::new)
            .insert(key.into(), value);
        self
    }

    /// Returns the configuration bag with the dump path merged in.
    #[must_use]
    pub fn merged_config(&self) -> ConfigBag {
        let mut bag = self.uses_with.clone().unwrap_or_default();
        if let Some(ref dump_path) = self.dump_path {
            bag.insert("dump_path".to_string(), serde_json::json!(dump_path));
        }
        bag
    }
}

/// A request to scale one pod.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScaleRequest {
    /// Target pod.
    pub pod_name: String,
    /// Desired replicas per shard.
    pub replicas: i64,
}

impl ScaleRequest {
    /// Creates a request.
    #[must_use]
    pub fn new(pod_name: impl Into<String>, replicas: i64) -> Self {
        Self {
            pod_name: pod_name.into(),
            replicas,
        }
    }
}

/// Successful creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Created {
    /// Always 201.
    pub status: u16,
    /// The assigned id.
    pub id: FlowId,
}

/// Every flow currently published.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlowListing {
    /// Number of flows.
    pub size: usize,
    /// Snapshot per flow id.
    pub items: BTreeMap<FlowId, FlowSnapshot>,
}

/// Outcome of deleting every flow.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClearReport {
    /// Flows a delete was attempted on.
    pub attempted: usize,
    /// Flows that terminated cleanly.
    pub deleted: usize,
    /// Failure detail per flow id.
    pub failures: BTreeMap<String, String>,
}

/// One accepted field of a create request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaField {
    /// JSON type name.
    #[serde(rename = "type")]
    pub type_name: String,
    /// Human-readable description.
    pub description: String,
    /// Whether the field must be present.
    pub required: bool,
}

impl SchemaField {
    fn optional(type_name: &str, description: &str) -> Self {
        Self {
            type_name: type_name.to_string(),
            description: description.to_string(),
            required: false,
        }
    }
}

/// Returns the accepted fields of a create request by name.
#[must_use]
pub fn schema() -> BTreeMap<String, SchemaField> {
    [
        ("id", SchemaField::optional("string", "Flow id; generated when absent")),
        ("workspace_id", SchemaField::optional("string", "Owning workspace")),
        (
            "params",
            SchemaField::optional("object", "Flow definition: {\"pods\": [pod declarations]}"),
        ),
        ("ports", SchemaField::optional("object", "Inbound port per pod name")),
        ("envs", SchemaField::optional("object", "Environment passed to every replica")),
        (
            "device_requests",
            SchemaField::optional("array", "Accelerator requests for pods that declare none"),
        ),
    ]
    .into_iter()
    .map(|(name, field)| (name.to_string(), field))
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dump_path_merged_into_config() {
        let request = RollingUpdateRequest::new("idx")
            .with_param("model", serde_json::json!("v2"))
            .with_dump_path("/dumps/1");

        let bag = request.merged_config();

        assert_eq!(bag.get("dump_path"), Some(&serde_json::json!("/dumps/1")));
        assert_eq!(bag.get("model"), Some(&serde_json::json!("v2")));
    }

    #[test]
    fn test_dump_path_alone_creates_config() {
        let bag = RollingUpdateRequest::new("idx").with_dump_path("/d").merged_config();
        assert_eq!(bag.len(), 1);
        assert!(RollingUpdateRequest::new("idx").merged_config().is_empty());
    }

    #[test]
    fn test_create_request_from_json() {
        let json = r#"{
            "workspace_id": "ws",
            "params": {"pods": [{"name": "enc", "shards": 2}, {"name": "idx", "needs": ["enc"]}]},
            "ports": {"idx": 45000},
            "envs": {"LOG": "debug"}
        }"#;

        let request: CreateFlowRequest = serde_json::from_str(json).unwrap();

        assert_eq!(request.params.pods.len(), 2);
        assert_eq!(request.params.pods[0].shards, Some(2));
        assert_eq!(request.ports.get("idx"), Some(&45000));
        assert!(request.id.is_none());
    }

    #[test]
    fn test_schema_lists_request_fields() {
        let fields = schema();
        let names: Vec<&str> = fields.keys().map(String::as_str).collect();
        assert_eq!(
            names,
            vec!["device_requests", "envs", "id", "params", "ports", "workspace_id"]
        );
        assert_eq!(fields["ports"].type_name, "object");
    }
}
