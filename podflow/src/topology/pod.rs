//! Pod specifications and declarations.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Reserved name of the flow's entry point.
pub const GATEWAY: &str = "gateway";

/// Opaque executor parameters.
pub type ConfigBag = serde_json::Map<String, serde_json::Value>;

/// How replies from a pod's replicas are awaited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PollingPolicy {
    /// Every replica of every shard must answer.
    #[serde(alias = "all")]
    All,
    /// The first replica to answer for each shard is enough.
    #[default]
    #[serde(alias = "any")]
    Any,
}

impl fmt::Display for PollingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => write!(f, "ALL"),
            Self::Any => write!(f, "ANY"),
        }
    }
}

/// Inbound address of a pod.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    /// Host name or IP.
    pub host: String,
    /// Inbound port.
    pub port: u16,
}

impl Address {
    /// Creates an address.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Accelerator request attached to a pod's replicas.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct DeviceRequest {
    /// Device driver, e.g. "nvidia".
    #[serde(default)]
    pub driver: Option<String>,
    /// Number of devices; `None` means all available.
    #[serde(default)]
    pub count: Option<u32>,
    /// Specific device ids.
    #[serde(default)]
    pub device_ids: Vec<String>,
    /// Required capabilities, e.g. "gpu".
    #[serde(default)]
    pub capabilities: Vec<String>,
}

/// What kind of node a pod is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PodKind {
    /// Started, scaled and updated by this flow.
    Internal,
    /// Synthetic fan-in node that reduces over its needs.
    Join,
    /// Owned elsewhere; this flow only routes to it.
    External {
        /// Whether the owner runs it as a join node.
        joins: bool,
    },
}

/// A validated pod in a topology.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodSpec {
    /// Unique name within the flow.
    pub name: String,
    /// Node kind.
    pub kind: PodKind,
    /// Executor identity passed to the supervisor.
    pub uses: Option<String>,
    /// Number of shards, at least 1.
    pub shards: usize,
    /// Replicas per shard, at least 1.
    pub replicas: usize,
    /// Polling policy.
    pub polling: PollingPolicy,
    /// Upstream pods in declaration order; `gateway` is the entry point.
    pub needs: Vec<String>,
    /// Inbound address. Always present for join and external pods.
    pub address: Option<Address>,
    /// Executor parameters.
    pub executor: ConfigBag,
    /// Accelerator requests.
    pub resources: Vec<DeviceRequest>,
}

impl PodSpec {
    /// Creates an internal single-shard, single-replica pod.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: PodKind::Internal,
            uses: None,
            shards: 1,
            replicas: 1,
            polling: PollingPolicy::default(),
            needs: Vec::new(),
            address: None,
            executor: ConfigBag::new(),
            resources: Vec::new(),
        }
    }

    /// Returns true if the pod is owned outside this flow.
    #[must_use]
    pub fn is_external(&self) -> bool {
        matches!(self.kind, PodKind::External { .. })
    }

    /// Returns true if the pod is a join node of either ownership.
    #[must_use]
    pub fn is_join(&self) -> bool {
        matches!(self.kind, PodKind::Join | PodKind::External { joins: true })
    }

    /// Returns true if this flow reduces across the pod's needs before
    /// handing it a request.
    #[must_use]
    pub fn reduces_needs(&self) -> bool {
        matches!(self.kind, PodKind::Join)
    }

    /// Returns true if the flow starts and stops the pod's replicas.
    #[must_use]
    pub fn is_owned(&self) -> bool {
        !self.is_external()
    }

    /// Returns true if the pod reads from the flow's entry point.
    #[must_use]
    pub fn needs_gateway(&self) -> bool {
        self.needs.iter().any(|n| n == GATEWAY)
    }

    /// Total number of replica units.
    #[must_use]
    pub fn unit_count(&self) -> usize {
        self.shards * self.replicas
    }

    /// All `(shard, replica)` pairs in shard-major order.
    pub fn units(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        (0..self.shards).flat_map(move |shard| (0..self.replicas).map(move |replica| (shard, replica)))
    }

    /// Short label for logs and status output.
    #[must_use]
    pub fn kind_label(&self) -> &'static str {
        match self.kind {
            PodKind::Internal => "internal",
            PodKind::Join => "join",
            PodKind::External { joins: false } => "external",
            PodKind::External { joins: true } => "external-join",
        }
    }
}

/// A pod as submitted by a caller, before defaults are resolved.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PodDeclaration {
    /// Pod name; defaults to `executor{index}` (or `joiner` for joins).
    pub name: Option<String>,
    /// Executor identity.
    pub uses: Option<String>,
    /// Number of shards.
    pub shards: Option<usize>,
    /// Replicas per shard.
    pub replicas: Option<usize>,
    /// Polling policy.
    pub polling: Option<PollingPolicy>,
    /// Upstream pods; defaults to the previously declared pod.
    pub needs: Option<Vec<String>>,
    /// Whether the pod is owned elsewhere.
    pub external: bool,
    /// Whether the pod is a join node.
    pub join: bool,
    /// Inbound host.
    pub host: Option<String>,
    /// Inbound port.
    pub port_in: Option<u16>,
    /// Executor parameters.
    pub uses_with: ConfigBag,
    /// Accelerator requests.
    pub device_requests: Vec<DeviceRequest>,
}

impl PodDeclaration {
    /// Declares a named pod.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    /// Declares a join node over `needs`.
    #[must_use]
    pub fn join<I, S>(needs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            join: true,
            needs: Some(needs.into_iter().map(Into::into).collect()),
            ..Self::default()
        }
    }

    /// Sets the name.
    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the executor identity.
    #[must_use]
    pub fn uses(mut self, uses: impl Into<String>) -> Self {
        self.uses = Some(uses.into());
        self
    }

    /// Sets the shard count.
    #[must_use]
    pub fn shards(mut self, shards: usize) -> Self {
        self.shards = Some(shards);
        self
    }

    /// Sets the replica count.
    #[must_use]
    pub fn replicas(mut self, replicas: usize) -> Self {
        self.replicas = Some(replicas);
        self
    }

    /// Sets the polling policy.
    #[must_use]
    pub fn polling(mut self, polling: PollingPolicy) -> Self {
        self.polling = Some(polling);
        self
    }

    /// Sets the upstream pods.
    #[must_use]
    pub fn needs<I, S>(mut self, needs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.needs = Some(needs.into_iter().map(Into::into).collect());
        self
    }

    /// Marks the pod as externally owned.
    #[must_use]
    pub fn external(mut self) -> Self {
        self.external = true;
        self
    }

    /// Sets the inbound address.
    #[must_use]
    pub fn address(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = Some(host.into());
        self.port_in = Some(port);
        self
    }

    /// Adds an executor parameter.
    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.uses_with.insert(key.into(), value);
        self
    }

    /// Adds an accelerator request.
    #[must_use]
    pub fn with_device_request(mut self, request: DeviceRequest) -> Self {
        self.device_requests.push(request);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_polling_serde() {
        assert_eq!(serde_json::to_string(&PollingPolicy::All).unwrap(), r#""ALL""#);
        let parsed: PollingPolicy = serde_json::from_str(r#""any""#).unwrap();
        assert_eq!(parsed, PollingPolicy::Any);
        assert_eq!(PollingPolicy::default(), PollingPolicy::Any);
    }

    #[test]
    fn test_units_are_shard_major() {
        let mut spec = PodSpec::new("p");
        spec.shards = 2;
        spec.replicas = 2;
        let units: Vec<_> = spec.units().collect();
        assert_eq!(units, vec![(0, 0), (0, 1), (1, 0), (1, 1)]);
        assert_eq!(spec.unit_count(), 4);
    }

    #[test]
    fn test_kind_predicates() {
        let mut spec = PodSpec::new("p");
        assert!(spec.is_owned());
        assert!(!spec.is_join());

        spec.kind = PodKind::Join;
        assert!(spec.is_join());
        assert!(spec.reduces_needs());

        spec.kind = PodKind::External { joins: true };
        assert!(spec.is_join());
        assert!(spec.is_external());
        assert!(!spec.reduces_needs());
        assert_eq!(spec.kind_label(), "external-join");
    }

    #[test]
    fn test_declaration_from_json() {
        let decl: PodDeclaration = serde_json::from_str(
            r#"{"name": "ext", "external": true, "host": "10.0.0.2", "port_in": 45000,
                "shards": 2, "polling": "all", "needs": ["gateway", "foo"]}"#,
        )
        .unwrap();

        assert_eq!(decl.name.as_deref(), Some("ext"));
        assert!(decl.external);
        assert_eq!(decl.shards, Some(2));
        assert_eq!(decl.polling, Some(PollingPolicy::All));
        assert_eq!(decl.needs, Some(vec!["gateway".to_string(), "foo".to_string()]));
    }

    #[test]
    fn test_address_display() {
        assert_eq!(Address::new("0.0.0.0", 8080).to_string(), "0.0.0.0:8080");
    }
}
