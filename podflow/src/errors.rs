//! Error types for the podflow control plane.
//!
//! Every fallible control-plane operation returns [`FlowError`]. Each variant
//! maps onto an [`ErrorCategory`] so the control surface can translate it to a
//! caller-facing outcome without leaking internal detail.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// The main error type for control-plane operations.
#[derive(Debug, Clone, Error)]
pub enum FlowError {
    /// The submitted topology is not a valid DAG.
    #[error("{0}")]
    Topology(#[from] TopologyError),

    /// A pod failed to start while the flow was building.
    #[error("Build failed at pod '{pod}': {reason}")]
    BuildFailure {
        /// The pod that failed to start.
        pod: String,
        /// Why it failed.
        reason: String,
    },

    /// An unknown flow id or pod name.
    #[error("{what} not found")]
    NotFound {
        /// Description of the missing thing.
        what: String,
    },

    /// A mutation was attempted on a pod this flow does not own.
    #[error("Forbidden: {reason}")]
    Forbidden {
        /// The pod targeted by the mutation.
        pod: String,
        /// Why it is forbidden.
        reason: String,
    },

    /// A rolling update was rolled back.
    #[error("Rolling update of pod '{pod}' failed: {reason}")]
    UpdateFailed {
        /// The pod being updated.
        pod: String,
        /// Why it failed.
        reason: String,
    },

    /// A scale operation was rolled back.
    #[error("Scaling pod '{pod}' failed: {reason}")]
    ScaleFailed {
        /// The pod being scaled.
        pod: String,
        /// Why it failed.
        reason: String,
    },

    /// Some replicas could not be stopped while a flow was terminated.
    #[error("Flow '{flow}' did not terminate cleanly: {reason}")]
    TeardownFailed {
        /// The flow being terminated.
        flow: String,
        /// Which replicas failed and why.
        reason: String,
    },

    /// The request itself is malformed.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// A flow with the requested id already exists or is being built.
    #[error("Flow '{0}' already exists")]
    AlreadyExists(String),

    /// The operation was cancelled before it finished.
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// The operation is not valid in the flow's current lifecycle state.
    #[error("Cannot {operation} while flow is {state}")]
    InvalidState {
        /// The attempted operation.
        operation: String,
        /// The current state.
        state: String,
    },

    /// The registry no longer accepts new flows.
    #[error("Registry is shutting down")]
    ShuttingDown,

    /// Some flows could not be terminated by a bulk delete.
    #[error("{0}")]
    Clear(#[from] ClearError),

    /// Replies could not be combined.
    #[error("{0}")]
    Reduction(#[from] ReductionError),
}

impl FlowError {
    /// Creates a not-found error for a flow id.
    #[must_use]
    pub fn flow_not_found(id: impl fmt::Display) -> Self {
        Self::NotFound {
            what: format!("Flow '{id}'"),
        }
    }

    /// Creates a not-found error for a pod name.
    #[must_use]
    pub fn pod_not_found(pod: &str) -> Self {
        Self::NotFound {
            what: format!("Pod '{pod}'"),
        }
    }

    /// Creates a forbidden error for an external pod.
    #[must_use]
    pub fn external_pod(pod: &str, operation: &str) -> Self {
        Self::Forbidden {
            pod: pod.to_string(),
            reason: format!("pod '{pod}' is external and cannot be {operation}"),
        }
    }

    /// Creates a build failure.
    #[must_use]
    pub fn build_failure(pod: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::BuildFailure {
            pod: pod.into(),
            reason: reason.into(),
        }
    }

    /// Creates an update failure.
    #[must_use]
    pub fn update_failed(pod: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::UpdateFailed {
            pod: pod.into(),
            reason: reason.into(),
        }
    }

    /// Creates a scale failure.
    #[must_use]
    pub fn scale_failed(pod: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ScaleFailed {
            pod: pod.into(),
            reason: reason.into(),
        }
    }

    /// Returns the caller-facing category of this error.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::NotFound { .. } => ErrorCategory::NotFound,
            Self::Forbidden { .. } => ErrorCategory::Forbidden,
            Self::AlreadyExists(_) | Self::InvalidState { .. } => ErrorCategory::Conflict,
            Self::ShuttingDown => ErrorCategory::Unavailable,
            Self::Topology(_)
            | Self::BuildFailure { .. }
            | Self::UpdateFailed { .. }
            | Self::ScaleFailed { .. }
            | Self::TeardownFailed { .. }
            | Self::InvalidRequest(_)
            | Self::Cancelled(_)
            | Self::Clear(_)
            | Self::Reduction(_) => ErrorCategory::BadRequest,
        }
    }

    /// Returns true if resubmitting the same request may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::BuildFailure { .. }
                | Self::UpdateFailed { .. }
                | Self::ScaleFailed { .. }
                | Self::Cancelled(_)
                | Self::InvalidState { .. }
        )
    }

    /// Returns a message fit for callers: the failing operation and the pod
    /// or flow it concerns, without the step-level reason of multi-step
    /// failures.
    #[must_use]
    pub fn summary(&self) -> String {
        match self {
            Self::BuildFailure { pod, .. } => format!("Build failed at pod '{pod}'"),
            Self::UpdateFailed { pod, .. } => format!("Rolling update of pod '{pod}' failed"),
            Self::ScaleFailed { pod, .. } => format!("Scaling pod '{pod}' failed"),
            Self::TeardownFailed { flow, .. } => format!("Flow '{flow}' did not terminate cleanly"),
            Self::Cancelled(_) => "Operation cancelled".to_string(),
            Self::Clear(clear) => format!(
                "{} of {} flows failed to terminate",
                clear.failures.len(),
                clear.attempted
            ),
            other => other.to_string(),
        }
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("category".to_string(), serde_json::json!(self.category()));
        map.insert("message".to_string(), serde_json::json!(self.to_string()));
        map.insert("retryable".to_string(), serde_json::json!(self.is_retryable()));
        if let Self::Topology(err) = self {
            map.insert("code".to_string(), serde_json::json!(err.error_info.code));
            if let Some(ref hint) = err.error_info.fix_hint {
                map.insert("fix_hint".to_string(), serde_json::json!(hint));
            }
        }
        map
    }
}

/// Caller-facing error categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Unknown flow or pod.
    NotFound,
    /// Invalid input or a failed build, update or scale.
    BadRequest,
    /// Mutation of something this flow does not own.
    Forbidden,
    /// Conflicts with existing state.
    Conflict,
    /// The service is not accepting work.
    Unavailable,
}

impl ErrorCategory {
    /// Returns the HTTP-equivalent status code.
    #[must_use]
    pub const fn status_code(self) -> u16 {
        match self {
            Self::NotFound => 404,
            Self::BadRequest => 400,
            Self::Forbidden => 403,
            Self::Conflict => 409,
            Self::Unavailable => 503,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "not_found"),
            Self::BadRequest => write!(f, "bad_request"),
            Self::Forbidden => write!(f, "forbidden"),
            Self::Conflict => write!(f, "conflict"),
            Self::Unavailable => write!(f, "unavailable"),
        }
    }
}

/// Metadata about a contract error for better diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ContractErrorInfo {
    /// Error code (e.g., "TOPOLOGY-CYCLE").
    pub code: String,
    /// Short summary of the error.
    pub summary: String,
    /// Hint for fixing the error.
    pub fix_hint: Option<String>,
    /// Additional context key-value pairs.
    #[serde(default)]
    pub context: HashMap<String, String>,
}

impl ContractErrorInfo {
    /// Creates a new contract error info.
    #[must_use]
    pub fn new(code: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            summary: summary.into(),
            fix_hint: None,
            context: HashMap::new(),
        }
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }

    /// Adds a single context entry.
    #[must_use]
    pub fn with_context_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// What made a topology invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopologyErrorKind {
    /// The needs edges form a cycle.
    Cycle,
    /// Two pods share a name.
    DuplicateName,
    /// A needs entry names an undeclared pod.
    DanglingNeeds,
    /// A join or external pod has no inbound address.
    MissingAddress,
    /// No pods were declared.
    Empty,
    /// A pod declaration is malformed (bad name, zero shards, ...).
    InvalidPod,
}

/// Error raised when a topology fails validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct TopologyError {
    /// What went wrong.
    pub kind: TopologyErrorKind,
    /// Human-readable message.
    pub message: String,
    /// Pods involved in the error.
    pub pods: Vec<String>,
    /// Diagnostic metadata.
    pub error_info: ContractErrorInfo,
}

impl TopologyError {
    fn new(
        kind: TopologyErrorKind,
        message: String,
        pods: Vec<String>,
        error_info: ContractErrorInfo,
    ) -> Self {
        Self {
            kind,
            message,
            pods,
            error_info,
        }
    }

    /// The needs edges contain a cycle along `path`.
    #[must_use]
    pub fn cycle(path: Vec<String>) -> Self {
        let joined = path.join(" -> ");
        Self::new(
            TopologyErrorKind::Cycle,
            format!("Cycle detected in topology: {joined}"),
            path,
            ContractErrorInfo::new("TOPOLOGY-CYCLE", format!("Topology contains a cycle: {joined}"))
                .with_fix_hint("Remove one of the needs edges in the cycle."),
        )
    }

    /// Two pods were declared with the same name.
    #[must_use]
    pub fn duplicate(name: &str) -> Self {
        Self::new(
            TopologyErrorKind::DuplicateName,
            format!("Pod '{name}' is declared more than once"),
            vec![name.to_string()],
            ContractErrorInfo::new("TOPOLOGY-DUPLICATE", format!("Duplicate pod name '{name}'"))
                .with_fix_hint("Give every pod in a flow a unique name."),
        )
    }

    /// A pod needs a pod that was not declared before it.
    #[must_use]
    pub fn dangling(pod: &str, need: &str) -> Self {
        Self::new(
            TopologyErrorKind::DanglingNeeds,
            format!("Pod '{pod}' needs unknown pod '{need}'"),
            vec![pod.to_string(), need.to_string()],
            ContractErrorInfo::new("TOPOLOGY-DANGLING", format!("Needs '{need}' not found"))
                .with_context_entry("pod", pod)
                .with_fix_hint("Declare a pod before any pod that needs it."),
        )
    }

    /// A join or external pod was declared without an inbound address.
    #[must_use]
    pub fn missing_address(pod: &str, kind: &str) -> Self {
        Self::new(
            TopologyErrorKind::MissingAddress,
            format!("{kind} pod '{pod}' requires an inbound address"),
            vec![pod.to_string()],
            ContractErrorInfo::new("TOPOLOGY-ADDRESS", format!("Pod '{pod}' has no inbound address"))
                .with_context_entry("kind", kind)
                .with_fix_hint("Set host and port_in on join and external pods."),
        )
    }

    /// No pods were declared.
    #[must_use]
    pub fn empty() -> Self {
        Self::new(
            TopologyErrorKind::Empty,
            "Topology has no pods".to_string(),
            Vec::new(),
            ContractErrorInfo::new("TOPOLOGY-EMPTY", "Cannot build an empty topology")
                .with_fix_hint("Add at least one pod."),
        )
    }

    /// A single declaration is malformed.
    #[must_use]
    pub fn invalid_pod(pod: &str, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self::new(
            TopologyErrorKind::InvalidPod,
            format!("Pod '{pod}' is invalid: {reason}"),
            vec![pod.to_string()],
            ContractErrorInfo::new("TOPOLOGY-INVALID", reason),
        )
    }
}

/// Errors raised while combining replies.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReductionError {
    /// A shard produced no reply under `ALL` polling.
    #[error("Pod '{pod}' has no reply from shard {shard}")]
    MissingShard {
        /// The pod.
        pod: String,
        /// The silent shard.
        shard: usize,
    },

    /// No replica answered at all.
    #[error("Pod '{0}' produced no replies")]
    NoReplies(String),

    /// A reply came from a shard or replica the pod does not have.
    #[error("Pod '{pod}' received a reply from unknown unit {shard}/{replica}")]
    UnknownUnit {
        /// The pod.
        pod: String,
        /// The reported shard.
        shard: usize,
        /// The reported replica.
        replica: usize,
    },

    /// An upstream output was needed but not produced.
    #[error("Pod '{pod}' is missing the output of '{upstream}'")]
    MissingUpstream {
        /// The consumer.
        pod: String,
        /// The absent upstream pod.
        upstream: String,
    },

    /// The pod is not part of the topology.
    #[error("Pod '{0}' is not in the topology")]
    UnknownPod(String),
}

/// Aggregated failures of a bulk delete.
#[derive(Debug, Clone, Error)]
#[error("{} of {} flows failed to terminate: {}", .failures.len(), .attempted, summarize(.failures))]
pub struct ClearError {
    /// Number of flows a delete was attempted on.
    pub attempted: usize,
    /// Flow ids that failed, with their errors.
    pub failures: Vec<(String, FlowError)>,
}

impl ClearError {
    /// Returns the number of flows that terminated cleanly.
    #[must_use]
    pub fn succeeded(&self) -> usize {
        self.attempted.saturating_sub(self.failures.len())
    }
}

fn summarize(failures: &[(String, FlowError)]) -> String {
    failures
        .iter()
        .map(|(id, err)| format!("{id}: {err}"))
        .collect::<Vec<_>>()
        .join("; ")
}
