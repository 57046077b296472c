//! Flow lifecycle states.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a flow.
///
/// ```text
/// Building -> Running | Failed
/// Running  -> Updating | Terminating
/// Updating -> Running | Failed
/// Failed   -> Terminating
/// Terminating -> Terminated
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowState {
    /// Replicas are being started.
    Building,
    /// Every owned replica is healthy and routable.
    Running,
    /// A rolling update or scale is in progress.
    Updating,
    /// Replicas are being stopped.
    Terminating,
    /// Every owned replica has been stopped.
    Terminated,
    /// A build or mutation left the flow unusable.
    Failed,
}

impl FlowState {
    /// Returns true if the lifecycle may move from `self` to `next`.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Building, Self::Running | Self::Failed)
                | (Self::Running, Self::Updating | Self::Terminating)
                | (Self::Updating, Self::Running | Self::Failed)
                | (Self::Failed | Self::Building, Self::Terminating)
                | (Self::Terminating, Self::Terminated)
        )
    }

    /// Returns true for states no operation leaves except teardown.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Terminated | Self::Failed)
    }

    /// Returns true if the topology may be mutated in this state.
    #[must_use]
    pub const fn accepts_mutations(self) -> bool {
        matches!(self, Self::Running)
    }

    /// Returns the state name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Building => "building",
            Self::Running => "running",
            Self::Updating => "updating",
            Self::Terminating => "terminating",
            Self::Terminated => "terminated",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for FlowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
