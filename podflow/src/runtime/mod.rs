//! Flow runtime: materializing, mutating and tearing down one flow.
//!
//! This module provides:
//! - The [`Supervisor`] contract for starting, stopping and probing replicas
//! - An in-process supervisor backed by tokio tasks
//! - The replica arena owned by each flow
//! - The lifecycle state machine and published status snapshots
//! - [`FlowRuntime`], which drives build, rolling update, scale and teardown

mod arena;
mod flow;
mod snapshot;
mod state;
mod supervisor;

pub use arena::{ReplicaArena, ReplicaKey, ReplicaSlot};
pub use flow::{FlowLaunch, FlowRuntime};
pub use snapshot::{FlowSnapshot, PodStatus, SnapshotCell};
pub use state::FlowState;
pub use supervisor::{
    InProcessSupervisor, ReplicaHandle, ReplicaUnit, Supervisor, SupervisorError,
};

#[cfg(test)]
pub use supervisor::MockSupervisor;
