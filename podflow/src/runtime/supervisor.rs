//! Replica supervision contract and an in-process implementation.

use crate::topology::{Address, ConfigBag, DeviceRequest};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

/// Errors reported by a supervisor. They never leave the runtime; they are
/// folded into build, update or scale failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SupervisorError {
    /// The replica could not be started.
    #[error("failed to start {unit}: {reason}")]
    StartFailed {
        /// The unit label.
        unit: String,
        /// Why.
        reason: String,
    },

    /// The replica could not be stopped.
    #[error("failed to stop {unit}: {reason}")]
    StopFailed {
        /// The unit label.
        unit: String,
        /// Why.
        reason: String,
    },

    /// The supervisor does not know the handle.
    #[error("unknown replica {0}")]
    UnknownReplica(Uuid),
}

/// Everything a supervisor needs to start one replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaUnit {
    /// Owning flow.
    pub flow_id: String,
    /// Pod name.
    pub pod: String,
    /// Shard index.
    pub shard: usize,
    /// Replica index within the shard.
    pub replica: usize,
    /// Executor identity.
    pub uses: Option<String>,
    /// Pod inbound address, if any.
    pub address: Option<Address>,
    /// Accelerator requests.
    pub resources: Vec<DeviceRequest>,
    /// Environment passed to the replica.
    pub envs: BTreeMap<String, String>,
    /// Configuration generation; bumped by every rolling update.
    pub generation: u64,
}

impl fmt::Display for ReplicaUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/shard-{}/replica-{}@g{}",
            self.flow_id, self.pod, self.shard, self.replica, self.generation
        )
    }
}

/// A started replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaHandle {
    /// Supervisor-assigned id.
    pub id: Uuid,
    /// What was started.
    pub unit: ReplicaUnit,
    /// When it was started.
    pub started_at: DateTime<Utc>,
}

impl ReplicaHandle {
    /// Creates a handle with a fresh id.
    #[must_use]
    pub fn new(unit: ReplicaUnit) -> Self {
        Self {
            id: Uuid::new_v4(),
            unit,
            started_at: Utc::now(),
        }
    }
}

/// Starts, stops and probes replicas on behalf of the control plane.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Supervisor: Send + Sync {
    /// Starts one replica with the given executor configuration.
    async fn start(&self, unit: &ReplicaUnit, config: &ConfigBag) -> Result<ReplicaHandle, SupervisorError>;

    /// Stops a replica.
    async fn stop(&self, handle: &ReplicaHandle) -> Result<(), SupervisorError>;

    /// Returns true if the replica is ready to take traffic.
    async fn health(&self, handle: &ReplicaHandle) -> bool;

    /// Waits until the replica has no in-flight work, or `timeout` passes.
    async fn drain(&self, _handle: &ReplicaHandle, _timeout: Duration) -> Result<(), SupervisorError> {
        Ok(())
    }
}

struct ReplicaTask {
    shutdown: Option<oneshot::Sender<()>>,
    join: JoinHandle<()>,
    in_flight: Arc<AtomicUsize>,
}

/// Runs every replica as a tokio task inside the current process.
///
/// Used by the daemon when no external process manager is configured. A
/// replica is healthy while its task is alive.
#[derive(Default)]
pub struct InProcessSupervisor {
    tasks: DashMap<Uuid, ReplicaTask>,
}

impl InProcessSupervisor {
    /// Creates an empty supervisor.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of live replica tasks.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.tasks.iter().filter(|t| !t.join.is_finished()).count()
    }

    /// Marks one unit of work as in flight on a replica; returns a guard that
    /// completes it on drop.
    #[must_use]
    pub fn begin_work(&self, handle: &ReplicaHandle) -> Option<WorkGuard> {
        self.tasks.get(&handle.id).map(|task| {
            task.in_flight.fetch_add(1, Ordering::SeqCst);
            WorkGuard {
                counter: task.in_flight.clone(),
            }
        })
    }
}

impl fmt::Debug for InProcessSupervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InProcessSupervisor")
            .field("tasks", &self.tasks.len())
            .finish()
    }
}

/// Completes one in-flight unit of work when dropped.
#[derive(Debug)]
pub struct WorkGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for WorkGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Supervisor for InProcessSupervisor {
    async fn start(&self, unit: &ReplicaUnit, _config: &ConfigBag) -> Result<ReplicaHandle, SupervisorError> {
        let handle = ReplicaHandle::new(unit.clone());
        let (shutdown, stopped) = oneshot::channel::<()>();
        let label = unit.to_string();

        let join = tokio::spawn(async move {
            debug!(unit = %label, "Replica task started");
            let _ = stopped.await;
            debug!(unit = %label, "Replica task exiting");
        });

        self.tasks.insert(
            handle.id,
            ReplicaTask {
                shutdown: Some(shutdown),
                join,
                in_flight: Arc::new(AtomicUsize::new(0)),
            },
        );
        Ok(handle)
    }

    async fn stop(&self, handle: &ReplicaHandle) -> Result<(), SupervisorError> {
        let Some((_, mut task)) = self.tasks.remove(&handle.id) else {
            return Err(SupervisorError::UnknownReplica(handle.id));
        };
        if let Some(shutdown) = task.shutdown.take() {
            let _ = shutdown.send(());
        }
        task.join.await.map_err(|e| SupervisorError::StopFailed {
            unit: handle.unit.to_string(),
            reason: e.to_string(),
        })
    }

    async fn health(&self, handle: &ReplicaHandle) -> bool {
        self.tasks
            .get(&handle.id)
            .is_some_and(|task| !task.join.is_finished())
    }

    async fn drain(&self, handle: &ReplicaHandle, timeout: Duration) -> Result<(), SupervisorError> {
        let Some(counter) = self.tasks.get(&handle.id).map(|t| t.in_flight.clone()) else {
            return Err(SupervisorError::UnknownReplica(handle.id));
        };
        let deadline = tokio::time::Instant::now() + timeout;
        while counter.load(Ordering::SeqCst) > 0 {
            if tokio::time::Instant::now() >= deadline {
                warn!(unit = %handle.unit, "Drain timed out with work still in flight");
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        Ok(())
    }
}
