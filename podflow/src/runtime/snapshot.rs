//! Immutable status views published by a flow runtime.

use super::{FlowState, ReplicaArena};
use crate::topology::{ConfigBag, PollingPolicy, Topology};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Status of one pod.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodStatus {
    /// Pod name.
    pub name: String,
    /// Kind label, see [`crate::topology::PodSpec::kind_label`].
    pub kind: String,
    /// Executor identity.
    pub uses: Option<String>,
    /// Shard count.
    pub shards: usize,
    /// Declared replicas per shard.
    pub replicas: usize,
    /// Reply policy.
    pub polling: PollingPolicy,
    /// Upstream pods.
    pub needs: Vec<String>,
    /// Inbound address as `host:port`.
    pub address: Option<String>,
    /// Executor configuration.
    pub executor: ConfigBag,
    /// Routable replicas per shard; empty for external pods.
    pub routable: Vec<usize>,
    /// Retired replicas that failed to stop; retried at teardown.
    #[serde(default)]
    pub stale: usize,
}

/// Point-in-time view of a flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowSnapshot {
    /// Flow id.
    pub flow_id: String,
    /// Owning workspace, if any.
    pub workspace_id: Option<String>,
    /// Lifecycle state.
    pub state: FlowState,
    /// Digest of the topology in effect.
    pub topology_digest: String,
    /// Pods in declaration order.
    pub pods: Vec<PodStatus>,
    /// Bumped by every successful mutation.
    pub generation: u64,
    /// When the flow was created.
    pub created_at: DateTime<Utc>,
    /// When this snapshot was taken.
    pub updated_at: DateTime<Utc>,
}

impl FlowSnapshot {
    /// Builds a snapshot from a topology and the replicas currently owned.
    #[must_use]
    pub fn capture(
        flow_id: &str,
        workspace_id: Option<&str>,
        state: FlowState,
        topology: &Topology,
        arena: &ReplicaArena,
        generation: u64,
        created_at: DateTime<Utc>,
    ) -> Self {
        let pods = topology
            .pods()
            .iter()
            .map(|spec| PodStatus {
                name: spec.name.clone(),
                kind: spec.kind_label().to_string(),
                uses: spec.uses.clone(),
                shards: spec.shards,
                replicas: spec.replicas,
                polling: spec.polling,
                needs: spec.needs.clone(),
                address: spec.address.as_ref().map(ToString::to_string),
                executor: spec.executor.clone(),
                routable: if spec.is_owned() {
                    arena.routable_per_shard(&spec.name, spec.shards)
                } else {
                    Vec::new()
                },
                stale: arena.stale_count(&spec.name),
            })
            .collect();

        Self {
            flow_id: flow_id.to_string(),
            workspace_id: workspace_id.map(str::to_string),
            state,
            topology_digest: topology.digest().to_string(),
            pods,
            generation,
            created_at,
            updated_at: Utc::now(),
        }
    }

    /// Returns a pod's status.
    #[must_use]
    pub fn pod(&self, name: &str) -> Option<&PodStatus> {
        self.pods.iter().find(|p| p.name == name)
    }

    /// Returns the pod names in declaration order.
    #[must_use]
    pub fn pod_names(&self) -> Vec<&str> {
        self.pods.iter().map(|p| p.name.as_str()).collect()
    }
}

/// Shared slot holding the most recently published snapshot.
///
/// Readers get an `Arc` to a complete snapshot; a writer replaces it whole.
#[derive(Debug)]
pub struct SnapshotCell {
    current: RwLock<Arc<FlowSnapshot>>,
}

impl SnapshotCell {
    /// Creates a cell holding `snapshot`.
    #[must_use]
    pub fn new(snapshot: FlowSnapshot) -> Self {
        Self {
            current: RwLock::new(Arc::new(snapshot)),
        }
    }

    /// Returns the current snapshot.
    #[must_use]
    pub fn load(&self) -> Arc<FlowSnapshot> {
        self.current.read().clone()
    }

    /// Replaces the current snapshot.
    pub fn store(&self, snapshot: FlowSnapshot) {
        *self.current.write() = Arc::new(snapshot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::{PodDeclaration, TopologyBuilder};

    fn snapshot(state: FlowState) -> FlowSnapshot {
        let topology = TopologyBuilder::new()
            .add(PodDeclaration::new("enc").shards(2))
            .add(PodDeclaration::new("ext").external().address("10.0.0.1", 8080))
            .build()
            .unwrap();
        FlowSnapshot::capture("f1", Some("ws"), state, &topology, &ReplicaArena::new(), 0, Utc::now())
    }

    #[test]
    fn test_capture_lists_pods() {
        let snap = snapshot(FlowState::Running);

        assert_eq!(snap.pod_names(), vec!["enc", "ext"]);
        assert_eq!(snap.pod("enc").unwrap().routable, vec![0, 0]);
        assert!(snap.pod("ext").unwrap().routable.is_empty());
        assert_eq!(snap.pod("ext").unwrap().address.as_deref(), Some("10.0.0.1:8080"));
        assert_eq!(snap.workspace_id.as_deref(), Some("ws"));
    }

    #[test]
    fn test_cell_replaces_whole_snapshot() {
        let cell = SnapshotCell::new(snapshot(FlowState::Building));
        let before = cell.load();

        cell.store(snapshot(FlowState::Running));

        assert_eq!(before.state, FlowState::Building);
        assert_eq!(cell.load().state, FlowState::Running);
    }
}
