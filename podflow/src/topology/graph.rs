//! The validated, immutable topology of one flow.

use super::{PodSpec, GATEWAY};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap, HashSet};

/// A validated DAG of pods.
///
/// Built only by [`TopologyBuilder`](super::TopologyBuilder); every `needs`
/// entry resolves to a pod in the topology or to [`GATEWAY`], and the graph is
/// acyclic.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Topology {
    /// Pods in declaration order.
    pods: Vec<PodSpec>,
    /// Name to position in `pods`.
    #[serde(skip)]
    index: HashMap<String, usize>,
    /// Topological order (upstream first, declaration order as tie-break).
    #[serde(skip)]
    order: Vec<String>,
    /// Hex SHA-256 of the canonical pod list.
    #[serde(skip)]
    digest: String,
}

impl Topology {
    pub(super) fn new(pods: Vec<PodSpec>) -> Self {
        let index = pods
            .iter()
            .enumerate()
            .map(|(i, p)| (p.name.clone(), i))
            .collect();
        let order = topological_sort(&pods);
        let digest = compute_digest(&pods);

        Self {
            pods,
            index,
            order,
            digest,
        }
    }

    /// Returns the pods in declaration order.
    #[must_use]
    pub fn pods(&self) -> &[PodSpec] {
        &self.pods
    }

    /// Looks up a pod by name.
    #[must_use]
    pub fn pod(&self, name: &str) -> Option<&PodSpec> {
        self.index.get(name).map(|&i| &self.pods[i])
    }

    /// Returns the pod names in declaration order.
    #[must_use]
    pub fn pod_names(&self) -> Vec<&str> {
        self.pods.iter().map(|p| p.name.as_str()).collect()
    }

    /// Returns the number of pods.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pods.len()
    }

    /// Returns true if there are no pods. Never true for a built topology.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pods.is_empty()
    }

    /// Returns the topological order, upstream first.
    #[must_use]
    pub fn execution_order(&self) -> &[String] {
        &self.order
    }

    /// Groups pods into start levels: a pod's level is one more than the
    /// deepest of its needs, with the gateway at level -1.
    #[must_use]
    pub fn start_levels(&self) -> Vec<Vec<&PodSpec>> {
        let mut depth: HashMap<&str, usize> = HashMap::new();
        let mut levels: Vec<Vec<&PodSpec>> = Vec::new();

        for name in &self.order {
            let Some(pod) = self.pod(name) else { continue };
            let level = pod
                .needs
                .iter()
                .filter(|n| n.as_str() != GATEWAY)
                .filter_map(|n| depth.get(n.as_str()).map(|d| d + 1))
                .max()
                .unwrap_or(0);
            depth.insert(pod.name.as_str(), level);
            if levels.len() <= level {
                levels.resize_with(level + 1, Vec::new);
            }
            levels[level].push(pod);
        }

        levels
    }

    /// Returns the pods that list `name` in their needs, in declaration order.
    #[must_use]
    pub fn consumers(&self, name: &str) -> Vec<&PodSpec> {
        self.pods
            .iter()
            .filter(|p| p.needs.iter().any(|n| n == name))
            .collect()
    }

    /// Returns the pods nobody needs, in declaration order. Their outputs
    /// form the flow's response.
    #[must_use]
    pub fn sinks(&self) -> Vec<&PodSpec> {
        let needed: HashSet<&str> = self
            .pods
            .iter()
            .flat_map(|p| p.needs.iter().map(String::as_str))
            .collect();
        self.pods
            .iter()
            .filter(|p| !needed.contains(p.name.as_str()))
            .collect()
    }

    /// Returns the hex SHA-256 digest of the canonical pod list.
    #[must_use]
    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Returns a copy of this topology with one pod replaced.
    ///
    /// The replacement keeps its name, kind and needs; only shard-local
    /// settings are expected to differ. Returns `None` for unknown pods.
    #[must_use]
    pub fn with_pod(&self, replacement: PodSpec) -> Option<Self> {
        let position = *self.index.get(&replacement.name)?;
        let mut pods = self.pods.clone();
        pods[position] = replacement;
        Some(Self::new(pods))
    }
}

fn compute_digest(pods: &[PodSpec]) -> String {
    let json = serde_json::to_string(pods).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(json.as_bytes());
    hex::encode(hasher.finalize())
}

/// Kahn's algorithm over `needs`; among ready pods the earliest declared goes
/// first.
fn topological_sort(pods: &[PodSpec]) -> Vec<String> {
    let index: HashMap<&str, usize> = pods.iter().enumerate().map(|(i, p)| (p.name.as_str(), i)).collect();
    let mut in_degree = vec![0_usize; pods.len()];
    let mut consumers: Vec<Vec<usize>> = vec![Vec::new(); pods.len()];
    for (i, pod) in pods.iter().enumerate() {
        for need in &pod.needs {
            if let Some(&upstream) = index.get(need.as_str()) {
                in_degree[i] += 1;
                consumers[upstream].push(i);
            }
        }
    }

    let mut ready: BTreeSet<usize> = (0..pods.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut result = Vec::with_capacity(pods.len());
    while let Some(next) = ready.pop_first() {
        result.push(pods[next].name.clone());
        for &consumer in &consumers[next] {
            in_degree[consumer] -= 1;
            if in_degree[consumer] == 0 {
                ready.insert(consumer);
            }
        }
    }

    result
}
