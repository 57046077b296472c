//! Per-flow ownership of replica handles.

use super::ReplicaHandle;
use std::collections::BTreeMap;

/// Identifies one replica slot within a flow.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReplicaKey {
    /// Pod name.
    pub pod: String,
    /// Shard index.
    pub shard: usize,
    /// Replica index within the shard.
    pub replica: usize,
}

impl ReplicaKey {
    /// Creates a key.
    #[must_use]
    pub fn new(pod: impl Into<String>, shard: usize, replica: usize) -> Self {
        Self {
            pod: pod.into(),
            shard,
            replica,
        }
    }
}

/// A started replica and whether it currently takes traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaSlot {
    /// The supervisor handle.
    pub handle: ReplicaHandle,
    /// Configuration generation the replica was started with.
    pub generation: u64,
    /// True while the replica is in the routing set.
    pub routable: bool,
}

/// Replica handles owned by one flow, keyed by pod, shard and replica.
///
/// The arena is the single owner of the handles; other components only see
/// snapshots derived from it. Retired replicas that failed to stop are parked
/// outside the slots until teardown tries them again.
#[derive(Debug, Default)]
pub struct ReplicaArena {
    slots: BTreeMap<ReplicaKey, ReplicaSlot>,
    stale: Vec<ReplicaHandle>,
}

impl ReplicaArena {
    /// Creates an empty arena.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a routable replica, returning the slot it replaced.
    pub fn insert(&mut self, key: ReplicaKey, handle: ReplicaHandle) -> Option<ReplicaSlot> {
        let generation = handle.unit.generation;
        self.slots.insert(
            key,
            ReplicaSlot {
                handle,
                generation,
                routable: true,
            },
        )
    }

    /// Removes a slot.
    pub fn remove(&mut self, key: &ReplicaKey) -> Option<ReplicaSlot> {
        self.slots.remove(key)
    }

    /// Returns a slot.
    #[must_use]
    pub fn get(&self, key: &ReplicaKey) -> Option<&ReplicaSlot> {
        self.slots.get(key)
    }

    /// Takes a replica out of the routing set. Returns false if absent.
    pub fn unroute(&mut self, key: &ReplicaKey) -> bool {
        match self.slots.get_mut(key) {
            Some(slot) => {
                slot.routable = false;
                true
            }
            None => false,
        }
    }

    /// Parks a retired replica that did not stop. It never takes traffic.
    pub fn park(&mut self, handle: ReplicaHandle) {
        self.stale.push(handle);
    }

    /// Removes and returns the parked replicas of a pod.
    pub fn take_stale(&mut self, pod: &str) -> Vec<ReplicaHandle> {
        let (taken, kept) = std::mem::take(&mut self.stale)
            .into_iter()
            .partition(|h| h.unit.pod == pod);
        self.stale = kept;
        taken
    }

    /// Returns the number of parked replicas of a pod.
    #[must_use]
    pub fn stale_count(&self, pod: &str) -> usize {
        self.stale.iter().filter(|h| h.unit.pod == pod).count()
    }

    /// Returns the keys of a pod's replicas in shard-major order.
    #[must_use]
    pub fn keys_for_pod(&self, pod: &str) -> Vec<ReplicaKey> {
        self.slots.keys().filter(|k| k.pod == pod).cloned().collect()
    }

    /// Returns the keys of one shard's replicas.
    #[must_use]
    pub fn keys_for_shard(&self, pod: &str, shard: usize) -> Vec<ReplicaKey> {
        self.slots
            .keys()
            .filter(|k| k.pod == pod && k.shard == shard)
            .cloned()
            .collect()
    }

    /// Returns the number of routable replicas per shard of a pod.
    #[must_use]
    pub fn routable_per_shard(&self, pod: &str, shards: usize) -> Vec<usize> {
        let mut counts = vec![0; shards];
        for (key, slot) in &self.slots {
            if key.pod == pod && slot.routable {
                if let Some(count) = counts.get_mut(key.shard) {
                    *count += 1;
                }
            }
        }
        counts
    }

    /// Iterates over every slot.
    pub fn iter(&self) -> impl Iterator<Item = (&ReplicaKey, &ReplicaSlot)> {
        self.slots.iter()
    }

    /// Returns the number of slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Returns true if the arena holds nothing, parked replicas included.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty() && self.stale.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::ReplicaUnit;
    use std::collections::BTreeMap;

    fn handle(pod: &str, shard: usize, replica: usize) -> ReplicaHandle {
        ReplicaHandle::new(ReplicaUnit {
            flow_id: "f".into(),
            pod: pod.into(),
            shard,
            replica,
            uses: None,
            address: None,
            resources: Vec::new(),
            envs: BTreeMap::new(),
            generation: 2,
        })
    }

    #[test]
    fn test_keys_are_shard_major() {
        let mut arena = ReplicaArena::new();
        for (shard, replica) in [(1, 0), (0, 1), (0, 0)] {
            arena.insert(ReplicaKey::new("enc", shard, replica), handle("enc", shard, replica));
        }
        arena.insert(ReplicaKey::new("idx", 0, 0), handle("idx", 0, 0));

        let keys = arena.keys_for_pod("enc");
        assert_eq!(
            keys,
            vec![
                ReplicaKey::new("enc", 0, 0),
                ReplicaKey::new("enc", 0, 1),
                ReplicaKey::new("enc", 1, 0),
            ]
        );
        assert_eq!(arena.keys_for_shard("enc", 0).len(), 2);
        assert_eq!(arena.len(), 4);
    }

    #[test]
    fn test_unroute_excludes_from_counts() {
        let mut arena = ReplicaArena::new();
        arena.insert(ReplicaKey::new("enc", 0, 0), handle("enc", 0, 0));
        arena.insert(ReplicaKey::new("enc", 0, 1), handle("enc", 0, 1));

        assert!(arena.unroute(&ReplicaKey::new("enc", 0, 1)));
        assert!(!arena.unroute(&ReplicaKey::new("enc", 3, 0)));
        assert_eq!(arena.routable_per_shard("enc", 2), vec![1, 0]);
    }

    #[test]
    fn test_insert_records_generation() {
        let mut arena = ReplicaArena::new();
        let key = ReplicaKey::new("enc", 0, 0);
        assert!(arena.insert(key.clone(), handle("enc", 0, 0)).is_none());
        assert_eq!(arena.get(&key).map(|s| s.generation), Some(2));
        assert!(arena.insert(key.clone(), handle("enc", 0, 0)).is_some());
        assert!(arena.remove(&key).is_some());
        assert!(arena.is_empty());
    }

    #[test]
    fn test_parked_replicas_are_not_routable() {
        let mut arena = ReplicaArena::new();
        arena.insert(ReplicaKey::new("enc", 0, 0), handle("enc", 0, 0));
        arena.park(handle("enc", 0, 0));
        arena.park(handle("idx", 0, 0));

        assert_eq!(arena.routable_per_shard("enc", 1), vec![1]);
        assert_eq!(arena.stale_count("enc"), 1);
        assert_eq!(arena.take_stale("enc").len(), 1);
        assert_eq!(arena.stale_count("enc"), 0);
        assert_eq!(arena.stale_count("idx"), 1);

        arena.remove(&ReplicaKey::new("enc", 0, 0));
        assert!(!arena.is_empty());
    }
}
