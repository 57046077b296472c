//! A supervisor whose failures are scripted per pod.

use crate::runtime::{ReplicaHandle, ReplicaUnit, Supervisor, SupervisorError};
use crate::topology::ConfigBag;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Default)]
struct Script {
    start_failures: HashMap<String, usize>,
    unhealthy: HashSet<String>,
    unhealthy_from_generation: HashMap<String, u64>,
    stop_failures: HashSet<String>,
}

#[derive(Debug, Default)]
struct Ledger {
    live: HashMap<Uuid, ReplicaUnit>,
    started: Vec<ReplicaUnit>,
    stopped: Vec<ReplicaUnit>,
    drained: Vec<ReplicaUnit>,
    configs: Vec<(String, ConfigBag)>,
    starts_per_pod: HashMap<String, usize>,
}

/// A [`Supervisor`] that records every call and fails where told to.
///
/// Replicas are healthy unless their pod was scripted otherwise.
#[derive(Debug, Default)]
pub struct ScriptedSupervisor {
    script: Mutex<Script>,
    ledger: Mutex<Ledger>,
    start_delay: Duration,
    stop_delay: Duration,
}

impl ScriptedSupervisor {
    /// Creates a supervisor where everything succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every start by `delay`.
    #[must_use]
    pub fn with_start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = delay;
        self
    }

    /// Delays every stop by `delay`.
    #[must_use]
    pub fn with_stop_delay(mut self, delay: Duration) -> Self {
        self.stop_delay = delay;
        self
    }

    /// Fails every start of `pod`.
    #[must_use]
    pub fn with_start_failure(self, pod: &str) -> Self {
        self.script.lock().start_failures.insert(pod.to_string(), 0);
        self
    }

    /// Lets the first `successes` starts of `pod` succeed, then fails.
    #[must_use]
    pub fn with_start_failure_after(self, pod: &str, successes: usize) -> Self {
        self.script.lock().start_failures.insert(pod.to_string(), successes);
        self
    }

    /// Makes every replica of `pod` report unhealthy.
    #[must_use]
    pub fn with_unhealthy(self, pod: &str) -> Self {
        self.mark_unhealthy(pod);
        self
    }

    /// Makes replicas of `pod` started at `generation` or later unhealthy.
    #[must_use]
    pub fn with_unhealthy_from_generation(self, pod: &str, generation: u64) -> Self {
        self.script
            .lock()
            .unhealthy_from_generation
            .insert(pod.to_string(), generation);
        self
    }

    /// Fails every stop of `pod`.
    #[must_use]
    pub fn with_stop_failure(self, pod: &str) -> Self {
        self.script.lock().stop_failures.insert(pod.to_string());
        self
    }

    /// Makes every replica of `pod` report unhealthy from now on.
    pub fn mark_unhealthy(&self, pod: &str) {
        self.script.lock().unhealthy.insert(pod.to_string());
    }

    /// Lets stops of `pod` succeed again.
    pub fn clear_stop_failure(&self, pod: &str) {
        self.script.lock().stop_failures.remove(pod);
    }

    /// Number of replicas started and not yet stopped.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.ledger.lock().live.len()
    }

    /// Live replicas of one pod, sorted by shard and replica.
    #[must_use]
    pub fn live_units(&self, pod: &str) -> Vec<ReplicaUnit> {
        let mut units: Vec<ReplicaUnit> = self
            .ledger
            .lock()
            .live
            .values()
            .filter(|u| u.pod == pod)
            .cloned()
            .collect();
        units.sort_by_key(|u| (u.shard, u.replica));
        units
    }

    /// Every unit started, in call order.
    #[must_use]
    pub fn started(&self) -> Vec<ReplicaUnit> {
        self.ledger.lock().started.clone()
    }

    /// Every unit stopped, in call order.
    #[must_use]
    pub fn stopped(&self) -> Vec<ReplicaUnit> {
        self.ledger.lock().stopped.clone()
    }

    /// Every unit drained, in call order.
    #[must_use]
    pub fn drained(&self) -> Vec<ReplicaUnit> {
        self.ledger.lock().drained.clone()
    }

    /// The executor configuration passed with each start, by pod.
    #[must_use]
    pub fn configs_for(&self, pod: &str) -> Vec<ConfigBag> {
        self.ledger
            .lock()
            .configs
            .iter()
            .filter(|(p, _)| p == pod)
            .map(|(_, c)| c.clone())
            .collect()
    }

    fn is_unhealthy(&self, unit: &ReplicaUnit) -> bool {
        let script = self.script.lock();
        script.unhealthy.contains(&unit.pod)
            || script
                .unhealthy_from_generation
                .get(&unit.pod)
                .is_some_and(|&from| unit.generation >= from)
    }
}

#[async_trait]
impl Supervisor for ScriptedSupervisor {
    async fn start(&self, unit: &ReplicaUnit, config: &ConfigBag) -> Result<ReplicaHandle, SupervisorError> {
        if !self.start_delay.is_zero() {
            tokio::time::sleep(self.start_delay).await;
        }

        let allowed = self.script.lock().start_failures.get(&unit.pod).copied();
        let mut ledger = self.ledger.lock();
        let attempts = ledger.starts_per_pod.entry(unit.pod.clone()).or_insert(0);
        *attempts += 1;
        if allowed.is_some_and(|successes| *attempts > successes) {
            return Err(SupervisorError::StartFailed {
                unit: unit.to_string(),
                reason: "scripted start failure".to_string(),
            });
        }

        let handle = ReplicaHandle::new(unit.clone());
        ledger.live.insert(handle.id, unit.clone());
        ledger.started.push(unit.clone());
        ledger.configs.push((unit.pod.clone(), config.clone()));
        Ok(handle)
    }

    async fn stop(&self, handle: &ReplicaHandle) -> Result<(), SupervisorError> {
        if !self.stop_delay.is_zero() {
            tokio::time::sleep(self.stop_delay).await;
        }
        if self.script.lock().stop_failures.contains(&handle.unit.pod) {
            return Err(SupervisorError::StopFailed {
                unit: handle.unit.to_string(),
                reason: "scripted stop failure".to_string(),
            });
        }

        let mut ledger = self.ledger.lock();
        match ledger.live.remove(&handle.id) {
            Some(unit) => {
                ledger.stopped.push(unit);
                Ok(())
            }
            None => Err(SupervisorError::UnknownReplica(handle.id)),
        }
    }

    async fn health(&self, handle: &ReplicaHandle) -> bool {
        self.ledger.lock().live.contains_key(&handle.id) && !self.is_unhealthy(&handle.unit)
    }

    async fn drain(&self, handle: &ReplicaHandle, _timeout: Duration) -> Result<(), SupervisorError> {
        self.ledger.lock().drained.push(handle.unit.clone());
        Ok(())
    }
}
