//! Lifecycle driver for one flow.

use super::{
    FlowSnapshot, FlowState, ReplicaArena, ReplicaHandle, ReplicaKey, ReplicaUnit, SnapshotCell,
    Supervisor,
};
use crate::cancellation::{CancellationToken, CleanupFailure, CleanupRegistry};
use crate::config::ControlPlaneConfig;
use crate::errors::FlowError;
use crate::observability::{flow_span, pod_span};
use crate::topology::{ConfigBag, PodSpec, Topology};
use chrono::{DateTime, Utc};
use futures::future::{join_all, BoxFuture, FutureExt};
use futures::stream::{self, StreamExt};
use rand::Rng;
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn, Instrument};

/// Identity and environment of a flow being created.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlowLaunch {
    /// Flow id.
    pub flow_id: String,
    /// Owning workspace, if any.
    pub workspace_id: Option<String>,
    /// Environment passed to every replica.
    pub envs: BTreeMap<String, String>,
}

impl FlowLaunch {
    /// Creates a launch with no workspace and no environment.
    #[must_use]
    pub fn new(flow_id: impl Into<String>) -> Self {
        Self {
            flow_id: flow_id.into(),
            ..Self::default()
        }
    }

    /// Sets the workspace.
    #[must_use]
    pub fn with_workspace(mut self, workspace_id: impl Into<String>) -> Self {
        self.workspace_id = Some(workspace_id.into());
        self
    }

    /// Adds an environment variable.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.insert(key.into(), value.into());
        self
    }
}

enum LaunchError {
    Start(String),
    Unhealthy(String),
    Cancelled(String),
}

impl LaunchError {
    fn into_reason(self) -> String {
        match self {
            Self::Start(reason) | Self::Unhealthy(reason) | Self::Cancelled(reason) => reason,
        }
    }
}

/// Starts one replica and waits for it to become healthy.
///
/// Holds only owned handles, so every launch runs as a `'static` job that
/// any runtime worker can poll.
#[derive(Clone)]
struct Launcher {
    supervisor: Arc<dyn Supervisor>,
    config: ControlPlaneConfig,
    cancel: Option<Arc<CancellationToken>>,
    deadline: Option<Instant>,
    cleanup: Arc<CleanupRegistry>,
}

type LaunchJob = BoxFuture<'static, (ReplicaKey, Result<ReplicaHandle, LaunchError>)>;

impl Launcher {
    fn job(&self, key: ReplicaKey, unit: ReplicaUnit, executor: ConfigBag) -> LaunchJob {
        let launcher = self.clone();
        async move {
            let result = launcher.launch(unit, &executor).await;
            (key, result)
        }
        .boxed()
    }

    async fn launch(&self, unit: ReplicaUnit, executor: &ConfigBag) -> Result<ReplicaHandle, LaunchError> {
        let start = self.supervisor.start(&unit, executor);
        let started = match self.deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, start)
                .await
                .map_err(|_| LaunchError::Start(format!("{unit} did not start before the build deadline")))?,
            None => start.await,
        };
        let handle = started.map_err(|e| LaunchError::Start(e.to_string()))?;
        debug!(unit = %unit, "Replica started");

        let supervisor = Arc::clone(&self.supervisor);
        let staged = handle.clone();
        self.cleanup.register(format!("stop {unit}"), move || async move {
            supervisor.stop(&staged).await.map_err(|e| e.to_string())
        });

        self.wait_healthy(&handle).await?;
        Ok(handle)
    }

    async fn wait_healthy(&self, handle: &ReplicaHandle) -> Result<(), LaunchError> {
        let timeout = self.config.health_check_timeout();
        let mut deadline = Instant::now() + timeout;
        if let Some(build) = self.deadline {
            deadline = deadline.min(build);
        }

        loop {
            if self.supervisor.health(handle).await {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(LaunchError::Unhealthy(format!(
                    "{} not healthy within {timeout:?}",
                    handle.unit
                )));
            }
            let delay = self.poll_delay();
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                reason = cancelled(self.cancel.as_deref()) => return Err(LaunchError::Cancelled(reason)),
            }
        }
    }

    fn poll_delay(&self) -> Duration {
        let base = self.config.health_check_interval();
        if self.config.health_jitter {
            base.mul_f64(1.0 + rand::thread_rng().gen_range(0.0..0.25))
        } else {
            base
        }
    }
}

async fn cancelled(token: Option<&CancellationToken>) -> String {
    match token {
        Some(token) => {
            token.cancelled().await;
            token.reason().unwrap_or_else(|| "cancelled".to_string())
        }
        None => std::future::pending().await,
    }
}

fn describe(failures: &[CleanupFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{} ({})", f.name, f.error))
        .collect::<Vec<_>>()
        .join(", ")
}

type StagedReplicas = Vec<(ReplicaKey, ReplicaHandle)>;

/// Owns the replicas of one flow and drives its lifecycle.
///
/// Every mutation takes `&mut self`; callers serialize access per flow. Each
/// state change publishes a fresh [`FlowSnapshot`] into a shared
/// [`SnapshotCell`] so status reads never wait on a running operation.
pub struct FlowRuntime {
    launch: FlowLaunch,
    topology: Topology,
    state: FlowState,
    arena: ReplicaArena,
    supervisor: Arc<dyn Supervisor>,
    config: ControlPlaneConfig,
    generation: u64,
    created_at: DateTime<Utc>,
    snapshot: Arc<SnapshotCell>,
}

impl FlowRuntime {
    /// Creates a runtime in the `Building` state. Nothing is started until
    /// [`build`](Self::build) runs.
    #[must_use]
    pub fn new(
        launch: FlowLaunch,
        topology: Topology,
        supervisor: Arc<dyn Supervisor>,
        config: ControlPlaneConfig,
    ) -> Self {
        let created_at = Utc::now();
        let arena = ReplicaArena::new();
        let snapshot = FlowSnapshot::capture(
            &launch.flow_id,
            launch.workspace_id.as_deref(),
            FlowState::Building,
            &topology,
            &arena,
            0,
            created_at,
        );
        Self {
            launch,
            topology,
            state: FlowState::Building,
            arena,
            supervisor,
            config,
            generation: 0,
            created_at,
            snapshot: Arc::new(SnapshotCell::new(snapshot)),
        }
    }

    /// Returns the flow id.
    #[must_use]
    pub fn flow_id(&self) -> &str {
        &self.launch.flow_id
    }

    /// Returns the lifecycle state.
    #[must_use]
    pub const fn state(&self) -> FlowState {
        self.state
    }

    /// Returns the topology in effect.
    #[must_use]
    pub const fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Returns the replicas this flow owns.
    #[must_use]
    pub const fn arena(&self) -> &ReplicaArena {
        &self.arena
    }

    /// Returns the number of successful mutations.
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns the latest published snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Arc<FlowSnapshot> {
        self.snapshot.load()
    }

    /// Returns the cell snapshots are published into.
    #[must_use]
    pub fn snapshot_cell(&self) -> Arc<SnapshotCell> {
        Arc::clone(&self.snapshot)
    }

    /// Starts every owned replica, level by level in dependency order, and
    /// waits for each to become healthy.
    ///
    /// External pods are never started. On any failure, cancellation or the
    /// build deadline, every replica started so far is stopped before the
    /// error is returned.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::BuildFailure`] naming the failing pod, or
    /// [`FlowError::Cancelled`].
    pub async fn build(&mut self, cancel: &Arc<CancellationToken>) -> Result<(), FlowError> {
        let span = flow_span("build", &self.launch.flow_id);
        self.build_levels(cancel).instrument(span).await
    }

    async fn build_levels(&mut self, cancel: &Arc<CancellationToken>) -> Result<(), FlowError> {
        if self.state != FlowState::Building {
            return Err(self.invalid_state("build"));
        }

        let deadline = Instant::now() + self.config.build_timeout();
        let cleanup = Arc::new(CleanupRegistry::new());
        let launcher = self.launcher(Some(Arc::clone(cancel)), Some(deadline), &cleanup);
        let levels: Vec<Vec<PodSpec>> = self
            .topology
            .start_levels()
            .into_iter()
            .map(|level| level.into_iter().filter(|p| p.is_owned()).cloned().collect())
            .collect();
        info!(pods = self.topology.len(), levels = levels.len(), "Building flow");

        for level in &levels {
            if cancel.is_cancelled() {
                let reason = cancel.reason().unwrap_or_default();
                return Err(self.abandon_build(&cleanup, FlowError::Cancelled(reason)).await);
            }

            match self.start_level(level, &launcher).await {
                Ok(started) => {
                    for (key, handle) in started {
                        self.arena.insert(key, handle);
                    }
                    self.publish();
                }
                Err((_, LaunchError::Cancelled(reason))) => {
                    return Err(self.abandon_build(&cleanup, FlowError::Cancelled(reason)).await);
                }
                Err((pod, err)) => {
                    let error = FlowError::build_failure(pod, err.into_reason());
                    return Err(self.abandon_build(&cleanup, error).await);
                }
            }
        }

        cleanup.disarm();
        self.set_state(FlowState::Running);
        info!(replicas = self.arena.len(), "Flow running");
        Ok(())
    }

    async fn start_level(
        &self,
        level: &[PodSpec],
        launcher: &Launcher,
    ) -> Result<StagedReplicas, (String, LaunchError)> {
        let generation = self.generation;
        let jobs: Vec<LaunchJob> = level
            .iter()
            .flat_map(|spec| spec.units().map(move |(shard, replica)| (spec, shard, replica)))
            .map(|(spec, shard, replica)| {
                launcher.job(
                    ReplicaKey::new(&spec.name, shard, replica),
                    self.unit_for(spec, shard, replica, generation),
                    spec.executor.clone(),
                )
            })
            .collect();

        let results: Vec<_> = stream::iter(jobs)
            .buffer_unordered(self.config.max_concurrent_starts.max(1))
            .collect()
            .await;

        let mut started = Vec::with_capacity(results.len());
        let mut first_error: Option<(String, LaunchError)> = None;
        for (key, result) in results {
            match result {
                Ok(handle) => started.push((key, handle)),
                Err(err) => {
                    let cancelled = matches!(err, LaunchError::Cancelled(_));
                    if first_error.is_none() || cancelled {
                        first_error = Some((key.pod, err));
                    }
                }
            }
        }

        match first_error {
            Some(error) => Err(error),
            None => Ok(started),
        }
    }

    async fn abandon_build(&mut self, cleanup: &CleanupRegistry, error: FlowError) -> FlowError {
        warn!(error = %error, "Build failed; stopping started replicas");
        let failures = cleanup.run_all(self.config.cleanup_timeout()).await;
        if !failures.is_empty() {
            warn!(leaked = %describe(&failures), "Build rollback could not stop every replica");
        }
        self.arena = ReplicaArena::new();
        self.set_state(FlowState::Failed);
        error
    }

    /// Restarts every replica of an owned pod with `uses_with` merged over
    /// its executor configuration.
    ///
    /// New replicas are started and health-checked one shard group at a
    /// time before any old replica is touched. Once every group is healthy,
    /// each group's new replicas take over routing and the old ones are
    /// drained and stopped. If any new replica fails, all new replicas are
    /// discarded and the flow keeps its previous topology.
    ///
    /// # Errors
    ///
    /// [`FlowError::NotFound`] for unknown pods, [`FlowError::Forbidden`] for
    /// external pods, [`FlowError::InvalidState`] unless running, and
    /// [`FlowError::UpdateFailed`] after a rollback.
    pub async fn rolling_update(&mut self, pod: &str, uses_with: ConfigBag) -> Result<(), FlowError> {
        let span = pod_span("rolling_update", &self.launch.flow_id, pod);
        self.update_pod(pod, uses_with).instrument(span).await
    }

    async fn update_pod(&mut self, pod: &str, uses_with: ConfigBag) -> Result<(), FlowError> {
        self.ensure_mutable("update")?;
        let mut updated = self.owned_pod(pod, "updated")?.clone();
        updated.executor.extend(uses_with);
        let next = self
            .topology
            .with_pod(updated.clone())
            .ok_or_else(|| FlowError::pod_not_found(pod))?;

        self.set_state(FlowState::Updating);
        let generation = self.generation + 1;
        let cleanup = Arc::new(CleanupRegistry::new());
        let mut staged = Vec::with_capacity(updated.unit_count());

        for shard in 0..updated.shards {
            match self
                .start_shard_group(&updated, shard, 0..updated.replicas, generation, &cleanup)
                .await
            {
                Ok(mut group) => staged.append(&mut group),
                Err(err) => {
                    let error = self
                        .abort_mutation(&cleanup, err.into_reason(), |reason| {
                            FlowError::update_failed(pod, reason)
                        })
                        .await;
                    return Err(error);
                }
            }
        }
        cleanup.disarm();

        for shard in 0..updated.shards {
            let mut retired = Vec::new();
            for (key, handle) in staged.iter().filter(|(k, _)| k.shard == shard) {
                if let Some(old) = self.arena.insert(key.clone(), handle.clone()) {
                    retired.push(old.handle);
                }
            }
            let failures = self.retire_all(retired).await;
            debug!(shard, failed = failures.len(), "Shard group swapped");
            self.park_failed(failures);
        }

        self.topology = next;
        self.generation = generation;
        self.set_state(FlowState::Running);
        info!(generation, "Rolling update complete");
        Ok(())
    }

    /// Sets the replica count of every shard of an owned pod.
    ///
    /// Scaling up starts the extra replicas and adds them to routing once
    /// healthy. Scaling down removes replicas from routing, drains them and
    /// then stops them.
    ///
    /// # Errors
    ///
    /// [`FlowError::InvalidRequest`] for zero replicas, plus the errors of
    /// [`rolling_update`](Self::rolling_update) with
    /// [`FlowError::ScaleFailed`] in place of `UpdateFailed`.
    pub async fn scale(&mut self, pod: &str, replicas: usize) -> Result<(), FlowError> {
        let span = pod_span("scale", &self.launch.flow_id, pod);
        self.scale_pod(pod, replicas).instrument(span).await
    }

    async fn scale_pod(&mut self, pod: &str, replicas: usize) -> Result<(), FlowError> {
        if replicas == 0 {
            return Err(FlowError::InvalidRequest(format!(
                "cannot scale pod '{pod}' to 0 replicas"
            )));
        }
        self.ensure_mutable("scale")?;
        let current = self.owned_pod(pod, "scaled")?.clone();
        if replicas == current.replicas {
            debug!(replicas, "Pod already at requested scale");
            return Ok(());
        }

        let mut resized = current.clone();
        resized.replicas = replicas;
        let next = self
            .topology
            .with_pod(resized.clone())
            .ok_or_else(|| FlowError::pod_not_found(pod))?;

        self.set_state(FlowState::Updating);
        let generation = self.generation + 1;

        if replicas > current.replicas {
            let cleanup = Arc::new(CleanupRegistry::new());
            let mut staged = Vec::new();
            for shard in 0..current.shards {
                match self
                    .start_shard_group(&resized, shard, current.replicas..replicas, generation, &cleanup)
                    .await
                {
                    Ok(mut group) => staged.append(&mut group),
                    Err(err) => {
                        let error = self
                            .abort_mutation(&cleanup, err.into_reason(), |reason| {
                                FlowError::scale_failed(pod, reason)
                            })
                            .await;
                        return Err(error);
                    }
                }
            }
            cleanup.disarm();
            for (key, handle) in staged {
                self.arena.insert(key, handle);
            }
        } else {
            // Out of routing first; drained and stopped afterwards.
            let mut retiring = Vec::new();
            for shard in 0..current.shards {
                for replica in replicas..current.replicas {
                    if let Some(slot) = self.arena.remove(&ReplicaKey::new(pod, shard, replica)) {
                        retiring.push(slot.handle);
                    }
                }
            }
            let failures = self.retire_all(retiring).await;
            self.park_failed(failures);
        }

        self.topology = next;
        self.generation = generation;
        self.set_state(FlowState::Running);
        info!(from = current.replicas, to = replicas, "Scale complete");
        Ok(())
    }

    /// Stops every owned replica in reverse dependency order. External pods
    /// are left alone. Calling this on a terminated flow is a no-op.
    ///
    /// The flow always ends `Terminated`; replicas that could not be stopped
    /// are reported in the error.
    ///
    /// # Errors
    ///
    /// [`FlowError::TeardownFailed`] if any replica failed to stop, or
    /// [`FlowError::InvalidState`] while another operation is mid-flight.
    pub async fn terminate(&mut self) -> Result<(), FlowError> {
        let span = flow_span("terminate", &self.launch.flow_id);
        self.teardown().instrument(span).await
    }

    async fn teardown(&mut self) -> Result<(), FlowError> {
        match self.state {
            FlowState::Terminated => return Ok(()),
            FlowState::Terminating | FlowState::Updating => {
                return Err(self.invalid_state("terminate"));
            }
            FlowState::Building | FlowState::Running | FlowState::Failed => {}
        }
        self.set_state(FlowState::Terminating);

        let order: Vec<String> = self
            .topology
            .execution_order()
            .iter()
            .rev()
            .filter(|name| self.topology.pod(name).is_some_and(PodSpec::is_owned))
            .cloned()
            .collect();

        let mut failures = Vec::new();
        for name in &order {
            let keys = self.arena.keys_for_pod(name);
            for key in &keys {
                self.arena.unroute(key);
            }
            let mut handles: Vec<ReplicaHandle> = keys
                .iter()
                .filter_map(|k| self.arena.remove(k))
                .map(|slot| slot.handle)
                .collect();
            handles.extend(self.arena.take_stale(name));
            let stopped = handles.len();
            failures.extend(self.retire_all(handles).await.into_iter().map(|(_, e)| e));
            debug!(pod = %name, replicas = stopped, "Pod stopped");
        }

        self.set_state(FlowState::Terminated);
        if failures.is_empty() {
            info!("Flow terminated");
            Ok(())
        } else {
            Err(FlowError::TeardownFailed {
                flow: self.launch.flow_id.clone(),
                reason: failures.join("; "),
            })
        }
    }

    async fn start_shard_group(
        &self,
        spec: &PodSpec,
        shard: usize,
        replicas: Range<usize>,
        generation: u64,
        cleanup: &Arc<CleanupRegistry>,
    ) -> Result<StagedReplicas, LaunchError> {
        let launcher = self.launcher(None, None, cleanup);
        let jobs: Vec<LaunchJob> = replicas
            .map(|replica| {
                launcher.job(
                    ReplicaKey::new(&spec.name, shard, replica),
                    self.unit_for(spec, shard, replica, generation),
                    spec.executor.clone(),
                )
            })
            .collect();
        let results = join_all(jobs).await;

        let mut group = Vec::with_capacity(results.len());
        for (key, result) in results {
            group.push((key, result?));
        }
        Ok(group)
    }

    async fn abort_mutation<F>(&mut self, cleanup: &CleanupRegistry, reason: String, into_error: F) -> FlowError
    where
        F: FnOnce(String) -> FlowError,
    {
        let failures = cleanup.run_all(self.config.cleanup_timeout()).await;
        if failures.is_empty() {
            warn!(reason = %reason, "Mutation rolled back");
            self.set_state(FlowState::Running);
            into_error(reason)
        } else {
            self.set_state(FlowState::Failed);
            into_error(format!(
                "{reason}; rollback left {} replica(s) running: {}",
                failures.len(),
                describe(&failures)
            ))
        }
    }

    async fn retire(&self, handle: &ReplicaHandle) -> Result<(), String> {
        if let Err(e) = self.supervisor.drain(handle, self.config.drain_timeout()).await {
            warn!(unit = %handle.unit, error = %e, "Drain failed; stopping anyway");
        }
        self.supervisor.stop(handle).await.map_err(|e| {
            warn!(unit = %handle.unit, error = %e, "Failed to stop replica");
            format!("{}: {e}", handle.unit)
        })
    }

    async fn retire_all(&self, handles: Vec<ReplicaHandle>) -> Vec<(ReplicaHandle, String)> {
        let outcomes = join_all(handles.iter().map(|h| self.retire(h))).await;
        handles
            .into_iter()
            .zip(outcomes)
            .filter_map(|(handle, outcome)| outcome.err().map(|e| (handle, e)))
            .collect()
    }

    /// Keeps replicas that failed to stop so teardown can retry them.
    fn park_failed(&mut self, failures: Vec<(ReplicaHandle, String)>) {
        if failures.is_empty() {
            return;
        }
        warn!(
            stale = failures.len(),
            errors = %failures.iter().map(|(_, e)| e.as_str()).collect::<Vec<_>>().join("; "),
            "Retired replicas did not stop; parked until teardown"
        );
        for (handle, _) in failures {
            self.arena.park(handle);
        }
    }

    fn launcher(
        &self,
        cancel: Option<Arc<CancellationToken>>,
        deadline: Option<Instant>,
        cleanup: &Arc<CleanupRegistry>,
    ) -> Launcher {
        Launcher {
            supervisor: Arc::clone(&self.supervisor),
            config: self.config.clone(),
            cancel,
            deadline,
            cleanup: Arc::clone(cleanup),
        }
    }

    fn unit_for(&self, spec: &PodSpec, shard: usize, replica: usize, generation: u64) -> ReplicaUnit {
        ReplicaUnit {
            flow_id: self.launch.flow_id.clone(),
            pod: spec.name.clone(),
            shard,
            replica,
            uses: spec.uses.clone(),
            address: spec.address.clone(),
            resources: spec.resources.clone(),
            envs: self.launch.envs.clone(),
            generation,
        }
    }

    fn owned_pod(&self, pod: &str, verb: &str) -> Result<&PodSpec, FlowError> {
        let spec = self
            .topology
            .pod(pod)
            .ok_or_else(|| FlowError::pod_not_found(pod))?;
        if spec.is_external() {
            return Err(FlowError::external_pod(pod, verb));
        }
        Ok(spec)
    }

    fn ensure_mutable(&self, operation: &str) -> Result<(), FlowError> {
        if self.state.accepts_mutations() {
            Ok(())
        } else {
            Err(self.invalid_state(operation))
        }
    }

    fn invalid_state(&self, operation: &str) -> FlowError {
        FlowError::InvalidState {
            operation: operation.to_string(),
            state: self.state.to_string(),
        }
    }

    fn set_state(&mut self, next: FlowState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal transition {} -> {next}",
            self.state
        );
        debug!(from = %self.state, to = %next, "Flow state changed");
        self.state = next;
        self.publish();
    }

    fn publish(&self) {
        self.snapshot.store(FlowSnapshot::capture(
            &self.launch.flow_id,
            self.launch.workspace_id.as_deref(),
            self.state,
            &self.topology,
            &self.arena,
            self.generation,
            self.created_at,
        ));
    }
}

impl fmt::Debug for FlowRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowRuntime")
            .field("flow_id", &self.launch.flow_id)
            .field("state", &self.state)
            .field("generation", &self.generation)
            .field("replicas", &self.arena.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{MockSupervisor, SupervisorError};
    use crate::testing::{external_topology, fast_config, linear_topology, ScriptedSupervisor};
    use crate::topology::{PodDeclaration, TopologyBuilder};
    use pretty_assertions::assert_eq;

    fn runtime(topology: Topology, supervisor: &Arc<ScriptedSupervisor>) -> FlowRuntime {
        FlowRuntime::new(
            FlowLaunch::new("flow-1").with_env("MODE", "test"),
            topology,
            supervisor.clone(),
            fast_config(),
        )
    }

    async fn running(topology: Topology, supervisor: &Arc<ScriptedSupervisor>) -> FlowRuntime {
        let mut flow = runtime(topology, supervisor);
        flow.build(&Arc::new(CancellationToken::new())).await.unwrap();
        flow
    }

    fn sharded() -> Topology {
        TopologyBuilder::new()
            .add(PodDeclaration::new("enc").shards(2).replicas(2))
            .add(PodDeclaration::new("idx"))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_build_starts_every_unit_in_dependency_order() {
        let sup = Arc::new(ScriptedSupervisor::new());
        let flow = running(sharded(), &sup).await;

        assert_eq!(flow.state(), FlowState::Running);
        assert_eq!(sup.live_count(), 5);
        let order: Vec<String> = sup.started().into_iter().map(|u| u.pod).collect();
        assert_eq!(order.last().map(String::as_str), Some("idx"));
        assert!(sup.started().iter().all(|u| u.envs.get("MODE").map(String::as_str) == Some("test")));

        let snap = flow.snapshot();
        assert_eq!(snap.state, FlowState::Running);
        assert_eq!(snap.pod("enc").unwrap().routable, vec![2, 2]);
    }

    #[tokio::test]
    async fn test_build_skips_external_pods() {
        let sup = Arc::new(ScriptedSupervisor::new());
        let flow = running(external_topology(45678), &sup).await;

        assert!(sup.live_units("external_real").is_empty());
        assert_eq!(sup.live_units("executor1").len(), 2);
        assert_eq!(flow.arena().len(), 2);
    }

    #[tokio::test]
    async fn test_build_failure_stops_started_replicas() {
        let sup = Arc::new(ScriptedSupervisor::new().with_unhealthy("b"));
        let mut flow = runtime(linear_topology(&["a", "b"]), &sup);

        let err = flow.build(&Arc::new(CancellationToken::new())).await.unwrap_err();

        assert!(matches!(err, FlowError::BuildFailure { ref pod, .. } if pod == "b"));
        assert_eq!(sup.live_count(), 0);
        assert_eq!(flow.state(), FlowState::Failed);
        assert!(flow.arena().is_empty());
    }

    #[tokio::test]
    async fn test_build_cancellation_tears_down() {
        let sup = Arc::new(ScriptedSupervisor::new().with_unhealthy("b"));
        let mut flow = FlowRuntime::new(
            FlowLaunch::new("flow-1"),
            linear_topology(&["a", "b"]),
            sup.clone(),
            fast_config().with_health_check_timeout(Duration::from_secs(30)),
        );
        let token = Arc::new(CancellationToken::new());
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            canceller.cancel("caller went away");
        });

        let err = flow.build(&token).await.unwrap_err();

        assert!(matches!(err, FlowError::Cancelled(ref r) if r == "caller went away"));
        assert_eq!(sup.live_count(), 0);
    }

    #[tokio::test]
    async fn test_build_reports_start_failure_without_stopping() {
        let mut mock = MockSupervisor::new();
        mock.expect_start().returning(|unit, _| {
            Err(SupervisorError::StartFailed {
                unit: unit.to_string(),
                reason: "no capacity".into(),
            })
        });
        mock.expect_stop().never();

        let mut flow = FlowRuntime::new(
            FlowLaunch::new("flow-1"),
            linear_topology(&["a"]),
            Arc::new(mock),
            fast_config(),
        );
        let err = flow.build(&Arc::new(CancellationToken::new())).await.unwrap_err();

        assert!(err.to_string().contains("no capacity"));
    }

    #[tokio::test]
    async fn test_rolling_update_replaces_every_replica() {
        let sup = Arc::new(ScriptedSupervisor::new());
        let mut flow = running(sharded(), &sup).await;
        let digest = flow.topology().digest().to_string();
        let mut bag = ConfigBag::new();
        bag.insert("dump_path".into(), serde_json::json!("/tmp/dump"));

        flow.rolling_update("enc", bag).await.unwrap();

        assert_eq!(flow.state(), FlowState::Running);
        assert_eq!(flow.generation(), 1);
        assert_ne!(flow.topology().digest(), digest);
        let live = sup.live_units("enc");
        assert_eq!(live.len(), 4);
        assert!(live.iter().all(|u| u.generation == 1));
        assert_eq!(sup.drained().len(), 4);
        assert_eq!(
            sup.configs_for("enc").last().and_then(|c| c.get("dump_path")),
            Some(&serde_json::json!("/tmp/dump"))
        );
        assert_eq!(
            flow.topology().pod("enc").unwrap().executor.get("dump_path"),
            Some(&serde_json::json!("/tmp/dump"))
        );
    }

    #[tokio::test]
    async fn test_rolling_update_failure_keeps_old_replicas() {
        let sup = Arc::new(ScriptedSupervisor::new().with_unhealthy_from_generation("enc", 1));
        let mut flow = running(sharded(), &sup).await;
        let before = flow.snapshot();

        let err = flow.rolling_update("enc", ConfigBag::new()).await.unwrap_err();

        assert!(matches!(err, FlowError::UpdateFailed { .. }));
        assert_eq!(flow.state(), FlowState::Running);
        let live = sup.live_units("enc");
        assert_eq!(live.len(), 4);
        assert!(live.iter().all(|u| u.generation == 0));
        let after = flow.snapshot();
        assert_eq!(after.topology_digest, before.topology_digest);
        assert_eq!(after.pods, before.pods);
    }

    #[tokio::test]
    async fn test_mutations_reject_external_and_unknown_pods() {
        let sup = Arc::new(ScriptedSupervisor::new());
        let mut flow = running(external_topology(45679), &sup).await;

        let update = flow.rolling_update("external_real", ConfigBag::new()).await;
        let scale = flow.scale("external_real", 2).await;
        let missing = flow.scale("ghost", 2).await;

        assert!(matches!(update, Err(FlowError::Forbidden { .. })));
        assert!(matches!(scale, Err(FlowError::Forbidden { .. })));
        assert!(matches!(missing, Err(FlowError::NotFound { .. })));
        assert_eq!(flow.state(), FlowState::Running);
    }

    #[tokio::test]
    async fn test_scale_up_and_down() {
        let sup = Arc::new(ScriptedSupervisor::new());
        let mut flow = running(sharded(), &sup).await;

        flow.scale("enc", 3).await.unwrap();
        assert_eq!(sup.live_units("enc").len(), 6);
        assert_eq!(flow.snapshot().pod("enc").unwrap().routable, vec![3, 3]);

        flow.scale("enc", 1).await.unwrap();
        assert_eq!(sup.live_units("enc").len(), 2);
        assert!(sup.live_units("enc").iter().all(|u| u.replica == 0));
        assert_eq!(flow.topology().pod("enc").unwrap().replicas, 1);
        assert_eq!(flow.snapshot().pod("enc").unwrap().routable, vec![1, 1]);
    }

    #[tokio::test]
    async fn test_status_during_scale_down_is_the_previous_view() {
        let sup = Arc::new(ScriptedSupervisor::new().with_stop_delay(Duration::from_millis(50)));
        let mut flow = running(sharded(), &sup).await;
        let cell = flow.snapshot_cell();

        let (scaled, during) = tokio::join!(flow.scale("enc", 1), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            cell.load()
        });
        scaled.unwrap();

        assert_eq!(during.state, FlowState::Updating);
        let enc = during.pod("enc").unwrap();
        assert_eq!((enc.replicas, enc.routable.clone()), (2, vec![2, 2]));
        let after = flow.snapshot();
        let enc = after.pod("enc").unwrap();
        assert_eq!((enc.replicas, enc.routable.clone()), (1, vec![1, 1]));
        assert_eq!(after.state, FlowState::Running);
    }

    #[tokio::test]
    async fn test_update_parks_replicas_that_fail_to_stop() {
        let sup = Arc::new(ScriptedSupervisor::new().with_stop_failure("enc"));
        let mut flow = running(sharded(), &sup).await;

        flow.rolling_update("enc", ConfigBag::new()).await.unwrap();

        let enc = flow.snapshot().pod("enc").cloned().unwrap();
        assert_eq!(enc.routable, vec![2, 2]);
        assert_eq!(enc.stale, 4);
        assert_eq!(sup.live_units("enc").len(), 8);

        sup.clear_stop_failure("enc");
        flow.terminate().await.unwrap();
        assert_eq!(sup.live_count(), 0);
    }

    #[tokio::test]
    async fn test_scale_down_parks_replicas_that_fail_to_stop() {
        let sup = Arc::new(ScriptedSupervisor::new().with_stop_failure("enc"));
        let mut flow = running(sharded(), &sup).await;

        flow.scale("enc", 1).await.unwrap();

        let enc = flow.snapshot().pod("enc").cloned().unwrap();
        assert_eq!(enc.routable, vec![1, 1]);
        assert_eq!(enc.stale, 2);

        let err = flow.terminate().await.unwrap_err();
        assert!(matches!(err, FlowError::TeardownFailed { .. }));
        assert_eq!(sup.live_units("enc").len(), 4);
    }

    #[tokio::test]
    async fn test_scale_to_zero_is_rejected() {
        let sup = Arc::new(ScriptedSupervisor::new());
        let mut flow = running(sharded(), &sup).await;

        let err = flow.scale("enc", 0).await.unwrap_err();

        assert!(matches!(err, FlowError::InvalidRequest(_)));
        assert_eq!(sup.live_units("enc").len(), 4);
    }

    #[tokio::test]
    async fn test_failed_scale_up_rolls_back() {
        let sup = Arc::new(ScriptedSupervisor::new().with_start_failure_after("enc", 5));
        let mut flow = running(sharded(), &sup).await;

        let err = flow.scale("enc", 4).await.unwrap_err();

        assert!(matches!(err, FlowError::ScaleFailed { .. }));
        assert_eq!(sup.live_units("enc").len(), 4);
        assert_eq!(flow.topology().pod("enc").unwrap().replicas, 2);
        assert_eq!(flow.state(), FlowState::Running);
    }

    #[tokio::test]
    async fn test_terminate_stops_in_reverse_order() {
        let sup = Arc::new(ScriptedSupervisor::new());
        let mut flow = running(linear_topology(&["a", "b", "c"]), &sup).await;

        flow.terminate().await.unwrap();

        let order: Vec<String> = sup.stopped().into_iter().map(|u| u.pod).collect();
        assert_eq!(order, vec!["c", "b", "a"]);
        assert_eq!(flow.state(), FlowState::Terminated);
        assert!(flow.terminate().await.is_ok());
    }

    #[tokio::test]
    async fn test_terminate_reports_stuck_replicas() {
        let sup = Arc::new(ScriptedSupervisor::new().with_stop_failure("b"));
        let mut flow = running(linear_topology(&["a", "b"]), &sup).await;

        let err = flow.terminate().await.unwrap_err();

        assert!(matches!(err, FlowError::TeardownFailed { .. }));
        assert_eq!(flow.state(), FlowState::Terminated);
        assert_eq!(sup.live_units("a").len(), 0);
    }

    #[tokio::test]
    async fn test_mutation_after_termination_is_rejected() {
        let sup = Arc::new(ScriptedSupervisor::new());
        let mut flow = running(linear_topology(&["a"]), &sup).await;
        flow.terminate().await.unwrap();

        let err = flow.scale("a", 2).await.unwrap_err();

        assert!(matches!(err, FlowError::InvalidState { .. }));
    }
}
