//! The flow registry.

use super::FlowId;
use crate::cancellation::{CancelOnDrop, CancellationToken};
use crate::config::ControlPlaneConfig;
use crate::errors::{ClearError, FlowError};
use crate::observability::flow_span;
use crate::runtime::{FlowLaunch, FlowRuntime, FlowSnapshot, FlowState, SnapshotCell, Supervisor};
use crate::topology::{ConfigBag, Topology};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn, Instrument, Span};

/// Caller-supplied extras for a new flow.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlowOptions {
    /// Requested id; generated when absent.
    pub id: Option<FlowId>,
    /// Owning workspace.
    pub workspace_id: Option<String>,
    /// Environment passed to every replica.
    pub envs: BTreeMap<String, String>,
}

impl FlowOptions {
    /// Creates empty options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests a specific id.
    #[must_use]
    pub fn with_id(mut self, id: FlowId) -> Self {
        self.id = Some(id);
        self
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

struct RegistryEntry {
    runtime: Mutex<FlowRuntime>,
    snapshot: Arc<SnapshotCell>,
}

struct Inner {
    flows: DashMap<FlowId, Arc<RegistryEntry>>,
    building: DashMap<FlowId, Arc<CancellationToken>>,
    supervisor: Arc<dyn Supervisor>,
    config: ControlPlaneConfig,
    closed: AtomicBool,
}

impl Inner {
    fn reserve(&self, id: &FlowId) -> Result<Arc<CancellationToken>, FlowError> {
        let token = Arc::new(CancellationToken::new());
        match self.building.entry(id.clone()) {
            Entry::Occupied(_) => return Err(FlowError::AlreadyExists(id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&token));
            }
        }
        if self.flows.contains_key(id) {
            self.building.remove(id);
            return Err(FlowError::AlreadyExists(id.to_string()));
        }
        Ok(token)
    }

    async fn build_and_publish(
        self: Arc<Self>,
        id: FlowId,
        mut runtime: FlowRuntime,
        token: Arc<CancellationToken>,
    ) -> Result<FlowId, FlowError> {
        let outcome = match runtime.build(&token).await {
            Ok(()) => {
                let abandoned = if self.closed.load(Ordering::SeqCst) {
                    Some(FlowError::ShuttingDown)
                } else if token.is_cancelled() {
                    Some(FlowError::Cancelled(token.reason().unwrap_or_default()))
                } else {
                    None
                };

                match abandoned {
                    Some(error) => {
                        warn!(error = %error, "Flow built after its request was abandoned; tearing down");
                        if let Err(e) = runtime.terminate().await {
                            warn!(error = %e, "Teardown of abandoned flow was incomplete");
                        }
                        Err(error)
                    }
                    None => {
                        let entry = Arc::new(RegistryEntry {
                            snapshot: runtime.snapshot_cell(),
                            runtime: Mutex::new(runtime),
                        });
                        self.flows.insert(id.clone(), entry);
                        info!("Flow published");
                        Ok(id.clone())
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "Flow build failed; nothing published");
                Err(e)
            }
        };
        self.building.remove(&id);
        outcome
    }
}

/// Process-wide map from [`FlowId`] to a running flow.
///
/// A flow becomes visible only after it has fully started. Mutations of one
/// flow hold that flow's own lock for their whole duration, including health
/// waits; the shared map is only touched for lookups, so other flows stay
/// responsive. Status reads never take the flow lock.
///
/// The registry is a cheap handle; clones share the same flows.
#[derive(Clone)]
pub struct FlowRegistry {
    inner: Arc<Inner>,
}

impl FlowRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new(supervisor: Arc<dyn Supervisor>, config: ControlPlaneConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                flows: DashMap::new(),
                building: DashMap::new(),
                supervisor,
                config,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Returns the configuration flows are built with.
    #[must_use]
    pub fn config(&self) -> &ControlPlaneConfig {
        &self.inner.config
    }

    /// Builds and publishes a new flow.
    ///
    /// If the returned future is dropped before completion, the build is
    /// cancelled and every replica it started is stopped; nothing is
    /// published.
    ///
    /// # Errors
    ///
    /// [`FlowError::AlreadyExists`] if the requested id is taken,
    /// [`FlowError::ShuttingDown`] after [`shutdown`](Self::shutdown), or
    /// the build error.
    pub async fn add(&self, topology: Topology, options: FlowOptions) -> Result<FlowId, FlowError> {
        let id = options.id.clone().unwrap_or_else(FlowId::generate);
        let span = flow_span("add", id.as_str());
        self.add_flow(id, topology, options).instrument(span).await
    }

    async fn add_flow(&self, id: FlowId, topology: Topology, options: FlowOptions) -> Result<FlowId, FlowError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(FlowError::ShuttingDown);
        }
        let token = self.inner.reserve(&id)?;

        let launch = FlowLaunch {
            flow_id: id.to_string(),
            workspace_id: options.workspace_id,
            envs: options.envs,
        };
        let runtime = FlowRuntime::new(
            launch,
            topology,
            Arc::clone(&self.inner.supervisor),
            self.inner.config.clone(),
        );

        let inner = Arc::clone(&self.inner);
        let build = inner.build_and_publish(id.clone(), runtime, Arc::clone(&token));
        let task = tokio::spawn(build.instrument(Span::current()));

        let mut guard = CancelOnDrop::new(token, "create request abandoned by caller");
        let outcome = match task.await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.inner.building.remove(&id);
                Err(FlowError::Cancelled(format!("build task aborted: {e}")))
            }
        };
        guard.disarm();
        outcome
    }

    /// Returns the latest snapshot of a flow.
    ///
    /// # Errors
    ///
    /// [`FlowError::NotFound`] for unknown ids.
    pub fn status(&self, id: &FlowId) -> Result<Arc<FlowSnapshot>, FlowError> {
        Ok(self.entry(id)?.snapshot.load())
    }

    /// Returns every published flow's snapshot.
    #[must_use]
    pub fn list(&self) -> BTreeMap<FlowId, Arc<FlowSnapshot>> {
        self.inner
            .flows
            .iter()
            .map(|e| (e.key().clone(), e.value().snapshot.load()))
            .collect()
    }

    /// Returns the number of published flows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.flows.len()
    }

    /// Returns true if no flow is published.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.flows.is_empty()
    }

    /// Returns the number of builds still in progress.
    #[must_use]
    pub fn pending_builds(&self) -> usize {
        self.inner.building.len()
    }

    /// Rolling-updates a pod of a flow and returns the resulting snapshot.
    ///
    /// # Errors
    ///
    /// [`FlowError::NotFound`], [`FlowError::Forbidden`] or
    /// [`FlowError::UpdateFailed`].
    pub async fn rolling_update(
        &self,
        id: &FlowId,
        pod: &str,
        config: ConfigBag,
    ) -> Result<Arc<FlowSnapshot>, FlowError> {
        let entry = self.entry(id)?;
        let mut runtime = entry.runtime.lock().await;
        ensure_live(&runtime, id)?;
        runtime.rolling_update(pod, config).await?;
        Ok(runtime.snapshot())
    }

    /// Scales a pod of a flow and returns the resulting snapshot.
    ///
    /// # Errors
    ///
    /// [`FlowError::InvalidRequest`] for zero replicas,
    /// [`FlowError::NotFound`], [`FlowError::Forbidden`] or
    /// [`FlowError::ScaleFailed`].
    pub async fn scale(&self, id: &FlowId, pod: &str, replicas: usize) -> Result<Arc<FlowSnapshot>, FlowError> {
        if replicas == 0 {
            return Err(FlowError::InvalidRequest(format!(
                "cannot scale pod '{pod}' to 0 replicas"
            )));
        }
        let entry = self.entry(id)?;
        let mut runtime = entry.runtime.lock().await;
        ensure_live(&runtime, id)?;
        runtime.scale(pod, replicas).await?;
        Ok(runtime.snapshot())
    }

    /// Terminates a flow and removes it.
    ///
    /// The entry is removed even when some replicas fail to stop; that
    /// failure is still returned.
    ///
    /// # Errors
    ///
    /// [`FlowError::NotFound`] for unknown ids, or
    /// [`FlowError::TeardownFailed`].
    pub async fn delete(&self, id: &FlowId) -> Result<(), FlowError> {
        let span = flow_span("delete", id.as_str());
        self.delete_flow(id).instrument(span).await
    }

    async fn delete_flow(&self, id: &FlowId) -> Result<(), FlowError> {
        let entry = self.entry(id)?;
        let mut runtime = entry.runtime.lock().await;
        ensure_live(&runtime, id)?;
        let result = runtime.terminate().await;
        drop(runtime);

        self.inner
            .flows
            .remove_if(id, |_, current| Arc::ptr_eq(current, &entry));
        info!("Flow removed");
        result
    }

    /// Deletes every flow, continuing past failures.
    ///
    /// Returns the number of flows deleted.
    ///
    /// # Errors
    ///
    /// [`FlowError::Clear`] listing every flow that failed to terminate.
    pub async fn clear(&self) -> Result<usize, FlowError> {
        let ids: Vec<FlowId> = self.inner.flows.iter().map(|e| e.key().clone()).collect();
        let attempted = ids.len();
        let results = join_all(ids.iter().map(|id| self.delete(id))).await;

        let failures: Vec<(String, FlowError)> = ids
            .iter()
            .zip(results)
            .filter_map(|(id, result)| match result {
                Ok(()) | Err(FlowError::NotFound { .. }) => None,
                Err(e) => Some((id.to_string(), e)),
            })
            .collect();

        if failures.is_empty() {
            info!(attempted, "Registry cleared");
            Ok(attempted)
        } else {
            let error = ClearError { attempted, failures };
            warn!(error = %error, "Registry cleared with failures");
            Err(error.into())
        }
    }

    /// Stops accepting new flows, cancels builds in progress and clears
    /// every flow.
    ///
    /// # Errors
    ///
    /// Same as [`clear`](Self::clear).
    pub async fn shutdown(&self) -> Result<usize, FlowError> {
        self.inner.closed.store(true, Ordering::SeqCst);
        for build in self.inner.building.iter() {
            build.value().cancel("registry shutting down");
        }

        let deadline = tokio::time::Instant::now() + self.inner.config.cleanup_timeout();
        while !self.inner.building.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        if !self.inner.building.is_empty() {
            warn!(pending = self.inner.building.len(), "Builds still running at shutdown");
        }

        self.clear().await
    }

    /// Returns true once [`shutdown`](Self::shutdown) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    fn entry(&self, id: &FlowId) -> Result<Arc<RegistryEntry>, FlowError> {
        self.inner
            .flows
            .get(id)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| FlowError::flow_not_found(id))
    }
}

fn ensure_live(runtime: &FlowRuntime, id: &FlowId) -> Result<(), FlowError> {
    if runtime.state() == FlowState::Terminated {
        Err(FlowError::flow_not_found(id))
    } else {
        Ok(())
    }
}

impl fmt::Debug for FlowRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowRegistry")
            .field("flows", &self.inner.flows.len())
            .field("building", &self.inner.building.len())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
