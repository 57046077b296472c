//! The control surface.

use super::{
    schema, ClearReport, ControlError, CreateFlowRequest, Created, FlowListing, RollingUpdateRequest,
    ScaleRequest, SchemaField,
};
use crate::errors::FlowError;
use crate::registry::{FlowId, FlowOptions, FlowRegistry};
use crate::runtime::FlowSnapshot;
use crate::topology::{Address, DeviceRequest, Topology, TopologyBuilder};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

const CREATED: u16 = 201;
const DEFAULT_HOST: &str = "0.0.0.0";

/// Stateless façade over a [`FlowRegistry`].
///
/// Validates requests, merges auxiliary parameters and maps every failure to
/// a [`ControlError`].
#[derive(Debug, Clone)]
pub struct ControlSurface {
    registry: FlowRegistry,
}

impl ControlSurface {
    /// Creates a surface over `registry`.
    #[must_use]
    pub const fn new(registry: FlowRegistry) -> Self {
        Self { registry }
    }

    /// Returns the underlying registry.
    #[must_use]
    pub const fn registry(&self) -> &FlowRegistry {
        &self.registry
    }

    /// Lists every flow's status.
    #[must_use]
    pub fn list(&self) -> FlowListing {
        let items: BTreeMap<FlowId, FlowSnapshot> = self
            .registry
            .list()
            .into_iter()
            .map(|(id, snapshot)| (id, FlowSnapshot::clone(&snapshot)))
            .collect();
        FlowListing {
            size: items.len(),
            items,
        }
    }

    /// Returns the accepted create-request fields.
    #[must_use]
    pub fn schema() -> BTreeMap<String, SchemaField> {
        schema()
    }

    /// Creates a flow.
    ///
    /// # Errors
    ///
    /// 400 for invalid topologies and build failures, 409 for a taken id,
    /// 503 while shutting down.
    pub async fn create(&self, request: CreateFlowRequest) -> Result<Created, ControlError> {
        let CreateFlowRequest {
            id,
            workspace_id,
            params,
            ports,
            envs,
            device_requests,
        } = request;

        let prepared = id
            .map(FlowId::parse)
            .transpose()
            .and_then(|id| {
                let topology = TopologyBuilder::from_declarations(params.pods).build()?;
                let topology = apply_overrides(topology, &ports, &device_requests)?;
                Ok((id, topology))
            })
            .map_err(|e| ControlError::rejected(&e))?;
        let (id, topology) = prepared;

        let options = FlowOptions {
            id,
            workspace_id,
            envs,
        };
        match self.registry.add(topology, options).await {
            Ok(id) => Ok(Created { status: CREATED, id }),
            Err(e) => {
                warn!(error = %e, "Create request failed");
                Err(ControlError::rejected(&e))
            }
        }
    }

    /// Rolling-updates a pod, merging the request's dump path into its
    /// configuration under `dump_path`.
    ///
    /// # Errors
    ///
    /// 400 on any failure, including unknown ids and external pods.
    pub async fn rolling_update(
        &self,
        id: &str,
        request: RollingUpdateRequest,
    ) -> Result<Arc<FlowSnapshot>, ControlError> {
        let id = FlowId::parse(id).map_err(|e| ControlError::rejected(&e))?;
        let config = request.merged_config();
        debug!(flow_id = %id, pod = %request.pod_name, keys = config.len(), "Rolling update requested");
        self.registry
            .rolling_update(&id, &request.pod_name, config)
            .await
            .map_err(|e| ControlError::rejected(&e))
    }

    /// Scales a pod.
    ///
    /// # Errors
    ///
    /// 400 on any failure, including non-positive replica counts.
    pub async fn scale(&self, id: &str, request: ScaleRequest) -> Result<Arc<FlowSnapshot>, ControlError> {
        let id = FlowId::parse(id).map_err(|e| ControlError::rejected(&e))?;
        let replicas = usize::try_from(request.replicas).map_err(|_| {
            ControlError::rejected(&FlowError::InvalidRequest(format!(
                "replicas must be a positive integer, got {}",
                request.replicas
            )))
        })?;
        self.registry
            .scale(&id, &request.pod_name, replicas)
            .await
            .map_err(|e| ControlError::rejected(&e))
    }

    /// Deletes every flow. Individual failures are reported, not raised.
    pub async fn delete_all(&self) -> ClearReport {
        match self.registry.clear().await {
            Ok(deleted) => ClearReport {
                attempted: deleted,
                deleted,
                failures: BTreeMap::new(),
            },
            Err(FlowError::Clear(clear)) => ClearReport {
                attempted: clear.attempted,
                deleted: clear.succeeded(),
                failures: clear
                    .failures
                    .into_iter()
                    .map(|(id, e)| (id, e.summary()))
                    .collect(),
            },
            Err(other) => ClearReport {
                failures: BTreeMap::from([("*".to_string(), other.summary())]),
                ..ClearReport::default()
            },
        }
    }

    /// Deletes one flow.
    ///
    /// # Errors
    ///
    /// 404 for unknown ids.
    pub async fn delete(&self, id: &str) -> Result<(), ControlError> {
        let id = lookup_id(id)?;
        self.registry
            .delete(&id)
            .await
            .map_err(|e| ControlError::classified(&e))
    }

    /// Returns one flow's status.
    ///
    /// # Errors
    ///
    /// 404 for unknown ids.
    pub fn status(&self, id: &str) -> Result<Arc<FlowSnapshot>, ControlError> {
        let id = lookup_id(id)?;
        self.registry
            .status(&id)
            .map_err(|e| ControlError::classified(&e))
    }
}

fn lookup_id(id: &str) -> Result<FlowId, ControlError> {
    FlowId::parse(id).map_err(|_| ControlError::classified(&FlowError::flow_not_found(id)))
}

/// Applies per-pod port overrides and default device requests.
fn apply_overrides(
    mut topology: Topology,
    ports: &BTreeMap<String, u16>,
    device_requests: &[DeviceRequest],
) -> Result<Topology, FlowError> {
    for (pod, &port) in ports {
        let Some(spec) = topology.pod(pod) else {
            return Err(FlowError::InvalidRequest(format!(
                "port override for unknown pod '{pod}'"
            )));
        };
        let mut spec = spec.clone();
        let host = spec
            .address
            .as_ref()
            .map_or_else(|| DEFAULT_HOST.to_string(), |a| a.host.clone());
        spec.address = Some(Address::new(host, port));
        topology = topology
            .with_pod(spec)
            .ok_or_else(|| FlowError::pod_not_found(pod))?;
    }

    if !device_requests.is_empty() {
        let targets: Vec<String> = topology
            .pods()
            .iter()
            .filter(|p| p.is_owned() && p.resources.is_empty())
            .map(|p| p.name.clone())
            .collect();
        for name in targets {
            let Some(spec) = topology.pod(&name) else { continue };
            let mut spec = spec.clone();
            spec.resources = device_requests.to_vec();
            topology = topology
                .with_pod(spec)
                .ok_or_else(|| FlowError::pod_not_found(&name))?;
        }
    }

    Ok(topology)
}
