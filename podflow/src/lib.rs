//! # Podflow
//!
//! A control plane for long-running pod pipelines ("flows").
//!
//! Podflow tracks every running flow in a registry and supports:
//!
//! - **Topology validation**: pods with shards, replicas, `needs` edges, join
//!   nodes and externally owned pods, checked as a DAG
//! - **Result combination**: mandatory shard reduction, needs concatenation
//!   and join reduction
//! - **Lifecycle management**: dependency-ordered builds with full rollback,
//!   rolling updates, scaling and reverse-order teardown
//! - **Per-flow serialization**: mutations of one flow never interleave, while
//!   other flows stay responsive
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use podflow::prelude::*;
//! use std::sync::Arc;
//!
//! let registry = FlowRegistry::new(Arc::new(InProcessSupervisor::new()), ControlPlaneConfig::new());
//! let topology = TopologyBuilder::new()
//!     .add(PodDeclaration::new("encoder").shards(2))
//!     .add(PodDeclaration::new("indexer"))
//!     .build()?;
//!
//! let id = registry.add(topology, FlowOptions::new()).await?;
//! registry.scale(&id, "encoder", 3).await?;
//! registry.delete(&id).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod config;
pub mod control;
pub mod errors;
pub mod observability;
pub mod reduce;
pub mod registry;
pub mod runtime;
pub mod testing;
pub mod topology;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::{CancellationToken, CleanupRegistry};
    pub use crate::config::ControlPlaneConfig;
    pub use crate::control::{
        ControlError, ControlSurface, CreateFlowRequest, RollingUpdateRequest, ScaleRequest,
    };
    pub use crate::errors::{ErrorCategory, FlowError, TopologyError};
    pub use crate::reduce::{Document, ReductionEngine, RequestRouter, ResultBatch};
    pub use crate::registry::{FlowId, FlowOptions, FlowRegistry};
    pub use crate::runtime::{
        FlowSnapshot, FlowState, InProcessSupervisor, ReplicaHandle, ReplicaUnit, Supervisor,
    };
    pub use crate::topology::{
        ConfigBag, PodDeclaration, PodKind, PodSpec, PollingPolicy, Topology, TopologyBuilder,
        GATEWAY,
    };
}
