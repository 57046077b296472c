//! Flow topology model.
//!
//! This module provides:
//! - Pod specifications (shards, replicas, polling, needs, pod kinds)
//! - Serializable pod declarations as submitted by callers
//! - A builder that resolves default wiring and validates the DAG
//! - The immutable [`Topology`] consumed by the runtime and reduction engine

mod builder;
mod graph;
mod pod;

pub use builder::TopologyBuilder;
pub use graph::Topology;
pub use pod::{
    Address, ConfigBag, DeviceRequest, PodDeclaration, PodKind, PodSpec, PollingPolicy, GATEWAY,
};
