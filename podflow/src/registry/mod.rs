//! Process-wide registry of running flows.
//!
//! This module provides:
//! - [`FlowId`], the opaque flow identifier
//! - [`FlowRegistry`], which publishes fully built flows and serializes
//!   every mutation per flow id

mod id;
mod store;

pub use id::FlowId;
pub use store::{FlowOptions, FlowRegistry};
