//! Testing utilities for podflow.
//!
//! This module provides:
//! - A scripted supervisor with injectable start, health and stop failures
//! - Document fixtures and an echo executor for routing tests
//! - Fast control-plane configuration for tests

mod fixtures;
mod scripted;

pub use fixtures::{echo_executor, external_topology, fast_config, input_docs, linear_topology};
pub use scripted::ScriptedSupervisor;
