//! Caller-facing control operations.
//!
//! This module provides:
//! - Request and response models for create, update, scale and delete
//! - [`ControlSurface`], which validates requests and delegates to the
//!   registry
//! - [`ControlError`], the only error type callers see
//! - The create-request schema

mod error;
mod models;
mod surface;

pub use error::ControlError;
pub use models::{
    schema, ClearReport, CreateFlowRequest, Created, FlowListing, FlowParams, RollingUpdateRequest,
    ScaleRequest, SchemaField,
};
pub use surface::ControlSurface;
