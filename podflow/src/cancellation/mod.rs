//! Cooperative cancellation and LIFO teardown.
//!
//! This module provides:
//! - CancellationToken for cooperative, awaitable cancellation
//! - CancelOnDrop to cancel a token when a caller stops waiting
//! - CleanupRegistry for LIFO async teardown with per-step timeouts

mod cleanup;
mod token;

pub use cleanup::{CleanupFailure, CleanupRegistry};
pub use token::{CancelOnDrop, CancellationToken};
