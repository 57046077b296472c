//! Result combination across shards, needs and join nodes.
//!
//! This module provides:
//! - Documents and result batches flowing between pods
//! - The reduction engine: mandatory shard reduction, needs concatenation and
//!   join reduction
//! - A request router that applies those rules hop by hop over a topology

mod batch;
mod engine;
mod router;

pub use batch::{Document, Reply, ResultBatch};
pub use engine::{merge_documents, ReductionEngine};
pub use router::{RequestRouter, RouteOutcome};
