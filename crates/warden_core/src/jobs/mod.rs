//! # Job System Collaborators
//!
//! The safety layer does not schedule work. It talks to whatever job system
//! hosts it through [`FenceOracle`] and [`ExecutionOracle`].
//!
//! This module also ships a reference implementation of both:
//! - [`FenceGraph`]: fence ledger with dependency tracking and inline completion
//! - [`WorkerPool`]: threads that run the graph's jobs
//! - [`ThreadContext`]: owner-thread identity

mod fence;
mod graph;
mod worker;

pub use fence::{ExecutionOracle, Fence, FenceOracle};
pub use graph::{FenceGraph, JobBody};
pub use worker::{is_executing_job, JobScope, ThreadContext, WorkerPool};
