//! # WARDEN Core
//!
//! Runtime race and use-after-free detection for manually managed buffers
//! shared between an owner thread and job workers:
//! - Versioned handles that go stale the moment their buffer is released
//! - Read, write and dispose permission bits set when a job is scheduled
//! - Schedule-time validation of dependencies and aliasing
//! - A stub build with the same API that compiles every check away
//!
//! ## Architecture Rules
//!
//! 1. **Nodes are never freed** - Safety metadata is recycled, not dropped
//! 2. **Violations are errors** - Every detected bug is returned to the caller
//! 3. **No locks on the hot path** - Permission queries are one atomic load
//!
//! ## Example
//!
//! ```rust,ignore
//! use warden_core::{CheckedSafety, FenceGraph, SafetyChecks, SafetyConfig, ThreadContext};
//!
//! let graph = Arc::new(FenceGraph::new());
//! let safety = CheckedSafety::new(SafetyConfig::default(), graph, Arc::new(ThreadContext::current()))?;
//! let buffer = safety.create()?;
//! safety.check_write_and_throw(&buffer)?;
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod config;
pub mod error;
pub mod jobs;
pub mod memory;
pub mod runtime;
pub mod safety;

pub use config::SafetyConfig;
pub use error::{Access, AccessHolder, AliasKind, ErrorKind, SafetyError, SafetyResult, ScheduleConflict};
pub use jobs::{ExecutionOracle, Fence, FenceGraph, FenceOracle, JobScope, ThreadContext, WorkerPool};
pub use memory::{Allocator, PersistentArena, PoolAllocator, PoolHandle};
pub use safety::{
    ActiveSafety, CheckedSafety, DependencyValidator, EnforceJobResult, NameResolver, SafetyChecks,
    SafetyHandle, StaticSafetyId, StaticSafetyIdRegistry, UncheckedSafety,
};
