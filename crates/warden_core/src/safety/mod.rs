//! # Safety Handles
//!
//! Race and use-after-free detection for buffers shared between the owner
//! thread and job workers.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  version snapshot   ┌──────────────────────────────┐
//! │ SafetyHandle │ ──────────────────▶ │ SafetyNode (pooled, reused)  │
//! │  (copyable)  │                     │  version0 | version1 | flags │
//! └──────────────┘                     │  writer + readers log        │
//!        │                             └──────────────────────────────┘
//!        │ recorded per job                       ▲
//!        ▼                                        │ update_dependencies
//! ┌─────────────────────┐   validate_schedule     │
//! │ DependencyValidator │ ────────────────────────┘
//! └─────────────────────┘
//! ```
//!
//! A handle compares its snapshot against the node's live version word.
//! Releasing the node advances the generation, which invalidates every copy
//! at once. Scheduling a job sets protection bits, and the next check on the
//! owner thread clears them once the recorded jobs are done.

mod checks;
mod handle;
mod node;
mod registry;
mod reporter;
mod validator;

pub use checks::{ActiveSafety, CheckedSafety, EnforceJobResult, SafetyChecks, UncheckedSafety};
pub use handle::{NodeTarget, PatchMode, SafetyHandle};
pub use node::{
    AccessLog, BufferDebugData, LocalPermissions, NodeId, SafetyNode, SafetyNodePool, ALLOW_DISPOSE,
    ALLOW_SECONDARY_WRITING, BUMP_SECONDARY_VERSION_ON_SCHEDULE_WRITE, DISPOSE_PROTECT, IS_INIT, MAGIC,
    READ_PROTECT, READ_WRITE_DISPOSE_PROTECT, READ_WRITE_PROTECT, SECONDARY_VERSION, VERSION_INC,
    WRITE_PROTECT,
};
pub use registry::{StaticSafetyId, StaticSafetyIdRegistry};
pub use reporter::{ConflictNames, ErrorReporter, NameResolver};
pub use validator::DependencyValidator;
