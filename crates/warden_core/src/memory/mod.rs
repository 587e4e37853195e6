//! # Memory Management
//!
//! Persistent storage for safety metadata and the allocation lifetime classes
//! the scheduler reasons about.
//!
//! ## Design Philosophy
//!
//! Metadata records are allocated once and recycled for the rest of the
//! process:
//! - No record is ever freed while the process runs
//! - Any index ever handed out stays dereferenceable
//! - Reuse is detected through versions, not through memory validity

mod arena;
mod pool;

pub use arena::PersistentArena;
pub use pool::{PoolAllocator, PoolHandle, PoolSlot};

/// Allocation lifetime class of a buffer.
///
/// The safety layer never allocates buffers itself, but it needs to know which
/// class a buffer came from when a job asks to free it on completion.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum Allocator {
    /// Not a valid allocator.
    #[default]
    Invalid,
    /// No allocation, the buffer wraps foreign memory.
    None,
    /// Frame-scoped scratch memory, owner thread only.
    Temp,
    /// Memory scoped to the job it is handed to.
    TempJob,
    /// Long-lived heap memory.
    Persistent,
    /// Memory owned by the audio mixer.
    AudioKernel,
}

impl Allocator {
    /// Returns true if a job may free a buffer of this class when it completes.
    #[inline]
    #[must_use]
    pub const fn can_deallocate_on_job_completion(self) -> bool {
        matches!(self, Self::Persistent | Self::TempJob)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deallocate_on_completion_classes() {
        assert!(Allocator::Persistent.can_deallocate_on_job_completion());
        assert!(Allocator::TempJob.can_deallocate_on_job_completion());
        assert!(!Allocator::Temp.can_deallocate_on_job_completion());
        assert!(!Allocator::Invalid.can_deallocate_on_job_completion());
        assert!(!Allocator::None.can_deallocate_on_job_completion());
        assert!(!Allocator::AudioKernel.can_deallocate_on_job_completion());
    }
}
