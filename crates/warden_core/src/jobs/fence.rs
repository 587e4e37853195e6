//! # Fences
//!
//! The job system is an outside collaborator. The safety layer only sees it
//! through the two oracles defined here.

/// Opaque token for "the point at which a scheduled job will have finished".
///
/// `Fence::NONE` stands for no job at all. It is always complete and is what a
/// node records before anyone schedules against it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[repr(transparent)]
pub struct Fence(u64);

impl Fence {
    /// The empty fence.
    pub const NONE: Self = Self(0);

    /// Wraps a raw job system token.
    #[inline]
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw token.
    #[inline]
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Returns true for [`Fence::NONE`].
    #[inline]
    #[must_use]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

/// Completion queries against the job system.
///
/// Implementations must treat [`Fence::NONE`] as complete and as a dependency
/// of everything.
pub trait FenceOracle: Send + Sync {
    /// Returns true once the job behind `fence` has finished.
    fn is_complete(&self, fence: Fence) -> bool;

    /// Blocks until the job behind `fence` has finished.
    ///
    /// May return early if the job system cannot finish the work (callers
    /// re-check with `is_complete`).
    fn wait_until_complete(&self, fence: Fence);

    /// Returns true if `dependency` transitively waits for `fence`, or if
    /// `fence` has already finished.
    fn is_dependency_or_already_synced(&self, fence: Fence, dependency: Fence) -> bool;
}

/// Queries about the calling thread.
pub trait ExecutionOracle: Send + Sync {
    /// Returns true if the caller is inside a running job.
    fn is_executing_job(&self) -> bool;

    /// Returns true if the caller is the thread that owns the safety handles.
    fn is_owner_thread(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fence_none() {
        assert!(Fence::NONE.is_none());
        assert!(Fence::default().is_none());
        assert!(!Fence::from_raw(3).is_none());
        assert_eq!(Fence::from_raw(3).raw(), 3);
    }
}
