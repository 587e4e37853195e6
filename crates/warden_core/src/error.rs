//! # Safety Error Types
//!
//! All errors that can occur in the safety system. Every one of them means the
//! caller has a bug: nothing here is retried or defaulted.

use thiserror::Error;

use crate::memory::Allocator;

/// The kind of access being checked.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Access {
    /// Reading buffer contents.
    Read,
    /// Writing buffer contents.
    Write,
    /// Disposing of the buffer.
    Dispose,
}

impl std::fmt::Display for Access {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Dispose => "dispose",
        })
    }
}

/// Which recorded job holds the conflicting access.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AccessHolder {
    /// The job recorded as the buffer's writer.
    Writer,
    /// One of the jobs recorded as the buffer's readers.
    Reader,
}

impl std::fmt::Display for AccessHolder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Writer => "writes to",
            Self::Reader => "reads from",
        })
    }
}

/// Conflicts found while validating a schedule request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ScheduleConflict {
    /// New writer against an outstanding reader.
    WriteAgainstRead,
    /// New writer against an outstanding writer.
    WriteAgainstWrite,
    /// New reader against an outstanding writer.
    ReadAgainstWrite,
    /// Deallocation against an outstanding reader.
    DeallocateAgainstRead,
    /// Deallocation against an outstanding writer.
    DeallocateAgainstWrite,
}

/// Ways a single job can alias one buffer with itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AliasKind {
    /// Same buffer listed read-only and writable.
    ReadAndWrite,
    /// Same buffer listed writable twice.
    WriteAndWrite,
    /// Same buffer listed for deallocation twice.
    DoubleDeallocate,
}

impl std::fmt::Display for AliasKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::ReadAndWrite => "a read-only and a writable container alias",
            Self::WriteAndWrite => "two writable containers alias",
            Self::DoubleDeallocate => "two deallocating containers alias",
        })
    }
}

/// Coarse classification of a [`SafetyError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The handle's version no longer matches its node.
    UseAfterRelease,
    /// Conflicting outstanding work, found outside a job.
    ConcurrentAccessViolation,
    /// Conflicting access found inside a running job.
    ConcurrentAccessViolationInJob,
    /// One job lists the same buffer in conflicting roles.
    AliasingViolation,
    /// A usage rule was broken.
    PolicyViolation,
    /// A node does not carry its magic bits.
    CorruptionDetected,
    /// Runtime lifecycle, configuration or capacity problem.
    Lifecycle,
}

/// Errors that can occur in the safety system.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SafetyError {
    /// The protected resource has been deallocated since the handle was taken.
    #[error("the safety handle is no longer valid: the protected resource has been deallocated")]
    Deallocated,

    /// `release` was called on a handle whose node was already released.
    #[error("the handle has already been released")]
    AlreadyReleased,

    /// The handle was never assigned a node.
    #[error("the resource has not been assigned or constructed; all containers must be valid when scheduling a job")]
    NotAllocated,

    /// A previously scheduled job still holds conflicting access.
    #[error("the previously scheduled job {holder} the resource; complete that job before you {access} it")]
    OutstandingJob {
        /// The access being attempted.
        access: Access,
        /// Which recorded job conflicts.
        holder: AccessHolder,
    },

    /// Recovery was attempted from a thread that does not own the handles.
    #[error("resource {access} attempted from a thread that is neither the owner thread nor a job")]
    NotOwnerThread {
        /// The access being attempted.
        access: Access,
    },

    /// A running job tried an access it was not granted at schedule time.
    #[error("you are not allowed to {access} this resource from inside a job")]
    AccessInJob {
        /// The access being attempted.
        access: Access,
    },

    /// A schedule request conflicts with recorded outstanding work.
    #[error("{message}")]
    ScheduleConflict {
        /// The kind of conflict.
        conflict: ScheduleConflict,
        /// Diagnostic naming both jobs and fields.
        message: String,
    },

    /// A schedule request aliases one buffer with itself.
    #[error("{alias} in job {job}")]
    Aliasing {
        /// How the buffer aliases.
        alias: AliasKind,
        /// The job being scheduled.
        job: String,
    },

    /// A buffer from this allocator may not be freed by a job.
    #[error("only Persistent and TempJob allocations can be deallocated from a job, got {allocator:?}")]
    DisallowedAllocator {
        /// The offending allocator class.
        allocator: Allocator,
    },

    /// Write attempted through a read-only secondary view.
    #[error("the container has been declared read-only but you are attempting to write to it")]
    WriteToReadOnlyView,

    /// A job lists a read-only view as writable.
    #[error("{message}")]
    MustBeMarkedReadOnly {
        /// Diagnostic naming the job and field.
        message: String,
    },

    /// The node forbids disposal.
    #[error("you are not allowed to dispose this resource")]
    DisposeNotAllowed,

    /// A deferred iteration count comes from a buffer the job does not list.
    #[error("the deferred list sets the iteration count when the job executes, so it must be included in the job")]
    DeferredListNotInJob,

    /// Temp memory was handed to a job.
    #[error("resource allocated with temp memory cannot be used when scheduling a job, use TempJob instead")]
    TempMemoryInJob,

    /// A view built from a raw pointer was handed to a job.
    #[error("resource constructed from an unsafe pointer cannot be used in a job")]
    UnsafePtrSliceInJob,

    /// The handle already tracks the secondary version.
    #[error("already using secondary version")]
    AlreadySecondaryVersion,

    /// The operation needs a handle on the primary version.
    #[error("operation requires a handle on the primary version")]
    PrimaryVersionRequired,

    /// A fixed view of a list was requested while a job writes the list.
    #[error("the previously scheduled job writes to the list; complete it before taking a fixed view, or use a deferred view")]
    ListWrittenByScheduledJob,

    /// A node lacks its magic bits.
    #[error("safety node is corrupted or is being accessed from a job that is not allowed to")]
    Corrupted,

    /// No more safety nodes can be created.
    #[error("safety node pool exhausted: capacity {capacity}")]
    PoolExhausted {
        /// Pool capacity in nodes.
        capacity: usize,
    },

    /// The process-wide runtime has not been initialized.
    #[error("safety runtime is not initialized")]
    NotInitialized,

    /// The process-wide runtime was initialized twice.
    #[error("safety runtime is already initialized")]
    AlreadyInitialized,

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl SafetyError {
    /// Returns the taxonomy class of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Deallocated | Self::AlreadyReleased | Self::NotAllocated => {
                ErrorKind::UseAfterRelease
            }
            Self::OutstandingJob { .. } | Self::NotOwnerThread { .. } | Self::ScheduleConflict { .. } => {
                ErrorKind::ConcurrentAccessViolation
            }
            Self::AccessInJob { .. } => ErrorKind::ConcurrentAccessViolationInJob,
            Self::Aliasing { .. } => ErrorKind::AliasingViolation,
            Self::DisallowedAllocator { .. }
            | Self::WriteToReadOnlyView
            | Self::MustBeMarkedReadOnly { .. }
            | Self::DisposeNotAllowed
            | Self::DeferredListNotInJob
            | Self::TempMemoryInJob
            | Self::UnsafePtrSliceInJob
            | Self::AlreadySecondaryVersion
            | Self::PrimaryVersionRequired
            | Self::ListWrittenByScheduledJob => ErrorKind::PolicyViolation,
            Self::Corrupted => ErrorKind::CorruptionDetected,
            Self::PoolExhausted { .. }
            | Self::NotInitialized
            | Self::AlreadyInitialized
            | Self::Config(_) => ErrorKind::Lifecycle,
        }
    }
}

/// Result type for safety operations.
pub type SafetyResult<T> = Result<T, SafetyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(SafetyError::Deallocated.kind(), ErrorKind::UseAfterRelease);
        assert_eq!(
            SafetyError::AccessInJob { access: Access::Write }.kind(),
            ErrorKind::ConcurrentAccessViolationInJob
        );
        assert_eq!(
            SafetyError::Aliasing { alias: AliasKind::ReadAndWrite, job: "Job".into() }.kind(),
            ErrorKind::AliasingViolation
        );
        assert_eq!(SafetyError::WriteToReadOnlyView.kind(), ErrorKind::PolicyViolation);
        assert_eq!(SafetyError::Corrupted.kind(), ErrorKind::CorruptionDetected);
    }

    #[test]
    fn test_error_messages() {
        let err = SafetyError::OutstandingJob { access: Access::Write, holder: AccessHolder::Reader };
        assert_eq!(
            err.to_string(),
            "the previously scheduled job reads from the resource; complete that job before you write it"
        );

        let err = SafetyError::Aliasing { alias: AliasKind::WriteAndWrite, job: "Blur".into() };
        assert_eq!(err.to_string(), "two writable containers alias in job Blur");
    }
}
