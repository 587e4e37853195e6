//! # Error Reporter
//!
//! Turns the name ids recorded on a node into readable conflict messages.

use crate::error::{ScheduleConflict, SafetyError};

use super::registry::{StaticSafetyId, StaticSafetyIdRegistry};

/// Resolves diagnostic name ids to text.
///
/// The registry is the default resolver. Hosts with their own name tables
/// plug in here.
pub trait NameResolver: Send + Sync {
    /// Returns a printable name for `id`.
    fn resolve(&self, id: StaticSafetyId) -> String;
}

impl NameResolver for StaticSafetyIdRegistry {
    fn resolve(&self, id: StaticSafetyId) -> String {
        self.name_of(id).map_or_else(
            || "(unknown)".to_owned(),
            |name| String::from_utf8_lossy(name).into_owned(),
        )
    }
}

/// The four names a conflict message refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConflictNames {
    /// Job being scheduled.
    pub job: StaticSafetyId,
    /// Job already recorded on the node.
    pub other_job: StaticSafetyId,
    /// Field of the new job.
    pub field: StaticSafetyId,
    /// Field of the recorded job.
    pub other_field: StaticSafetyId,
}

/// Builds schedule-time errors.
pub struct ErrorReporter<'a> {
    names: &'a dyn NameResolver,
}

impl<'a> ErrorReporter<'a> {
    /// Creates a reporter resolving names through `names`.
    #[must_use]
    pub fn new(names: &'a dyn NameResolver) -> Self {
        Self { names }
    }

    /// Builds the error for a conflict between a new job and recorded work.
    #[must_use]
    pub fn schedule_conflict(&self, conflict: ScheduleConflict, names: ConflictNames) -> SafetyError {
        let job = self.names.resolve(names.job);
        let other_job = self.names.resolve(names.other_job);
        let field = self.names.resolve(names.field);
        let other_field = self.names.resolve(names.other_field);

        let message = match conflict {
            ScheduleConflict::ReadAgainstWrite => format!(
                "the previously scheduled job {other_job} writes to {field} through {other_field}. \
                 You are trying to schedule a new job {job} which reads from the same resource. \
                 Include that job as a dependency of the newly scheduled job"
            ),
            ScheduleConflict::WriteAgainstWrite => format!(
                "the previously scheduled job {other_job} writes to {field} through {other_field}. \
                 You are trying to schedule a new job {job} which writes to the same resource. \
                 Include that job as a dependency of the newly scheduled job"
            ),
            ScheduleConflict::WriteAgainstRead => format!(
                "the previously scheduled job {other_job} reads from {field} through {other_field}. \
                 You are trying to schedule a new job {job} which writes to the same resource. \
                 Include that job as a dependency of the newly scheduled job"
            ),
            ScheduleConflict::DeallocateAgainstRead => format!(
                "job {job} deallocates a resource that the previously scheduled job {other_job} \
                 still reads from through {other_field}"
            ),
            ScheduleConflict::DeallocateAgainstWrite => format!(
                "job {job} deallocates a resource that the previously scheduled job {other_job} \
                 still writes to through {other_field}"
            ),
        };

        SafetyError::ScheduleConflict { conflict, message }
    }

    /// Builds the error for a writable field whose container is read-only.
    #[must_use]
    pub fn must_be_marked_read_only(&self, job: StaticSafetyId, field: StaticSafetyId) -> SafetyError {
        SafetyError::MustBeMarkedReadOnly {
            message: format!(
                "{} must be marked read-only in the job {}, because the container itself is marked read only",
                self.names.resolve(field),
                self.names.resolve(job)
            ),
        }
    }

    /// Resolves a single id.
    #[must_use]
    pub fn name(&self, id: StaticSafetyId) -> String {
        self.names.resolve(id)
    }
}
