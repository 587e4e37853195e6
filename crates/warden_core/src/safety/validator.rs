//! # Dependency Validator
//!
//! Collects the buffers one job is about to touch, checks the request against
//! the jobs already recorded on those buffers, and records the new job once it
//! has been scheduled.
//!
//! ## Check order
//!
//! 1. Aliasing inside the request (read+write, write+write, double dealloc)
//! 2. Writable buffers against recorded readers and writer
//! 3. Read-only buffers against the recorded writer
//! 4. Deallocated buffers against recorded readers and writer
//!
//! Aliasing goes first so a request that aliases always fails the same way,
//! whatever its dependency.

use crate::error::{AliasKind, SafetyError, SafetyResult, ScheduleConflict};
use crate::jobs::{Fence, FenceOracle};

use super::handle::SafetyHandle;
use super::node::{
    BufferDebugData, NodeId, SafetyNodePool, BUMP_SECONDARY_VERSION_ON_SCHEDULE_WRITE,
    READ_WRITE_DISPOSE_PROTECT,
};
use super::registry::StaticSafetyId;
use super::reporter::{ConflictNames, ErrorReporter};

/// Capacity grows in steps of this many entries.
const CAPACITY_STEP: usize = 16;

/// The access set of one job, built while it is being scheduled.
///
/// Discard it (or [`clear`](Self::clear) it) once the job is scheduled.
#[derive(Clone, Debug, Default)]
pub struct DependencyValidator {
    read_only: Vec<SafetyHandle>,
    writable: Vec<SafetyHandle>,
    deallocate: Vec<Option<NodeId>>,
}

impl DependencyValidator {
    /// Creates an empty access set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves room for entries whose count is known up front.
    pub fn allocate_known(&mut self, read_only: usize, writable: usize, deallocate: usize) {
        reserve_known(&mut self.read_only, read_only);
        reserve_known(&mut self.writable, writable);
        reserve_known(&mut self.deallocate, deallocate);
    }

    /// Returns the handles recorded read-only.
    #[inline]
    #[must_use]
    pub fn read_only(&self) -> &[SafetyHandle] {
        &self.read_only
    }

    /// Returns the handles recorded writable.
    #[inline]
    #[must_use]
    pub fn writable(&self) -> &[SafetyHandle] {
        &self.writable
    }

    /// Returns the nodes recorded for deallocation.
    #[inline]
    #[must_use]
    pub fn deallocate(&self) -> &[Option<NodeId>] {
        &self.deallocate
    }

    /// Returns true if nothing has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read_only.is_empty() && self.writable.is_empty() && self.deallocate.is_empty()
    }

    /// Forgets every entry, keeping the storage.
    pub fn clear(&mut self) {
        self.read_only.clear();
        self.writable.clear();
        self.deallocate.clear();
    }

    pub(crate) fn push_read_only(&mut self, handle: SafetyHandle) {
        self.read_only.push(handle);
    }

    pub(crate) fn push_writable(&mut self, handle: SafetyHandle) {
        self.writable.push(handle);
    }

    pub(crate) fn push_deallocate(&mut self, node: Option<NodeId>) {
        self.deallocate.push(node);
    }

    /// Checks that `dependency` covers every recorded job the request
    /// conflicts with, and that the request does not alias itself.
    ///
    /// # Errors
    ///
    /// Returns `Aliasing` or `ScheduleConflict` for the first problem found.
    pub(crate) fn validate_schedule(
        &self,
        pool: &SafetyNodePool,
        fences: &dyn FenceOracle,
        reporter: &ErrorReporter<'_>,
        dependency: Fence,
        job: StaticSafetyId,
    ) -> SafetyResult<()> {
        self.check_aliasing(reporter, job)?;

        let covered = |fence: Fence| fences.is_dependency_or_already_synced(fence, dependency);
        let conflict = |kind: ScheduleConflict, field: StaticSafetyId, other: &BufferDebugData| {
            reporter.schedule_conflict(
                kind,
                ConflictNames {
                    job,
                    other_job: other.job,
                    field,
                    other_field: other.field,
                },
            )
        };

        for handle in &self.writable {
            let Some(node) = handle.node_id().and_then(|id| pool.get(id)) else {
                continue;
            };
            let log = node.log();
            if let Some(reader) = log.readers.iter().find(|r| !covered(r.fence)) {
                return Err(conflict(ScheduleConflict::WriteAgainstRead, handle.static_safety_id(), reader));
            }
            if !covered(log.writer.fence) {
                return Err(conflict(
                    ScheduleConflict::WriteAgainstWrite,
                    handle.static_safety_id(),
                    &log.writer,
                ));
            }
        }

        for handle in &self.read_only {
            let Some(node) = handle.node_id().and_then(|id| pool.get(id)) else {
                continue;
            };
            let log = node.log();
            if !covered(log.writer.fence) {
                return Err(conflict(
                    ScheduleConflict::ReadAgainstWrite,
                    handle.static_safety_id(),
                    &log.writer,
                ));
            }
        }

        for node in self.deallocate.iter().flatten().filter_map(|&id| pool.get(id)) {
            let log = node.log();
            if let Some(reader) = log.readers.iter().find(|r| !covered(r.fence)) {
                return Err(conflict(ScheduleConflict::DeallocateAgainstRead, StaticSafetyId::UNKNOWN, reader));
            }
            if !covered(log.writer.fence) {
                return Err(conflict(
                    ScheduleConflict::DeallocateAgainstWrite,
                    StaticSafetyId::UNKNOWN,
                    &log.writer,
                ));
            }
        }

        Ok(())
    }

    fn check_aliasing(&self, reporter: &ErrorReporter<'_>, job: StaticSafetyId) -> SafetyResult<()> {
        let alias = |alias: AliasKind| SafetyError::Aliasing {
            alias,
            job: reporter.name(job),
        };

        for (i, handle) in self.writable.iter().enumerate() {
            let Some(node) = handle.node_id() else {
                continue;
            };
            if self.read_only.iter().any(|r| r.node_id() == Some(node)) {
                return Err(alias(AliasKind::ReadAndWrite));
            }
            if self.writable[i + 1..].iter().any(|w| w.node_id() == Some(node)) {
                return Err(alias(AliasKind::WriteAndWrite));
            }
        }

        for (i, node) in self.deallocate.iter().enumerate() {
            let Some(node) = node else {
                continue;
            };
            if self.deallocate[i + 1..].contains(&Some(*node)) {
                return Err(alias(AliasKind::DoubleDeallocate));
            }
        }

        Ok(())
    }

    /// Checks that the buffer supplying a deferred iteration count is part of
    /// the job.
    ///
    /// # Errors
    ///
    /// Returns `DeferredListNotInJob` if it is not. An unassigned handle is
    /// never part of a job, even when unassigned handles were recorded.
    pub(crate) fn validate_deferred(&self, deferred: Option<&SafetyHandle>) -> SafetyResult<()> {
        let Some(deferred) = deferred else {
            return Ok(());
        };
        let node = deferred.node_id();
        if node.is_none() {
            return Err(SafetyError::DeferredListNotInJob);
        }

        let listed = self.writable.iter().any(|h| h.node_id() == node)
            || self.read_only.iter().any(|h| h.node_id() == node)
            || self.deallocate.contains(&node);
        if listed {
            Ok(())
        } else {
            Err(SafetyError::DeferredListNotInJob)
        }
    }

    /// Records `scheduled` as the writer or a reader of every listed buffer
    /// and protects them until the job is synced.
    ///
    /// Does nothing for [`Fence::NONE`]: the job already ran.
    ///
    /// # Errors
    ///
    /// Returns `Corrupted` if a listed handle is a job-local shadow.
    pub(crate) fn update_dependencies(
        &self,
        pool: &SafetyNodePool,
        fences: &dyn FenceOracle,
        scheduled: Fence,
        job: StaticSafetyId,
    ) -> SafetyResult<()> {
        if scheduled.is_none() {
            return Ok(());
        }

        for handle in &self.writable {
            // A job that already ran may have released the buffer.
            let Some(node) = handle.internal_node(pool)? else {
                continue;
            };
            let secondary = handle.is_secondary_version();
            node.log().writer = BufferDebugData {
                fence: scheduled,
                scheduled_with_secondary: secondary,
                job,
                field: handle.static_safety_id(),
            };
            if !secondary && node.has_flag(BUMP_SECONDARY_VERSION_ON_SCHEDULE_WRITE) {
                node.bump_secondary();
            }
            node.protect(READ_WRITE_DISPOSE_PROTECT);
        }

        for handle in &self.read_only {
            let Some(node) = handle.internal_node(pool)? else {
                continue;
            };
            {
                let mut log = node.log();
                log.readers.retain(|reader| !fences.is_complete(reader.fence));
                log.readers.push(BufferDebugData {
                    fence: scheduled,
                    scheduled_with_secondary: handle.is_secondary_version(),
                    job,
                    field: handle.static_safety_id(),
                });
            }
            node.protect(READ_WRITE_DISPOSE_PROTECT);
        }

        Ok(())
    }
}

fn reserve_known<T>(entries: &mut Vec<T>, additional: usize) {
    let needed = entries.len() + additional;
    if needed > entries.capacity() {
        let step = (needed - entries.capacity()).next_multiple_of(CAPACITY_STEP);
        entries.reserve_exact(entries.capacity() + step - entries.len());
    }
}
