//! # Safety Checks
//!
//! The call-site API containers and job dispatch code use, behind one trait
//! with two implementations:
//!
//! - [`CheckedSafety`]: tracks every node and enforces every rule
//! - [`UncheckedSafety`]: compiles every call down to nothing
//!
//! [`ActiveSafety`] picks one of them from the `collections-checks` feature.
//! Both are always built so the same tests can drive either.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::SafetyConfig;
use crate::error::{Access, AccessHolder, SafetyError, SafetyResult};
use crate::jobs::{ExecutionOracle, Fence, FenceOracle};
use crate::memory::Allocator;

use super::handle::{NodeTarget, PatchMode, SafetyHandle};
use super::node::{
    SafetyNode, SafetyNodePool, ALLOW_DISPOSE, ALLOW_SECONDARY_WRITING,
    BUMP_SECONDARY_VERSION_ON_SCHEDULE_WRITE, DISPOSE_PROTECT, READ_PROTECT, READ_WRITE_PROTECT,
    WRITE_PROTECT,
};
use super::registry::{StaticSafetyId, StaticSafetyIdRegistry};
use super::reporter::{ErrorReporter, NameResolver};
use super::validator::DependencyValidator;

/// Outcome of forcing a buffer's jobs to finish.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnforceJobResult {
    /// Nothing was outstanding.
    AllJobsAlreadySynced,
    /// At least one job had to be waited on.
    DidSyncRunningJobs,
    /// The handle was already stale.
    HandleWasAlreadyDeallocated,
}

/// Safety operations shared by the checked and the stub build.
pub trait SafetyChecks: Send + Sync {
    // ---------------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------------

    /// Creates a handle on a fresh node.
    ///
    /// # Errors
    ///
    /// Returns `PoolExhausted` when no node can be created, and
    /// `NotInitialized` after [`shutdown`](Self::shutdown).
    fn create(&self) -> SafetyResult<SafetyHandle>;

    /// Retires the handle's node. Every copy of the handle becomes invalid.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyReleased` for a stale or unassigned handle.
    fn release(&self, handle: SafetyHandle) -> SafetyResult<()>;

    /// Releases the internal handles and drains the node pool.
    ///
    /// Afterwards every entry point that creates, releases, patches, records
    /// or recovers fails with `NotInitialized`. Pure queries keep answering
    /// from the node versions left behind. Node storage goes away with the
    /// last owner of the instance.
    ///
    /// # Returns
    ///
    /// The number of nodes still live, which are leaks.
    fn shutdown(&self) -> usize;

    // ---------------------------------------------------------------------
    // Queries
    // ---------------------------------------------------------------------

    /// Returns true if the handle's node has not been released since.
    fn is_valid(&self, handle: &SafetyHandle) -> bool;
    /// Returns true if the buffer may be read right now.
    fn is_allowed_to_read(&self, handle: &SafetyHandle) -> bool;
    /// Returns true if the buffer may be written right now.
    fn is_allowed_to_write(&self, handle: &SafetyHandle) -> bool;
    /// Returns true if the buffer may be disposed right now.
    fn is_allowed_to_dispose(&self, handle: &SafetyHandle) -> bool;

    // ---------------------------------------------------------------------
    // Enforcement
    // ---------------------------------------------------------------------

    /// Fails unless the buffer may be read. Outside a job, lifts read
    /// protection once the recorded writer has finished.
    ///
    /// # Errors
    ///
    /// `AccessInJob`, `Deallocated`, `NotOwnerThread` or `OutstandingJob`.
    fn check_read_and_throw(&self, handle: &SafetyHandle) -> SafetyResult<()>;

    /// Fails unless the buffer may be written. Outside a job, lifts write
    /// protection once every recorded job has finished.
    ///
    /// # Errors
    ///
    /// As [`check_read_and_throw`](Self::check_read_and_throw), plus
    /// `WriteToReadOnlyView` for a read-only secondary view.
    fn check_write_and_throw(&self, handle: &SafetyHandle) -> SafetyResult<()>;

    /// Fails unless the buffer may be disposed.
    ///
    /// # Errors
    ///
    /// As [`check_read_and_throw`](Self::check_read_and_throw), plus
    /// `DisposeNotAllowed` when the node forbids disposal.
    fn check_dispose_and_throw(&self, handle: &SafetyHandle) -> SafetyResult<()>;

    /// Same as [`check_dispose_and_throw`](Self::check_dispose_and_throw).
    ///
    /// # Errors
    ///
    /// See [`check_dispose_and_throw`](Self::check_dispose_and_throw).
    fn check_deallocate_and_throw(&self, handle: &SafetyHandle) -> SafetyResult<()> {
        self.check_dispose_and_throw(handle)
    }

    /// Fails if the handle is stale or unassigned.
    ///
    /// # Errors
    ///
    /// Returns `Deallocated`.
    fn check_exists_and_throw(&self, handle: &SafetyHandle) -> SafetyResult<()>;

    /// Fails unless a fixed-size view of a resizable buffer may be taken.
    ///
    /// Allowed while a job writes the buffer only if that job was scheduled
    /// against the secondary view, or has finished.
    ///
    /// # Errors
    ///
    /// `ListWrittenByScheduledJob`, `PrimaryVersionRequired`, `AccessInJob`
    /// or `Deallocated`.
    fn check_get_secondary_data_pointer_and_throw(&self, handle: &SafetyHandle) -> SafetyResult<()>;

    /// Write check on the primary version followed by a secondary
    /// generation bump, invalidating every fixed-size view.
    ///
    /// # Errors
    ///
    /// `PrimaryVersionRequired`, or any error of
    /// [`check_write_and_throw`](Self::check_write_and_throw).
    fn check_write_and_bump_secondary_version(&self, handle: &SafetyHandle) -> SafetyResult<()>;

    /// Waits for the recorded writer and every recorded reader.
    ///
    /// # Errors
    ///
    /// Returns `Corrupted` for a job-local shadow.
    fn enforce_all_buffer_jobs_have_completed(&self, handle: &SafetyHandle) -> SafetyResult<EnforceJobResult>;

    /// Waits for every recorded job if disposal is blocked, then releases.
    ///
    /// # Errors
    ///
    /// Returns `Corrupted` for a job-local shadow.
    fn enforce_all_buffer_jobs_have_completed_and_release(
        &self,
        handle: &SafetyHandle,
    ) -> SafetyResult<EnforceJobResult>;

    /// Waits for every recorded job if disposal is blocked, then blocks reads
    /// and writes.
    ///
    /// # Errors
    ///
    /// Returns `Corrupted` for a job-local shadow.
    fn enforce_all_buffer_jobs_have_completed_and_disable_read_write(
        &self,
        handle: &SafetyHandle,
    ) -> SafetyResult<EnforceJobResult>;

    // ---------------------------------------------------------------------
    // Secondary version
    // ---------------------------------------------------------------------

    /// Switches the handle to the node's secondary version.
    ///
    /// # Errors
    ///
    /// Returns `AlreadySecondaryVersion` on a second call.
    fn use_secondary_version(&self, handle: &mut SafetyHandle) -> SafetyResult<()>;

    /// Makes the secondary view writable or permanently read-only.
    ///
    /// # Errors
    ///
    /// Returns `Deallocated` for a stale handle.
    fn set_allow_secondary_version_writing(&self, handle: &SafetyHandle, allow: bool) -> SafetyResult<()>;

    /// Makes scheduling a primary-version writer invalidate secondary views.
    ///
    /// # Errors
    ///
    /// Returns `Deallocated` for a stale handle.
    fn set_bump_secondary_version_on_schedule_write(&self, handle: &SafetyHandle, bump: bool) -> SafetyResult<()>;

    // ---------------------------------------------------------------------
    // Job-local permissions
    // ---------------------------------------------------------------------

    /// Gives the handle a job-local read-only copy of its node.
    ///
    /// # Errors
    ///
    /// Returns `Corrupted` if the handle is already patched.
    fn patch_local_read_only(&self, handle: &mut SafetyHandle) -> SafetyResult<()>;

    /// Gives the handle a job-local write-only copy of its node.
    ///
    /// # Errors
    ///
    /// Returns `Corrupted` if the handle is already patched.
    fn patch_local_write_only(&self, handle: &mut SafetyHandle) -> SafetyResult<()>;

    /// Gives the handle a job-local read-write copy of its node.
    ///
    /// # Errors
    ///
    /// Returns `Corrupted` if the handle is already patched.
    fn patch_local_read_write(&self, handle: &mut SafetyHandle) -> SafetyResult<()>;

    /// Patches a run of handles: the first `read_only + force_read_only`
    /// read-only, the next `writable + force_writable` read-write.
    ///
    /// # Errors
    ///
    /// Returns `Corrupted` if a handle is already patched.
    fn patch_local_dynamic(
        &self,
        handles: &mut [SafetyHandle],
        read_only: usize,
        writable: usize,
        force_read_only: usize,
        force_writable: usize,
    ) -> SafetyResult<()> {
        let split = (read_only + force_read_only).min(handles.len());
        let (reads, rest) = handles.split_at_mut(split);
        for handle in reads {
            self.patch_local_read_only(handle)?;
        }
        for handle in rest.iter_mut().take(writable + force_writable) {
            self.patch_local_read_write(handle)?;
        }
        Ok(())
    }

    /// Points a patched handle back at its node and releases it.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyReleased` for a stale handle.
    fn release_patched(&self, handle: SafetyHandle) -> SafetyResult<()>;

    // ---------------------------------------------------------------------
    // Internal handles
    // ---------------------------------------------------------------------

    /// Handle shared by views built from raw pointers.
    fn temp_unsafe_ptr_slice_handle(&self) -> SafetyHandle;
    /// Returns true if `handle` is the raw-pointer view handle.
    fn is_temp_unsafe_ptr_slice_handle(&self, handle: &SafetyHandle) -> bool;
    /// Handle shared by frame-scoped temp allocations.
    fn temp_memory_handle(&self) -> SafetyHandle;
    /// Returns true if `handle` is the temp memory handle.
    fn is_temp_memory_handle(&self, handle: &SafetyHandle) -> bool;

    // ---------------------------------------------------------------------
    // Diagnostic names
    // ---------------------------------------------------------------------

    /// Interns a diagnostic name.
    fn new_static_safety_id(&self, name: &[u8]) -> StaticSafetyId;

    /// Interns the type name of `T`.
    fn new_static_safety_id_for<T: ?Sized>(&self) -> StaticSafetyId
    where
        Self: Sized,
    {
        self.new_static_safety_id(std::any::type_name::<T>().as_bytes())
    }

    /// Returns the name behind `id`.
    fn static_safety_id_name(&self, id: StaticSafetyId) -> Option<String>;

    // ---------------------------------------------------------------------
    // Introspection
    // ---------------------------------------------------------------------

    /// Returns the recorded writer, or `Fence::NONE`.
    ///
    /// # Errors
    ///
    /// Returns `Corrupted` for a job-local shadow.
    fn writer(&self, handle: &SafetyHandle) -> SafetyResult<Fence>;

    /// Returns the recorded readers.
    ///
    /// # Errors
    ///
    /// Returns `Corrupted` for a job-local shadow.
    fn readers(&self, handle: &SafetyHandle) -> SafetyResult<Vec<Fence>>;

    /// Returns the number of recorded readers.
    ///
    /// # Errors
    ///
    /// Returns `Corrupted` for a job-local shadow.
    fn reader_count(&self, handle: &SafetyHandle) -> SafetyResult<usize> {
        self.readers(handle).map(|readers| readers.len())
    }

    /// Returns the name of the recorded writer job.
    ///
    /// # Errors
    ///
    /// Returns `Corrupted` for a job-local shadow.
    fn writer_name(&self, handle: &SafetyHandle) -> SafetyResult<Option<String>>;

    /// Returns the name of the recorded reader job at `index`.
    ///
    /// # Errors
    ///
    /// Returns `Corrupted` for a job-local shadow.
    fn reader_name(&self, handle: &SafetyHandle, index: usize) -> SafetyResult<Option<String>>;

    // ---------------------------------------------------------------------
    // Scheduling
    // ---------------------------------------------------------------------

    /// Adds a buffer the job reads. Stamps `field` onto the handle.
    ///
    /// # Errors
    ///
    /// `TempMemoryInJob`, `NotAllocated`, `Deallocated` or
    /// `UnsafePtrSliceInJob`.
    fn record_read_only(
        &self,
        validator: &mut DependencyValidator,
        handle: &mut SafetyHandle,
        field: StaticSafetyId,
        job: StaticSafetyId,
    ) -> SafetyResult<()>;

    /// Adds a buffer the job writes. Stamps `field` onto the handle.
    ///
    /// # Errors
    ///
    /// As [`record_read_only`](Self::record_read_only), plus
    /// `MustBeMarkedReadOnly` for a read-only secondary view.
    fn record_writable(
        &self,
        validator: &mut DependencyValidator,
        handle: &mut SafetyHandle,
        field: StaticSafetyId,
        job: StaticSafetyId,
    ) -> SafetyResult<()>;

    /// Adds a run of handles owned by one field: the first
    /// `read_only + force_read_only` read-only, the next `writable` writable.
    ///
    /// # Errors
    ///
    /// See [`record_writable`](Self::record_writable).
    #[allow(clippy::too_many_arguments)]
    fn record_dynamic(
        &self,
        validator: &mut DependencyValidator,
        handles: &mut [SafetyHandle],
        field: StaticSafetyId,
        job: StaticSafetyId,
        read_only: usize,
        writable: usize,
        force_read_only: usize,
    ) -> SafetyResult<()> {
        let split = (read_only + force_read_only).min(handles.len());
        let (reads, rest) = handles.split_at_mut(split);
        let writes = writable.min(rest.len());
        validator.allocate_known(reads.len(), writes, 0);
        for handle in reads {
            self.record_read_only(validator, handle, field, job)?;
        }
        for handle in &mut rest[..writes] {
            self.record_writable(validator, handle, field, job)?;
        }
        Ok(())
    }

    /// Adds a buffer the job frees when it completes.
    fn record_deallocate(&self, validator: &mut DependencyValidator, handle: &SafetyHandle);

    /// Checks the collected access set against recorded work.
    ///
    /// # Errors
    ///
    /// `Aliasing` or `ScheduleConflict`.
    fn validate_schedule(
        &self,
        validator: &DependencyValidator,
        dependency: Fence,
        job: StaticSafetyId,
    ) -> SafetyResult<()>;

    /// Checks that the buffer supplying a deferred count is in the job.
    ///
    /// # Errors
    ///
    /// Returns `DeferredListNotInJob`.
    fn validate_deferred(&self, validator: &DependencyValidator, deferred: Option<&SafetyHandle>) -> SafetyResult<()>;

    /// Checks that a job may free buffers from `allocator`.
    ///
    /// # Errors
    ///
    /// Returns `DisallowedAllocator`.
    fn validate_deallocate_on_job_completion(&self, allocator: Allocator) -> SafetyResult<()>;

    /// Records the scheduled job on every buffer in the access set.
    ///
    /// # Errors
    ///
    /// Returns `Corrupted` if the set holds a job-local shadow.
    fn update_dependencies(
        &self,
        validator: &DependencyValidator,
        scheduled: Fence,
        job: StaticSafetyId,
    ) -> SafetyResult<()>;
}

/// The full-checking build.
///
/// # Example
///
/// ```rust,ignore
/// let graph = Arc::new(FenceGraph::new());
/// let safety = CheckedSafety::new(
///     SafetyConfig::default(),
///     graph.clone(),
///     Arc::new(ThreadContext::current()),
/// )?;
///
/// let handle = safety.create()?;
/// safety.check_write_and_throw(&handle)?;
/// safety.release(handle)?;
/// ```
pub struct CheckedSafety {
    config: SafetyConfig,
    pool: SafetyNodePool,
    registry: Arc<StaticSafetyIdRegistry>,
    names: Arc<dyn NameResolver>,
    fences: Arc<dyn FenceOracle>,
    execution: Arc<dyn ExecutionOracle>,
    slice_handle: SafetyHandle,
    temp_memory_handle: SafetyHandle,
    shut_down: AtomicBool,
}

impl CheckedSafety {
    /// Builds the node pool and name table and creates the internal handles.
    ///
    /// # Errors
    ///
    /// Returns `Config` for an invalid configuration and `PoolExhausted` if
    /// the pool cannot hold the prewarmed and internal nodes.
    pub fn new(
        config: SafetyConfig,
        fences: Arc<dyn FenceOracle>,
        execution: Arc<dyn ExecutionOracle>,
    ) -> SafetyResult<Self> {
        config.validate()?;

        let pool = SafetyNodePool::new(config.node_chunk_size, config.max_node_chunks);
        let warmed = (0..config.prewarm_nodes)
            .map(|_| pool.acquire())
            .collect::<Option<Vec<_>>>()
            .ok_or(SafetyError::PoolExhausted {
                capacity: pool.capacity(),
            })?;
        for id in warmed {
            pool.release(id);
        }

        let slice_handle = SafetyHandle::create(&pool)?;
        let slice_node = slice_handle
            .internal_node(&pool)?
            .ok_or(SafetyError::Corrupted)?;
        slice_node.protect_secondary(WRITE_PROTECT);
        slice_node.set_flag(ALLOW_SECONDARY_WRITING, false);
        let temp_memory_handle = SafetyHandle::create(&pool)?;

        let registry = Arc::new(StaticSafetyIdRegistry::new(&config));
        let names: Arc<dyn NameResolver> = registry.clone();

        tracing::debug!(
            capacity = pool.capacity(),
            prewarmed = config.prewarm_nodes,
            "safety checks ready"
        );

        Ok(Self {
            config,
            pool,
            registry,
            names,
            fences,
            execution,
            slice_handle,
            temp_memory_handle,
            shut_down: AtomicBool::new(false),
        })
    }

    /// Resolves diagnostic names through `names` instead of the registry.
    #[must_use]
    pub fn with_name_resolver(mut self, names: Arc<dyn NameResolver>) -> Self {
        self.names = names;
        self
    }

    /// Returns the active configuration.
    #[inline]
    #[must_use]
    pub fn config(&self) -> &SafetyConfig {
        &self.config
    }

    /// Returns the node pool.
    #[inline]
    #[must_use]
    pub fn pool(&self) -> &SafetyNodePool {
        &self.pool
    }

    /// Returns the name registry.
    #[inline]
    #[must_use]
    pub fn registry(&self) -> &StaticSafetyIdRegistry {
        &self.registry
    }

    /// Fails every lifecycle entry point once [`SafetyChecks::shutdown`] ran.
    fn ensure_running(&self) -> SafetyResult<()> {
        if self.shut_down.load(Ordering::Acquire) {
            Err(SafetyError::NotInitialized)
        } else {
            Ok(())
        }
    }

    fn reporter(&self) -> ErrorReporter<'_> {
        ErrorReporter::new(self.names.as_ref())
    }

    fn node(&self, handle: &SafetyHandle) -> SafetyResult<&SafetyNode> {
        handle.internal_node(&self.pool)?.ok_or(SafetyError::Deallocated)
    }

    /// First half of every recovery path: outside a job, on the owner
    /// thread, with a live node.
    fn begin_recovery(&self, handle: &SafetyHandle, access: Access) -> SafetyResult<&SafetyNode> {
        self.ensure_running()?;
        if self.execution.is_executing_job() {
            return Err(SafetyError::AccessInJob { access });
        }
        let node = self.node(handle)?;
        if self.config.enforce_owner_thread && !self.execution.is_owner_thread() {
            return Err(SafetyError::NotOwnerThread { access });
        }
        Ok(node)
    }

    fn sync(&self, fence: Fence, access: Access, holder: AccessHolder) -> SafetyResult<()> {
        if self.fences.is_complete(fence) {
            return Ok(());
        }
        if !self.config.auto_sync_on_access {
            return Err(SafetyError::OutstandingJob { access, holder });
        }

        tracing::warn!(
            fence = fence.raw(),
            %access,
            "completing an outstanding job before access"
        );
        self.fences.wait_until_complete(fence);
        if self.fences.is_complete(fence) {
            Ok(())
        } else {
            Err(SafetyError::OutstandingJob { access, holder })
        }
    }

    fn sync_readers(&self, readers: &[Fence], access: Access) -> SafetyResult<()> {
        readers
            .iter()
            .try_for_each(|&reader| self.sync(reader, access, AccessHolder::Reader))
    }

    fn flags_of(&self, handle: &SafetyHandle) -> u32 {
        match handle.target() {
            NodeTarget::Unassigned => 0,
            NodeTarget::Direct(id) => self.pool.get(id).map_or(0, SafetyNode::flags),
            NodeTarget::LocalShadow { local, .. } => local.flags,
        }
    }

    fn same_node(a: &SafetyHandle, b: &SafetyHandle) -> bool {
        a.node_id().is_some() && a.node_id() == b.node_id()
    }

    fn sanity_check_for_job(&self, handle: &SafetyHandle, write: bool, job: StaticSafetyId) -> SafetyResult<()> {
        self.ensure_running()?;
        if self.is_temp_memory_handle(handle) {
            return Err(SafetyError::TempMemoryInJob);
        }
        if handle.target() == NodeTarget::Unassigned {
            return Err(SafetyError::NotAllocated);
        }
        if !handle.is_valid(&self.pool) {
            return Err(SafetyError::Deallocated);
        }
        if self.is_temp_unsafe_ptr_slice_handle(handle) {
            return Err(SafetyError::UnsafePtrSliceInJob);
        }
        if write && handle.is_secondary_version() && self.flags_of(handle) & ALLOW_SECONDARY_WRITING == 0 {
            return Err(self.reporter().must_be_marked_read_only(job, handle.static_safety_id()));
        }
        Ok(())
    }

    fn patch(&self, handle: &mut SafetyHandle, mode: PatchMode) -> SafetyResult<()> {
        self.ensure_running()?;
        handle.patch_local(&self.pool, mode)
    }
}

impl SafetyChecks for CheckedSafety {
    fn create(&self) -> SafetyResult<SafetyHandle> {
        self.ensure_running()?;
        SafetyHandle::create(&self.pool)
    }

    fn release(&self, handle: SafetyHandle) -> SafetyResult<()> {
        self.ensure_running()?;
        handle.release(&self.pool)
    }

    fn shutdown(&self) -> usize {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return 0;
        }

        for handle in [self.slice_handle, self.temp_memory_handle] {
            if let Err(error) = handle.release(&self.pool) {
                tracing::warn!(%error, "internal safety handle was already released");
            }
        }

        let leaked = self.pool.live_count();
        let drained = self.pool.drain();
        if leaked > 0 {
            tracing::warn!(leaked, drained, "safety nodes still live at shutdown");
        } else {
            tracing::info!(drained, "safety checks shut down");
        }
        leaked
    }

    fn is_valid(&self, handle: &SafetyHandle) -> bool {
        handle.is_valid(&self.pool)
    }

    fn is_allowed_to_read(&self, handle: &SafetyHandle) -> bool {
        handle.is_allowed_to_read(&self.pool)
    }

    fn is_allowed_to_write(&self, handle: &SafetyHandle) -> bool {
        handle.is_allowed_to_write(&self.pool)
    }

    fn is_allowed_to_dispose(&self, handle: &SafetyHandle) -> bool {
        handle.is_allowed_to_dispose(&self.pool)
    }

    fn check_read_and_throw(&self, handle: &SafetyHandle) -> SafetyResult<()> {
        if handle.is_allowed_to_read(&self.pool) {
            return Ok(());
        }

        let node = self.begin_recovery(handle, Access::Read)?;
        let (writer, _) = node.log().fences();
        self.sync(writer, Access::Read, AccessHolder::Writer)?;

        node.unprotect(READ_PROTECT, true);
        tracing::debug!("read protection lifted");
        Ok(())
    }

    fn check_write_and_throw(&self, handle: &SafetyHandle) -> SafetyResult<()> {
        if handle.is_allowed_to_write(&self.pool) {
            return Ok(());
        }

        let node = self.begin_recovery(handle, Access::Write)?;
        let (writer, readers) = node.log().fences();
        self.sync(writer, Access::Write, AccessHolder::Writer)?;
        self.sync_readers(&readers, Access::Write)?;

        let secondary_writable = node.has_flag(ALLOW_SECONDARY_WRITING);
        if !secondary_writable && handle.is_secondary_version() {
            return Err(SafetyError::WriteToReadOnlyView);
        }

        // The secondary word stays protected unless its view is writable.
        node.unprotect(WRITE_PROTECT, secondary_writable);
        tracing::debug!(secondary_writable, "write protection lifted");
        Ok(())
    }

    fn check_dispose_and_throw(&self, handle: &SafetyHandle) -> SafetyResult<()> {
        if handle.is_allowed_to_dispose(&self.pool) {
            return Ok(());
        }

        let node = self.begin_recovery(handle, Access::Dispose)?;
        let (writer, readers) = node.log().fences();
        self.sync(writer, Access::Dispose, AccessHolder::Writer)?;
        if !node.has_flag(ALLOW_DISPOSE) {
            return Err(SafetyError::DisposeNotAllowed);
        }
        self.sync_readers(&readers, Access::Dispose)?;

        node.unprotect(DISPOSE_PROTECT, true);
        tracing::debug!("dispose protection lifted");
        Ok(())
    }

    fn check_exists_and_throw(&self, handle: &SafetyHandle) -> SafetyResult<()> {
        if handle.is_valid(&self.pool) {
            Ok(())
        } else {
            Err(SafetyError::Deallocated)
        }
    }

    fn check_get_secondary_data_pointer_and_throw(&self, handle: &SafetyHandle) -> SafetyResult<()> {
        if handle.is_allowed_to_read(&self.pool) {
            return Ok(());
        }
        if handle.is_secondary_version() {
            return Err(SafetyError::PrimaryVersionRequired);
        }

        let node = self.begin_recovery(handle, Access::Read)?;
        let writer = node.log().writer;
        // A job scheduled against the fixed view cannot resize the buffer.
        if writer.scheduled_with_secondary || self.fences.is_complete(writer.fence) {
            return Ok(());
        }
        Err(SafetyError::ListWrittenByScheduledJob)
    }

    fn check_write_and_bump_secondary_version(&self, handle: &SafetyHandle) -> SafetyResult<()> {
        if handle.is_secondary_version() {
            return Err(SafetyError::PrimaryVersionRequired);
        }
        if !handle.is_allowed_to_write(&self.pool) {
            self.check_write_and_throw(handle)?;
        }
        self.node(handle)?.bump_secondary();
        Ok(())
    }

    fn enforce_all_buffer_jobs_have_completed(&self, handle: &SafetyHandle) -> SafetyResult<EnforceJobResult> {
        self.ensure_running()?;
        let Some(node) = handle.internal_node(&self.pool)? else {
            return Ok(EnforceJobResult::HandleWasAlreadyDeallocated);
        };

        let (writer, readers) = node.log().fences();
        let mut result = EnforceJobResult::AllJobsAlreadySynced;
        for fence in std::iter::once(writer).chain(readers) {
            if !self.fences.is_complete(fence) {
                result = EnforceJobResult::DidSyncRunningJobs;
                self.fences.wait_until_complete(fence);
            }
        }
        Ok(result)
    }

    fn enforce_all_buffer_jobs_have_completed_and_release(
        &self,
        handle: &SafetyHandle,
    ) -> SafetyResult<EnforceJobResult> {
        self.ensure_running()?;
        let result = if handle.is_allowed_to_dispose(&self.pool) {
            EnforceJobResult::AllJobsAlreadySynced
        } else {
            self.enforce_all_buffer_jobs_have_completed(handle)?
        };

        if result != EnforceJobResult::HandleWasAlreadyDeallocated {
            handle.release(&self.pool)?;
        }
        Ok(result)
    }

    fn enforce_all_buffer_jobs_have_completed_and_disable_read_write(
        &self,
        handle: &SafetyHandle,
    ) -> SafetyResult<EnforceJobResult> {
        self.ensure_running()?;
        let result = if handle.is_allowed_to_dispose(&self.pool) {
            EnforceJobResult::AllJobsAlreadySynced
        } else {
            self.enforce_all_buffer_jobs_have_completed(handle)?
        };

        if result != EnforceJobResult::HandleWasAlreadyDeallocated {
            self.node(handle)?.protect(READ_WRITE_PROTECT);
        }
        Ok(result)
    }

    fn use_secondary_version(&self, handle: &mut SafetyHandle) -> SafetyResult<()> {
        self.ensure_running()?;
        handle.use_secondary_version(&self.pool)
    }

    fn set_allow_secondary_version_writing(&self, handle: &SafetyHandle, allow: bool) -> SafetyResult<()> {
        self.ensure_running()?;
        let node = self.node(handle)?;
        node.protect_secondary(WRITE_PROTECT);
        node.set_flag(ALLOW_SECONDARY_WRITING, allow);
        Ok(())
    }

    fn set_bump_secondary_version_on_schedule_write(&self, handle: &SafetyHandle, bump: bool) -> SafetyResult<()> {
        self.ensure_running()?;
        self.node(handle)?
            .set_flag(BUMP_SECONDARY_VERSION_ON_SCHEDULE_WRITE, bump);
        Ok(())
    }

    fn patch_local_read_only(&self, handle: &mut SafetyHandle) -> SafetyResult<()> {
        self.patch(handle, PatchMode::ReadOnly)
    }

    fn patch_local_write_only(&self, handle: &mut SafetyHandle) -> SafetyResult<()> {
        self.patch(handle, PatchMode::WriteOnly)
    }

    fn patch_local_read_write(&self, handle: &mut SafetyHandle) -> SafetyResult<()> {
        self.patch(handle, PatchMode::ReadWrite)
    }

    fn release_patched(&self, mut handle: SafetyHandle) -> SafetyResult<()> {
        self.ensure_running()?;
        handle.unpatch();
        handle.release(&self.pool)
    }

    fn temp_unsafe_ptr_slice_handle(&self) -> SafetyHandle {
        self.slice_handle
    }

    fn is_temp_unsafe_ptr_slice_handle(&self, handle: &SafetyHandle) -> bool {
        Self::same_node(handle, &self.slice_handle)
    }

    fn temp_memory_handle(&self) -> SafetyHandle {
        self.temp_memory_handle
    }

    fn is_temp_memory_handle(&self, handle: &SafetyHandle) -> bool {
        Self::same_node(handle, &self.temp_memory_handle)
    }

    fn new_static_safety_id(&self, name: &[u8]) -> StaticSafetyId {
        self.registry.get_or_create(name)
    }

    fn static_safety_id_name(&self, id: StaticSafetyId) -> Option<String> {
        self.registry
            .name_of(id)
            .map(|name| String::from_utf8_lossy(name).into_owned())
    }

    fn writer(&self, handle: &SafetyHandle) -> SafetyResult<Fence> {
        Ok(handle
            .internal_node(&self.pool)?
            .map_or(Fence::NONE, |node| node.log().writer.fence))
    }

    fn readers(&self, handle: &SafetyHandle) -> SafetyResult<Vec<Fence>> {
        Ok(handle
            .internal_node(&self.pool)?
            .map(|node| node.log().fences().1)
            .unwrap_or_default())
    }

    fn reader_count(&self, handle: &SafetyHandle) -> SafetyResult<usize> {
        Ok(handle
            .internal_node(&self.pool)?
            .map_or(0, |node| node.log().readers.len()))
    }

    fn writer_name(&self, handle: &SafetyHandle) -> SafetyResult<Option<String>> {
        let Some(node) = handle.internal_node(&self.pool)? else {
            return Ok(None);
        };
        let writer = node.log().writer;
        Ok((!writer.fence.is_none()).then(|| self.names.resolve(writer.job)))
    }

    fn reader_name(&self, handle: &SafetyHandle, index: usize) -> SafetyResult<Option<String>> {
        let Some(node) = handle.internal_node(&self.pool)? else {
            return Ok(None);
        };
        let job = node.log().readers.get(index).map(|reader| reader.job);
        Ok(job.map(|job| self.names.resolve(job)))
    }

    fn record_read_only(
        &self,
        validator: &mut DependencyValidator,
        handle: &mut SafetyHandle,
        field: StaticSafetyId,
        job: StaticSafetyId,
    ) -> SafetyResult<()> {
        handle.set_static_safety_id(field);
        self.sanity_check_for_job(handle, false, job)?;
        validator.push_read_only(*handle);
        Ok(())
    }

    fn record_writable(
        &self,
        validator: &mut DependencyValidator,
        handle: &mut SafetyHandle,
        field: StaticSafetyId,
        job: StaticSafetyId,
    ) -> SafetyResult<()> {
        handle.set_static_safety_id(field);
        self.sanity_check_for_job(handle, true, job)?;
        validator.push_writable(*handle);
        Ok(())
    }

    fn record_deallocate(&self, validator: &mut DependencyValidator, handle: &SafetyHandle) {
        validator.push_deallocate(handle.node_id());
    }

    fn validate_schedule(
        &self,
        validator: &DependencyValidator,
        dependency: Fence,
        job: StaticSafetyId,
    ) -> SafetyResult<()> {
        self.ensure_running()?;
        validator.validate_schedule(&self.pool, self.fences.as_ref(), &self.reporter(), dependency, job)
    }

    fn validate_deferred(&self, validator: &DependencyValidator, deferred: Option<&SafetyHandle>) -> SafetyResult<()> {
        validator.validate_deferred(deferred)
    }

    fn validate_deallocate_on_job_completion(&self, allocator: Allocator) -> SafetyResult<()> {
        if allocator.can_deallocate_on_job_completion() {
            Ok(())
        } else {
            Err(SafetyError::DisallowedAllocator { allocator })
        }
    }

    fn update_dependencies(
        &self,
        validator: &DependencyValidator,
        scheduled: Fence,
        job: StaticSafetyId,
    ) -> SafetyResult<()> {
        self.ensure_running()?;
        validator.update_dependencies(&self.pool, self.fences.as_ref(), scheduled, job)
    }
}

/// The stub build: every check passes and nothing is tracked.
///
/// Handles it hands out are default values. Violations go undetected.
#[derive(Clone, Copy, Debug, Default)]
pub struct UncheckedSafety;

impl UncheckedSafety {
    /// Creates the stub. Takes the same arguments as [`CheckedSafety::new`].
    ///
    /// # Errors
    ///
    /// Returns `Config` for an invalid configuration.
    pub fn new(
        config: SafetyConfig,
        _fences: Arc<dyn FenceOracle>,
        _execution: Arc<dyn ExecutionOracle>,
    ) -> SafetyResult<Self> {
        config.validate()?;
        Ok(Self)
    }
}

#[allow(clippy::inline_always)]
impl SafetyChecks for UncheckedSafety {
    #[inline(always)]
    fn create(&self) -> SafetyResult<SafetyHandle> {
        Ok(SafetyHandle::default())
    }

    #[inline(always)]
    fn release(&self, _handle: SafetyHandle) -> SafetyResult<()> {
        Ok(())
    }

    fn shutdown(&self) -> usize {
        0
    }

    #[inline(always)]
    fn is_valid(&self, _handle: &SafetyHandle) -> bool {
        true
    }

    #[inline(always)]
    fn is_allowed_to_read(&self, _handle: &SafetyHandle) -> bool {
        true
    }

    #[inline(always)]
    fn is_allowed_to_write(&self, _handle: &SafetyHandle) -> bool {
        true
    }

    #[inline(always)]
    fn is_allowed_to_dispose(&self, _handle: &SafetyHandle) -> bool {
        true
    }

    #[inline(always)]
    fn check_read_and_throw(&self, _handle: &SafetyHandle) -> SafetyResult<()> {
        Ok(())
    }

    #[inline(always)]
    fn check_write_and_throw(&self, _handle: &SafetyHandle) -> SafetyResult<()> {
        Ok(())
    }

    #[inline(always)]
    fn check_dispose_and_throw(&self, _handle: &SafetyHandle) -> SafetyResult<()> {
        Ok(())
    }

    #[inline(always)]
    fn check_exists_and_throw(&self, _handle: &SafetyHandle) -> SafetyResult<()> {
        Ok(())
    }

    #[inline(always)]
    fn check_get_secondary_data_pointer_and_throw(&self, _handle: &SafetyHandle) -> SafetyResult<()> {
        Ok(())
    }

    #[inline(always)]
    fn check_write_and_bump_secondary_version(&self, _handle: &SafetyHandle) -> SafetyResult<()> {
        Ok(())
    }

    fn enforce_all_buffer_jobs_have_completed(&self, _handle: &SafetyHandle) -> SafetyResult<EnforceJobResult> {
        Ok(EnforceJobResult::AllJobsAlreadySynced)
    }

    fn enforce_all_buffer_jobs_have_completed_and_release(
        &self,
        _handle: &SafetyHandle,
    ) -> SafetyResult<EnforceJobResult> {
        Ok(EnforceJobResult::AllJobsAlreadySynced)
    }

    fn enforce_all_buffer_jobs_have_completed_and_disable_read_write(
        &self,
        _handle: &SafetyHandle,
    ) -> SafetyResult<EnforceJobResult> {
        Ok(EnforceJobResult::AllJobsAlreadySynced)
    }

    #[inline(always)]
    fn use_secondary_version(&self, _handle: &mut SafetyHandle) -> SafetyResult<()> {
        Ok(())
    }

    #[inline(always)]
    fn set_allow_secondary_version_writing(&self, _handle: &SafetyHandle, _allow: bool) -> SafetyResult<()> {
        Ok(())
    }

    #[inline(always)]
    fn set_bump_secondary_version_on_schedule_write(&self, _handle: &SafetyHandle, _bump: bool) -> SafetyResult<()> {
        Ok(())
    }

    #[inline(always)]
    fn patch_local_read_only(&self, _handle: &mut SafetyHandle) -> SafetyResult<()> {
        Ok(())
    }

    #[inline(always)]
    fn patch_local_write_only(&self, _handle: &mut SafetyHandle) -> SafetyResult<()> {
        Ok(())
    }

    #[inline(always)]
    fn patch_local_read_write(&self, _handle: &mut SafetyHandle) -> SafetyResult<()> {
        Ok(())
    }

    #[inline(always)]
    fn release_patched(&self, _handle: SafetyHandle) -> SafetyResult<()> {
        Ok(())
    }

    #[inline(always)]
    fn temp_unsafe_ptr_slice_handle(&self) -> SafetyHandle {
        SafetyHandle::default()
    }

    #[inline(always)]
    fn is_temp_unsafe_ptr_slice_handle(&self, _handle: &SafetyHandle) -> bool {
        false
    }

    #[inline(always)]
    fn temp_memory_handle(&self) -> SafetyHandle {
        SafetyHandle::default()
    }

    #[inline(always)]
    fn is_temp_memory_handle(&self, _handle: &SafetyHandle) -> bool {
        false
    }

    #[inline(always)]
    fn new_static_safety_id(&self, _name: &[u8]) -> StaticSafetyId {
        StaticSafetyId::UNKNOWN
    }

    fn static_safety_id_name(&self, _id: StaticSafetyId) -> Option<String> {
        None
    }

    fn writer(&self, _handle: &SafetyHandle) -> SafetyResult<Fence> {
        Ok(Fence::NONE)
    }

    fn readers(&self, _handle: &SafetyHandle) -> SafetyResult<Vec<Fence>> {
        Ok(Vec::new())
    }

    fn writer_name(&self, _handle: &SafetyHandle) -> SafetyResult<Option<String>> {
        Ok(None)
    }

    fn reader_name(&self, _handle: &SafetyHandle, _index: usize) -> SafetyResult<Option<String>> {
        Ok(None)
    }

    #[inline(always)]
    fn record_read_only(
        &self,
        _validator: &mut DependencyValidator,
        _handle: &mut SafetyHandle,
        _field: StaticSafetyId,
        _job: StaticSafetyId,
    ) -> SafetyResult<()> {
        Ok(())
    }

    #[inline(always)]
    fn record_writable(
        &self,
        _validator: &mut DependencyValidator,
        _handle: &mut SafetyHandle,
        _field: StaticSafetyId,
        _job: StaticSafetyId,
    ) -> SafetyResult<()> {
        Ok(())
    }

    #[inline(always)]
    fn record_deallocate(&self, _validator: &mut DependencyValidator, _handle: &SafetyHandle) {}

    #[inline(always)]
    fn validate_schedule(
        &self,
        _validator: &DependencyValidator,
        _dependency: Fence,
        _job: StaticSafetyId,
    ) -> SafetyResult<()> {
        Ok(())
    }

    #[inline(always)]
    fn validate_deferred(&self, _validator: &DependencyValidator, _deferred: Option<&SafetyHandle>) -> SafetyResult<()> {
        Ok(())
    }

    #[inline(always)]
    fn validate_deallocate_on_job_completion(&self, _allocator: Allocator) -> SafetyResult<()> {
        Ok(())
    }

    #[inline(always)]
    fn update_dependencies(
        &self,
        _validator: &DependencyValidator,
        _scheduled: Fence,
        _job: StaticSafetyId,
    ) -> SafetyResult<()> {
        Ok(())
    }
}

/// The implementation selected by the `collections-checks` feature.
#[cfg(feature = "collections-checks")]
pub type ActiveSafety = CheckedSafety;

/// The implementation selected by the `collections-checks` feature.
#[cfg(not(feature = "collections-checks"))]
pub type ActiveSafety = UncheckedSafety;
