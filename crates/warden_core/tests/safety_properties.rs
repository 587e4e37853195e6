//! # Safety Property Tests
//!
//! End-to-end checks of the guarantees the checked build makes:
//!
//! 1. **Generations**: a released handle never validates again, even when its
//!    node is reused
//! 2. **Scheduling**: unsynced conflicts and aliasing are rejected, declared
//!    dependencies are accepted
//! 3. **Secondary views**: read-only views stay read-only
//! 4. **Bookkeeping**: reader logs stay bounded, disposal drains every job
//!
//! Run with: cargo test --test safety_properties

use std::sync::Arc;

use warden_core::jobs::{Fence, FenceGraph, FenceOracle, ThreadContext};
use warden_core::{
    AliasKind, CheckedSafety, DependencyValidator, EnforceJobResult, ErrorKind, SafetyChecks, SafetyConfig,
    SafetyError, SafetyHandle, ScheduleConflict, StaticSafetyId,
};

fn setup() -> (CheckedSafety, Arc<FenceGraph>) {
    let graph = Arc::new(FenceGraph::new());
    let safety = CheckedSafety::new(SafetyConfig::default(), graph.clone(), Arc::new(ThreadContext::current()))
        .expect("default config is valid");
    (safety, graph)
}

/// Access set of one job under construction.
struct JobBuilder<'a> {
    safety: &'a CheckedSafety,
    validator: DependencyValidator,
    job: StaticSafetyId,
}

impl<'a> JobBuilder<'a> {
    fn new(safety: &'a CheckedSafety, name: &str) -> Self {
        Self {
            safety,
            validator: DependencyValidator::new(),
            job: safety.new_static_safety_id(name.as_bytes()),
        }
    }

    fn reads(mut self, handle: &mut SafetyHandle, field: &str) -> Self {
        let field = self.safety.new_static_safety_id(field.as_bytes());
        self.safety
            .record_read_only(&mut self.validator, handle, field, self.job)
            .unwrap();
        self
    }

    fn writes(mut self, handle: &mut SafetyHandle, field: &str) -> Self {
        let field = self.safety.new_static_safety_id(field.as_bytes());
        self.safety
            .record_writable(&mut self.validator, handle, field, self.job)
            .unwrap();
        self
    }

    fn validate(&self, dependency: Fence) -> Result<(), SafetyError> {
        self.safety.validate_schedule(&self.validator, dependency, self.job)
    }

    /// Validates, then records the job on every buffer under a new fence.
    fn schedule(&self, graph: &FenceGraph, dependency: Fence) -> Result<Fence, SafetyError> {
        self.validate(dependency)?;
        let fence = graph.schedule(&[dependency]);
        self.safety.update_dependencies(&self.validator, fence, self.job)?;
        Ok(fence)
    }
}

// ============================================================================
// GENERATIONS
// ============================================================================

#[test]
fn released_handle_stays_invalid_after_node_reuse() {
    let (safety, _graph) = setup();

    for _ in 0..1_000 {
        let old = safety.create().unwrap();
        safety.release(old).unwrap();
        assert!(!safety.is_valid(&old));

        let new = safety.create().unwrap();
        assert_eq!(new.node_id(), old.node_id(), "the pool reuses the freed node");
        assert!(safety.is_valid(&new));
        assert!(!safety.is_valid(&old));
        safety.release(new).unwrap();
    }
}

#[test]
fn fresh_handle_has_every_permission() {
    let (safety, _graph) = setup();
    let handles: Vec<SafetyHandle> = (0..64).map(|_| safety.create().unwrap()).collect();

    for handle in &handles {
        assert!(safety.is_allowed_to_read(handle));
        assert!(safety.is_allowed_to_write(handle));
        assert!(safety.is_allowed_to_dispose(handle));
    }
}

#[test]
fn create_write_release() {
    let (safety, _graph) = setup();
    let h = safety.create().unwrap();
    assert!(safety.is_allowed_to_write(&h));
    safety.release(h).unwrap();
    assert!(!safety.is_valid(&h));

    let err = safety.check_read_and_throw(&h).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UseAfterRelease);
}

// ============================================================================
// SCHEDULING
// ============================================================================

#[test]
fn writer_must_depend_on_unsynced_reader() {
    let (safety, graph) = setup();
    let mut h = safety.create().unwrap();

    let a = JobBuilder::new(&safety, "ReadJob")
        .reads(&mut h, "ReadJob.input")
        .schedule(&graph, Fence::NONE)
        .unwrap();

    let b = JobBuilder::new(&safety, "WriteJob").writes(&mut h, "WriteJob.output");
    let err = b.validate(Fence::NONE).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConcurrentAccessViolation);
    assert!(matches!(
        err,
        SafetyError::ScheduleConflict {
            conflict: ScheduleConflict::WriteAgainstRead,
            ..
        }
    ));
    assert!(err.to_string().contains("the previously scheduled job ReadJob reads from"));

    b.validate(a).unwrap();
}

#[test]
fn second_writer_must_depend_on_first() {
    let (safety, graph) = setup();
    let mut h = safety.create().unwrap();

    let x = JobBuilder::new(&safety, "X")
        .writes(&mut h, "X.data")
        .schedule(&graph, Fence::NONE)
        .unwrap();

    let y = JobBuilder::new(&safety, "Y").writes(&mut h, "Y.data");
    assert!(matches!(
        y.validate(Fence::NONE),
        Err(SafetyError::ScheduleConflict {
            conflict: ScheduleConflict::WriteAgainstWrite,
            ..
        })
    ));
    let y_fence = y.schedule(&graph, x).unwrap();
    assert_eq!(safety.writer(&h), Ok(y_fence));
    assert_eq!(safety.writer_name(&h), Ok(Some("Y".to_owned())));
}

#[test]
fn transitive_dependency_covers_writer() {
    let (safety, graph) = setup();
    let mut h = safety.create().unwrap();

    let x = JobBuilder::new(&safety, "X")
        .writes(&mut h, "X.data")
        .schedule(&graph, Fence::NONE)
        .unwrap();
    let unrelated = graph.schedule(&[]);
    let combined = graph.combine(&[x, unrelated]);

    JobBuilder::new(&safety, "Y")
        .reads(&mut h, "Y.data")
        .validate(combined)
        .unwrap();
}

#[test]
fn synced_writer_needs_no_dependency() {
    let (safety, graph) = setup();
    let mut h = safety.create().unwrap();

    let x = JobBuilder::new(&safety, "X")
        .writes(&mut h, "X.data")
        .schedule(&graph, Fence::NONE)
        .unwrap();
    graph.complete(x);

    JobBuilder::new(&safety, "Y")
        .writes(&mut h, "Y.data")
        .validate(Fence::NONE)
        .unwrap();
}

#[test]
fn aliasing_rejected_regardless_of_dependencies() {
    let (safety, graph) = setup();
    let mut h = safety.create().unwrap();
    let mut alias = h;

    let job = JobBuilder::new(&safety, "AliasJob")
        .reads(&mut h, "AliasJob.src")
        .writes(&mut alias, "AliasJob.dst");

    for dependency in [Fence::NONE, graph.schedule(&[])] {
        let err = job.validate(dependency).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AliasingViolation);
        assert!(matches!(
            err,
            SafetyError::Aliasing {
                alias: AliasKind::ReadAndWrite,
                ..
            }
        ));
    }
}

#[test]
fn deferred_list_must_be_a_recorded_buffer() {
    let (safety, _graph) = setup();
    let mut counts = safety.create().unwrap();
    let job = JobBuilder::new(&safety, "SpawnJob").reads(&mut counts, "SpawnJob.counts");
    safety.validate_deferred(&job.validator, Some(&counts)).unwrap();

    // Unassigned handles never match each other, even when one was recorded.
    let mut validator = DependencyValidator::new();
    safety.record_deallocate(&mut validator, &SafetyHandle::default());
    assert_eq!(
        safety.validate_deferred(&validator, Some(&SafetyHandle::default())),
        Err(SafetyError::DeferredListNotInJob)
    );
}

#[test]
fn deallocation_waits_for_readers() {
    let (safety, graph) = setup();
    let mut h = safety.create().unwrap();

    let a = JobBuilder::new(&safety, "ReadJob")
        .reads(&mut h, "ReadJob.input")
        .schedule(&graph, Fence::NONE)
        .unwrap();

    let mut free = JobBuilder::new(&safety, "FreeJob");
    safety.record_deallocate(&mut free.validator, &h);
    assert!(matches!(
        free.validate(Fence::NONE),
        Err(SafetyError::ScheduleConflict {
            conflict: ScheduleConflict::DeallocateAgainstRead,
            ..
        })
    ));
    free.validate(a).unwrap();
}

// ============================================================================
// SECONDARY VIEWS
// ============================================================================

#[test]
fn read_only_secondary_view_never_recovers() {
    let (safety, graph) = setup();
    let primary = safety.create().unwrap();
    safety.set_allow_secondary_version_writing(&primary, false).unwrap();

    let mut view = primary;
    safety.use_secondary_version(&mut view).unwrap();
    assert!(safety.is_allowed_to_read(&view));

    assert_eq!(safety.check_write_and_throw(&view), Err(SafetyError::WriteToReadOnlyView));

    // Outstanding work drained, still refused.
    let mut writer = primary;
    JobBuilder::new(&safety, "Fill")
        .writes(&mut writer, "Fill.out")
        .schedule(&graph, Fence::NONE)
        .unwrap();
    safety.enforce_all_buffer_jobs_have_completed(&primary).unwrap();
    assert_eq!(safety.check_write_and_throw(&view), Err(SafetyError::WriteToReadOnlyView));
    assert_eq!(safety.check_write_and_throw(&view), Err(SafetyError::WriteToReadOnlyView));

    // The primary version is unaffected.
    safety.check_write_and_throw(&primary).unwrap();
}

#[test]
fn second_switch_to_secondary_fails() {
    let (safety, _graph) = setup();
    let mut h = safety.create().unwrap();

    safety.use_secondary_version(&mut h).unwrap();
    let err = safety.use_secondary_version(&mut h).unwrap_err();
    assert_eq!(err, SafetyError::AlreadySecondaryVersion);
    assert_eq!(err.to_string(), "already using secondary version");
}

#[test]
fn resize_invalidates_array_views() {
    let (safety, _graph) = setup();
    let list = safety.create().unwrap();
    let mut array = list;
    safety.use_secondary_version(&mut array).unwrap();
    assert!(safety.is_valid(&array));

    safety.check_write_and_bump_secondary_version(&list).unwrap();
    assert!(!safety.is_valid(&array));
    assert_eq!(safety.check_exists_and_throw(&array), Err(SafetyError::Deallocated));
    safety.check_exists_and_throw(&list).unwrap();
}

#[test]
fn scheduled_write_bumps_secondary_when_enabled() {
    let (safety, graph) = setup();
    let mut list = safety.create().unwrap();
    safety.set_bump_secondary_version_on_schedule_write(&list, true).unwrap();
    let mut array = list;
    safety.use_secondary_version(&mut array).unwrap();

    JobBuilder::new(&safety, "Grow")
        .writes(&mut list, "Grow.list")
        .schedule(&graph, Fence::NONE)
        .unwrap();
    assert!(safety.is_valid(&list));
    assert!(!safety.is_valid(&array));
}

// ============================================================================
// BOOKKEEPING
// ============================================================================

#[test]
fn reader_log_stays_bounded() {
    let (safety, graph) = setup();
    let mut h = safety.create().unwrap();

    for _ in 0..5_000 {
        let fence = JobBuilder::new(&safety, "Sample")
            .reads(&mut h, "Sample.src")
            .schedule(&graph, Fence::NONE)
            .unwrap();
        graph.complete(fence);
        assert!(safety.reader_count(&h).unwrap() <= 1);
    }
    assert_eq!(graph.outstanding(), 0);
}

#[test]
fn release_drains_outstanding_reader() {
    let (safety, graph) = setup();
    let mut h = safety.create().unwrap();

    let a = JobBuilder::new(&safety, "ReadJob")
        .reads(&mut h, "ReadJob.input")
        .schedule(&graph, Fence::NONE)
        .unwrap();
    assert!(!graph.is_complete(a));

    let result = safety.enforce_all_buffer_jobs_have_completed_and_release(&h);
    assert_eq!(result, Ok(EnforceJobResult::DidSyncRunningJobs));
    assert!(graph.is_complete(a));
    assert!(!safety.is_valid(&h));

    assert_eq!(
        safety.enforce_all_buffer_jobs_have_completed_and_release(&h),
        Ok(EnforceJobResult::HandleWasAlreadyDeallocated)
    );
}

#[test]
fn shutdown_counts_leaked_nodes() {
    let (safety, _graph) = setup();
    let _leaked: Vec<SafetyHandle> = (0..3).map(|_| safety.create().unwrap()).collect();
    let freed = safety.create().unwrap();
    safety.release(freed).unwrap();

    assert_eq!(safety.shutdown(), 3);
}

#[test]
fn shut_down_instance_refuses_new_handles() {
    let (safety, _graph) = setup();
    let survivor = safety.create().unwrap();
    assert_eq!(safety.shutdown(), 1);

    assert_eq!(safety.create(), Err(SafetyError::NotInitialized));
    assert_eq!(safety.release(survivor), Err(SafetyError::NotInitialized));
    assert_eq!(safety.create().unwrap_err().kind(), ErrorKind::Lifecycle);
}
