//! # Fence Graph
//!
//! In-process ledger of scheduled jobs, their dependencies and their
//! completion. It is the reference [`FenceOracle`] used by the worker pool and
//! the tests; a host engine with its own scheduler plugs in its own oracle.
//!
//! ## Lifecycle of a fence
//!
//! ```text
//! schedule ──► Pending ──claim──► Running ──finish──► (dropped)
//!                 │                                       ▲
//!                 └──── wait_until_complete runs inline ──┘
//! ```
//!
//! Waiting on a fence nobody has claimed yet runs it (and its dependencies)
//! on the waiting thread, the way `Complete()` drains unscheduled work.
//! Finished fences leave the ledger, so its size tracks the work in flight
//! rather than the work ever scheduled.

use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};

use parking_lot::{Condvar, Mutex, MutexGuard};

use super::fence::{Fence, FenceOracle};
use super::worker::JobScope;

/// A unit of work attached to a fence.
pub type JobBody = Box<dyn FnOnce() + Send + 'static>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FenceState {
    Pending,
    Running,
}

struct FenceRecord {
    dependencies: Vec<Fence>,
    state: FenceState,
    body: Option<JobBody>,
}

struct GraphState {
    next: u64,
    /// Pending and running fences. Any other fence counts as complete.
    records: HashMap<Fence, FenceRecord>,
    /// Scratch for dependency walks; only touched under the lock.
    visited: HashSet<Fence>,
    walk: Vec<Fence>,
}

/// One entry of the explicit stack `drive` works through.
enum Step {
    /// Make sure the fence is complete, claiming it if still pending.
    Wait(Fence),
    /// Run a claimed fence whose dependencies are complete.
    Run(Fence, Option<JobBody>),
}

/// Dependency DAG of scheduled jobs.
///
/// # Thread Safety
///
/// All state sits behind one mutex. Threads waiting on a running fence park
/// on a condition variable that every `finish` signals.
pub struct FenceGraph {
    state: Mutex<GraphState>,
    finished: Condvar,
}

impl Default for FenceGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl FenceGraph {
    /// Creates an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GraphState {
                next: 1,
                records: HashMap::new(),
                visited: HashSet::new(),
                walk: Vec::new(),
            }),
            finished: Condvar::new(),
        }
    }

    /// Schedules a job with no body that finishes after `dependencies`.
    pub fn schedule(&self, dependencies: &[Fence]) -> Fence {
        self.insert(dependencies, None)
    }

    /// Schedules `body` to run after `dependencies`.
    pub fn schedule_with<F>(&self, dependencies: &[Fence], body: F) -> Fence
    where
        F: FnOnce() + Send + 'static,
    {
        self.insert(dependencies, Some(Box::new(body)))
    }

    /// Returns a fence that completes once every fence in `dependencies` has.
    pub fn combine(&self, dependencies: &[Fence]) -> Fence {
        self.insert(dependencies, None)
    }

    /// Completes `fence`, running it inline if nobody has claimed it.
    pub fn complete(&self, fence: Fence) {
        self.wait_until_complete(fence);
    }

    /// Returns the number of fences not yet complete.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.state.lock().records.len()
    }

    /// Runs `fence` on the calling thread if nobody has claimed it yet.
    ///
    /// # Returns
    ///
    /// True if this call ran the job.
    pub fn run(&self, fence: Fence) -> bool {
        let mut state = self.state.lock();
        let mut steps = Vec::new();
        if !claim(&mut state, fence, &mut steps) {
            return false;
        }
        self.drive(state, steps);
        true
    }

    fn insert(&self, dependencies: &[Fence], body: Option<JobBody>) -> Fence {
        let mut state = self.state.lock();
        let fence = Fence::from_raw(state.next);
        state.next += 1;
        // Dependencies already finished have nothing left to order against.
        let dependencies = dependencies
            .iter()
            .copied()
            .filter(|d| state.records.contains_key(d))
            .collect();
        state.records.insert(
            fence,
            FenceRecord {
                dependencies,
                state: FenceState::Pending,
                body,
            },
        );
        fence
    }

    /// Works through `steps` until every fence on it is complete.
    ///
    /// Dependency chains are walked on the heap, so their depth is not
    /// bounded by the calling thread's stack.
    fn drive(&self, mut state: MutexGuard<'_, GraphState>, mut steps: Vec<Step>) {
        while let Some(step) = steps.pop() {
            match step {
                Step::Wait(fence) => match state.records.get(&fence).map(|record| record.state) {
                    None => {}
                    Some(FenceState::Running) => {
                        self.finished.wait(&mut state);
                        steps.push(Step::Wait(fence));
                    }
                    Some(FenceState::Pending) => {
                        claim(&mut state, fence, &mut steps);
                    }
                },
                Step::Run(fence, body) => {
                    if let Some(body) = body {
                        MutexGuard::unlocked(&mut state, || execute(fence, body));
                    }
                    state.records.remove(&fence);
                    self.finished.notify_all();
                }
            }
        }
    }
}

/// Marks a pending fence running and queues it behind its dependencies.
fn claim(state: &mut GraphState, fence: Fence, steps: &mut Vec<Step>) -> bool {
    match state.records.get_mut(&fence) {
        Some(record) if record.state == FenceState::Pending => {
            record.state = FenceState::Running;
            steps.push(Step::Run(fence, record.body.take()));
            steps.extend(record.dependencies.iter().map(|&dependency| Step::Wait(dependency)));
            true
        }
        _ => false,
    }
}

fn execute(fence: Fence, body: JobBody) {
    let _scope = JobScope::enter();
    if catch_unwind(AssertUnwindSafe(body)).is_err() {
        tracing::error!(fence = fence.raw(), "job panicked; fence completed anyway");
    }
}

impl FenceOracle for FenceGraph {
    fn is_complete(&self, fence: Fence) -> bool {
        fence.is_none() || !self.state.lock().records.contains_key(&fence)
    }

    fn wait_until_complete(&self, fence: Fence) {
        if fence.is_none() {
            return;
        }
        let state = self.state.lock();
        self.drive(state, vec![Step::Wait(fence)]);
    }

    fn is_dependency_or_already_synced(&self, fence: Fence, dependency: Fence) -> bool {
        if fence.is_none() || fence == dependency {
            return true;
        }

        let mut state = self.state.lock();
        let GraphState {
            records, visited, walk, ..
        } = &mut *state;
        if !records.contains_key(&fence) {
            return true;
        }

        visited.clear();
        walk.clear();
        walk.push(dependency);
        while let Some(current) = walk.pop() {
            if current == fence {
                return true;
            }
            // Finished fences are gone and cannot lead to an unfinished one.
            let Some(record) = records.get(&current) else {
                continue;
            };
            if visited.insert(current) {
                walk.extend(record.dependencies.iter().copied());
            }
        }
        false
    }
}
