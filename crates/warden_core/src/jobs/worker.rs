//! # Worker Pool
//!
//! A small set of threads that run jobs scheduled on a [`FenceGraph`], plus
//! the thread bookkeeping the safety checks need: which thread owns the
//! handles, and whether the caller is currently inside a job.

use std::cell::Cell;
use std::sync::Arc;
use std::thread::{JoinHandle, ThreadId};

use crossbeam_channel::{Receiver, Sender};

use super::fence::{ExecutionOracle, Fence};
use super::graph::FenceGraph;

thread_local! {
    static JOB_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// Returns true if the calling thread is running a job body.
#[inline]
#[must_use]
pub fn is_executing_job() -> bool {
    JOB_DEPTH.with(|depth| depth.get() > 0)
}

/// Marks the calling thread as running a job until dropped.
///
/// Scopes nest: a job that completes another job inline stays "in a job"
/// after the inner one returns.
pub struct JobScope {
    _not_send: std::marker::PhantomData<*const ()>,
}

impl JobScope {
    /// Enters a job on the calling thread.
    #[must_use]
    pub fn enter() -> Self {
        JOB_DEPTH.with(|depth| depth.set(depth.get() + 1));
        Self {
            _not_send: std::marker::PhantomData,
        }
    }
}

impl Drop for JobScope {
    fn drop(&mut self) {
        JOB_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

/// Execution oracle bound to the thread that owns the safety handles.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ThreadContext {
    owner: ThreadId,
}

impl ThreadContext {
    /// Makes the calling thread the owner thread.
    #[must_use]
    pub fn current() -> Self {
        Self {
            owner: std::thread::current().id(),
        }
    }

    /// Returns the owner thread's id.
    #[inline]
    #[must_use]
    pub fn owner(&self) -> ThreadId {
        self.owner
    }
}

impl ExecutionOracle for ThreadContext {
    fn is_executing_job(&self) -> bool {
        is_executing_job()
    }

    fn is_owner_thread(&self) -> bool {
        std::thread::current().id() == self.owner
    }
}

/// Threads that run jobs scheduled through [`WorkerPool::schedule`].
///
/// ## Usage
///
/// ```rust,ignore
/// let graph = Arc::new(FenceGraph::new());
/// let workers = WorkerPool::new(4, Arc::clone(&graph));
///
/// let fence = workers.schedule(&[], || println!("on a worker"));
/// graph.wait_until_complete(fence);
/// ```
///
/// Work that a worker has not picked up yet can still be completed inline by
/// whoever waits on its fence first.
pub struct WorkerPool {
    graph: Arc<FenceGraph>,
    sender: Option<Sender<Fence>>,
    threads: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `threads` workers pulling from `graph`.
    ///
    /// # Panics
    ///
    /// Panics if `threads` is zero or a thread cannot be spawned.
    #[must_use]
    pub fn new(threads: usize, graph: Arc<FenceGraph>) -> Self {
        assert!(threads > 0, "Worker count must be greater than zero");

        let (sender, receiver) = crossbeam_channel::unbounded::<Fence>();
        let threads: Vec<JoinHandle<()>> = (0..threads)
            .map(|index| {
                let graph = Arc::clone(&graph);
                let receiver = receiver.clone();
                std::thread::Builder::new()
                    .name(format!("warden-worker-{index}"))
                    .spawn(move || worker_loop(&graph, &receiver))
                    .expect("failed to spawn worker thread")
            })
            .collect();

        tracing::debug!(workers = threads.len(), "worker pool started");

        Self {
            graph,
            sender: Some(sender),
            threads,
        }
    }

    /// Schedules `body` after `dependencies` and hands it to the workers.
    pub fn schedule<F>(&self, dependencies: &[Fence], body: F) -> Fence
    where
        F: FnOnce() + Send + 'static,
    {
        let fence = self.graph.schedule_with(dependencies, body);
        if let Some(sender) = &self.sender {
            // Workers only stop once the pool is dropped, so a send cannot
            // fail while `self` is alive.
            let _ = sender.send(fence);
        }
        fence
    }

    /// Returns the graph this pool runs.
    #[inline]
    #[must_use]
    pub fn graph(&self) -> &Arc<FenceGraph> {
        &self.graph
    }

    /// Returns the number of worker threads.
    #[inline]
    #[must_use]
    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.sender = None;
        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
    }
}

fn worker_loop(graph: &FenceGraph, receiver: &Receiver<Fence>) {
    while let Ok(fence) = receiver.recv() {
        graph.run(fence);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::FenceOracle;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_job_scope_nesting() {
        assert!(!is_executing_job());
        {
            let _outer = JobScope::enter();
            {
                let _inner = JobScope::enter();
                assert!(is_executing_job());
            }
            assert!(is_executing_job());
        }
        assert!(!is_executing_job());
    }

    #[test]
    fn test_thread_context_owner() {
        let context = ThreadContext::current();
        assert!(context.is_owner_thread());
        assert!(!context.is_executing_job());

        let other = std::thread::spawn(move || context.is_owner_thread()).join().unwrap();
        assert!(!other);
    }

    #[test]
    fn test_workers_run_jobs() {
        let graph = Arc::new(FenceGraph::new());
        let workers = WorkerPool::new(4, Arc::clone(&graph));
        assert_eq!(workers.thread_count(), 4);

        let count = Arc::new(AtomicUsize::new(0));
        let fences: Vec<Fence> = (0..64)
            .map(|_| {
                let count = Arc::clone(&count);
                workers.schedule(&[], move || {
                    assert!(is_executing_job());
                    count.fetch_add(1, Ordering::Relaxed);
                })
            })
            .collect();

        let all = graph.combine(&fences);
        graph.wait_until_complete(all);
        assert_eq!(count.load(Ordering::Relaxed), 64);
        assert!(fences.iter().all(|&f| graph.is_complete(f)));
    }

    #[test]
    fn test_dependent_jobs_run_in_order() {
        let graph = Arc::new(FenceGraph::new());
        let workers = WorkerPool::new(2, Arc::clone(&graph));

        let stage = Arc::new(AtomicUsize::new(0));
        let first = {
            let stage = Arc::clone(&stage);
            workers.schedule(&[], move || {
                std::thread::sleep(std::time::Duration::from_millis(5));
                stage.store(1, Ordering::SeqCst);
            })
        };
        let second = {
            let stage = Arc::clone(&stage);
            workers.schedule(&[first], move || {
                assert_eq!(stage.load(Ordering::SeqCst), 1);
                stage.store(2, Ordering::SeqCst);
            })
        };

        graph.wait_until_complete(second);
        assert_eq!(stage.load(Ordering::SeqCst), 2);
    }
}
