//! Task scheduling for edges.
//!
//! Every unit of background work returns a [`TaskHandle`]. Work that must run after another unit is
//! attached to that unit's handle with [`TaskManager::require_done`] and is only submitted to the
//! pool once its predecessor has finished, so ordering never costs a blocked worker.

use crate::error::{Result, ZnnError};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use tracing::trace;

type Job = Box<dyn FnOnce() + Send + 'static>;

enum HandleState {
    Pending(Vec<Job>),
    Done,
}

struct HandleInner {
    state: Mutex<HandleState>,
    finished: Condvar,
}

/// Opaque token for one scheduled unit of work.
#[derive(Clone)]
pub struct TaskHandle {
    inner: Arc<HandleInner>,
}

impl TaskHandle {
    /// A handle that has already completed.
    pub fn done() -> Self {
        Self::with_state(HandleState::Done)
    }

    fn pending() -> Self {
        Self::with_state(HandleState::Pending(Vec::new()))
    }

    fn with_state(state: HandleState) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                state: Mutex::new(state),
                finished: Condvar::new(),
            }),
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(*self.inner.state.lock(), HandleState::Done)
    }

    /// Blocks the calling thread until the work behind this handle has run.
    pub fn wait(&self) {
        let mut state = self.inner.state.lock();
        while matches!(*state, HandleState::Pending(_)) {
            self.inner.finished.wait(&mut state);
        }
    }

    pub fn same_task(&self, other: &TaskHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn complete(&self) {
        let continuations = {
            let mut state = self.inner.state.lock();
            let previous = std::mem::replace(&mut *state, HandleState::Done);
            self.inner.finished.notify_all();
            match previous {
                HandleState::Pending(jobs) => jobs,
                HandleState::Done => Vec::new(),
            }
        };
        for job in continuations {
            job();
        }
    }

    // Runs `job` as soon as this handle completes (immediately if it already has).
    fn then(&self, job: Job) {
        let mut state = self.inner.state.lock();
        if let HandleState::Pending(jobs) = &mut *state {
            jobs.push(job);
            return;
        }
        drop(state);
        job();
    }
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("done", &self.is_done())
            .finish()
    }
}

/// Thread-pool executor shared by every edge of a network.
pub struct TaskManager {
    pool: Arc<rayon::ThreadPool>,
}

impl TaskManager {
    /// Builds a dedicated pool. `None` lets rayon pick the thread count.
    ///
    /// # Errors
    ///
    /// Returns `ZnnError::Config` for `Some(0)` and `ZnnError::ThreadPool` if the pool cannot
    /// start.
    pub fn new(threads: Option<usize>) -> Result<Self> {
        if threads == Some(0) {
            return Err(ZnnError::Config(
                "'threads' must be >= 1 when set".to_string(),
            ));
        }

        let mut builder =
            rayon::ThreadPoolBuilder::new().thread_name(|i| format!("znn-worker-{i}"));
        if let Some(n) = threads {
            builder = builder.num_threads(n);
        }
        let pool = builder.build()?;
        trace!(threads = pool.current_num_threads(), "task manager started");

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Runs `f` on one of the pool's workers and waits for its result.
    pub fn install<R, F>(&self, f: F) -> R
    where
        R: Send,
        F: FnOnce() -> R + Send,
    {
        self.pool.install(f)
    }

    /// Submits `f` for execution as soon as a worker is free.
    pub fn schedule<F>(&self, f: F) -> TaskHandle
    where
        F: FnOnce() + Send + 'static,
    {
        self.require_done(&TaskHandle::done(), f)
    }

    /// Submits `f` once the work behind `handle` has completed. Never blocks the caller.
    pub fn require_done<F>(&self, handle: &TaskHandle, f: F) -> TaskHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let next = TaskHandle::pending();
        let signal = next.clone();
        let pool = Arc::clone(&self.pool);
        handle.then(Box::new(move || {
            pool.spawn(move || {
                f();
                signal.complete();
            })
        }));
        next
    }
}

impl std::fmt::Debug for TaskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskManager")
            .field("threads", &self.threads())
            .finish()
    }
}

/// The single outstanding unit of work of an edge.
///
/// New work is always chained onto the current handle and replaces it, so work submitted through
/// one `PendingTask` runs in submission order and never overlaps.
pub struct PendingTask {
    handle: Mutex<TaskHandle>,
}

impl PendingTask {
    pub fn new(handle: TaskHandle) -> Self {
        Self {
            handle: Mutex::new(handle),
        }
    }

    pub fn idle() -> Self {
        Self::new(TaskHandle::done())
    }

    /// Chains `f` after the current handle and makes it the new pending handle.
    pub fn then<F>(&self, tasks: &TaskManager, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut handle = self.handle.lock();
        *handle = tasks.require_done(&handle, f);
    }

    /// Replaces the pending handle. Used when the new work was scheduled elsewhere.
    pub fn set(&self, handle: TaskHandle) {
        *self.handle.lock() = handle;
    }

    pub fn is_idle(&self) -> bool {
        self.handle.lock().is_done()
    }

    /// Blocks until no work is outstanding, including work chained while waiting.
    pub fn wait(&self) {
        loop {
            let current = self.handle.lock().clone();
            current.wait();
            if self.handle.lock().same_task(&current) {
                return;
            }
        }
    }
}
