//! Query executor - worker pool with a counting-signal barrier
//!
//! A fixed pool of OS threads pulls [`QueryTask`]s off a bounded,
//! mutex-protected queue. A query with `N` tasks submits `N−1` to the pool
//! and performs the last one on the request thread, then waits on a
//! [`CountingSignal`] initialized with `N−1`; the barrier gives the caller
//! a happens-before edge from every worker's completion to the
//! post-barrier aggregation.
//!
//! The executor-level submit lock serializes the submit-then-wait prelude
//! so two concurrent queries cannot interleave their barriers with each
//! other's submissions.
//!
//! # Shutdown
//!
//! `Running → Draining → Stopped`. Draining rejects new submissions and
//! waits up to 5 seconds for queued and running tasks; whatever is still
//! queued after the window is cancelled (each cancelled task still fires
//! its signal, so no waiter deadlocks).

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

use crate::config::ExecutorSettings;
use crate::error::{QueryError, Result};
use crate::metrics::EXECUTOR_PENDING_TASKS;
use crate::query::task::QueryTask;

/// How long shutdown waits for in-flight tasks before abandoning them.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Worker dequeue timeout; bounds how long a worker sleeps before
/// re-checking the executor state.
const DEQUEUE_TIMEOUT: Duration = Duration::from_millis(200);

// ============================================================================
// CountingSignal
// ============================================================================

/// Single-use barrier released after a fixed number of signals.
///
/// Initialized with `N−1` for an `N`-task query; the caller performs the
/// last task itself and then waits. With an initial count of zero,
/// [`CountingSignal::wait`] returns immediately.
pub struct CountingSignal {
    count: Mutex<usize>,
    zero: Condvar,
}

impl CountingSignal {
    /// Create a signal that releases waiters after `count` count-downs.
    pub fn new(count: usize) -> Self {
        Self {
            count: Mutex::new(count),
            zero: Condvar::new(),
        }
    }

    /// Record one completion; releases waiters when the count hits zero.
    pub fn count_down(&self) {
        let mut count = self.count.lock();
        if *count > 0 {
            *count -= 1;
        }
        if *count == 0 {
            self.zero.notify_all();
        }
    }

    /// Block until the count reaches zero.
    pub fn wait(&self) {
        let mut count = self.count.lock();
        while *count > 0 {
            self.zero.wait(&mut count);
        }
    }
}

// ============================================================================
// Executor
// ============================================================================

/// Executor lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExecutorState {
    /// Accepting and running tasks
    Running = 0,
    /// Rejecting submissions, finishing in-flight work
    Draining = 1,
    /// Workers exited; queue leftovers cancelled
    Stopped = 2,
}

impl ExecutorState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ExecutorState::Running,
            1 => ExecutorState::Draining,
            _ => ExecutorState::Stopped,
        }
    }
}

struct PoolInner {
    queue: Mutex<VecDeque<Arc<QueryTask>>>,
    not_empty: Condvar,
    not_full: Condvar,
    queue_size: usize,
    state: AtomicU8,
    active: AtomicUsize,
}

impl PoolInner {
    fn state(&self) -> ExecutorState {
        ExecutorState::from_u8(self.state.load(Ordering::Acquire))
    }
}

/// Fixed-size worker pool dispatching [`QueryTask`]s.
pub struct QueryExecutor {
    inner: Arc<PoolInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    /// Serializes the submit-then-wait prelude across concurrent queries
    submit_lock: Mutex<()>,
}

impl QueryExecutor {
    /// Start a pool per the executor settings.
    pub fn new(settings: &ExecutorSettings) -> Arc<Self> {
        let inner = Arc::new(PoolInner {
            queue: Mutex::new(VecDeque::new()),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            queue_size: settings.queue_size.max(1),
            state: AtomicU8::new(ExecutorState::Running as u8),
            active: AtomicUsize::new(0),
        });

        let thread_count = settings.thread_count.max(1);
        let mut workers = Vec::with_capacity(thread_count);
        for i in 0..thread_count {
            let inner = inner.clone();
            let handle = std::thread::Builder::new()
                .name(format!("qexe-{}", i))
                .spawn(move || worker_loop(inner))
                .expect("failed to spawn query worker");
            workers.push(handle);
        }
        info!(threads = thread_count, "query executor started");

        Arc::new(Self {
            inner,
            workers: Mutex::new(workers),
            submit_lock: Mutex::new(()),
        })
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ExecutorState {
        self.inner.state()
    }

    /// Tasks currently waiting in the queue.
    pub fn pending_tasks(&self) -> usize {
        self.inner.queue.lock().len()
    }

    /// Submit one task to the pool.
    ///
    /// Blocks while the bounded queue is full; fails with `Shutdown` once
    /// the executor is draining or stopped.
    pub fn submit(&self, task: Arc<QueryTask>) -> Result<()> {
        let mut queue = self.inner.queue.lock();
        loop {
            if self.inner.state() != ExecutorState::Running {
                return Err(QueryError::Shutdown);
            }
            if queue.len() < self.inner.queue_size {
                task.mark_queued();
                queue.push_back(task);
                EXECUTOR_PENDING_TASKS.set(queue.len() as i64);
                self.inner.not_empty.notify_one();
                return Ok(());
            }
            let _ = self.inner.not_full.wait_for(&mut queue, DEQUEUE_TIMEOUT);
        }
    }

    /// Run a set of tasks to completion.
    ///
    /// With more than one task, `N−1` go to the pool and the last runs on
    /// the calling thread before waiting on the barrier. A submission
    /// rejected by shutdown falls back to inline execution, so every task
    /// terminates and signals either way.
    pub fn run(&self, tasks: &[Arc<QueryTask>]) {
        match tasks {
            [] => {}
            [only] => only.perform(),
            _ => {
                let n = tasks.len() - 1;
                let signal = Arc::new(CountingSignal::new(n));

                {
                    let _guard = self.submit_lock.lock();
                    for task in &tasks[..n] {
                        task.set_signal(signal.clone());
                        if let Err(e) = self.submit(task.clone()) {
                            debug!(error = %e, "submission rejected, running task inline");
                            task.perform();
                        }
                    }
                }

                tasks[n].perform();
                signal.wait();
            }
        }
    }

    /// Drain and stop the pool.
    ///
    /// Waits up to 5 seconds for queued and running tasks, then cancels
    /// whatever is left and joins the workers.
    pub fn shutdown(&self) {
        let prev = self
            .inner
            .state
            .swap(ExecutorState::Draining as u8, Ordering::AcqRel);
        if ExecutorState::from_u8(prev) != ExecutorState::Running {
            return;
        }
        info!("query executor draining");

        let deadline = Instant::now() + SHUTDOWN_GRACE;
        loop {
            let idle = self.inner.queue.lock().is_empty()
                && self.inner.active.load(Ordering::Acquire) == 0;
            if idle || Instant::now() >= deadline {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }

        self.inner
            .state
            .store(ExecutorState::Stopped as u8, Ordering::Release);
        self.inner.not_empty.notify_all();
        self.inner.not_full.notify_all();

        let leftovers: Vec<Arc<QueryTask>> = self.inner.queue.lock().drain(..).collect();
        if !leftovers.is_empty() {
            info!(count = leftovers.len(), "cancelling tasks abandoned by shutdown");
        }
        for task in leftovers {
            task.cancel();
        }
        EXECUTOR_PENDING_TASKS.set(0);

        for handle in self.workers.lock().drain(..) {
            let _ = handle.join();
        }
        info!("query executor shutdown complete");
    }
}

impl Drop for QueryExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(inner: Arc<PoolInner>) {
    loop {
        let task = {
            let mut queue = inner.queue.lock();
            loop {
                if let Some(task) = queue.pop_front() {
                    EXECUTOR_PENDING_TASKS.set(queue.len() as i64);
                    inner.not_full.notify_one();
                    break Some(task);
                }
                if inner.state() == ExecutorState::Stopped {
                    break None;
                }
                let _ = inner.not_empty.wait_for(&mut queue, DEQUEUE_TIMEOUT);
            }
        };

        let Some(task) = task else { return };

        inner.active.fetch_add(1, Ordering::AcqRel);
        let outcome = catch_unwind(AssertUnwindSafe(|| task.perform()));
        inner.active.fetch_sub(1, Ordering::AcqRel);

        if outcome.is_err() {
            // the task's signal guard already fired during unwind
            error!("query task panicked in worker");
        }
    }
}
