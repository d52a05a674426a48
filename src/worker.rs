//! Worker pool and ready-task scheduling
//!
//! The engine provides mechanism, not policy: tasks whose frontier reached
//! zero enter a shared ready queue and parallel workers pull from it in an
//! arbitrary order. Each worker tracks the task it is currently executing in
//! thread-local state so `current_task()` and `current_worker()` resolve
//! from inside user functions.

use std::cell::Cell;
use std::sync::atomic::{ AtomicBool, AtomicUsize, Ordering };
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::queue::SegQueue;
use crossbeam::utils::Backoff;
use parking_lot::{ Condvar, Mutex };
use tracing::{ debug, trace };

use crate::constants::WORKER_SPIN_BEFORE_PARK;
use crate::guid::{ Guid, NULL_GUID };

thread_local! {
    static WORKER_ID: Cell<Option<usize>> = const { Cell::new(None) };
    static CURRENT_TASK: Cell<Guid> = const { Cell::new(NULL_GUID) };
}

/// The worker index of the calling thread, if it is a pool worker
pub fn current_worker() -> Option<usize> {
    WORKER_ID.with(|w| w.get())
}

/// The task executing on the calling thread (`NULL_GUID` outside dispatch)
pub fn current_task() -> Guid {
    CURRENT_TASK.with(|t| t.get())
}

/// Run `f` with the thread's current-task marker set to `task`
pub(crate) fn with_current_task<R>(task: Guid, f: impl FnOnce() -> R) -> R {
    CURRENT_TASK.with(|t| {
        let prev = t.replace(task);
        let result = f();
        t.set(prev);
        result
    })
}

/// Shared ready queue with parked-worker wakeup
pub struct Scheduler {
    ready: SegQueue<Guid>,
    stop: AtomicBool,
    sleep: Mutex<()>,
    wake: Condvar,
    workers: AtomicUsize,
}

impl Scheduler {
    /// Create an empty scheduler
    pub fn new() -> Self {
        Self {
            ready: SegQueue::new(),
            stop: AtomicBool::new(false),
            sleep: Mutex::new(()),
            wake: Condvar::new(),
            workers: AtomicUsize::new(0),
        }
    }

    /// Number of workers attached to this scheduler
    pub fn worker_count(&self) -> usize {
        self.workers.load(Ordering::Acquire)
    }

    /// Hand a ready task to the pool
    pub fn enqueue(&self, task: Guid) {
        trace!(?task, "task ready");
        self.ready.push(task);
        self.wake.notify_one();
    }

    /// Next ready task; blocks until one arrives or the scheduler stops
    pub fn next(&self) -> Option<Guid> {
        let backoff = Backoff::new();
        let mut spins = 0u32;
        loop {
            if let Some(task) = self.ready.pop() {
                return Some(task);
            }
            if self.stop.load(Ordering::Acquire) {
                // Drain stragglers before retiring
                return self.ready.pop();
            }
            if spins < WORKER_SPIN_BEFORE_PARK {
                backoff.snooze();
                spins += 1;
                continue;
            }
            let mut guard = self.sleep.lock();
            if self.ready.is_empty() && !self.stop.load(Ordering::Acquire) {
                let _ = self.wake.wait_for(&mut guard, Duration::from_millis(1));
            }
            spins = 0;
        }
    }

    /// Pending ready tasks (diagnostics)
    pub fn pending(&self) -> usize {
        self.ready.len()
    }

    /// Stop the pool: workers retire once the queue drains
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        self.wake.notify_all();
    }

    /// Whether the scheduler has been stopped
    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Parallel workers pulling ready tasks
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `count` workers, each invoking `execute` per ready task
    pub fn spawn<F>(count: usize, scheduler: Arc<Scheduler>, execute: F) -> Self
    where
        F: Fn(Guid) + Send + Sync + 'static,
    {
        scheduler.workers.store(count, Ordering::Release);
        let execute = Arc::new(execute);
        let handles = (0..count)
            .map(|id| {
                let scheduler = Arc::clone(&scheduler);
                let execute = Arc::clone(&execute);
                std::thread::Builder::new()
                    .name(format!("weft-worker-{id}"))
                    .spawn(move || {
                        WORKER_ID.with(|w| w.set(Some(id)));
                        debug!(worker = id, "worker up");
                        while let Some(task) = scheduler.next() {
                            execute(task);
                        }
                        debug!(worker = id, "worker retired");
                    })
                    .expect("worker thread spawn")
            })
            .collect();
        Self { handles }
    }

    /// Number of workers
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Whether the pool is empty
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Join all workers (call after [`Scheduler::stop`])
    pub fn join(self) {
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}
