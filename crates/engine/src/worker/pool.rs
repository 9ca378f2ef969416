//! Pool of reusable worker threads
//!
//! Each worker is a dedicated OS thread fed through a job channel. A task
//! that misses its deadline gets its worker abandoned: the pool stops
//! waiting, drops the job channel, and detaches the thread. The thread
//! finishes whatever it is running, then exits on its own.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, trace, warn};

use crate::error::panic_message;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Worker pool errors
#[derive(Debug, thiserror::Error)]
pub enum WorkerPoolError {
    /// The OS refused to start a worker thread
    #[error("failed to spawn worker {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    /// Every worker slot is busy
    #[error("worker pool exhausted ({capacity} workers busy)")]
    Exhausted { capacity: usize },
}

/// Handle to one worker thread
///
/// Owned by the pool while idle and by the dispatcher while running a task.
#[derive(Debug)]
pub struct Worker {
    id: u64,
    name: String,
    jobs: Sender<Job>,
    handle: JoinHandle<()>,
}

impl Worker {
    /// Numeric worker identity, unique within the pool
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Thread name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Check if the underlying thread is still running
    pub fn is_alive(&self) -> bool {
        !self.handle.is_finished()
    }
}

/// Outcome of [`WorkerPool::run_with_deadline`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion<R> {
    /// The task returned in time; the worker went back to the idle set
    Finished(R),
    /// The task panicked in time; the worker survived and went back to the idle set
    Panicked(String),
    /// The deadline expired; the worker was abandoned
    TimedOut,
    /// The worker thread disappeared without reporting; the worker was discarded
    Lost,
}

impl<R> Completion<R> {
    /// Check if the task signalled completion before its deadline
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Finished(_) | Self::Panicked(_))
    }
}

/// Point-in-time pool counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerPoolStats {
    /// Maximum live workers
    pub capacity: usize,
    /// Workers ever started
    pub spawned: u64,
    /// Live workers (idle + busy)
    pub live: usize,
    /// Workers waiting for a task
    pub idle: usize,
    /// Workers abandoned after a deadline
    pub abandoned: u64,
    /// Tasks that signalled completion in time
    pub completed: u64,
}

impl WorkerPoolStats {
    /// Workers currently running a task
    pub fn busy(&self) -> usize {
        self.live.saturating_sub(self.idle)
    }
}

/// Fixed-capacity pool of reusable worker threads
///
/// # Example
///
/// ```
/// use rowflow_engine::worker::{Completion, WorkerPool};
/// use std::time::Duration;
///
/// let pool = WorkerPool::new("doc", 2);
/// let worker = pool.acquire_worker().unwrap();
/// let outcome = pool.run_with_deadline(worker, || 6 * 7, Some(Duration::from_secs(1)));
///
/// assert_eq!(outcome, Completion::Finished(42));
/// assert_eq!(pool.stats().idle, 1);
/// ```
pub struct WorkerPool {
    name_prefix: String,
    capacity: usize,
    idle: Mutex<Vec<Worker>>,
    live: AtomicUsize,
    next_id: AtomicU64,
    abandoned: AtomicU64,
    completed: AtomicU64,
}

impl WorkerPool {
    /// Create an empty pool; workers are started lazily
    pub fn new(name_prefix: impl Into<String>, capacity: usize) -> Self {
        Self {
            name_prefix: name_prefix.into(),
            capacity: capacity.max(1),
            idle: Mutex::new(Vec::with_capacity(capacity)),
            live: AtomicUsize::new(0),
            next_id: AtomicU64::new(0),
            abandoned: AtomicU64::new(0),
            completed: AtomicU64::new(0),
        }
    }

    /// Maximum live workers
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Take an idle live worker, or start a new one if below capacity
    ///
    /// Never waits for a worker to free up.
    pub fn acquire_worker(&self) -> Result<Worker, WorkerPoolError> {
        loop {
            let candidate = self.idle.lock().pop();
            match candidate {
                Some(worker) if worker.is_alive() => return Ok(worker),
                Some(worker) => {
                    warn!(worker = %worker.name, "Discarding dead idle worker");
                    self.live.fetch_sub(1, Ordering::AcqRel);
                }
                None => break,
            }
        }

        let reserved = self
            .live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                (live < self.capacity).then_some(live + 1)
            });
        if reserved.is_err() {
            return Err(WorkerPoolError::Exhausted {
                capacity: self.capacity,
            });
        }

        self.spawn_worker().inspect_err(|_| {
            self.live.fetch_sub(1, Ordering::AcqRel);
        })
    }

    /// Run `task` on `worker`, waiting at most `timeout` (None = wait forever)
    ///
    /// The worker is released back to the pool if the task signals completion
    /// in time, and abandoned otherwise. Panics inside `task` are caught on the
    /// worker thread.
    pub fn run_with_deadline<F, R>(
        &self,
        worker: Worker,
        task: F,
        timeout: Option<Duration>,
    ) -> Completion<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (done_tx, done_rx) = channel::bounded(1);
        let job: Job = Box::new(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(task));
            // The receiver is gone once the dispatcher has given up on us
            let _ = done_tx.send(outcome);
        });

        if worker.jobs.send(job).is_err() {
            error!(worker = %worker.name, "Worker thread exited before accepting a task");
            self.discard(worker);
            return Completion::Lost;
        }

        let received = match timeout {
            Some(limit) => done_rx.recv_timeout(limit),
            None => done_rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };

        match received {
            Ok(Ok(value)) => {
                self.release(worker);
                Completion::Finished(value)
            }
            Ok(Err(payload)) => {
                let message = panic_message(payload.as_ref());
                debug!(worker = %worker.name, %message, "Task panicked, worker kept");
                self.release(worker);
                Completion::Panicked(message)
            }
            Err(RecvTimeoutError::Timeout) => {
                self.abandon(worker, timeout.unwrap_or_default());
                Completion::TimedOut
            }
            Err(RecvTimeoutError::Disconnected) => {
                error!(worker = %worker.name, "Worker thread vanished while running a task");
                self.discard(worker);
                Completion::Lost
            }
        }
    }

    /// Snapshot of the pool counters
    pub fn stats(&self) -> WorkerPoolStats {
        WorkerPoolStats {
            capacity: self.capacity,
            spawned: self.next_id.load(Ordering::Relaxed),
            live: self.live.load(Ordering::Relaxed),
            idle: self.idle.lock().len(),
            abandoned: self.abandoned.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
        }
    }

    /// Stop all idle workers and wait for their threads to exit
    ///
    /// Busy workers are untouched; abandoned ones are already detached.
    pub fn shutdown(&self) {
        let idle: Vec<Worker> = std::mem::take(&mut *self.idle.lock());
        for worker in idle {
            let Worker {
                name, jobs, handle, ..
            } = worker;
            drop(jobs);
            if handle.join().is_err() {
                warn!(worker = %name, "Worker thread panicked during shutdown");
            }
            self.live.fetch_sub(1, Ordering::AcqRel);
        }
    }

    fn spawn_worker(&self) -> Result<Worker, WorkerPoolError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let name = format!("{}-worker-{}", self.name_prefix, id);
        let (jobs, inbox) = channel::unbounded::<Job>();

        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || worker_loop(inbox))
            .map_err(|source| WorkerPoolError::Spawn {
                name: name.clone(),
                source,
            })?;

        debug!(worker = %name, "Spawned worker");
        Ok(Worker {
            id,
            name,
            jobs,
            handle,
        })
    }

    fn release(&self, worker: Worker) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        trace!(worker = %worker.name, "Worker released");
        self.idle.lock().push(worker);
    }

    fn abandon(&self, worker: Worker, limit: Duration) {
        warn!(
            worker = %worker.name,
            limit_ms = limit.as_millis() as u64,
            "Task missed its deadline, abandoning worker thread"
        );
        self.abandoned.fetch_add(1, Ordering::Relaxed);
        self.discard(worker);
    }

    fn discard(&self, worker: Worker) {
        // Dropping the sender ends the thread's job loop; the handle is detached
        drop(worker);
        self.live.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(inbox: Receiver<Job>) {
    for job in inbox.iter() {
        job();
    }
    trace!("Worker job channel closed, exiting");
}
