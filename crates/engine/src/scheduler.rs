//! Bounded task scheduler
//!
//! Accepts records, holds at most `max_queue_size` of them in flight (queued
//! or executing), and runs at most `max_parallel_workers` at once. Each of the
//! `max_parallel_workers` dispatcher threads takes one queued record at a
//! time, runs it on a pooled worker under the per-task deadline, and hands the
//! result to the emitter.
//!
//! ```text
//!  submit() ──▶ [gate: in_flight < max_queue_size] ──▶ queue ──▶ dispatcher × N
//!     ▲                                                              │
//!     └────────────── slot freed (condvar) ◀── result emitted ◀──────┘
//! ```

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::config::EngineConfig;
use crate::emitter::ResultEmitter;
use crate::error::{EngineError, SubmitError, TaskFailure};
use crate::monitor::ProgressMonitor;
use crate::record::{Record, TaskContext, TaskResult};
use crate::worker::{Completion, WorkerPool};

/// The per-record computation
///
/// Must be safe to call concurrently from several threads and must not have
/// externally observable side effects: a computation that misses its deadline
/// is abandoned mid-flight and its partial effects are undefined.
pub type ComputeFn<T, V> = Arc<dyn Fn(&TaskContext, T) -> anyhow::Result<V> + Send + Sync>;

/// Wrap a closure as a [`ComputeFn`]
pub fn compute_fn<T, V, F>(f: F) -> ComputeFn<T, V>
where
    F: Fn(&TaskContext, T) -> anyhow::Result<V> + Send + Sync + 'static,
{
    Arc::new(f)
}

#[derive(Debug, Default)]
struct Gate {
    queued: usize,
    active: usize,
    closed: bool,
}

impl Gate {
    fn in_flight(&self) -> usize {
        self.queued + self.active
    }
}

struct Shared<T, V> {
    config: EngineConfig,
    compute: ComputeFn<T, V>,
    pool: Arc<WorkerPool>,
    emitter: ResultEmitter<V>,
    monitor: Arc<ProgressMonitor>,
    gate: Mutex<Gate>,
    slot_freed: Condvar,
}

/// Submits records for bounded, parallel execution
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use rowflow_engine::prelude::*;
///
/// let config = EngineConfig::new().with_max_parallel_workers(2).with_max_queue_size(4);
/// let monitor = Arc::new(ProgressMonitor::new(
///     Some(3),
///     CancellationToken::new(),
///     Arc::new(NoopProgressSink),
/// ));
/// let (emitter, drain) = rowflow_engine::emitter::channel();
/// let compute = compute_fn(|_ctx: &TaskContext, n: u32| Ok(n * 2));
///
/// let scheduler = BoundedScheduler::new(config, compute, emitter, monitor).unwrap();
/// for (index, n) in [1, 2, 3].into_iter().enumerate() {
///     scheduler.submit(Record::new(index, n)).unwrap();
/// }
/// scheduler.shutdown();
///
/// let mut doubled: Vec<u32> = drain.filter_map(|r| r.into_value()).collect();
/// doubled.sort();
/// assert_eq!(doubled, vec![2, 4, 6]);
/// ```
pub struct BoundedScheduler<T, V> {
    shared: Arc<Shared<T, V>>,
    queue: Option<Sender<Record<T>>>,
    dispatchers: Vec<JoinHandle<()>>,
}

impl<T, V> BoundedScheduler<T, V>
where
    T: Send + 'static,
    V: Send + 'static,
{
    /// Validate the configuration and start the dispatcher threads
    pub fn new(
        config: EngineConfig,
        compute: ComputeFn<T, V>,
        emitter: ResultEmitter<V>,
        monitor: Arc<ProgressMonitor>,
    ) -> Result<Self, EngineError> {
        config.validate()?;

        if config.max_queue_size < config.max_parallel_workers {
            warn!(
                max_queue_size = config.max_queue_size,
                max_parallel_workers = config.max_parallel_workers,
                "Queue bound is below the worker cap, parallelism is limited by the queue"
            );
        }

        let pool = Arc::new(WorkerPool::new(
            config.worker_name_prefix.clone(),
            config.max_parallel_workers,
        ));
        let (queue, inbox) = unbounded::<Record<T>>();

        let shared = Arc::new(Shared {
            config,
            compute,
            pool,
            emitter,
            monitor,
            gate: Mutex::new(Gate::default()),
            slot_freed: Condvar::new(),
        });

        let mut scheduler = Self {
            shared: Arc::clone(&shared),
            queue: Some(queue),
            dispatchers: Vec::with_capacity(shared.config.max_parallel_workers),
        };

        for i in 0..shared.config.max_parallel_workers {
            let name = format!("{}-dispatch-{}", shared.config.worker_name_prefix, i);
            let shared = Arc::clone(&shared);
            let inbox = inbox.clone();
            let handle = thread::Builder::new()
                .name(name.clone())
                .spawn(move || dispatch_loop(shared, inbox))
                .map_err(|source| EngineError::Spawn { name, source })?;
            scheduler.dispatchers.push(handle);
        }

        Ok(scheduler)
    }

    /// Submit one record, blocking while `max_queue_size` records are in flight
    ///
    /// Returns [`SubmitError::Cancelled`] as soon as cancellation is observed,
    /// including while blocked. A blocked submitter re-checks cancellation at
    /// every completion and every `cancel_poll_interval`.
    pub fn submit(&self, record: Record<T>) -> Result<(), SubmitError> {
        let index = record.index;
        let shared = &self.shared;
        let Some(queue) = self.queue.as_ref() else {
            return Err(SubmitError::Closed { index });
        };

        let mut gate = shared.gate.lock();
        loop {
            if gate.closed {
                return Err(SubmitError::Closed { index });
            }
            if shared.monitor.check_cancelled() {
                debug!(index, "Submission rejected, run cancelled");
                return Err(SubmitError::Cancelled { index });
            }
            if gate.in_flight() < shared.config.max_queue_size {
                break;
            }
            trace!(index, in_flight = gate.in_flight(), "Queue full, waiting for a slot");
            shared
                .slot_freed
                .wait_for(&mut gate, shared.config.cancel_poll_interval);
        }

        if !shared.monitor.try_begin_submit() {
            return Err(SubmitError::Cancelled { index });
        }
        gate.queued += 1;

        if queue.send(record).is_err() {
            // Every dispatcher is gone; nothing will ever run this record
            gate.queued -= 1;
            shared.monitor.abort_submit();
            error!(index, "No dispatcher available, scheduler closed");
            return Err(SubmitError::Closed { index });
        }
        Ok(())
    }

    /// Records queued or executing right now
    pub fn in_flight(&self) -> usize {
        self.shared.gate.lock().in_flight()
    }

    /// Records executing right now
    pub fn active(&self) -> usize {
        self.shared.gate.lock().active
    }

    /// The worker pool backing this scheduler
    pub fn pool(&self) -> Arc<WorkerPool> {
        Arc::clone(&self.shared.pool)
    }

    /// The run's monitor
    pub fn monitor(&self) -> Arc<ProgressMonitor> {
        Arc::clone(&self.shared.monitor)
    }

    /// Stop accepting records and wake blocked submitters
    ///
    /// Records already accepted still run and produce results.
    pub fn close(&mut self) {
        {
            let mut gate = self.shared.gate.lock();
            gate.closed = true;
        }
        self.shared.slot_freed.notify_all();
        self.queue.take();
        self.shared.monitor.close_input();
    }

    /// Close, then wait for every accepted record to produce its result
    ///
    /// With no per-task deadline this waits as long as the slowest record.
    pub fn shutdown(mut self) {
        self.close();
        for handle in self.dispatchers.drain(..) {
            if handle.join().is_err() {
                error!("Dispatcher thread panicked");
            }
        }
        self.shared.pool.shutdown();
    }
}

impl<T, V> Drop for BoundedScheduler<T, V> {
    fn drop(&mut self) {
        // Dispatchers drain what was accepted, then exit on their own
        if self.queue.take().is_some() {
            self.shared.gate.lock().closed = true;
            self.shared.slot_freed.notify_all();
            self.shared.monitor.close_input();
        }
    }
}

fn dispatch_loop<T, V>(shared: Arc<Shared<T, V>>, inbox: Receiver<Record<T>>)
where
    T: Send + 'static,
    V: Send + 'static,
{
    for record in inbox.iter() {
        {
            let mut gate = shared.gate.lock();
            gate.queued -= 1;
            gate.active += 1;
            shared.monitor.on_started();
        }

        let result = shared.execute(record);
        let failure = result.failure_reason().cloned();
        if !shared.emitter.on_task_finished(result) {
            trace!("Result consumer gone, result dropped");
        }

        shared.gate.lock().active -= 1;
        shared.monitor.on_finished(failure.as_ref());
        shared.slot_freed.notify_all();
    }
    trace!("Dispatcher queue closed, exiting");
}

impl<T, V> Shared<T, V>
where
    T: Send + 'static,
    V: Send + 'static,
{
    fn execute(&self, record: Record<T>) -> TaskResult<V> {
        let Record { index, value } = record;

        let worker = match self.pool.acquire_worker() {
            Ok(worker) => worker,
            Err(e) => {
                error!(index, error = %e, "No worker available for task");
                return TaskResult::failure(index, TaskFailure::worker_lost(e.to_string()));
            }
        };
        debug!(index, worker = worker.name(), "Dispatching task");

        let timeout = self.config.per_task_timeout;
        let token = CancellationToken::new();
        let ctx = TaskContext::new(index, token.clone(), timeout);
        let compute = Arc::clone(&self.compute);

        match self
            .pool
            .run_with_deadline(worker, move || compute(&ctx, value), timeout)
        {
            Completion::Finished(Ok(output)) => TaskResult::success(index, output),
            Completion::Finished(Err(e)) => {
                debug!(index, error = %e, "Compute function failed");
                TaskResult::failure(index, TaskFailure::compute(format!("{:#}", e)))
            }
            Completion::Panicked(message) => {
                warn!(index, %message, "Compute function panicked");
                TaskResult::failure(index, TaskFailure::compute(format!("panicked: {}", message)))
            }
            Completion::TimedOut => {
                // Ask the abandoned computation to stop early
                token.cancel();
                let limit = timeout.unwrap_or_default();
                TaskResult::failure(index, TaskFailure::Timeout { limit })
            }
            Completion::Lost => TaskResult::failure(
                index,
                TaskFailure::worker_lost("worker thread exited before reporting a result"),
            ),
        }
    }
}
