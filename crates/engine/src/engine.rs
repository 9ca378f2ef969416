//! Engine facade
//!
//! Wires a record source, the scheduler, the emitter, and the monitor into a
//! single run: a feeder thread submits every input record, the caller drains
//! results as they finish, and [`RunHandle::join`] reports the outcome.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::emitter::{self, Drain, Ordered};
use crate::error::{panic_message, EngineError};
use crate::monitor::{ProgressMonitor, ProgressSink, ProgressSnapshot, RunState, TracingProgressSink};
use crate::record::{Record, TaskContext};
use crate::scheduler::{BoundedScheduler, ComputeFn};
use crate::worker::{WorkerPool, WorkerPoolStats};

/// Applies one compute function to ordered record streams
///
/// # Example
///
/// ```
/// use rowflow_engine::{EngineConfig, TaskContext, TransformEngine};
///
/// let config = EngineConfig::new().with_max_parallel_workers(2).with_max_queue_size(4);
/// let engine = TransformEngine::new(config, |_ctx: &TaskContext, word: String| {
///     Ok(word.len())
/// })
/// .unwrap();
///
/// let mut run = engine.run(vec!["a".to_string(), "bcd".to_string()], Some(2)).unwrap();
/// let lengths: Vec<Option<usize>> = run.ordered().map(|r| r.into_value()).collect();
/// assert_eq!(lengths, vec![Some(1), Some(3)]);
///
/// let summary = run.join().unwrap();
/// assert_eq!(summary.succeeded, 2);
/// ```
pub struct TransformEngine<T, V> {
    config: EngineConfig,
    compute: ComputeFn<T, V>,
    sink: Arc<dyn ProgressSink>,
    cancel: CancellationToken,
}

impl<T, V> TransformEngine<T, V>
where
    T: Send + 'static,
    V: Send + 'static,
{
    /// Create an engine; invalid configuration is rejected here
    pub fn new<F>(config: EngineConfig, compute: F) -> Result<Self, EngineError>
    where
        F: Fn(&TaskContext, T) -> anyhow::Result<V> + Send + Sync + 'static,
    {
        Self::from_compute_fn(config, Arc::new(compute))
    }

    /// Create an engine from an already shared compute function
    pub fn from_compute_fn(config: EngineConfig, compute: ComputeFn<T, V>) -> Result<Self, EngineError> {
        config.validate()?;
        Ok(Self {
            config,
            compute,
            sink: Arc::new(TracingProgressSink::new()),
            cancel: CancellationToken::new(),
        })
    }

    /// Send progress to `sink` instead of the log
    pub fn with_progress_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Observe an external cancellation token
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// The token that cancels runs started by this engine
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// The engine configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Start a run over `inputs`
    ///
    /// Records are indexed by their position in `inputs`. `total_expected`
    /// is the progress denominator; pass `None` when the length is unknown.
    /// Results must be drained from the returned handle.
    #[instrument(skip_all, fields(run_id))]
    pub fn run<I>(&self, inputs: I, total_expected: Option<usize>) -> Result<RunHandle<V>, EngineError>
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
    {
        let run_id = Uuid::now_v7();
        tracing::Span::current().record("run_id", tracing::field::display(run_id));

        let monitor = Arc::new(ProgressMonitor::new(
            total_expected,
            self.cancel.child_token(),
            Arc::clone(&self.sink),
        ));
        let (emitter, drain) = emitter::channel();
        let scheduler = BoundedScheduler::new(
            self.config.clone(),
            Arc::clone(&self.compute),
            emitter,
            Arc::clone(&monitor),
        )?;
        let pool = scheduler.pool();

        info!(
            %run_id,
            max_queue_size = self.config.max_queue_size,
            max_parallel_workers = self.config.max_parallel_workers,
            timeout_ms = self.config.per_task_timeout.map(|t| t.as_millis() as u64),
            total_expected,
            "Starting run"
        );

        let inputs = inputs.into_iter();
        let feeder_name = format!("{}-feeder", self.config.worker_name_prefix);
        let feeder = thread::Builder::new()
            .name(feeder_name.clone())
            .spawn(move || feed(scheduler, inputs))
            .map_err(|source| EngineError::Spawn {
                name: feeder_name,
                source,
            })?;

        Ok(RunHandle {
            run_id,
            started_at: Utc::now(),
            drain: Some(drain),
            feeder: Some(feeder),
            monitor,
            pool,
        })
    }
}

fn feed<T, V, I>(scheduler: BoundedScheduler<T, V>, inputs: I)
where
    T: Send + 'static,
    V: Send + 'static,
    I: Iterator<Item = T>,
{
    for (index, value) in inputs.enumerate() {
        if let Err(e) = scheduler.submit(Record::new(index, value)) {
            info!(index = e.index(), reason = %e, "Stopped feeding records");
            break;
        }
    }
    scheduler.shutdown();
}

/// A run in progress
///
/// Drain results with [`RunHandle::results`] (completion order) or
/// [`RunHandle::ordered`] (input order), then call [`RunHandle::join`].
pub struct RunHandle<V> {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    drain: Option<Drain<V>>,
    feeder: Option<JoinHandle<()>>,
    monitor: Arc<ProgressMonitor>,
    pool: Arc<WorkerPool>,
}

impl<V> RunHandle<V> {
    /// Unique run ID
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Results in completion order
    ///
    /// Yields nothing if the results were already taken.
    pub fn results(&mut self) -> Drain<V> {
        self.take_drain()
    }

    /// Results in input order, buffering early finishers
    pub fn ordered(&mut self) -> Ordered<V> {
        self.take_drain().ordered()
    }

    /// Current progress
    pub fn progress(&self) -> ProgressSnapshot {
        self.monitor.snapshot()
    }

    /// Current worker pool counters
    pub fn workers(&self) -> WorkerPoolStats {
        self.pool.stats()
    }

    /// Request cooperative cancellation of this run
    ///
    /// Other runs of the same engine are unaffected. Records already accepted
    /// still produce results.
    pub fn cancel(&self) {
        self.monitor.cancel();
    }

    /// Wait for every accepted record to finish and summarize the run
    ///
    /// Results not yet drained are discarded.
    pub fn join(mut self) -> Result<RunSummary, EngineError> {
        self.drain.take();
        if let Some(feeder) = self.feeder.take() {
            feeder
                .join()
                .map_err(|payload| EngineError::FeederPanicked(panic_message(payload.as_ref())))?;
        }

        let finished_at = Utc::now();
        let progress = self.monitor.snapshot();
        let summary = RunSummary {
            run_id: self.run_id,
            state: progress.state,
            submitted: progress.submitted,
            succeeded: progress.succeeded,
            failed: progress.failed,
            timed_out: progress.timed_out,
            workers: self.pool.stats(),
            started_at: self.started_at,
            finished_at,
            elapsed: (finished_at - self.started_at).to_std().unwrap_or_default(),
        };

        if summary.workers.abandoned > 0 {
            warn!(
                run_id = %summary.run_id,
                abandoned = summary.workers.abandoned,
                "Abandoned worker threads may still be running"
            );
        }
        info!(
            run_id = %summary.run_id,
            state = ?summary.state,
            submitted = summary.submitted,
            succeeded = summary.succeeded,
            failed = summary.failed,
            timed_out = summary.timed_out,
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "Run finished"
        );
        Ok(summary)
    }

    fn take_drain(&mut self) -> Drain<V> {
        match self.drain.take() {
            Some(drain) => drain,
            // Already taken: hand back an exhausted drain
            None => emitter::channel().1,
        }
    }
}

/// Outcome of a finished run
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub state: RunState,
    pub submitted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub workers: WorkerPoolStats,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(rename = "elapsed_ms", serialize_with = "serialize_millis")]
    pub elapsed: Duration,
}

impl RunSummary {
    /// Records that produced no value
    pub fn missing(&self) -> usize {
        self.failed + self.timed_out
    }
}

fn serialize_millis<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_u64(duration.as_millis() as u64)
}
