//! # Rowflow Engine
//!
//! Applies a CPU-bound function to every record of an ordered input sequence
//! using a bounded pool of worker threads.
//!
//! ## Features
//!
//! - **Backpressure**: submission blocks once `max_queue_size` records are in flight
//! - **Capped parallelism**: at most `max_parallel_workers` computations run at once
//! - **Per-task deadlines**: a worker that overruns is abandoned and replaced, never reused
//! - **Exactly-once results**: every accepted record yields one result tagged with its input index
//! - **Progress and cancellation**: fraction-complete reporting and cooperative stop
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     TransformEngine                          │
//! │  (feeder thread: enumerates inputs, submits, closes input)  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    BoundedScheduler                          │
//! │  (in-flight gate, dispatcher threads, deadline enforcement) │
//! └─────────────────────────────────────────────────────────────┘
//!              │                                  │
//!              ▼                                  ▼
//! ┌───────────────────────────┐    ┌────────────────────────────┐
//! │        WorkerPool         │    │  ResultEmitter ──▶ Drain   │
//! │  (reusable OS threads)    │    │  (completion order)        │
//! └───────────────────────────┘    └────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    ProgressMonitor                           │
//! │  (counters, run state, progress sink, cancellation token)   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```
//! use rowflow_engine::prelude::*;
//!
//! let engine = TransformEngine::new(
//!     EngineConfig::new().with_max_parallel_workers(4),
//!     |_ctx: &TaskContext, line: String| Ok(line.to_uppercase()),
//! )
//! .unwrap();
//!
//! let mut run = engine.run(vec!["a".to_string(), "b".to_string()], Some(2)).unwrap();
//! for result in run.results() {
//!     println!("{} -> {:?}", result.index, result.value());
//! }
//! let summary = run.join().unwrap();
//! assert_eq!(summary.state, RunState::Completed);
//! ```

pub mod config;
pub mod emitter;
pub mod engine;
pub mod error;
pub mod monitor;
pub mod record;
pub mod scheduler;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::config::{ConfigError, EngineConfig};
    pub use crate::emitter::{Drain, DrainTimeout, Ordered, Resequencer, ResultEmitter};
    pub use crate::engine::{RunHandle, RunSummary, TransformEngine};
    pub use crate::error::{EngineError, SubmitError, TaskFailure};
    pub use crate::monitor::{
        NoopProgressSink, ProgressMonitor, ProgressSink, ProgressSnapshot, RunState,
        TracingProgressSink,
    };
    pub use crate::record::{Record, TaskContext, TaskResult};
    pub use crate::scheduler::{compute_fn, BoundedScheduler, ComputeFn};
    pub use crate::worker::{Completion, WorkerPool, WorkerPoolError, WorkerPoolStats};
    pub use tokio_util::sync::CancellationToken;
}

// Re-export key types at crate root
pub use config::{ConfigError, EngineConfig};
pub use emitter::{Drain, DrainTimeout, Resequencer, ResultEmitter};
pub use engine::{RunHandle, RunSummary, TransformEngine};
pub use error::{EngineError, SubmitError, TaskFailure};
pub use monitor::{NoopProgressSink, ProgressMonitor, ProgressSink, RunState, TracingProgressSink};
pub use record::{Record, TaskContext, TaskResult};
pub use scheduler::{compute_fn, BoundedScheduler, ComputeFn};
pub use tokio_util::sync::CancellationToken;
pub use worker::{Completion, WorkerPool, WorkerPoolError, WorkerPoolStats};
