//! Progress tracking and cooperative cancellation
//!
//! The monitor owns the run's counters and its state machine:
//!
//! ```text
//! Running ──(token observed)──▶ Cancelling ──(nothing in flight)──▶ Cancelled
//!    │
//!    └──(input closed, finished == submitted)──▶ Completed
//! ```
//!
//! Cancellation is only observed between task completions and on submission;
//! tasks already running are never interrupted by it.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::{panic_message, TaskFailure};

/// Receiver of progress notifications
///
/// Called from dispatcher threads after every completion, so implementations
/// must be cheap and must not block.
pub trait ProgressSink: Send + Sync {
    /// Report overall progress in `[0.0, 1.0]` with a human-readable message
    fn report_progress(&self, fraction: f64, message: &str);
}

impl<F> ProgressSink for F
where
    F: Fn(f64, &str) + Send + Sync,
{
    fn report_progress(&self, fraction: f64, message: &str) {
        self(fraction, message)
    }
}

/// Discards progress
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProgressSink;

impl ProgressSink for NoopProgressSink {
    fn report_progress(&self, _fraction: f64, _message: &str) {}
}

/// Logs progress through `tracing`, once per whole-percent step
#[derive(Debug, Default)]
pub struct TracingProgressSink {
    // Last logged percentage + 1 (0 = nothing logged yet)
    last_step: AtomicU64,
}

impl TracingProgressSink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProgressSink for TracingProgressSink {
    fn report_progress(&self, fraction: f64, message: &str) {
        let step = (fraction.clamp(0.0, 1.0) * 100.0).floor() as u64 + 1;
        if self.last_step.fetch_max(step, Ordering::Relaxed) < step {
            info!(percent = step - 1, "{}", message);
        }
    }
}

/// Run lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Accepting submissions
    Running,
    /// Cancellation observed; in-flight tasks are finishing
    Cancelling,
    /// Cancelled and drained (terminal)
    Cancelled,
    /// Every submitted record has a result (terminal)
    Completed,
}

impl RunState {
    /// Check if the state can no longer change
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Completed)
    }
}

/// Point-in-time view of a run's progress
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    pub state: RunState,
    pub total_expected: Option<usize>,
    pub submitted: usize,
    pub active: usize,
    pub finished: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub fraction: f64,
}

impl ProgressSnapshot {
    /// Records accepted but not yet finished (queued + active)
    pub fn in_flight(&self) -> usize {
        self.submitted.saturating_sub(self.finished)
    }
}

#[derive(Debug)]
struct Lifecycle {
    state: RunState,
    input_closed: bool,
}

/// Counters, progress reporting, and cancellation for one run
pub struct ProgressMonitor {
    total_expected: Option<usize>,
    submitted: AtomicUsize,
    active: AtomicUsize,
    finished: AtomicUsize,
    succeeded: AtomicUsize,
    failed: AtomicUsize,
    timed_out: AtomicUsize,
    cancel: CancellationToken,
    lifecycle: Mutex<Lifecycle>,
    sink: Arc<dyn ProgressSink>,
}

impl ProgressMonitor {
    /// Create a monitor
    ///
    /// `total_expected` is the progress denominator; when unknown, progress is
    /// measured against records submitted so far.
    pub fn new(
        total_expected: Option<usize>,
        cancel: CancellationToken,
        sink: Arc<dyn ProgressSink>,
    ) -> Self {
        Self {
            total_expected,
            submitted: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            finished: AtomicUsize::new(0),
            succeeded: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            timed_out: AtomicUsize::new(0),
            cancel,
            lifecycle: Mutex::new(Lifecycle {
                state: RunState::Running,
                input_closed: false,
            }),
            sink,
        }
    }

    /// The external cancellation token this monitor observes
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Observe the cancellation token
    ///
    /// Returns true once cancellation has been observed for this run. A run
    /// that already completed stays completed.
    pub fn check_cancelled(&self) -> bool {
        let mut lifecycle = self.lifecycle.lock();
        self.advance(&mut lifecycle);
        matches!(
            lifecycle.state,
            RunState::Cancelling | RunState::Cancelled
        )
    }

    /// Count a submission, unless cancellation has been observed
    ///
    /// The check and the increment are atomic with respect to state changes,
    /// so no record is accepted after the run reaches a terminal state.
    pub fn try_begin_submit(&self) -> bool {
        let mut lifecycle = self.lifecycle.lock();
        self.advance(&mut lifecycle);
        if lifecycle.state != RunState::Running || lifecycle.input_closed {
            return false;
        }
        self.submitted.fetch_add(1, Ordering::AcqRel);
        true
    }

    /// Undo a submission that could not be enqueued
    pub fn abort_submit(&self) {
        let mut lifecycle = self.lifecycle.lock();
        self.submitted.fetch_sub(1, Ordering::AcqRel);
        self.advance(&mut lifecycle);
    }

    /// A queued task was handed to a worker
    pub fn on_started(&self) {
        self.active.fetch_add(1, Ordering::AcqRel);
    }

    /// A task produced its result; updates counters and reports progress
    ///
    /// Returns the new progress fraction.
    pub fn on_finished(&self, failure: Option<&TaskFailure>) -> f64 {
        let finished = {
            let mut lifecycle = self.lifecycle.lock();
            self.active.fetch_sub(1, Ordering::AcqRel);
            let finished = self.finished.fetch_add(1, Ordering::AcqRel) + 1;
            match failure {
                None => self.succeeded.fetch_add(1, Ordering::Relaxed),
                Some(f) if f.is_timeout() => self.timed_out.fetch_add(1, Ordering::Relaxed),
                Some(_) => self.failed.fetch_add(1, Ordering::Relaxed),
            };
            self.advance(&mut lifecycle);
            finished
        };

        let fraction = self.fraction();
        let message = match self.total_expected {
            Some(total) => format!("processed {} of {} records", finished, total),
            None => format!("processed {} records", finished),
        };
        self.report(fraction, &message);
        fraction
    }

    /// Call the sink; a panicking sink is logged and otherwise ignored
    fn report(&self, fraction: f64, message: &str) {
        let reported = panic::catch_unwind(AssertUnwindSafe(|| {
            self.sink.report_progress(fraction, message)
        }));
        if let Err(payload) = reported {
            error!(
                panic = %panic_message(payload.as_ref()),
                "Progress sink panicked, report dropped"
            );
        }
    }

    /// No further submissions will arrive
    pub fn close_input(&self) {
        let mut lifecycle = self.lifecycle.lock();
        lifecycle.input_closed = true;
        self.advance(&mut lifecycle);
    }

    /// Current state
    pub fn state(&self) -> RunState {
        self.lifecycle.lock().state
    }

    /// Finished records over the expected total, in `[0.0, 1.0]`
    pub fn fraction(&self) -> f64 {
        let finished = self.finished.load(Ordering::Acquire);
        let denominator = self
            .total_expected
            .unwrap_or_else(|| self.submitted.load(Ordering::Acquire));

        if denominator == 0 {
            return if self.state() == RunState::Completed {
                1.0
            } else {
                0.0
            };
        }
        (finished as f64 / denominator as f64).min(1.0)
    }

    /// Snapshot of all counters
    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            state: self.state(),
            total_expected: self.total_expected,
            submitted: self.submitted.load(Ordering::Acquire),
            active: self.active.load(Ordering::Acquire),
            finished: self.finished.load(Ordering::Acquire),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            fraction: self.fraction(),
        }
    }

    fn advance(&self, lifecycle: &mut Lifecycle) {
        if lifecycle.state.is_terminal() {
            return;
        }

        if lifecycle.state == RunState::Running && self.cancel.is_cancelled() {
            info!("Cancellation observed, no further records will be accepted");
            lifecycle.state = RunState::Cancelling;
        }

        let drained =
            self.finished.load(Ordering::Acquire) == self.submitted.load(Ordering::Acquire);
        if !drained {
            return;
        }

        match lifecycle.state {
            RunState::Cancelling => {
                info!("Cancelled run drained");
                lifecycle.state = RunState::Cancelled;
            }
            RunState::Running if lifecycle.input_closed => {
                lifecycle.state = RunState::Completed;
            }
            _ => {}
        }
    }
}
