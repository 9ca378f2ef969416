//! Records, results, and the per-task execution context

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::TaskFailure;

/// One input unit, tagged with its position in the original sequence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record<T> {
    /// Position in the input sequence (0-based)
    pub index: usize,
    /// Caller-owned payload, passed to the compute function untouched
    pub value: T,
}

impl<T> Record<T> {
    /// Create a new record
    pub fn new(index: usize, value: T) -> Self {
        Self { index, value }
    }
}

/// Outcome of one submitted record
///
/// Produced exactly once per submission. Results arrive in completion order;
/// `index` restores input order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskResult<V> {
    /// Index of the record this result belongs to
    pub index: usize,
    /// Computed value or the reason there is none
    pub outcome: Result<V, TaskFailure>,
}

impl<V> TaskResult<V> {
    /// Successful result
    pub fn success(index: usize, value: V) -> Self {
        Self {
            index,
            outcome: Ok(value),
        }
    }

    /// Failed result
    pub fn failure(index: usize, failure: TaskFailure) -> Self {
        Self {
            index,
            outcome: Err(failure),
        }
    }

    /// Check if a value was produced
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    /// Borrow the value, if any
    pub fn value(&self) -> Option<&V> {
        self.outcome.as_ref().ok()
    }

    /// Borrow the failure, if any
    pub fn failure_reason(&self) -> Option<&TaskFailure> {
        self.outcome.as_ref().err()
    }

    /// Take the value, mapping failures to the "missing" marker `None`
    pub fn into_value(self) -> Option<V> {
        self.outcome.ok()
    }
}

/// Context handed to the compute function for one task
///
/// The token is private to this task and is cancelled only when the task's
/// deadline expires; run-level cancellation never interrupts a running task.
/// Long computations should poll [`TaskContext::is_cancelled`] so an
/// abandoned worker thread exits promptly.
#[derive(Debug, Clone)]
pub struct TaskContext {
    index: usize,
    token: CancellationToken,
    started_at: Instant,
    deadline: Option<Instant>,
}

impl TaskContext {
    /// Create a context for the record at `index`, starting its clock now
    pub fn new(index: usize, token: CancellationToken, timeout: Option<Duration>) -> Self {
        let started_at = Instant::now();
        Self {
            index,
            token,
            started_at,
            deadline: timeout.map(|t| started_at + t),
        }
    }

    /// Index of the record being computed
    pub fn index(&self) -> usize {
        self.index
    }

    /// Check if the engine has given up on this task
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// The task's cancellation token
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.token
    }

    /// Time since dispatch
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Time left before the deadline (None = no deadline)
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_accessors() {
        let ok: TaskResult<u32> = TaskResult::success(3, 42);
        assert!(ok.is_success());
        assert_eq!(ok.value(), Some(&42));
        assert!(ok.failure_reason().is_none());
        assert_eq!(ok.into_value(), Some(42));

        let failed: TaskResult<u32> = TaskResult::failure(4, TaskFailure::compute("nope"));
        assert!(!failed.is_success());
        assert!(failed.value().is_none());
        assert!(failed.failure_reason().unwrap().is_compute());
        assert_eq!(failed.into_value(), None);
    }

    #[test]
    fn test_context_cancellation() {
        let token = CancellationToken::new();
        let ctx = TaskContext::new(9, token.clone(), None);

        assert_eq!(ctx.index(), 9);
        assert!(!ctx.is_cancelled());
        assert!(ctx.remaining().is_none());

        token.cancel();
        assert!(ctx.is_cancelled());
    }

    #[test]
    fn test_context_remaining() {
        let ctx = TaskContext::new(0, CancellationToken::new(), Some(Duration::from_secs(60)));
        let remaining = ctx.remaining().unwrap();
        assert!(remaining > Duration::from_secs(50));
        assert!(remaining <= Duration::from_secs(60));
    }
}
