//! Error taxonomy
//!
//! Per-record failures never unwind past the engine: they become a
//! [`TaskFailure`] inside the record's result. Only construction-time
//! problems surface as [`EngineError`].

use std::time::Duration;

use serde::Serialize;

use crate::config::ConfigError;

/// Why a record produced no value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskFailure {
    /// The compute function returned an error or panicked
    #[error("compute failed: {message}")]
    Compute { message: String },

    /// The compute function did not finish before its deadline
    #[error("task exceeded its deadline of {limit:?}")]
    Timeout {
        #[serde(rename = "limit_ms", serialize_with = "serialize_millis")]
        limit: Duration,
    },

    /// No worker thread could run the task, or it vanished mid-task
    #[error("worker unavailable: {message}")]
    WorkerLost { message: String },
}

impl TaskFailure {
    /// Build a compute failure from any displayable error
    pub fn compute(message: impl Into<String>) -> Self {
        Self::Compute {
            message: message.into(),
        }
    }

    /// Build a worker failure from any displayable error
    pub fn worker_lost(message: impl Into<String>) -> Self {
        Self::WorkerLost {
            message: message.into(),
        }
    }

    /// Check if this failure came from a deadline
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Check if this failure came from the compute function itself
    pub fn is_compute(&self) -> bool {
        matches!(self, Self::Compute { .. })
    }
}

fn serialize_millis<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_u64(duration.as_millis() as u64)
}

/// Submission errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    /// Cancellation was observed; the record was not accepted
    #[error("run cancelled, record {index} was not submitted")]
    Cancelled { index: usize },

    /// The scheduler no longer accepts records
    #[error("scheduler is closed, record {index} was not submitted")]
    Closed { index: usize },
}

impl SubmitError {
    /// Index of the rejected record
    pub fn index(&self) -> usize {
        match self {
            Self::Cancelled { index } | Self::Closed { index } => *index,
        }
    }

    /// Check if the rejection was caused by cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

/// Engine construction and lifecycle errors
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Configuration rejected
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// An engine thread could not be started
    #[error("failed to spawn thread {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    /// The thread feeding records into the scheduler panicked
    #[error("record feeder panicked: {0}")]
    FeederPanicked(String),
}

/// Extract a readable message from a panic payload
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
