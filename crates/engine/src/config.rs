//! Engine configuration
//!
//! Bounds for backpressure and parallelism, plus the optional per-task deadline.

use std::num::NonZeroUsize;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Environment variable for [`EngineConfig::max_queue_size`]
pub const ENV_MAX_QUEUE_SIZE: &str = "ROWFLOW_MAX_QUEUE_SIZE";
/// Environment variable for [`EngineConfig::max_parallel_workers`]
pub const ENV_MAX_PARALLEL_WORKERS: &str = "ROWFLOW_MAX_PARALLEL_WORKERS";
/// Environment variable for [`EngineConfig::per_task_timeout`], in milliseconds
pub const ENV_TASK_TIMEOUT_MS: &str = "ROWFLOW_TASK_TIMEOUT_MS";

/// Engine configuration
///
/// # Example
///
/// ```
/// use rowflow_engine::EngineConfig;
/// use std::time::Duration;
///
/// let config = EngineConfig::default()
///     .with_max_parallel_workers(4)
///     .with_max_queue_size(16)
///     .with_per_task_timeout(Duration::from_secs(2));
///
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum tasks queued or executing at once. Submission blocks at this bound.
    pub max_queue_size: usize,

    /// Maximum tasks executing at once
    pub max_parallel_workers: usize,

    /// Wall-clock deadline per task, measured from dispatch (None = no deadline)
    #[serde(rename = "per_task_timeout_ms", with = "option_duration_millis")]
    pub per_task_timeout: Option<Duration>,

    /// How often a blocked submitter re-checks cancellation
    #[serde(rename = "cancel_poll_interval_ms", with = "duration_millis")]
    pub cancel_poll_interval: Duration,

    /// Prefix for worker and dispatcher thread names
    pub worker_name_prefix: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let workers = std::thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(4);

        Self {
            max_queue_size: workers * 2,
            max_parallel_workers: workers,
            per_task_timeout: None,
            cancel_poll_interval: Duration::from_millis(50),
            worker_name_prefix: "rowflow".to_string(),
        }
    }
}

impl EngineConfig {
    /// Create a new configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `ROWFLOW_MAX_QUEUE_SIZE`: backpressure bound
    /// - `ROWFLOW_MAX_PARALLEL_WORKERS`: concurrency cap
    /// - `ROWFLOW_TASK_TIMEOUT_MS`: per-task deadline (0 or unset = none)
    ///
    /// Unset or unparsable values fall back to [`EngineConfig::default`].
    pub fn from_env() -> Self {
        Self::default().merge_lookup(|key| std::env::var(key).ok())
    }

    /// Overlay values from a key lookup (e.g. the process environment)
    pub fn merge_lookup<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let parse = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());

        if let Some(size) = parse(ENV_MAX_QUEUE_SIZE) {
            self.max_queue_size = size as usize;
        }
        if let Some(workers) = parse(ENV_MAX_PARALLEL_WORKERS) {
            self.max_parallel_workers = workers as usize;
        }
        if let Some(ms) = parse(ENV_TASK_TIMEOUT_MS) {
            self.per_task_timeout = (ms > 0).then(|| Duration::from_millis(ms));
        }
        self
    }

    /// Set the backpressure bound
    pub fn with_max_queue_size(mut self, size: usize) -> Self {
        self.max_queue_size = size;
        self
    }

    /// Set the concurrency cap
    pub fn with_max_parallel_workers(mut self, workers: usize) -> Self {
        self.max_parallel_workers = workers;
        self
    }

    /// Set the per-task deadline
    pub fn with_per_task_timeout(mut self, timeout: Duration) -> Self {
        self.per_task_timeout = Some(timeout);
        self
    }

    /// Disable deadline enforcement
    pub fn without_timeout(mut self) -> Self {
        self.per_task_timeout = None;
        self
    }

    /// Set the cancellation re-check interval for blocked submitters
    pub fn with_cancel_poll_interval(mut self, interval: Duration) -> Self {
        self.cancel_poll_interval = interval;
        self
    }

    /// Set the thread name prefix
    pub fn with_worker_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.worker_name_prefix = prefix.into();
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_queue_size == 0 {
            return Err(ConfigError::InvalidConfig(
                "max_queue_size must be greater than zero".into(),
            ));
        }
        if self.max_parallel_workers == 0 {
            return Err(ConfigError::InvalidConfig(
                "max_parallel_workers must be greater than zero".into(),
            ));
        }
        if self.per_task_timeout == Some(Duration::ZERO) {
            return Err(ConfigError::InvalidConfig(
                "per_task_timeout must be greater than zero when set".into(),
            ));
        }
        if self.cancel_poll_interval.is_zero() {
            return Err(ConfigError::InvalidConfig(
                "cancel_poll_interval must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    /// Parallelism actually reachable: in-flight work never exceeds the queue bound
    pub fn effective_parallelism(&self) -> usize {
        self.max_parallel_workers.min(self.max_queue_size)
    }
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Invalid configuration
    #[error("invalid engine configuration: {0}")]
    InvalidConfig(String),
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Serde support for Option<Duration> as milliseconds
mod option_duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => (d.as_millis() as u64).serialize(serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis: Option<u64> = Option::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert!(config.max_parallel_workers >= 1);
        assert_eq!(config.max_queue_size, config.max_parallel_workers * 2);
        assert!(config.per_task_timeout.is_none());
        assert_eq!(config.cancel_poll_interval, Duration::from_millis(50));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = EngineConfig::new()
            .with_max_queue_size(8)
            .with_max_parallel_workers(3)
            .with_per_task_timeout(Duration::from_millis(250))
            .with_worker_name_prefix("fp");

        assert_eq!(config.max_queue_size, 8);
        assert_eq!(config.max_parallel_workers, 3);
        assert_eq!(config.per_task_timeout, Some(Duration::from_millis(250)));
        assert_eq!(config.worker_name_prefix, "fp");

        let config = config.without_timeout();
        assert!(config.per_task_timeout.is_none());
    }

    #[test]
    fn test_config_validation() {
        assert!(EngineConfig::new().with_max_queue_size(0).validate().is_err());
        assert!(EngineConfig::new()
            .with_max_parallel_workers(0)
            .validate()
            .is_err());
        assert!(EngineConfig::new()
            .with_per_task_timeout(Duration::ZERO)
            .validate()
            .is_err());
        assert!(EngineConfig::new()
            .with_cancel_poll_interval(Duration::ZERO)
            .validate()
            .is_err());
    }

    #[test]
    fn test_effective_parallelism() {
        let config = EngineConfig::new()
            .with_max_parallel_workers(8)
            .with_max_queue_size(2);
        assert_eq!(config.effective_parallelism(), 2);
    }

    #[test]
    fn test_merge_lookup() {
        let vars: HashMap<&str, &str> = HashMap::from([
            (ENV_MAX_QUEUE_SIZE, "12"),
            (ENV_MAX_PARALLEL_WORKERS, " 3 "),
            (ENV_TASK_TIMEOUT_MS, "1500"),
        ]);
        let config = EngineConfig::default().merge_lookup(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(config.max_queue_size, 12);
        assert_eq!(config.max_parallel_workers, 3);
        assert_eq!(config.per_task_timeout, Some(Duration::from_millis(1500)));
    }

    #[test]
    fn test_merge_lookup_ignores_garbage() {
        let base = EngineConfig::default().with_per_task_timeout(Duration::from_secs(1));
        let config = base.clone().merge_lookup(|k| match k {
            ENV_MAX_QUEUE_SIZE => Some("lots".to_string()),
            ENV_TASK_TIMEOUT_MS => Some("0".to_string()),
            _ => None,
        });

        assert_eq!(config.max_queue_size, base.max_queue_size);
        assert!(config.per_task_timeout.is_none());
    }

    #[test]
    fn test_config_serialization() {
        let config = EngineConfig::new()
            .with_max_queue_size(4)
            .with_max_parallel_workers(2)
            .with_per_task_timeout(Duration::from_millis(100));

        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["per_task_timeout_ms"], 100);
        assert_eq!(json["cancel_poll_interval_ms"], 50);

        let parsed: EngineConfig = serde_json::from_value(json).unwrap();
        assert_eq!(config, parsed);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let parsed: EngineConfig = serde_json::from_str(r#"{"max_parallel_workers": 5}"#).unwrap();
        assert_eq!(parsed.max_parallel_workers, 5);
        assert!(parsed.per_task_timeout.is_none());
        assert_eq!(parsed.worker_name_prefix, "rowflow");
    }
}
