// Engine configuration loading
//
// Layers, lowest first: defaults, --config file, environment, flags.
// clap resolves the last two, so a flag always beats its environment variable.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use rowflow_engine::EngineConfig;

use crate::output::OutputFormat;

#[derive(Debug, Default, Clone, Args)]
pub struct EngineArgs {
    /// Maximum records queued or executing at once
    #[arg(long, global = true, env = "ROWFLOW_MAX_QUEUE_SIZE")]
    pub max_queue_size: Option<usize>,

    /// Maximum records executing at once
    #[arg(long, global = true, env = "ROWFLOW_MAX_PARALLEL_WORKERS")]
    pub max_parallel_workers: Option<usize>,

    /// Per-record deadline in milliseconds (0 disables the deadline)
    #[arg(long, global = true, env = "ROWFLOW_TASK_TIMEOUT_MS")]
    pub timeout_ms: Option<u64>,
}

impl EngineArgs {
    /// Overlay the values that were given
    pub fn apply(&self, mut config: EngineConfig) -> EngineConfig {
        if let Some(size) = self.max_queue_size {
            config = config.with_max_queue_size(size);
        }
        if let Some(workers) = self.max_parallel_workers {
            config = config.with_max_parallel_workers(workers);
        }
        match self.timeout_ms {
            Some(0) => config = config.without_timeout(),
            Some(ms) => config = config.with_per_task_timeout(Duration::from_millis(ms)),
            None => {}
        }
        config
    }
}

/// Build the effective configuration
pub fn load(path: Option<&Path>, args: &EngineArgs) -> Result<EngineConfig> {
    let base = match path {
        Some(path) => read_file(path)?,
        None => EngineConfig::default(),
    };

    let config = args.apply(base);
    config.validate().context("Invalid engine configuration")?;
    Ok(config)
}

fn read_file(path: &Path) -> Result<EngineConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse(&content, path)
}

fn parse(content: &str, path: &Path) -> Result<EngineConfig> {
    let is_json = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if is_json {
        serde_json::from_str(content)
            .with_context(|| format!("Failed to parse JSON: {}", path.display()))
    } else {
        serde_yaml::from_str(content)
            .with_context(|| format!("Failed to parse YAML: {}", path.display()))
    }
}

/// Print the effective configuration
pub fn show(config: &EngineConfig, output: OutputFormat) -> Result<()> {
    if output.is_text() {
        print!("{}", serde_yaml::to_string(config)?);
        return Ok(());
    }
    output.print_value(config)
}
