// Output formatting for CLI

use std::io::Write;

use anyhow::Result;
use rowflow_engine::{RunSummary, TaskResult};
use serde::Serialize;

/// Printed in place of a value for records that produced none
pub const MISSING_MARKER: &str = "?";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
    Yaml,
}

impl OutputFormat {
    pub fn from_str(s: &str) -> Self {
        match s {
            "json" => OutputFormat::Json,
            "yaml" => OutputFormat::Yaml,
            _ => OutputFormat::Text,
        }
    }

    pub fn print_value<T: Serialize>(&self, value: &T) -> Result<()> {
        match self {
            OutputFormat::Json => {
                println!("{}", serde_json::to_string_pretty(value)?);
            }
            OutputFormat::Yaml => {
                println!("{}", serde_yaml::to_string(value)?);
            }
            OutputFormat::Text => {
                // Text format is handled by each command
            }
        }
        Ok(())
    }

    pub fn is_text(&self) -> bool {
        matches!(self, OutputFormat::Text)
    }

    /// Write one result line
    ///
    /// Text is `index<TAB>value`, JSON is one object per line, and YAML is one
    /// `---` document per result, so every format can be streamed.
    pub fn write_result<W: Write>(&self, out: &mut W, result: &TaskResult<String>) -> Result<()> {
        match self {
            OutputFormat::Text => {
                let value = result.value().map(String::as_str).unwrap_or(MISSING_MARKER);
                writeln!(out, "{}\t{}", result.index, value)?;
            }
            OutputFormat::Json => {
                writeln!(out, "{}", serde_json::to_string(&ResultLine::from(result))?)?;
            }
            OutputFormat::Yaml => {
                write!(out, "---\n{}", serde_yaml::to_string(&ResultLine::from(result))?)?;
            }
        }
        Ok(())
    }
}

#[derive(Serialize)]
struct ResultLine<'a> {
    index: usize,
    value: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<'a> From<&'a TaskResult<String>> for ResultLine<'a> {
    fn from(result: &'a TaskResult<String>) -> Self {
        Self {
            index: result.index,
            value: result.value().map(String::as_str).unwrap_or(MISSING_MARKER),
            error: result.failure_reason().map(ToString::to_string),
        }
    }
}

/// Print a simple key-value pair for text output
pub fn print_field(label: &str, value: &str) {
    eprintln!("{:<14} {}", format!("{}:", label), value);
}

/// Print the run summary to stderr
pub fn print_summary(format: OutputFormat, summary: &RunSummary) -> Result<()> {
    match format {
        OutputFormat::Text => {
            print_field("Run", &summary.run_id.to_string());
            print_field("State", &format!("{:?}", summary.state));
            print_field("Submitted", &summary.submitted.to_string());
            print_field("Succeeded", &summary.succeeded.to_string());
            print_field("Failed", &summary.failed.to_string());
            print_field("Timed out", &summary.timed_out.to_string());
            print_field("Workers", &summary.workers.spawned.to_string());
            print_field("Elapsed", &format!("{}ms", summary.elapsed.as_millis()));
        }
        OutputFormat::Json => {
            eprintln!("{}", serde_json::to_string(summary)?);
        }
        OutputFormat::Yaml => {
            eprint!("---\n{}", serde_yaml::to_string(summary)?);
        }
    }
    Ok(())
}
