// Run command: transform every input line through the engine

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use rowflow_engine::{
    EngineConfig, NoopProgressSink, ProgressSink, RunState, RunSummary, TaskResult,
    TracingProgressSink, TransformEngine,
};

use crate::output::{print_summary, OutputFormat};
use crate::transform::TransformKind;

pub async fn run(
    config: EngineConfig,
    input: Option<PathBuf>,
    transform: TransformKind,
    ordered: bool,
    output: OutputFormat,
    quiet: bool,
) -> Result<()> {
    let lines = read_lines(input.as_deref())?;
    let total = lines.len();

    let sink: Arc<dyn ProgressSink> = if quiet {
        Arc::new(NoopProgressSink)
    } else {
        Arc::new(TracingProgressSink::new())
    };
    let engine = TransformEngine::from_compute_fn(config, transform.compute_fn())
        .context("Failed to create engine")?
        .with_progress_sink(sink);

    let cancel = engine.cancellation_token();
    let signal = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received interrupt, cancelling run");
            cancel.cancel();
        }
    });

    let summary = tokio::task::spawn_blocking(move || {
        let stdout = std::io::stdout();
        let mut out = BufWriter::new(stdout.lock());
        execute(&engine, lines, ordered, output, &mut out)
    })
    .await
    .context("Run task panicked")??;
    signal.abort();

    if !quiet {
        print_summary(output, &summary)?;
    }
    if summary.state == RunState::Cancelled {
        anyhow::bail!(
            "Run cancelled after {} of {} records",
            summary.submitted,
            total
        );
    }
    Ok(())
}

/// Run the engine over `lines`, streaming results to `out`
fn execute<W: Write>(
    engine: &TransformEngine<String, String>,
    lines: Vec<String>,
    ordered: bool,
    output: OutputFormat,
    out: &mut W,
) -> Result<RunSummary> {
    let total = lines.len();
    let mut handle = engine.run(lines, Some(total)).context("Failed to start run")?;

    let written = if ordered {
        write_results(out, handle.ordered(), output)
    } else {
        write_results(out, handle.results(), output)
    };
    if let Err(e) = written {
        handle.cancel();
        return Err(e.context("Failed to write results"));
    }

    handle.join().context("Run failed")
}

fn write_results<W, I>(out: &mut W, results: I, output: OutputFormat) -> Result<usize>
where
    W: Write,
    I: Iterator<Item = TaskResult<String>>,
{
    let mut count = 0;
    for result in results {
        output.write_result(out, &result)?;
        count += 1;
    }
    out.flush()?;
    Ok(count)
}

fn read_lines(path: Option<&Path>) -> Result<Vec<String>> {
    match path {
        Some(path) if path != Path::new("-") => {
            let file = File::open(path)
                .with_context(|| format!("Failed to open input: {}", path.display()))?;
            collect_lines(BufReader::new(file))
        }
        _ => collect_lines(std::io::stdin().lock()),
    }
}

fn collect_lines<R: BufRead>(reader: R) -> Result<Vec<String>> {
    reader
        .lines()
        .collect::<std::io::Result<Vec<_>>>()
        .context("Failed to read input")
}
