// Rowflow CLI
//
// Design Decision: Use clap derive for ergonomic argument parsing.
// Design Decision: Support text/json/yaml output formats for scripting.
// Design Decision: Logs and progress go to stderr so stdout stays pipeable.
// Design Decision: The engine runs on plain threads; tokio only watches for Ctrl-C.

mod commands;
mod output;
mod transform;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "rowflow")]
#[command(about = "Rowflow CLI - Apply a transform to every line of an input in parallel")]
#[command(version)]
pub struct Cli {
    /// Output format
    #[arg(long, short, global = true, default_value = "text", value_parser = ["text", "json", "yaml"])]
    pub output: String,

    /// Suppress progress and non-essential output
    #[arg(long, short, global = true)]
    pub quiet: bool,

    /// Engine configuration file (YAML or JSON)
    #[arg(long, short, global = true, env = "ROWFLOW_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(flatten)]
    pub engine: commands::config::EngineArgs,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Transform every line of the input
    Run {
        /// Input file, one record per line (default: stdin)
        #[arg(long, short)]
        input: Option<PathBuf>,

        /// Transform to apply
        #[arg(long, short, value_enum, default_value = "fingerprint")]
        transform: transform::TransformKind,

        /// Print results in input order instead of completion order
        #[arg(long)]
        ordered: bool,
    },

    /// Print the effective engine configuration
    Config,
}

fn init_tracing(quiet: bool) {
    let default_filter = if quiet {
        "rowflow=warn,rowflow_engine=warn"
    } else {
        "rowflow=info,rowflow_engine=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.quiet);

    let output_format = output::OutputFormat::from_str(&cli.output);
    let config = commands::config::load(cli.config.as_deref(), &cli.engine)?;

    match cli.command {
        Commands::Run {
            input,
            transform,
            ordered,
        } => {
            commands::run::run(
                config,
                input,
                transform,
                ordered,
                output_format,
                cli.quiet,
            )
            .await
        }
        Commands::Config => commands::config::show(&config, output_format),
    }
}
