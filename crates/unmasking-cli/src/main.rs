//! `unmasking` command-line interface.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{info, warn, Level};

use unmasking_core::telemetry::{init_tracing, LogFormat};
use unmasking_core::{JobConfig, JobEngine, UnmaskingError};

#[derive(Parser)]
#[command(name = "unmasking", version = unmasking_core::VERSION)]
#[command(about = "Authorship verification through unmasking experiments")]
struct Cli {
    /// Enable debug logging
    #[arg(long, global = true)]
    verbose: bool,

    /// Emit newline-delimited JSON log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run an unmasking job described by a JSON job configuration
    Run {
        /// Job configuration file
        config: PathBuf,

        /// Directory the job output directory is created under
        #[arg(short, long, default_value = "out")]
        output: PathBuf,
    },

    /// Aggregate previously saved curve result files
    Aggregate {
        /// Result JSON files to aggregate
        #[arg(required = true)]
        inputs: Vec<PathBuf>,

        /// Optional job configuration naming the aggregators
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Directory aggregated results are written to
        #[arg(short, long, default_value = "out")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let format = if cli.json { LogFormat::Json } else { LogFormat::Text };
    init_tracing(format, level);

    let engine = JobEngine::new();
    let cancel = engine.cancel_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, letting in-flight work wind down");
            cancel.set();
        }
    });

    match cli.command {
        Command::Run { config, output } => {
            let job = JobConfig::from_file(&config)
                .with_context(|| format!("reading job configuration {}", config.display()))?;
            match engine.run(&job, &output).await {
                Ok(job_dir) => {
                    info!(output_dir = %job_dir.display(), "run complete");
                    Ok(())
                }
                Err(UnmaskingError::Interrupted) => {
                    warn!("job interrupted");
                    std::process::exit(130);
                }
                Err(err) => Err(err.into()),
            }
        }
        Command::Aggregate {
            inputs,
            config,
            output,
        } => {
            let job = match config {
                Some(path) => JobConfig::from_file(&path)
                    .with_context(|| format!("reading job configuration {}", path.display()))?,
                None => JobConfig::from_value(serde_json::json!({
                    "job": { "aggregators": [{ "name": "curve_average" }] }
                })),
            };
            let written = engine.aggregate(&inputs, &job, &output).await?;
            for path in &written {
                info!(path = %path.display(), "aggregate written");
            }
            Ok(())
        }
    }
}
