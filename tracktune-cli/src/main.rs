//! tracktune CLI: run tracked demo sweeps and manage configuration.

mod commands;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// tracktune: hyperparameter sweeps logged to W&B, MLflow or Comet
#[derive(Parser, Debug)]
#[command(name = "tracktune", version, about, long_about = None)]
struct Cli {
    /// Workspace directory
    #[arg(short, long, default_value = ".", global = true)]
    workspace: PathBuf,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the demo sweep against a tracking service
    Run(RunArgs),
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Args, Debug, Clone)]
struct RunArgs {
    /// Tracking service to log to
    #[arg(short, long, value_enum, default_value_t = TrackerArg::None)]
    tracker: TrackerArg,

    /// Forward results through a logger callback, or scope a run to each trial
    #[arg(short, long, value_enum, default_value_t = ModeArg::Callback)]
    mode: ModeArg,

    /// Objective to optimize
    #[arg(long, value_enum, default_value_t = ObjectiveArg::MeanSd)]
    objective: ObjectiveArg,

    /// Repetitions of the search space
    #[arg(short = 'n', long)]
    num_samples: Option<usize>,

    /// Trials run at once
    #[arg(long)]
    max_concurrent: Option<usize>,

    /// Sampling seed
    #[arg(long)]
    seed: Option<u64>,

    /// Reports per trial
    #[arg(long, default_value_t = tracktune_core::demo::DEFAULT_ITERATIONS)]
    iterations: u64,

    /// Experiment name (also the default run group)
    #[arg(short, long)]
    experiment: Option<String>,
}

#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum TrackerArg {
    Wandb,
    Mlflow,
    Comet,
    None,
}

#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum ModeArg {
    Callback,
    Scoped,
}

#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum ObjectiveArg {
    MeanSd,
    WidthHeight,
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Create default configuration file
    Init,
    /// Show current configuration
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Set up tracing: human-readable stderr + JSON file logging
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)));

    let log_dir = directories::ProjectDirs::from("dev", "tracktune", "tracktune")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "tracktune.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let workspace = cli
        .workspace
        .canonicalize()
        .or_else(|_| std::env::current_dir())
        .unwrap_or_else(|_| PathBuf::from("."));

    commands::handle_command(cli.command, &workspace).await
}
