//! lorapatch CLI
//!
//! Inspect low-rank adapter files and merge them into dense checkpoints.

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use lorapatch_cli::commands::{InspectCommand, MergeCommand};
use lorapatch_cli::config::{CliConfig, ConfigBuilder};
use std::path::PathBuf;
use tracing::error;

const DEFAULT_CONFIG: &str = "lorapatch.toml";

/// lorapatch - runtime low-rank adapter tools
#[derive(Parser)]
#[command(name = "lorapatch")]
#[command(about = "Inspect and merge low-rank adapters")]
#[command(long_about = r#"
Tools around the lorapatch adapter engine.

Examples:
  # List the pairs an adapter holds
  lorapatch inspect style.safetensors

  # Same, as JSON
  lorapatch inspect style.safetensors --json

  # Merge an adapter into a dense checkpoint
  lorapatch merge --model base.safetensors --adapter style.safetensors --scale 0.8 --output merged.safetensors
"#)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    /// Device to use (cpu, cuda, cuda:N)
    #[arg(short, long, value_name = "DEVICE", global = true)]
    device: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, value_name = "LEVEL", global = true)]
    log_level: Option<String>,

    /// Log format (pretty, compact, json)
    #[arg(long, value_name = "FORMAT", global = true)]
    log_format: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the LoRA pairs in an adapter file
    Inspect(InspectCommand),

    /// Merge an adapter into model weights
    Merge(MergeCommand),
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_configuration(&cli)?;
    setup_logging(&config);

    let result = match cli.command {
        Some(Commands::Inspect(cmd)) => cmd.execute(&config),
        Some(Commands::Merge(cmd)) => cmd.execute(&config),
        None => {
            Cli::command().print_help()?;
            Ok(())
        }
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        for cause in e.chain().skip(1) {
            error!("  Caused by: {}", cause);
        }
        std::process::exit(1);
    }

    Ok(())
}

/// Load configuration from file and merge with CLI arguments.
///
/// A missing file means defaults; an unreadable or malformed one is an error.
fn load_configuration(cli: &Cli) -> Result<CliConfig> {
    let path = cli.config.clone().unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG));
    ConfigBuilder::from_file(&path)?
        .device(cli.device.clone())
        .log_level(cli.log_level.clone())
        .log_format(cli.log_format.clone())
        .build()
        .context("Failed to build configuration")
}

/// Setup logging based on configuration; `RUST_LOG` wins over the configured level
fn setup_logging(config: &CliConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));

    let subscriber =
        tracing_subscriber::fmt().with_env_filter(filter).with_target(false).with_writer(std::io::stderr);

    match (config.logging.format.as_str(), config.logging.timestamps) {
        ("json", _) => subscriber.json().with_timer(tracing_subscriber::fmt::time::uptime()).init(),
        ("compact", true) => subscriber.compact().init(),
        ("compact", false) => subscriber.compact().without_time().init(),
        (_, true) => subscriber.pretty().init(),
        (_, false) => subscriber.pretty().without_time().init(),
    }
}
