use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

use commands::{handle_ingest, handle_watch};

#[derive(Parser)]
#[command(name = "scingest")]
#[command(about = "scingest - watches beamtime directories and ingests datasets into SciCat", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch the configured beamtime directories until interrupted
    Watch {
        /// Path to the YAML configuration file
        #[arg(short, long, env = "SCINGEST_CONFIG")]
        config: PathBuf,

        /// Stop after this many seconds instead of waiting for a signal
        #[arg(short = 'r', long)]
        runtime: Option<u64>,

        /// Log level (error, warn, info, debug, trace)
        #[arg(short, long)]
        log: Option<String>,
    },

    /// Ingest every dataset found right now, then exit
    Ingest {
        /// Path to the YAML configuration file
        #[arg(short, long, env = "SCINGEST_CONFIG")]
        config: PathBuf,

        /// Log level (error, warn, info, debug, trace)
        #[arg(short, long)]
        log: Option<String>,
    },
}

/// `RUST_LOG` wins over `--log`; without either we log at info.
fn filter_directives(env: Option<String>, level: Option<&str>) -> String {
    env.filter(|directives| !directives.trim().is_empty())
        .or_else(|| level.map(str::to_string))
        .unwrap_or_else(|| "info".to_string())
}

fn init_logging(level: Option<&str>) {
    let directives = filter_directives(std::env::var(EnvFilter::DEFAULT_ENV).ok(), level);
    let filter = EnvFilter::try_new(&directives).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_names(true)
        .with_level(true)
        .compact()
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Watch {
            config,
            runtime,
            log,
        } => {
            init_logging(log.as_deref());
            handle_watch(&config, runtime).await
        }
        Commands::Ingest { config, log } => {
            init_logging(log.as_deref());
            handle_ingest(&config).await
        }
    }
}
