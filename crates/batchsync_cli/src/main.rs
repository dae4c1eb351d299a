//! batchsync CLI
//!
//! Command-line tools for the batchsync engine.
//!
//! # Commands
//!
//! - `inspect` - Summarize a persisted ledger
//! - `staging ls` - List staged batch resources
//! - `staging verify` - Check staged resources against their checksums
//! - `demo` - Run an initial load of generated data into simulated stores

mod commands;

use clap::{Parser, Subcommand};
use commands::demo::DemoOptions;
use commands::Format;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// batchsync command-line tools.
#[derive(Parser)]
#[command(name = "batchsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Summarize a persisted ledger
    Inspect {
        /// Ledger directory
        path: PathBuf,

        /// Show per-load progress
        #[arg(short, long)]
        loads: bool,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Work with a staging directory
    Staging {
        #[command(subcommand)]
        command: StagingCommands,
    },

    /// Load generated data into simulated stores
    Demo {
        /// Number of store nodes
        #[arg(long, default_value_t = 2)]
        stores: usize,

        /// Rows per source table
        #[arg(long, default_value_t = 1000)]
        rows: usize,

        /// Maximum rows per reload batch
        #[arg(long, default_value_t = 1000)]
        max_batch_size: u64,

        /// Extraction worker threads
        #[arg(long, default_value_t = 4)]
        threads: usize,

        /// Persist the ledger in this directory
        #[arg(long)]
        ledger: Option<PathBuf>,

        /// Stage batches in this directory
        #[arg(long)]
        staging: Option<PathBuf>,

        /// Print the wire stream to stdout
        #[arg(long)]
        wire: bool,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Show version information
    Version,
}

#[derive(Subcommand)]
enum StagingCommands {
    /// List staged resources
    Ls {
        /// Staging directory
        path: PathBuf,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Verify staged resources
    Verify {
        /// Staging directory
        path: PathBuf,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Inspect { path, loads, json } => {
            commands::inspect::run(&path, loads, Format::from_json_flag(json))?
        }
        Commands::Staging { command } => match command {
            StagingCommands::Ls { path, json } => {
                commands::staging::run_list(&path, Format::from_json_flag(json))?
            }
            StagingCommands::Verify { path, json } => {
                if !commands::staging::run_verify(&path, Format::from_json_flag(json))? {
                    return Ok(ExitCode::FAILURE);
                }
            }
        },
        Commands::Demo {
            stores,
            rows,
            max_batch_size,
            threads,
            ledger,
            staging,
            wire,
            json,
        } => {
            let options = DemoOptions {
                stores,
                rows,
                max_batch_size,
                threads,
                ledger,
                staging,
                wire,
            };
            commands::demo::run(&options, Format::from_json_flag(json))?;
        }
        Commands::Version => {
            println!("batchsync CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(ExitCode::SUCCESS)
}
