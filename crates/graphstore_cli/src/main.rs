//! graphstore CLI
//!
//! Command-line tools for graphstore database maintenance.
//!
//! # Commands
//!
//! - `inspect` - Display the manifest and per-channel files
//! - `verify` - Check every log and data file without modifying them
//! - `dump-log` - Dump transactions log entries for debugging
//! - `gc` - Run an issued garbage collection
//! - `export` - Copy the database into a new directory
//!
//! `gc` and `export` open the database and need its type descriptors,
//! given as a JSON file with `--types`.

mod commands;
mod types_file;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// graphstore command-line database tools.
#[derive(Parser)]
#[command(name = "graphstore")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the database directory
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Type descriptor file (JSON), needed to open the database
    #[arg(global = true, short, long)]
    types: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Display the manifest and per-channel file statistics
    Inspect {
        /// Show every data file
        #[arg(long)]
        files: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Verify every transactions log and data file
    Verify {
        /// Only check this channel
        #[arg(short, long)]
        channel: Option<u32>,
    },

    /// Dump transactions log entries for debugging
    DumpLog {
        /// Channel whose log to dump
        #[arg(short, long, default_value = "0")]
        channel: u32,

        /// Maximum number of entries to dump
        #[arg(short, long)]
        limit: Option<usize>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Run garbage collection until it completes or the budget runs out
    Gc {
        /// Time budget in milliseconds
        #[arg(short, long, default_value = "10000")]
        budget_ms: u64,
    },

    /// Export the database into a new directory
    Export {
        /// Target directory; must not hold a database
        target: PathBuf,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Inspect { files, format } => {
            let path = cli.path.ok_or("Database path required for inspect")?;
            commands::inspect::run(&path, files, &format)?;
        }
        Commands::Verify { channel } => {
            let path = cli.path.ok_or("Database path required for verify")?;
            commands::verify::run(&path, channel)?;
        }
        Commands::DumpLog {
            channel,
            limit,
            format,
        } => {
            let path = cli.path.ok_or("Database path required for dump-log")?;
            commands::dump_log::run(&path, channel, limit, &format)?;
        }
        Commands::Gc { budget_ms } => {
            let path = cli.path.ok_or("Database path required for gc")?;
            let types = cli.types.ok_or("Type descriptor file required for gc")?;
            commands::gc::run(&path, &types, budget_ms)?;
        }
        Commands::Export { target } => {
            let path = cli.path.ok_or("Database path required for export")?;
            let types = cli.types.ok_or("Type descriptor file required for export")?;
            commands::export::run(&path, &types, &target)?;
        }
        Commands::Version => {
            println!("graphstore CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("graphstore core v{}", graphstore_core::VERSION);
        }
    }

    Ok(())
}
