//! vabc CLI
//!
//! Command-line tools for Virtual A/B partition updates.
//!
//! # Commands
//!
//! - `apply` - Turn a partition update manifest into a COW log
//! - `dump` - List the records of a COW log
//! - `version` - Show version information

mod commands;
mod manifest;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Virtual A/B COW log tools.
#[derive(Parser)]
#[command(name = "vabc")]
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
    /// Write the COW log for one partition update
    Apply {
        /// Source partition image
        #[arg(short, long)]
        source: PathBuf,

        /// New content of the install operations, concatenated in order
        #[arg(short, long)]
        data: PathBuf,

        /// Update manifest (JSON)
        #[arg(short, long)]
        manifest: PathBuf,

        /// Where to write the COW log
        #[arg(short, long, required_unless_present = "dry_run")]
        output: Option<PathBuf>,

        /// Record operations in memory instead of writing a file
        #[arg(long, conflicts_with = "resume_from")]
        dry_run: bool,

        /// Continue an interrupted log at this operation index
        #[arg(long, value_name = "LABEL")]
        resume_from: Option<u64>,
    },

    /// Dump COW log records for debugging
    Dump {
        /// COW log to read
        #[arg(short, long)]
        cow: PathBuf,

        /// Maximum number of records to dump
        #[arg(short, long)]
        limit: Option<usize>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Apply {
            source,
            data,
            manifest,
            output,
            dry_run,
            resume_from,
        } => {
            let output = if dry_run { None } else { output };
            let summary =
                commands::apply::run(&source, &data, &manifest, output.as_deref(), resume_from)?;
            summary.print();
        }
        Commands::Dump { cow, limit, format } => {
            commands::dump::run(&cow, limit, &format)?;
        }
        Commands::Version => {
            println!("vabc CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("vabc core v{}", vabc_core::VERSION);
        }
    }

    Ok(())
}
