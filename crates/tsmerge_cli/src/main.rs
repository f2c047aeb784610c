//! tsmerge CLI
//!
//! Command-line tools for inspecting and repairing inner compactions.
//!
//! # Commands
//!
//! - `inspect-log` - Decode a compaction log
//! - `recover` - Resolve every leftover compaction log of a registry
//! - `compact` - Run one inner compaction
//! - `verify` - Validate every data file's sidecar and ledgers

mod commands;

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use tsmerge_core::{CompactionConfig, RegistryKey, SequenceClass};

/// tsmerge command-line compaction tools.
#[derive(Parser)]
#[command(name = "tsmerge")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Storage root, repeat for several (searched in order)
    #[arg(global = true, short, long = "root")]
    roots: Vec<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Which registry to operate on.
#[derive(Args, Debug, Clone)]
struct Scope {
    /// Logical group, e.g. root.sg
    #[arg(short, long)]
    group: String,

    /// Virtual group id
    #[arg(long, default_value = "0")]
    virtual_group: String,

    /// Time partition id
    #[arg(short, long, default_value = "0")]
    partition: i64,

    /// Operate on unsequence files
    #[arg(short, long)]
    unsequence: bool,
}

impl Scope {
    fn key(&self) -> RegistryKey {
        RegistryKey::new(
            self.group.clone(),
            self.virtual_group.clone(),
            self.partition,
            SequenceClass::from_flag(!self.unsequence),
        )
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Decode a compaction log
    InspectLog {
        /// Path to the log file
        log: PathBuf,

        /// Force the legacy text format (detected from the name otherwise)
        #[arg(short, long)]
        legacy: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Resolve every leftover compaction log of a registry
    Recover {
        #[command(flatten)]
        scope: Scope,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Run one inner compaction
    Compact {
        #[command(flatten)]
        scope: Scope,

        /// Maximum number of source files to merge
        #[arg(short, long, default_value = "10")]
        max_files: usize,

        /// Dry run - show what would be merged
        #[arg(short, long)]
        dry_run: bool,
    },

    /// Validate every data file's sidecar and ledgers
    Verify {
        #[command(flatten)]
        scope: Scope,
    },

    /// Show version information
    Version,
}

fn config(roots: &[PathBuf]) -> Result<CompactionConfig, Box<dyn std::error::Error>> {
    if roots.is_empty() {
        return Err("At least one --root is required".into());
    }
    Ok(CompactionConfig::new().data_dirs(roots.to_vec()))
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
        Commands::InspectLog {
            log,
            legacy,
            format,
        } => {
            commands::inspect_log::run(&log, legacy, &format)?;
        }
        Commands::Recover { scope, format } => {
            commands::recover::run(&config(&cli.roots)?, scope.key(), &format)?;
        }
        Commands::Compact {
            scope,
            max_files,
            dry_run,
        } => {
            let config = config(&cli.roots)?.max_source_files(max_files);
            commands::compact::run(&config, scope.key(), dry_run)?;
        }
        Commands::Verify { scope } => {
            commands::verify::run(&config(&cli.roots)?, scope.key())?;
        }
        Commands::Version => {
            println!("tsmerge CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("tsmerge Core v{}", tsmerge_core::VERSION);
        }
    }

    Ok(())
}
