//! CLI argument definitions using clap
//!
//! Commands:
//! - binlog init --config <path>
//! - binlog list --config <path>
//! - binlog dump --config <path> [--file <name>]
//! - binlog recover --config <path>
//! - binlog purge --config <path> --to <name>

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// binlog - crash-recoverable binary log administration
#[derive(Parser, Debug)]
#[command(name = "binlog")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create the data directory and the first log file
    Init {
        /// Path to configuration file
        #[arg(long, default_value = "./binlog.json")]
        config: PathBuf,
    },

    /// List indexed log files
    List {
        /// Path to configuration file
        #[arg(long, default_value = "./binlog.json")]
        config: PathBuf,
    },

    /// Print the records of one log file as JSON lines
    Dump {
        /// Path to configuration file
        #[arg(long, default_value = "./binlog.json")]
        config: PathBuf,

        /// File to dump (defaults to the last indexed file)
        #[arg(long)]
        file: Option<String>,
    },

    /// Report what crash recovery would do, without changing anything
    Recover {
        /// Path to configuration file
        #[arg(long, default_value = "./binlog.json")]
        config: PathBuf,
    },

    /// Delete every log file before the named one
    Purge {
        /// Path to configuration file
        #[arg(long, default_value = "./binlog.json")]
        config: PathBuf,

        /// First file to keep
        #[arg(long)]
        to: String,
    },
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}
