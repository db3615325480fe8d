//! Command-line administration for a binlog directory
//!
//! - init: create the data directory and first log file
//! - list: show indexed files
//! - dump: print one file's records
//! - recover: dry-run crash recovery
//! - purge: delete old files

mod args;
mod commands;
mod errors;
mod io;

pub use args::{Cli, Command};
pub use commands::{dump, init, list, purge, recover, run, run_command};
pub use errors::{CliError, CliErrorCode, CliResult};
pub use io::{write_line, write_response};
