//! CLI-specific error types
//!
//! Every CLI error ends the process with a non-zero exit.

use std::fmt;
use std::io;

use crate::binlog::BinlogError;
use crate::config::ConfigError;
use crate::recovery::RecoveryError;
use crate::service::ServiceError;

/// CLI error codes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CliErrorCode {
    /// Configuration file error
    ConfigError,
    /// I/O error (stdout)
    IoError,
    /// Already initialized
    AlreadyInitialized,
    /// Not initialized
    NotInitialized,
    /// Log was not shut down cleanly
    NeedsRecovery,
    /// Log store operation failed
    LogError,
}

impl CliErrorCode {
    /// Get the error code string
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConfigError => "BINLOG_CLI_CONFIG_ERROR",
            Self::IoError => "BINLOG_CLI_IO_ERROR",
            Self::AlreadyInitialized => "BINLOG_CLI_ALREADY_INITIALIZED",
            Self::NotInitialized => "BINLOG_CLI_NOT_INITIALIZED",
            Self::NeedsRecovery => "BINLOG_CLI_NEEDS_RECOVERY",
            Self::LogError => "BINLOG_CLI_LOG_ERROR",
        }
    }
}

/// CLI error
#[derive(Debug)]
pub struct CliError {
    code: CliErrorCode,
    message: String,
}

impl CliError {
    pub fn new(code: CliErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::ConfigError, msg)
    }

    pub fn io_error(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::IoError, msg)
    }

    pub fn already_initialized() -> Self {
        Self::new(
            CliErrorCode::AlreadyInitialized,
            "Data directory already holds a binlog index",
        )
    }

    pub fn not_initialized() -> Self {
        Self::new(
            CliErrorCode::NotInitialized,
            "No binlog index found. Run 'binlog init' first.",
        )
    }

    pub fn needs_recovery(file: &str) -> Self {
        Self::new(
            CliErrorCode::NeedsRecovery,
            format!("{} is still marked in use; start the service to recover it first", file),
        )
    }

    pub fn log_error(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::LogError, msg)
    }

    pub fn code(&self) -> &CliErrorCode {
        &self.code
    }

    pub fn code_str(&self) -> &'static str {
        self.code.code()
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code.code(), self.message)
    }
}

impl std::error::Error for CliError {}

impl From<io::Error> for CliError {
    fn from(e: io::Error) -> Self {
        Self::io_error(e.to_string())
    }
}

impl From<serde_json::Error> for CliError {
    fn from(e: serde_json::Error) -> Self {
        Self::io_error(format!("JSON error: {}", e))
    }
}

impl From<ConfigError> for CliError {
    fn from(e: ConfigError) -> Self {
        Self::config_error(e.to_string())
    }
}

impl From<BinlogError> for CliError {
    fn from(e: BinlogError) -> Self {
        Self::log_error(e.to_string())
    }
}

impl From<RecoveryError> for CliError {
    fn from(e: RecoveryError) -> Self {
        Self::log_error(e.to_string())
    }
}

impl From<ServiceError> for CliError {
    fn from(e: ServiceError) -> Self {
        match e {
            ServiceError::Config(e) => e.into(),
            other => Self::log_error(other.to_string()),
        }
    }
}

/// CLI result type
pub type CliResult<T> = Result<T, CliError>;
