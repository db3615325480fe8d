//! Binary log error types
//!
//! Error codes:
//! - BINLOG_APPEND_FAILED (ERROR severity)
//! - BINLOG_FSYNC_FAILED (FATAL severity)
//! - BINLOG_CORRUPTION (FATAL severity)
//! - BINLOG_LOG_DISABLED (ERROR severity)
//! - BINLOG_CACHE_FULL (ERROR severity)
//! - BINLOG_INTERRUPTED (ERROR severity)
//! - BINLOG_PRIOR_COMMIT_FAILED (ERROR severity)
//! - BINLOG_INVALID_STATE (FATAL severity)
//! - BINLOG_ENCRYPTION (FATAL severity)
//!
//! `BinlogError` is `Clone` so that a single batch failure can be handed to
//! every member of a group commit.

use std::fmt;
use std::io;
use std::sync::Arc;

/// Severity levels for binlog errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Operation fails, server continues
    Error,
    /// Logging cannot continue in this process
    Fatal,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Error => write!(f, "ERROR"),
            Severity::Fatal => write!(f, "FATAL"),
        }
    }
}

/// Binlog-specific error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinlogErrorCode {
    /// Write to the active log file failed
    AppendFailed,
    /// fsync of the active log file failed
    FsyncFailed,
    /// Log file content failed validation
    Corruption,
    /// Logging was disabled after an earlier I/O failure
    LogDisabled,
    /// Session cache exceeded its configured limit
    CacheFull,
    /// Session was killed while waiting to commit
    Interrupted,
    /// The transaction this commit depended on failed
    PriorCommitFailed,
    /// Internal invariant violated (poisoned lock, write mid-rotation)
    InvalidState,
    /// Encryption key unavailable or scheme unknown
    Encryption,
}

impl BinlogErrorCode {
    /// Returns the stable string code
    pub fn code(&self) -> &'static str {
        match self {
            BinlogErrorCode::AppendFailed => "BINLOG_APPEND_FAILED",
            BinlogErrorCode::FsyncFailed => "BINLOG_FSYNC_FAILED",
            BinlogErrorCode::Corruption => "BINLOG_CORRUPTION",
            BinlogErrorCode::LogDisabled => "BINLOG_LOG_DISABLED",
            BinlogErrorCode::CacheFull => "BINLOG_CACHE_FULL",
            BinlogErrorCode::Interrupted => "BINLOG_INTERRUPTED",
            BinlogErrorCode::PriorCommitFailed => "BINLOG_PRIOR_COMMIT_FAILED",
            BinlogErrorCode::InvalidState => "BINLOG_INVALID_STATE",
            BinlogErrorCode::Encryption => "BINLOG_ENCRYPTION",
        }
    }

    /// Returns the severity level for this error
    pub fn severity(&self) -> Severity {
        match self {
            BinlogErrorCode::AppendFailed
            | BinlogErrorCode::LogDisabled
            | BinlogErrorCode::CacheFull
            | BinlogErrorCode::Interrupted
            | BinlogErrorCode::PriorCommitFailed => Severity::Error,
            BinlogErrorCode::FsyncFailed
            | BinlogErrorCode::Corruption
            | BinlogErrorCode::InvalidState
            | BinlogErrorCode::Encryption => Severity::Fatal,
        }
    }

    /// Whether this error means the log store can no longer be written
    pub fn disables_logging(&self) -> bool {
        matches!(
            self,
            BinlogErrorCode::AppendFailed
                | BinlogErrorCode::FsyncFailed
                | BinlogErrorCode::LogDisabled
        )
    }
}

impl fmt::Display for BinlogErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Binlog error type with full context
#[derive(Debug, Clone)]
pub struct BinlogError {
    code: BinlogErrorCode,
    message: String,
    details: Option<String>,
    source: Option<Arc<io::Error>>,
}

impl BinlogError {
    fn new(code: BinlogErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
            source: None,
        }
    }

    /// Create an append failed error
    pub fn append_failed(message: impl Into<String>, source: io::Error) -> Self {
        Self {
            source: Some(Arc::new(source)),
            ..Self::new(BinlogErrorCode::AppendFailed, message)
        }
    }

    /// Create an fsync failed error
    pub fn fsync_failed(message: impl Into<String>, source: io::Error) -> Self {
        Self {
            source: Some(Arc::new(source)),
            ..Self::new(BinlogErrorCode::FsyncFailed, message)
        }
    }

    /// Create a corruption error
    pub fn corruption(message: impl Into<String>) -> Self {
        Self::new(BinlogErrorCode::Corruption, message)
    }

    /// Create a corruption error with file and byte offset context
    pub fn corruption_at(file: &str, offset: u64, reason: impl Into<String>) -> Self {
        Self {
            details: Some(format!("file: {}, byte_offset: {}", file, offset)),
            ..Self::new(BinlogErrorCode::Corruption, reason)
        }
    }

    /// Logging was disabled earlier in this process
    pub fn log_disabled(reason: impl Into<String>) -> Self {
        Self::new(BinlogErrorCode::LogDisabled, reason)
    }

    /// Session cache limit exceeded
    pub fn cache_full(limit: usize) -> Self {
        Self {
            details: Some(format!("max_cache_size: {}", limit)),
            ..Self::new(
                BinlogErrorCode::CacheFull,
                "transaction cache exceeded its size limit",
            )
        }
    }

    /// Commit wait interrupted by kill
    pub fn interrupted(message: impl Into<String>) -> Self {
        Self::new(BinlogErrorCode::Interrupted, message)
    }

    /// The commit this one waited for did not succeed
    pub fn prior_commit_failed(message: impl Into<String>) -> Self {
        Self::new(BinlogErrorCode::PriorCommitFailed, message)
    }

    /// Internal invariant violated
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::new(BinlogErrorCode::InvalidState, message)
    }

    /// Encryption setup or key lookup failed
    pub fn encryption(message: impl Into<String>) -> Self {
        Self::new(BinlogErrorCode::Encryption, message)
    }

    /// Generic I/O failure outside the append/fsync paths (open, index, header)
    pub fn io(message: impl Into<String>, source: io::Error) -> Self {
        Self::append_failed(message, source)
    }

    /// Attach details to an existing error
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// Returns the error code
    pub fn code(&self) -> BinlogErrorCode {
        self.code
    }

    /// Returns the severity level
    pub fn severity(&self) -> Severity {
        self.code.severity()
    }

    /// Returns the error message
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns additional error details
    pub fn details(&self) -> Option<&str> {
        self.details.as_deref()
    }

    /// Returns whether this error is fatal
    pub fn is_fatal(&self) -> bool {
        self.severity() == Severity::Fatal
    }
}

impl fmt::Display for BinlogError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {}: {}",
            self.code.severity(),
            self.code.code(),
            self.message
        )?;
        if let Some(ref details) = self.details {
            write!(f, " ({})", details)?;
        }
        if let Some(ref source) = self.source {
            write!(f, " (caused by: {})", source)?;
        }
        Ok(())
    }
}

impl std::error::Error for BinlogError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

impl<T> From<std::sync::PoisonError<T>> for BinlogError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        BinlogError::invalid_state("lock poisoned by a panicking thread")
    }
}

/// Result type for binlog operations
pub type BinlogResult<T> = Result<T, BinlogError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(BinlogErrorCode::AppendFailed.code(), "BINLOG_APPEND_FAILED");
        assert_eq!(BinlogErrorCode::FsyncFailed.code(), "BINLOG_FSYNC_FAILED");
        assert_eq!(BinlogErrorCode::Corruption.code(), "BINLOG_CORRUPTION");
        assert_eq!(BinlogErrorCode::LogDisabled.code(), "BINLOG_LOG_DISABLED");
    }

    #[test]
    fn test_fsync_failed_is_fatal() {
        let err = BinlogError::fsync_failed("fsync failed", io::Error::other("disk error"));
        assert!(err.is_fatal());
        assert!(err.code().disables_logging());
    }

    #[test]
    fn test_append_failed_is_not_fatal() {
        let err = BinlogError::append_failed("write failed", io::Error::other("disk full"));
        assert!(!err.is_fatal());
        assert!(err.code().disables_logging());
    }

    #[test]
    fn test_cache_full_does_not_disable_logging() {
        assert!(!BinlogErrorCode::CacheFull.disables_logging());
        assert!(!BinlogErrorCode::Interrupted.disables_logging());
    }

    #[test]
    fn test_clone_shares_source() {
        let err = BinlogError::append_failed("write failed", io::Error::other("disk full"));
        let shared = err.clone();
        assert_eq!(format!("{}", err), format!("{}", shared));
        assert!(std::error::Error::source(&shared).is_some());
    }

    #[test]
    fn test_error_display_contains_required_fields() {
        let err = BinlogError::corruption_at("binlog.000003", 42, "checksum mismatch");
        let display = format!("{}", err);
        assert!(display.contains("BINLOG_CORRUPTION"));
        assert!(display.contains("FATAL"));
        assert!(display.contains("checksum mismatch"));
        assert!(display.contains("byte_offset: 42"));
        assert!(display.contains("binlog.000003"));
    }
}
