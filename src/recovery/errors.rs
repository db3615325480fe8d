//! Recovery errors
//!
//! Every recovery error aborts startup; there is no partial-service mode.

use std::fmt;

use crate::binlog::BinlogError;
use crate::engine::EngineError;
use crate::tc::TcError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Fatal,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Fatal => write!(f, "FATAL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryErrorCode {
    /// Damaged record before a file's expected end
    Corruption,
    /// Engines report more prepared branches than the log accounts for
    XidMismatch,
    /// Prepared transactions exist but there is no log to decide them
    NoLog,
    /// Index and files on disk disagree
    IndexInconsistent,
    /// An engine failed to report, commit or roll back
    EngineFailed,
    /// Truncation would discard an effect that cannot be undone
    TruncationConflict,
    /// Any other failure
    Failed,
}

impl RecoveryErrorCode {
    pub fn code(&self) -> &'static str {
        match self {
            RecoveryErrorCode::Corruption => "RECOVERY_CORRUPTION",
            RecoveryErrorCode::XidMismatch => "RECOVERY_XID_MISMATCH",
            RecoveryErrorCode::NoLog => "RECOVERY_NO_LOG",
            RecoveryErrorCode::IndexInconsistent => "RECOVERY_INDEX_INCONSISTENT",
            RecoveryErrorCode::EngineFailed => "RECOVERY_ENGINE_FAILED",
            RecoveryErrorCode::TruncationConflict => "RECOVERY_TRUNCATION_CONFLICT",
            RecoveryErrorCode::Failed => "RECOVERY_FAILED",
        }
    }

    pub fn severity(&self) -> Severity {
        Severity::Fatal
    }
}

impl fmt::Display for RecoveryErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

#[derive(Debug)]
pub struct RecoveryError {
    code: RecoveryErrorCode,
    message: String,
    file: Option<String>,
    offset: Option<u64>,
}

impl RecoveryError {
    fn new(code: RecoveryErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            file: None,
            offset: None,
        }
    }

    pub fn corruption(file: &str, offset: u64, reason: impl Into<String>) -> Self {
        Self {
            code: RecoveryErrorCode::Corruption,
            message: format!("{} at offset {}: {}", file, offset, reason.into()),
            file: Some(file.to_string()),
            offset: Some(offset),
        }
    }

    pub fn xid_mismatch(xid: u64, prepared: u32, logged: u32) -> Self {
        Self::new(
            RecoveryErrorCode::XidMismatch,
            format!(
                "xid {} prepared in {} engines but the log records only {}",
                xid, prepared, logged
            ),
        )
    }

    pub fn no_log(prepared: usize) -> Self {
        Self::new(
            RecoveryErrorCode::NoLog,
            format!(
                "{} prepared transactions found but no log exists; set heuristic_recover",
                prepared
            ),
        )
    }

    pub fn index_inconsistent(reason: impl Into<String>) -> Self {
        Self::new(RecoveryErrorCode::IndexInconsistent, reason)
    }

    pub fn engine_failed(err: EngineError) -> Self {
        Self::new(RecoveryErrorCode::EngineFailed, err.to_string())
    }

    pub fn truncation_conflict(file: &str, safe: u64, unsafe_end: u64) -> Self {
        Self {
            code: RecoveryErrorCode::TruncationConflict,
            message: format!(
                "cannot truncate {} to {}: a non-revertible group ends at {}",
                file, safe, unsafe_end
            ),
            file: Some(file.to_string()),
            offset: Some(safe),
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self::new(RecoveryErrorCode::Failed, reason)
    }

    pub fn code(&self) -> RecoveryErrorCode {
        self.code
    }

    pub fn severity(&self) -> Severity {
        self.code.severity()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn file(&self) -> Option<&str> {
        self.file.as_deref()
    }

    pub fn offset(&self) -> Option<u64> {
        self.offset
    }

    pub fn is_fatal(&self) -> bool {
        true
    }
}

impl fmt::Display for RecoveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {}: {}",
            self.code.severity(),
            self.code.code(),
            self.message
        )
    }
}

impl std::error::Error for RecoveryError {}

impl From<BinlogError> for RecoveryError {
    fn from(err: BinlogError) -> Self {
        if err.code() == crate::binlog::BinlogErrorCode::Corruption {
            Self::new(RecoveryErrorCode::Corruption, err.to_string())
        } else {
            Self::new(RecoveryErrorCode::Failed, err.to_string())
        }
    }
}

impl From<TcError> for RecoveryError {
    fn from(err: TcError) -> Self {
        Self::new(RecoveryErrorCode::Failed, format!("coordinator journal: {}", err))
    }
}

impl From<EngineError> for RecoveryError {
    fn from(err: EngineError) -> Self {
        Self::engine_failed(err)
    }
}

pub type RecoveryResult<T> = Result<T, RecoveryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_fatal() {
        let err = RecoveryError::xid_mismatch(5, 3, 1);
        assert!(err.is_fatal());
        assert_eq!(err.severity(), Severity::Fatal);
        assert_eq!(err.code().code(), "RECOVERY_XID_MISMATCH");
    }

    #[test]
    fn test_display_format() {
        let err = RecoveryError::corruption("binlog.000002", 120, "checksum mismatch");
        let s = err.to_string();
        assert!(s.starts_with("[FATAL] RECOVERY_CORRUPTION:"));
        assert!(s.contains("binlog.000002"));
        assert_eq!(err.offset(), Some(120));
        assert_eq!(err.file(), Some("binlog.000002"));
    }

    #[test]
    fn test_from_binlog_corruption() {
        let err: RecoveryError = BinlogError::corruption("bad frame").into();
        assert_eq!(err.code(), RecoveryErrorCode::Corruption);
    }
}
