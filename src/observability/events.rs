//! Typed lifecycle events

use std::fmt;

use super::logger::Severity;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    // Service lifecycle
    ServiceInitBegin,
    ServiceReady,
    ShutdownBegin,
    ShutdownComplete,
    ConfigLoaded,

    // Log files
    FileCreated,
    FileRotated,
    FilePurged,
    PurgeBlocked,
    FileClosed,
    /// Store failed; logging disabled for the rest of the process
    LogDisabled,
    IncidentWritten,

    // Group commit
    GroupCommitBatch,

    // Registrar
    TcCheckpoint,
    TcJournalFull,

    // Recovery
    RecoveryBegin,
    RecoveryDecision,
    RecoveryTruncated,
    RecoveryTruncationRefused,
    RecoveryComplete,
    RecoveryFailed,
}

impl Event {
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::ServiceInitBegin => "BINLOG_INIT_BEGIN",
            Event::ServiceReady => "BINLOG_READY",
            Event::ShutdownBegin => "BINLOG_SHUTDOWN_BEGIN",
            Event::ShutdownComplete => "BINLOG_SHUTDOWN_COMPLETE",
            Event::ConfigLoaded => "CONFIG_LOADED",

            Event::FileCreated => "LOG_FILE_CREATED",
            Event::FileRotated => "LOG_FILE_ROTATED",
            Event::FilePurged => "LOG_FILE_PURGED",
            Event::PurgeBlocked => "LOG_PURGE_BLOCKED",
            Event::FileClosed => "LOG_FILE_CLOSED",
            Event::LogDisabled => "LOG_DISABLED",
            Event::IncidentWritten => "INCIDENT_WRITTEN",

            Event::GroupCommitBatch => "GROUP_COMMIT_BATCH",

            Event::TcCheckpoint => "TC_CHECKPOINT",
            Event::TcJournalFull => "TC_JOURNAL_FULL",

            Event::RecoveryBegin => "RECOVERY_BEGIN",
            Event::RecoveryDecision => "RECOVERY_DECISION",
            Event::RecoveryTruncated => "RECOVERY_TRUNCATED",
            Event::RecoveryTruncationRefused => "RECOVERY_TRUNCATION_REFUSED",
            Event::RecoveryComplete => "RECOVERY_COMPLETE",
            Event::RecoveryFailed => "RECOVERY_FAILED",
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            Event::GroupCommitBatch | Event::RecoveryDecision => Severity::Trace,
            Event::PurgeBlocked
            | Event::IncidentWritten
            | Event::TcJournalFull
            | Event::RecoveryTruncated
            | Event::RecoveryTruncationRefused => Severity::Warn,
            Event::LogDisabled => Severity::Error,
            Event::RecoveryFailed => Severity::Fatal,
            _ => Severity::Info,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.severity() == Severity::Fatal
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
