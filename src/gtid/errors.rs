//! Position tracker errors

use thiserror::Error;

/// Result type for position tracking
pub type GtidResult<T> = Result<T, GtidError>;

/// Position tracker errors
#[derive(Debug, Error)]
pub enum GtidError {
    #[error("invalid position '{0}', expected domain-server-seq")]
    Parse(String),

    #[error(
        "position {domain_id}-{server_id}-{seq_no} is not after last position \
         {domain_id}-{last_server_id}-{last_seq_no} (strict mode)"
    )]
    StrictOutOfOrder {
        domain_id: u32,
        server_id: u32,
        seq_no: u64,
        last_server_id: u32,
        last_seq_no: u64,
    },

    #[error("position state file I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("position state file line {line}: {reason}")]
    StateFile { line: usize, reason: String },

    #[error("position tracker lock poisoned")]
    Poisoned,
}
