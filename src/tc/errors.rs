//! Transaction coordinator errors

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::binlog::BinlogError;

pub type TcResult<T> = Result<T, TcError>;

#[derive(Debug, Error)]
pub enum TcError {
    #[error("coordinator journal I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("coordinator journal {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("coordinator journal {0} exists; crash recovery must run before it is reopened")]
    NeedsRecovery(PathBuf),

    #[error("invalid coordinator configuration: {0}")]
    Config(String),

    #[error("transaction id 0 is reserved")]
    ZeroXid,

    #[error("batch of {batch} transactions exceeds the journal's {capacity} slots")]
    BatchTooLarge { batch: usize, capacity: usize },

    #[error("coordinator journal sync failed: {0}")]
    SyncFailed(String),

    #[error("transaction coordinator is closed")]
    Closed,

    #[error("coordinator lock poisoned")]
    Poisoned,

    #[error(transparent)]
    Binlog(#[from] BinlogError),
}

impl<T> From<std::sync::PoisonError<T>> for TcError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        TcError::Poisoned
    }
}
