//! Two-phase commit durability registrar
//!
//! When a transaction spans recoverable engines, its commit record in the
//! log is what makes it durable. The registrar remembers which logged
//! transactions engines may not yet have made durable themselves, so that
//! crash recovery knows how far back it must look.
//!
//! Two backends implement the same contract:
//! - `BinlogTc`: per log file counts of outstanding transactions; a file
//!   whose count drops to zero (and whose engines have checkpointed) is no
//!   longer needed, announced by a `Checkpoint` record
//! - `MmapTc`: a memory-mapped slot journal of live transaction ids, synced
//!   by a background thread in batches
//!
//! Tokens are never persisted beyond what recovery can rebuild from the
//! log or journal, so releasing one is safe to lose in a crash.

mod binlog;
mod errors;
mod mmap;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::binlog::LogPosition;
use crate::engine::{RecoverableEngine, Xid};

pub use self::binlog::{BinlogTc, XidBookkeepingEntry};
pub use self::errors::{TcError, TcResult};
pub use self::mmap::{read_journal, remove_journal, MmapTc, JOURNAL_FILE_NAME};

/// Which registrar backend to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TcBackend {
    Binlog,
    Mmap,
}

impl Default for TcBackend {
    fn default() -> Self {
        TcBackend::Binlog
    }
}

/// Proof that a transaction's commit is anchored
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TcToken {
    Binlog { file: String, xid: Xid },
    Slot { slot: usize, xid: Xid },
}

impl TcToken {
    pub fn xid(&self) -> Xid {
        match self {
            TcToken::Binlog { xid, .. } | TcToken::Slot { xid, .. } => *xid,
        }
    }
}

pub trait TransactionCoordinatorLog: Send + Sync {
    fn name(&self) -> &'static str;

    /// Anchor `xids`, whose commit records end at `anchor`.
    ///
    /// Called under the log append lock; may block until the anchor is
    /// durable in the backend.
    fn reserve_durability_tokens(&self, anchor: &LogPosition, xids: &[Xid])
        -> TcResult<Vec<TcToken>>;

    fn reserve_durability_token(&self, anchor: &LogPosition, xid: Xid) -> TcResult<TcToken> {
        self.reserve_durability_tokens(anchor, &[xid])?
            .pop()
            .ok_or(TcError::Closed)
    }

    /// Every engine has made the transaction durable on its own
    fn release_token(&self, token: TcToken) -> TcResult<()>;

    /// A rotation switched the active file. Called under the append lock.
    fn on_new_file(&self, old_file: &str, new_file: &str) -> TcResult<()>;

    /// Ask every engine to persist its state; once all have confirmed,
    /// `file` stops holding back the oldest-needed marker. Must be called
    /// without any coordinator lock held.
    fn request_durable_checkpoint(
        &self,
        file: &str,
        engines: &[Arc<dyn RecoverableEngine>],
    ) -> TcResult<()>;

    /// Oldest log file crash recovery must scan, if the backend uses the log
    fn oldest_needed_file(&self) -> Option<String>;

    fn is_file_needed(&self, name: &str) -> bool;

    /// Clean shutdown
    fn close(&self) -> TcResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_names_deserialize() {
        let b: TcBackend = serde_json::from_str("\"mmap\"").unwrap();
        assert_eq!(b, TcBackend::Mmap);
        assert_eq!(TcBackend::default(), TcBackend::Binlog);
    }

    #[test]
    fn test_token_xid() {
        let t = TcToken::Slot { slot: 3, xid: 9 };
        assert_eq!(t.xid(), 9);
    }
}
