//! Group commit
//!
//! Concurrent commits are merged into batches that share one write and one
//! fsync:
//!
//! 1. A committing session enqueues its request; the first to find the
//!    queue empty becomes leader for the batch
//! 2. The leader may wait briefly for more members, takes the append lock
//!    and freezes the queue in arrival order, with declared dependents
//!    placed right after the commit they wait for
//! 3. One write and one fsync cover every member
//! 4. Engines' ordered commit hooks run in frozen order under the
//!    commit-ordering lock, not the append lock
//! 5. Every member's promise is fulfilled with its own outcome, or with the
//!    one failure the whole batch shares
//!
//! Lock order: append → post-write → commit-order. The queue lock is only
//! ever taken alone or inside the append lock.

mod coordinator;
mod promise;
mod queue;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::binlog::record::CommitPayload;
use crate::binlog::{LogPosition, LogRecord, RecordType, RotateOutcome};
use crate::engine::{RecoverableEngine, Xid};
use crate::gtid::Gtid;
use crate::tc::TcToken;

pub use coordinator::{AfterSyncHook, CommitTicket, GroupCommitCoordinator};
pub use promise::Promise;
pub use queue::{CommitArena, SlotStatus};

/// Batch formation settings
#[derive(Debug, Clone, Default)]
pub struct GroupCommitConfig {
    /// Stop waiting for members once this many are queued (0 = never wait)
    pub wait_count: usize,
    /// Longest the leader waits for more members
    pub wait_usec: u64,
    pub domain_id: u32,
    pub server_id: u32,
}

impl GroupCommitConfig {
    pub fn waits(&self) -> bool {
        self.wait_count > 0 && self.wait_usec > 0
    }
}

/// How a logged group ends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminal {
    Commit { xid: Option<Xid>, engine_count: u32 },
    /// Rolled back, logged only for its non-transactional effects
    Rollback,
    /// Single self-contained record (e.g. DDL); no terminal record
    Standalone,
}

impl Terminal {
    pub fn commit() -> Self {
        Terminal::Commit {
            xid: None,
            engine_count: 0,
        }
    }

    pub fn two_phase(xid: Xid, engine_count: u32) -> Self {
        Terminal::Commit {
            xid: Some(xid),
            engine_count,
        }
    }

    pub fn xid(&self) -> Option<Xid> {
        match self {
            Terminal::Commit { xid, .. } => *xid,
            _ => None,
        }
    }

    pub(crate) fn record(&self) -> Option<LogRecord> {
        match self {
            Terminal::Commit {
                xid: Some(xid),
                engine_count,
            } => Some(LogRecord::commit(&CommitPayload::two_phase(*xid, *engine_count))),
            Terminal::Commit { xid: None, .. } => Some(LogRecord::commit(&CommitPayload::plain())),
            Terminal::Rollback => Some(LogRecord::rollback()),
            Terminal::Standalone => None,
        }
    }
}

/// Cooperative cancellation for a session waiting on a prior commit
#[derive(Debug, Clone, Default)]
pub struct KillSwitch(Arc<AtomicBool>);

impl KillSwitch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kill(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_killed(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// One session's group, ready to be logged
pub struct CommitRequest {
    pub body: Vec<LogRecord>,
    pub terminal: Terminal,
    /// Position to log under; allocated by the leader when `None`
    pub gtid: Option<Gtid>,
    pub ddl: bool,
    /// Engines whose ordered hooks run for this commit
    pub engines: Vec<Arc<dyn RecoverableEngine>>,
    /// Commit that must be logged before this one
    pub waitee: Option<CommitTicket>,
    pub kill: Option<KillSwitch>,
}

impl CommitRequest {
    pub fn new(body: Vec<LogRecord>, terminal: Terminal) -> Self {
        Self {
            body,
            terminal,
            gtid: None,
            ddl: false,
            engines: Vec::new(),
            waitee: None,
            kill: None,
        }
    }

    pub fn with_gtid(mut self, gtid: Gtid) -> Self {
        self.gtid = Some(gtid);
        self
    }

    pub fn with_engines(mut self, engines: Vec<Arc<dyn RecoverableEngine>>) -> Self {
        self.engines = engines;
        self
    }

    pub fn after(mut self, waitee: CommitTicket) -> Self {
        self.waitee = Some(waitee);
        self
    }

    pub fn with_kill(mut self, kill: KillSwitch) -> Self {
        self.kill = Some(kill);
        self
    }

    pub fn ddl(mut self) -> Self {
        self.ddl = true;
        self
    }

    /// Some change in the body cannot be rolled back
    pub fn has_nontrans(&self) -> bool {
        self.body
            .iter()
            .any(|r| r.record_type == RecordType::DataChange && !r.is_transactional())
    }
}

/// What one member of a batch got
#[derive(Debug, Clone)]
pub struct CommitOutcome {
    pub gtid: Gtid,
    /// End of the group's last record
    pub position: LogPosition,
    pub token: Option<TcToken>,
    pub group_size: usize,
    pub leader: bool,
    /// The batch was fsynced (false when the sync period skipped it)
    pub synced: bool,
    /// The file switched after this batch; set for the leader only
    pub rotated: Option<RotateOutcome>,
}
