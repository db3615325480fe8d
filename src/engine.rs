//! Storage engines as seen by the binlog
//!
//! A recoverable engine takes part in two-phase commit. The binlog never
//! looks inside an engine; it only drives these calls.

use thiserror::Error;

/// Transaction id generated by this server
pub type Xid = u64;

/// A transaction an engine reports as prepared but unresolved
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PreparedXid {
    /// Generated by this server; recovery decides its fate
    Local(Xid),
    /// Owned by an external transaction manager; never touched by recovery
    External(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("engine {engine}: {message}")]
pub struct EngineError {
    pub engine: String,
    pub message: String,
}

impl EngineError {
    pub fn new(engine: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            engine: engine.into(),
            message: message.into(),
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

/// One-shot callback an engine fires once its state is durable
pub struct CheckpointNotifier(Box<dyn FnOnce() + Send>);

impl CheckpointNotifier {
    pub fn new(f: impl FnOnce() + Send + 'static) -> Self {
        Self(Box::new(f))
    }

    pub fn notify(self) {
        (self.0)()
    }
}

impl std::fmt::Debug for CheckpointNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CheckpointNotifier")
    }
}

pub trait RecoverableEngine: Send + Sync {
    fn name(&self) -> &str;

    /// First phase: make `xid` durable in the engine as prepared
    fn prepare(&self, xid: Xid) -> EngineResult<()>;

    fn commit_by_xid(&self, xid: Xid) -> EngineResult<()>;

    fn rollback_by_xid(&self, xid: Xid) -> EngineResult<()>;

    /// Every transaction left prepared by a crash
    fn recover_prepared(&self) -> EngineResult<Vec<PreparedXid>>;

    /// Runs in commit order before the log write
    fn prepare_ordered(&self, _xid: Option<Xid>) {}

    /// Runs in commit order after the log write, under the ordering lock
    fn commit_ordered(&self, _xid: Option<Xid>) {}

    /// Persist engine state, then fire `notifier`. Engines without their
    /// own durability concerns fire it immediately.
    fn commit_checkpoint_request(&self, notifier: CheckpointNotifier) {
        notifier.notify();
    }
}
