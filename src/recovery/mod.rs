//! Crash recovery
//!
//! Reconciles transactions that engines report as prepared against what
//! the log made durable, and repairs the log itself after a crash.
//!
//! - `scanner`: pure per-record state machine and whole-file scan
//! - `xid_tally`: per-xid commit/rollback decision
//! - `truncate`: safe-boundary planning for truncation mode
//! - `startup`: the manager that runs all of it at startup
//!
//! Every error here is fatal: the service refuses to start.

mod errors;
mod scanner;
mod startup;
mod truncate;
mod xid_tally;

pub use errors::{RecoveryError, RecoveryErrorCode, RecoveryResult};
pub use scanner::{
    scan_file, step, CompletedGroup, FileScan, GroupEnd, ScanEvent, ScanOptions, ScanState,
    TornTail,
};
pub use startup::{RecoveryManager, RecoveryOptions, RecoveryReport};
pub use truncate::{plan_truncation, TruncationConflict, TruncationPlan};
pub use xid_tally::{Decision, HeuristicRecover, Logged, TallyEntry, XidTally};
