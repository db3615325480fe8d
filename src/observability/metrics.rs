//! Passive operational counters
//!
//! Monotonic, reset only on process start, `Relaxed` atomics throughout.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct MetricsRegistry {
    bytes_written: AtomicU64,
    records_written: AtomicU64,
    fsyncs: AtomicU64,
    group_commit_batches: AtomicU64,
    group_commit_members: AtomicU64,
    rotations: AtomicU64,
    purged_files: AtomicU64,
    incidents: AtomicU64,
    tc_syncs: AtomicU64,
    tc_checkpoints: AtomicU64,
    recovery_commits: AtomicU64,
    recovery_rollbacks: AtomicU64,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_bytes_written(&self, bytes: u64) {
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_records_written(&self, records: u64) {
        self.records_written.fetch_add(records, Ordering::Relaxed);
    }

    pub fn increment_fsyncs(&self) {
        self.fsyncs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn fsyncs(&self) -> u64 {
        self.fsyncs.load(Ordering::Relaxed)
    }

    /// One leader round carrying `members` commits
    pub fn record_group_commit(&self, members: u64) {
        self.group_commit_batches.fetch_add(1, Ordering::Relaxed);
        self.group_commit_members.fetch_add(members, Ordering::Relaxed);
    }

    pub fn increment_rotations(&self) {
        self.rotations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_purged_files(&self, files: u64) {
        self.purged_files.fetch_add(files, Ordering::Relaxed);
    }

    pub fn increment_incidents(&self) {
        self.incidents.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_tc_syncs(&self) {
        self.tc_syncs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_tc_checkpoints(&self) {
        self.tc_checkpoints.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_recovery_commits(&self, n: u64) {
        self.recovery_commits.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_recovery_rollbacks(&self, n: u64) {
        self.recovery_rollbacks.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            records_written: self.records_written.load(Ordering::Relaxed),
            fsyncs: self.fsyncs.load(Ordering::Relaxed),
            group_commit_batches: self.group_commit_batches.load(Ordering::Relaxed),
            group_commit_members: self.group_commit_members.load(Ordering::Relaxed),
            rotations: self.rotations.load(Ordering::Relaxed),
            purged_files: self.purged_files.load(Ordering::Relaxed),
            incidents: self.incidents.load(Ordering::Relaxed),
            tc_syncs: self.tc_syncs.load(Ordering::Relaxed),
            tc_checkpoints: self.tc_checkpoints.load(Ordering::Relaxed),
            recovery_commits: self.recovery_commits.load(Ordering::Relaxed),
            recovery_rollbacks: self.recovery_rollbacks.load(Ordering::Relaxed),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.snapshot()).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Point-in-time copy of every counter
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub bytes_written: u64,
    pub records_written: u64,
    pub fsyncs: u64,
    pub group_commit_batches: u64,
    pub group_commit_members: u64,
    pub rotations: u64,
    pub purged_files: u64,
    pub incidents: u64,
    pub tc_syncs: u64,
    pub tc_checkpoints: u64,
    pub recovery_commits: u64,
    pub recovery_rollbacks: u64,
}
