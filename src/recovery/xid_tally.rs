//! Per-xid reconciliation of engine prepare state against the log
//!
//! For every locally generated xid an engine reports as prepared, the
//! number of engines holding it is compared with what the log's commit
//! marker says:
//!
//! | log                         | decision          |
//! |-----------------------------|-------------------|
//! | no commit marker            | rollback          |
//! | prepared == logged          | commit            |
//! | 0 < prepared < logged       | commit (others already committed) |
//! | prepared > logged           | fatal mismatch    |
//! | live in the slot journal    | commit            |

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::engine::{PreparedXid, Xid};

use super::errors::{RecoveryError, RecoveryResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Commit,
    Rollback,
}

/// Operator override used when the log cannot decide
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeuristicRecover {
    Off,
    Commit,
    Rollback,
}

impl Default for HeuristicRecover {
    fn default() -> Self {
        HeuristicRecover::Off
    }
}

impl HeuristicRecover {
    pub fn decision(self) -> Option<Decision> {
        match self {
            HeuristicRecover::Off => None,
            HeuristicRecover::Commit => Some(Decision::Commit),
            HeuristicRecover::Rollback => Some(Decision::Rollback),
        }
    }
}

/// What the log says about an xid
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Logged {
    Absent,
    /// Commit marker naming this many engine branches
    Branches(u32),
    /// Still registered in the coordinator slot journal
    Journal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TallyEntry {
    pub xid: Xid,
    /// Indexes of the engines holding the xid prepared
    pub engines: Vec<usize>,
    pub logged: Logged,
}

impl TallyEntry {
    pub fn prepared(&self) -> u32 {
        self.engines.len() as u32
    }

    pub fn decide(&self) -> RecoveryResult<Decision> {
        let prepared = self.prepared();
        match self.logged {
            Logged::Absent => Ok(Decision::Rollback),
            Logged::Journal => Ok(Decision::Commit),
            Logged::Branches(logged) if prepared <= logged => Ok(Decision::Commit),
            Logged::Branches(logged) => Err(RecoveryError::xid_mismatch(self.xid, prepared, logged)),
        }
    }
}

#[derive(Debug, Default)]
pub struct XidTally {
    entries: BTreeMap<Xid, TallyEntry>,
    foreign: Vec<String>,
}

impl XidTally {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record what engine number `engine` reported as prepared
    pub fn add_prepared(&mut self, engine: usize, prepared: &[PreparedXid]) {
        for p in prepared {
            match p {
                PreparedXid::Local(xid) => {
                    let entry = self.entries.entry(*xid).or_insert_with(|| TallyEntry {
                        xid: *xid,
                        engines: Vec::new(),
                        logged: Logged::Absent,
                    });
                    if !entry.engines.contains(&engine) {
                        entry.engines.push(engine);
                    }
                }
                PreparedXid::External(id) => self.foreign.push(id.clone()),
            }
        }
    }

    /// A commit marker for `xid` was found in the log
    pub fn add_logged(&mut self, xid: Xid, engine_count: u32) {
        if let Some(entry) = self.entries.get_mut(&xid) {
            entry.logged = match entry.logged {
                Logged::Branches(n) => Logged::Branches(n.max(engine_count)),
                Logged::Journal => Logged::Journal,
                Logged::Absent => Logged::Branches(engine_count),
            };
        }
    }

    /// `xid` is live in the coordinator slot journal
    pub fn add_journal(&mut self, xid: Xid) {
        if let Some(entry) = self.entries.get_mut(&xid) {
            entry.logged = Logged::Journal;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn contains(&self, xid: Xid) -> bool {
        self.entries.contains_key(&xid)
    }

    pub fn entries(&self) -> impl Iterator<Item = &TallyEntry> {
        self.entries.values()
    }

    pub fn foreign(&self) -> &[String] {
        &self.foreign
    }

    /// Decide every in-doubt xid in ascending order.
    ///
    /// Fails on the first xid whose engines hold more branches than the
    /// log can explain.
    pub fn decide_all(&self) -> RecoveryResult<Vec<(Xid, Decision)>> {
        self.entries
            .values()
            .map(|e| e.decide().map(|d| (e.xid, d)))
            .collect()
    }

    /// Same decision for every in-doubt xid
    pub fn decide_uniform(&self, decision: Decision) -> Vec<(Xid, Decision)> {
        self.entries.keys().map(|xid| (*xid, decision)).collect()
    }

    pub fn engines_for(&self, xid: Xid) -> &[usize] {
        self.entries
            .get(&xid)
            .map(|e| e.engines.as_slice())
            .unwrap_or(&[])
    }
}
