//! Record-level scan state machine
//!
//! `step` is a pure transition function over one record at a time:
//!
//! ```text
//! AwaitingPosition --Gtid--> InGroup --Commit/Rollback--> AwaitingPosition
//!        |                      \--body (standalone)----> AwaitingPosition
//!        \--Rotate--> Closed
//! ```
//!
//! `scan_file` drives it over a whole file and collects what recovery needs.

use serde::Serialize;

use crate::binlog::record::{CommitPayload, GtidListPayload, GtidPayload, LogRecord, RecordBody, RecordType};
use crate::binlog::{LogReader, ReadRecord};
use crate::engine::Xid;
use crate::gtid::Gtid;

use super::errors::{RecoveryError, RecoveryResult};

/// How a group ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupEnd {
    Commit,
    Rollback,
    Standalone,
}

/// A group seen from its position record to its end
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedGroup {
    pub gtid: Gtid,
    pub flags: u8,
    pub start: u64,
    pub end: u64,
    pub end_kind: GroupEnd,
    pub xid: Option<Xid>,
    /// Engine branches recorded in the commit marker
    pub engine_count: u32,
    /// Some change in the group cannot be rolled back
    pub has_nontrans: bool,
    pub incident: bool,
    /// Body records, only when collected
    pub body: Vec<LogRecord>,
}

impl CompletedGroup {
    pub fn is_two_phase(&self) -> bool {
        self.xid.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenGroup {
    gtid: GtidPayload,
    start: u64,
    has_nontrans: bool,
    incident: bool,
    body: Vec<LogRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanState {
    AwaitingPosition,
    InGroup(OpenGroup),
    Closed,
}

/// Something recovery cares about, produced by a transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanEvent {
    Group(CompletedGroup),
    GtidList(GtidListPayload),
    Checkpoint(String),
    Rotate(String),
    Incident,
}

/// Advance the scan by one record
pub fn step(
    state: ScanState,
    rec: &ReadRecord,
    collect_bodies: bool,
) -> Result<(ScanState, Option<ScanEvent>), String> {
    let record = &rec.record;
    let body = record.body().map_err(|e| e.message().to_string())?;
    match state {
        ScanState::Closed => Err(format!(
            "{} record after rotate marker",
            record.record_type.name()
        )),
        ScanState::AwaitingPosition => match body {
            RecordBody::Gtid(gtid) => Ok((
                ScanState::InGroup(OpenGroup {
                    gtid,
                    start: rec.offset,
                    has_nontrans: false,
                    incident: false,
                    body: Vec::new(),
                }),
                None,
            )),
            RecordBody::GtidList(list) => {
                Ok((ScanState::AwaitingPosition, Some(ScanEvent::GtidList(list))))
            }
            RecordBody::Checkpoint(c) => Ok((
                ScanState::AwaitingPosition,
                Some(ScanEvent::Checkpoint(c.oldest_file)),
            )),
            RecordBody::StartEncryption(_) => Ok((ScanState::AwaitingPosition, None)),
            RecordBody::Incident(_) => Ok((ScanState::AwaitingPosition, Some(ScanEvent::Incident))),
            RecordBody::Rotate(r) => Ok((ScanState::Closed, Some(ScanEvent::Rotate(r.next_file)))),
            RecordBody::DataChange(_) | RecordBody::Commit(_) | RecordBody::Rollback => Err(
                format!("{} record outside a group", record.record_type.name()),
            ),
        },
        ScanState::InGroup(mut group) => match body {
            RecordBody::DataChange(_) | RecordBody::Incident(_) => {
                if record.record_type == RecordType::Incident {
                    group.incident = true;
                } else if !record.is_transactional() {
                    group.has_nontrans = true;
                }
                if collect_bodies {
                    group.body.push(record.clone());
                }
                if group.gtid.is_standalone() {
                    let done = close_group(group, rec.end_offset, GroupEnd::Standalone, None);
                    Ok((ScanState::AwaitingPosition, Some(ScanEvent::Group(done))))
                } else {
                    Ok((ScanState::InGroup(group), None))
                }
            }
            RecordBody::Commit(commit) => {
                let done = close_group(group, rec.end_offset, GroupEnd::Commit, Some(commit));
                Ok((ScanState::AwaitingPosition, Some(ScanEvent::Group(done))))
            }
            RecordBody::Rollback => {
                let done = close_group(group, rec.end_offset, GroupEnd::Rollback, None);
                Ok((ScanState::AwaitingPosition, Some(ScanEvent::Group(done))))
            }
            RecordBody::Gtid(_)
            | RecordBody::GtidList(_)
            | RecordBody::Checkpoint(_)
            | RecordBody::StartEncryption(_)
            | RecordBody::Rotate(_) => Err(format!(
                "group {} interrupted by {} record",
                group.gtid.gtid,
                record.record_type.name()
            )),
        },
    }
}

fn close_group(
    group: OpenGroup,
    end: u64,
    end_kind: GroupEnd,
    commit: Option<CommitPayload>,
) -> CompletedGroup {
    CompletedGroup {
        gtid: group.gtid.gtid,
        flags: group.gtid.flags,
        start: group.start,
        end,
        end_kind,
        xid: commit.and_then(|c| c.xid),
        engine_count: commit.map_or(0, |c| c.engine_count),
        has_nontrans: group.has_nontrans,
        incident: group.incident,
        body: group.body,
    }
}

/// Where the valid part of a damaged file ends
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TornTail {
    pub valid_end: u64,
    pub reason: String,
}

/// Everything recovery learns from one file
#[derive(Debug, Clone)]
pub struct FileScan {
    pub name: String,
    pub in_use: bool,
    pub file_len: u64,
    pub groups: Vec<CompletedGroup>,
    pub gtid_list: Option<GtidListPayload>,
    /// Checkpoint markers in file order
    pub checkpoints: Vec<String>,
    pub rotate_to: Option<String>,
    pub incidents: usize,
    /// Set when the file must be cut back to `valid_end`
    pub torn: Option<TornTail>,
}

impl FileScan {
    /// Oldest file named by the newest checkpoint marker
    pub fn last_checkpoint(&self) -> Option<&str> {
        self.checkpoints.last().map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ScanOptions {
    /// Damage at the end is cut off instead of failing the scan
    pub allow_torn_tail: bool,
    pub collect_bodies: bool,
}

/// Scan a whole file
pub fn scan_file(reader: &mut LogReader, options: ScanOptions) -> RecoveryResult<FileScan> {
    let name = reader.name().to_string();
    let mut scan = FileScan {
        name: name.clone(),
        in_use: reader.header().is_in_use(),
        file_len: reader.file_len(),
        groups: Vec::new(),
        gtid_list: None,
        checkpoints: Vec::new(),
        rotate_to: None,
        incidents: 0,
        torn: None,
    };

    let mut state = ScanState::AwaitingPosition;
    loop {
        let rec = match reader.read_next() {
            Ok(Some(rec)) => rec,
            Ok(None) => break,
            Err(e) => {
                let at = reader.valid_pos();
                if options.allow_torn_tail {
                    scan.torn = Some(TornTail {
                        valid_end: at,
                        reason: e.message().to_string(),
                    });
                    break;
                }
                return Err(RecoveryError::corruption(&name, at, e.message()));
            }
        };
        let offset = rec.offset;
        let (next, event) = match step(state, &rec, options.collect_bodies) {
            Ok(t) => t,
            Err(reason) => {
                if options.allow_torn_tail {
                    scan.torn = Some(TornTail {
                        valid_end: offset,
                        reason,
                    });
                    // Whatever group was open is cut off with the tail
                    state = ScanState::AwaitingPosition;
                    break;
                }
                return Err(RecoveryError::corruption(&name, offset, reason));
            }
        };
        state = next;
        match event {
            Some(ScanEvent::Group(g)) => scan.groups.push(g),
            Some(ScanEvent::GtidList(list)) => {
                if scan.gtid_list.is_none() {
                    scan.gtid_list = Some(list);
                }
            }
            Some(ScanEvent::Checkpoint(file)) => scan.checkpoints.push(file),
            Some(ScanEvent::Rotate(next)) => scan.rotate_to = Some(next),
            Some(ScanEvent::Incident) => scan.incidents += 1,
            None => {}
        }
    }

    if let ScanState::InGroup(open) = state {
        // An unfinished group never committed
        if !options.allow_torn_tail {
            return Err(RecoveryError::corruption(
                &name,
                open.start,
                "file ends inside a group",
            ));
        }
        let valid_end = match &scan.torn {
            Some(t) => t.valid_end.min(open.start),
            None => open.start,
        };
        scan.torn = Some(TornTail {
            valid_end,
            reason: format!("incomplete group {}", open.gtid.gtid),
        });
    }
    Ok(scan)
}
