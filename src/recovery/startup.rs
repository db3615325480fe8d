//! Recovery manager
//!
//! Runs once at startup, before the log accepts writes.
//!
//! # Sequence (strict order)
//!
//! 1. Open the index (finishing any interrupted purge)
//! 2. Ask every engine for its prepared transactions
//! 3. Read the coordinator slot journal, if a crashed run left one
//! 4. Scan the last file; if it was not closed cleanly, scan back to the
//!    file named by its newest checkpoint marker
//! 5. Decide every in-doubt xid (tally, truncation or heuristic)
//! 6. Cut the torn tail, resolve transactions in the engines, clear the
//!    in-use flag, drop the journal
//! 7. Rebuild the position state from the newest complete position list
//!
//! Any failure aborts startup.

use std::collections::{HashMap, HashSet};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;

use crate::binlog::header::mark_closed;
use crate::binlog::{BinlogErrorCode, KeyProvider, LogFileIndex, LogPosition, LogReader};
use crate::crash_point::{maybe_crash, points};
use crate::engine::{RecoverableEngine, Xid};
use crate::gtid::{Gtid, GtidState};
use crate::observability::{log_event_with_fields, Event, MetricsRegistry, Timer};
use crate::tc::{read_journal, remove_journal, JOURNAL_FILE_NAME};

use super::errors::{RecoveryError, RecoveryResult};
use super::scanner::{scan_file, CompletedGroup, FileScan, GroupEnd, ScanOptions};
use super::truncate::{plan_truncation, TruncationConflict, TruncationPlan};
use super::xid_tally::{Decision, HeuristicRecover, XidTally};

#[derive(Clone)]
pub struct RecoveryOptions {
    pub dir: PathBuf,
    pub basename: String,
    pub keys: Option<Arc<dyn KeyProvider>>,
    /// Cut the log back instead of committing in-doubt transactions
    pub truncate_on_recovery: bool,
    pub heuristic: HeuristicRecover,
    /// Report what recovery would do without touching files or engines
    pub inspect_only: bool,
}

impl RecoveryOptions {
    pub fn new(dir: impl AsRef<Path>, basename: impl Into<String>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            basename: basename.into(),
            keys: None,
            truncate_on_recovery: false,
            heuristic: HeuristicRecover::Off,
            inspect_only: false,
        }
    }
}

/// Outcome of a recovery run
#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryReport {
    /// The last file was left in use, or a coordinator journal was found
    pub was_crashed: bool,
    pub last_file: Option<String>,
    pub scanned_files: Vec<String>,
    pub groups_scanned: usize,
    pub committed: Vec<Xid>,
    pub rolled_back: Vec<Xid>,
    /// Prepared transactions owned by an external transaction manager
    pub foreign: Vec<String>,
    pub heuristic: bool,
    pub incidents: usize,
    pub torn_tail: Option<LogPosition>,
    pub truncated_at: Option<LogPosition>,
    /// Set when truncation was refused; nothing was changed
    pub conflict: Option<TruncationConflict>,
    pub gtid_list: Vec<Gtid>,
    /// Decisions were carried out (false when inspecting)
    pub applied: bool,
}

impl RecoveryReport {
    /// Position state reconstructed from the log
    pub fn gtid_state(&self) -> GtidState {
        GtidState::from_list(&self.gtid_list)
    }
}

/// What the scan phase produced
struct ScanResult {
    scans: Vec<FileScan>,
    journal: Option<Vec<Xid>>,
    was_crashed: bool,
}

pub struct RecoveryManager {
    options: RecoveryOptions,
    metrics: Arc<MetricsRegistry>,
}

impl RecoveryManager {
    pub fn new(options: RecoveryOptions, metrics: Arc<MetricsRegistry>) -> Self {
        Self { options, metrics }
    }

    pub fn options(&self) -> &RecoveryOptions {
        &self.options
    }

    fn journal_path(&self) -> PathBuf {
        self.options.dir.join(JOURNAL_FILE_NAME)
    }

    fn open_index(&self) -> RecoveryResult<LogFileIndex> {
        LogFileIndex::open(&self.options.dir, &self.options.basename).map_err(|e| {
            if e.code() == BinlogErrorCode::Corruption {
                RecoveryError::index_inconsistent(e.message())
            } else {
                RecoveryError::from(e)
            }
        })
    }

    fn scan(
        &self,
        index: &LogFileIndex,
        name: &str,
        options: ScanOptions,
    ) -> RecoveryResult<FileScan> {
        let mut reader = LogReader::open(&index.file_path(name), name, self.options.keys.clone())?;
        let options = ScanOptions {
            allow_torn_tail: options.allow_torn_tail && reader.header().is_in_use(),
            ..options
        };
        scan_file(&mut reader, options)
    }

    /// Run crash recovery against `engines`.
    pub fn recover(&self, engines: &[Arc<dyn RecoverableEngine>]) -> RecoveryResult<RecoveryReport> {
        maybe_crash(points::RECOVERY_START);
        let dir = self.options.dir.display().to_string();
        log_event_with_fields(Event::RecoveryBegin, &[("dir", &dir)]);
        let timer = Timer::new();

        match self.run(engines) {
            Ok(report) => {
                let committed = report.committed.len().to_string();
                let rolled_back = report.rolled_back.len().to_string();
                let foreign = report.foreign.len().to_string();
                let elapsed = timer.elapsed_ms();
                log_event_with_fields(
                    Event::RecoveryComplete,
                    &[
                        ("committed", &committed),
                        ("rolled_back", &rolled_back),
                        ("foreign", &foreign),
                        ("crashed", if report.was_crashed { "true" } else { "false" }),
                        ("elapsed_ms", &elapsed),
                    ],
                );
                Ok(report)
            }
            Err(err) => {
                log_event_with_fields(
                    Event::RecoveryFailed,
                    &[("code", err.code().code()), ("reason", err.message())],
                );
                Err(err)
            }
        }
    }

    fn run(&self, engines: &[Arc<dyn RecoverableEngine>]) -> RecoveryResult<RecoveryReport> {
        let index = self.open_index()?;

        let mut tally = XidTally::new();
        for (i, engine) in engines.iter().enumerate() {
            let prepared = engine.recover_prepared()?;
            tally.add_prepared(i, &prepared);
        }

        let mut report = RecoveryReport {
            foreign: tally.foreign().to_vec(),
            last_file: index.last().map(str::to_string),
            ..RecoveryReport::default()
        };

        let journal = read_journal(&self.journal_path())?;
        if index.entries().is_empty() && journal.is_none() {
            // No log at all: only a heuristic can resolve prepared work
            report.was_crashed = false;
            let decisions = if tally.is_empty() {
                Vec::new()
            } else {
                match self.options.heuristic.decision() {
                    Some(d) => {
                        report.heuristic = true;
                        tally.decide_uniform(d)
                    }
                    None => return Err(RecoveryError::no_log(tally.len())),
                }
            };
            self.apply(engines, &tally, &decisions, &mut report)?;
            return Ok(report);
        }

        let scanned = self.scan_needed_files(&index, journal)?;
        report.was_crashed = scanned.was_crashed;
        report.scanned_files = scanned.scans.iter().map(|s| s.name.clone()).collect();
        report.groups_scanned = scanned.scans.iter().map(|s| s.groups.len()).sum();
        report.incidents = scanned.scans.iter().map(|s| s.incidents).sum();

        for scan in &scanned.scans {
            for group in &scan.groups {
                if let (Some(xid), GroupEnd::Commit) = (group.xid, group.end_kind) {
                    tally.add_logged(xid, group.engine_count);
                }
            }
        }
        if let Some(xids) = &scanned.journal {
            for xid in xids {
                tally.add_journal(*xid);
            }
        }

        // Where the last file gets cut, if anywhere
        let mut cut: Option<u64> = None;
        if let Some(last) = scanned.scans.last() {
            if let Some(torn) = &last.torn {
                report.torn_tail = Some(LogPosition {
                    file: last.name.clone(),
                    offset: torn.valid_end,
                });
                cut = Some(torn.valid_end);
            }
        }

        let decisions = if let Some(d) = self.options.heuristic.decision() {
            report.heuristic = true;
            tally.decide_uniform(d)
        } else if self.options.truncate_on_recovery && scanned.was_crashed {
            let in_doubt: HashSet<Xid> = tally.entries().map(|e| e.xid).collect();
            match plan_truncation(&scanned.scans, &in_doubt) {
                TruncationPlan::Nothing => tally.decide_all()?,
                TruncationPlan::Truncate { file, offset } => {
                    let at = offset.to_string();
                    log_event_with_fields(Event::RecoveryTruncated, &[("file", &file), ("offset", &at)]);
                    cut = Some(cut.map_or(offset, |c| c.min(offset)));
                    report.truncated_at = Some(LogPosition { file, offset });
                    tally.decide_uniform(Decision::Rollback)
                }
                TruncationPlan::Conflict(conflict) => {
                    let safe = conflict.safe_boundary.to_string();
                    let end = conflict.unsafe_end.to_string();
                    log_event_with_fields(
                        Event::RecoveryTruncationRefused,
                        &[
                            ("file", &conflict.file),
                            ("safe_boundary", &safe),
                            ("unsafe_end", &end),
                            ("reason", &conflict.reason),
                        ],
                    );
                    report.conflict = Some(conflict);
                    report.gtid_list = self.rebuild_gtid_state(&index, &scanned.scans, None)?;
                    // In-doubt work stays prepared and the files stay as found
                    return Ok(report);
                }
            }
        } else {
            tally.decide_all()?
        };

        report.gtid_list = self.rebuild_gtid_state(&index, &scanned.scans, cut)?;

        if !self.options.inspect_only {
            if let (Some(offset), Some(last)) = (cut, scanned.scans.last()) {
                truncate_file(&index.file_path(&last.name), &last.name, offset)?;
            }
        }
        self.apply(engines, &tally, &decisions, &mut report)?;

        if !self.options.inspect_only {
            if let Some(last) = scanned.scans.last().filter(|s| s.in_use) {
                let path = index.file_path(&last.name);
                let mut file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(&path)
                    .map_err(|e| RecoveryError::failed(format!("cannot open {}: {}", last.name, e)))?;
                mark_closed(&last.name, &mut file)?;
            }
            if scanned.journal.is_some() {
                remove_journal(&self.journal_path())?;
            }
        }
        Ok(report)
    }

    /// Scan the last file and, after a crash, every older file recovery
    /// still needs.
    fn scan_needed_files(
        &self,
        index: &LogFileIndex,
        journal: Option<Vec<Xid>>,
    ) -> RecoveryResult<ScanResult> {
        let entries = index.entries();
        let last_name = match entries.last() {
            Some(name) => name.clone(),
            None => {
                return Ok(ScanResult {
                    scans: Vec::new(),
                    was_crashed: journal.is_some(),
                    journal,
                })
            }
        };
        let last = self.scan(
            index,
            &last_name,
            ScanOptions {
                allow_torn_tail: true,
                collect_bodies: false,
            },
        )?;
        let was_crashed = last.in_use || journal.is_some();
        if !last.in_use {
            return Ok(ScanResult {
                scans: vec![last],
                journal,
                was_crashed,
            });
        }

        let start = match last.last_checkpoint() {
            Some(oldest) => index.position(oldest).ok_or_else(|| {
                RecoveryError::index_inconsistent(format!(
                    "checkpoint in {} names {} which is not in the index",
                    last_name, oldest
                ))
            })?,
            None => 0,
        };

        let mut scans = Vec::with_capacity(entries.len() - start);
        for (i, name) in entries[start..entries.len() - 1].iter().enumerate() {
            let scan = self.scan(index, name, ScanOptions::default())?;
            let expected = &entries[start + i + 1];
            if scan.rotate_to.as_deref() != Some(expected.as_str()) {
                return Err(RecoveryError::corruption(
                    name,
                    scan.file_len,
                    format!("file does not end with a rotate marker to {}", expected),
                ));
            }
            scans.push(scan);
        }
        scans.push(last);
        Ok(ScanResult {
            scans,
            journal,
            was_crashed,
        })
    }

    fn apply(
        &self,
        engines: &[Arc<dyn RecoverableEngine>],
        tally: &XidTally,
        decisions: &[(Xid, Decision)],
        report: &mut RecoveryReport,
    ) -> RecoveryResult<()> {
        for (xid, decision) in decisions {
            let xid_str = xid.to_string();
            let verdict = match decision {
                Decision::Commit => "commit",
                Decision::Rollback => "rollback",
            };
            log_event_with_fields(Event::RecoveryDecision, &[("xid", &xid_str), ("decision", verdict)]);
            if !self.options.inspect_only {
                for &i in tally.engines_for(*xid) {
                    let engine = &engines[i];
                    match decision {
                        Decision::Commit => engine.commit_by_xid(*xid)?,
                        Decision::Rollback => engine.rollback_by_xid(*xid)?,
                    }
                }
            }
            match decision {
                Decision::Commit => report.committed.push(*xid),
                Decision::Rollback => report.rolled_back.push(*xid),
            }
        }
        report.applied = !self.options.inspect_only;
        if report.applied {
            self.metrics.add_recovery_commits(report.committed.len() as u64);
            self.metrics.add_recovery_rollbacks(report.rolled_back.len() as u64);
        }
        Ok(())
    }

    /// Position state as of the end of the log (or `cut` in the last file).
    ///
    /// Starts from the newest complete position list, walking back past
    /// silent ones, then replays every group logged after it.
    fn rebuild_gtid_state(
        &self,
        index: &LogFileIndex,
        scans: &[FileScan],
        cut: Option<u64>,
    ) -> RecoveryResult<Vec<Gtid>> {
        let entries = index.entries();
        let last_name = match entries.last() {
            Some(name) => name,
            None => return Ok(Vec::new()),
        };
        let known: HashMap<&str, &FileScan> = scans.iter().map(|s| (s.name.as_str(), s)).collect();

        let mut chain: Vec<FileScan> = Vec::new();
        for name in entries.iter().rev() {
            let scan = match known.get(name.as_str()) {
                Some(s) => (*s).clone(),
                None => self.scan(index, name, ScanOptions::default())?,
            };
            let complete = scan.gtid_list.as_ref().map_or(false, |l| l.complete);
            chain.push(scan);
            if complete {
                break;
            }
        }
        chain.reverse();

        let mut state = chain
            .first()
            .and_then(|s| s.gtid_list.as_ref())
            .filter(|l| l.complete)
            .map(|l| GtidState::from_list(&l.gtids))
            .unwrap_or_default();
        for scan in &chain {
            let limit = if &scan.name == last_name { cut } else { None };
            for group in &scan.groups {
                if limit.map_or(false, |c| group.start >= c) {
                    break;
                }
                state
                    .update(group.gtid, false)
                    .map_err(|e| RecoveryError::failed(e.to_string()))?;
            }
        }
        Ok(state.to_list())
    }

    /// Every group in the log, oldest first, with body records.
    ///
    /// A damaged tail of an in-use last file is skipped rather than
    /// reported.
    pub fn scan_groups(&self) -> RecoveryResult<Vec<CompletedGroup>> {
        let index = self.open_index()?;
        let mut groups = Vec::new();
        let last = index.entries().len().saturating_sub(1);
        for (i, name) in index.entries().iter().enumerate() {
            let scan = self.scan(
                &index,
                name,
                ScanOptions {
                    allow_torn_tail: i == last,
                    collect_bodies: true,
                },
            )?;
            groups.extend(scan.groups);
        }
        Ok(groups)
    }
}

/// Cut `path` back to `len` bytes and make it durable
fn truncate_file(path: &Path, name: &str, len: u64) -> RecoveryResult<()> {
    let file = OpenOptions::new()
        .write(true)
        .open(path)
        .map_err(|e| RecoveryError::failed(format!("cannot open {}: {}", name, e)))?;
    file.set_len(len)
        .and_then(|_| file.sync_all())
        .map_err(|e| RecoveryError::failed(format!("cannot truncate {} to {}: {}", name, len, e)))
}
