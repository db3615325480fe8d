//! Log file store
//!
//! Owns the active log file and the index. Not internally synchronized:
//! the group-commit coordinator keeps the store behind its append lock,
//! which therefore also guards the index.
//!
//! Durability order for a new file: write header and markers, fsync the
//! file and its directory, then append the name to the index. During
//! rotation the old file stays open (and in use) until its successor is
//! durable and indexed, so a crash at any point leaves a valid last file.
//!
//! The first write or fsync failure breaks the store for the rest of the
//! process; every later call reports `BINLOG_LOG_DISABLED`.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;

use crate::crash_point::{maybe_crash, points};
use crate::observability::{log_event_with_fields, Event, MetricsRegistry};

use super::checksum::ChecksumAlg;
use super::crypto::{KeyProvider, RecordCipher};
use super::errors::{BinlogError, BinlogResult};
use super::header::{mark_closed, FileHeader, HEADER_LEN};
use super::index::{sync_dir, LogFileIndex};
use super::reader::{LogReader, ReaderPins};
use super::record::{CheckpointPayload, GtidListPayload, LogRecord, RotatePayload};

/// Static settings of a store
#[derive(Clone)]
pub struct StoreOptions {
    pub dir: PathBuf,
    pub basename: String,
    pub max_file_size: u64,
    /// fsync every N commits; 0 leaves flushing to the OS
    pub sync_period: u32,
    pub checksum: ChecksumAlg,
    pub keys: Option<Arc<dyn KeyProvider>>,
}

/// A position in the log
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct LogPosition {
    pub file: String,
    pub offset: u64,
}

/// Markers written at the head of a new file
#[derive(Debug, Clone)]
pub struct FileHead {
    pub gtid_list: GtidListPayload,
    /// Oldest file crash recovery must still scan; `None` names the new
    /// file itself
    pub checkpoint: Option<String>,
}

/// Byte range of one appended unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitSpan {
    pub start: u64,
    /// Offset of the unit's last record
    pub last_record: u64,
    pub end: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotateOutcome {
    pub old_file: String,
    pub new_file: String,
}

/// Why a purge stopped early
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PurgeBlock {
    Active(String),
    Pinned(String),
    NeededByRecovery(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeOutcome {
    pub purged: Vec<String>,
    pub blocked: Option<PurgeBlock>,
}

struct ActiveFile {
    name: String,
    file: File,
    len: u64,
    cipher: Option<RecordCipher>,
}

pub struct LogFileStore {
    options: StoreOptions,
    index: LogFileIndex,
    active: Option<ActiveFile>,
    pins: ReaderPins,
    broken: Option<String>,
    unsynced_commits: u32,
    /// Fault injection: fail the next append as if the disk were full
    fail_next_write: bool,
    metrics: Arc<MetricsRegistry>,
}

impl LogFileStore {
    /// Opens the index. No file is active until `create_new_file`.
    pub fn open(options: StoreOptions, metrics: Arc<MetricsRegistry>) -> BinlogResult<Self> {
        let index = LogFileIndex::open(&options.dir, &options.basename)?;
        Ok(Self {
            options,
            index,
            active: None,
            pins: ReaderPins::new(),
            broken: None,
            unsynced_commits: 0,
            fail_next_write: false,
            metrics,
        })
    }

    /// Make the next append fail with an I/O error
    #[doc(hidden)]
    pub fn inject_write_failure(&mut self) {
        self.fail_next_write = true;
    }

    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    pub fn index(&self) -> &LogFileIndex {
        &self.index
    }

    pub fn file_names(&self) -> Vec<String> {
        self.index.entries().to_vec()
    }

    pub fn file_path(&self, name: &str) -> PathBuf {
        self.index.file_path(name)
    }

    pub fn active_name(&self) -> Option<&str> {
        self.active.as_ref().map(|a| a.name.as_str())
    }

    /// Current end of the active file
    pub fn position(&self) -> Option<LogPosition> {
        self.active.as_ref().map(|a| LogPosition {
            file: a.name.clone(),
            offset: a.len,
        })
    }

    pub fn pins(&self) -> &ReaderPins {
        &self.pins
    }

    pub fn is_broken(&self) -> bool {
        self.broken.is_some()
    }

    /// Create the first active file of this process
    pub fn create_new_file(&mut self, head: &FileHead) -> BinlogResult<String> {
        self.check_usable()?;
        if self.active.is_some() {
            return Err(BinlogError::invalid_state(
                "create_new_file called while a file is active",
            ));
        }
        let active = match self.write_new_file(head) {
            Ok(a) => a,
            Err(e) => return Err(self.fail(e)),
        };
        if let Err(e) = self.index.append(&active.name) {
            return Err(self.fail(e));
        }
        let name = active.name.clone();
        log_event_with_fields(Event::FileCreated, &[("file", &name)]);
        self.active = Some(active);
        Ok(name)
    }

    fn write_new_file(&self, head: &FileHead) -> BinlogResult<ActiveFile> {
        let name = self.index.next_file_name();
        let path = self.index.file_path(&name);
        // An unindexed file of this name can only be a leftover from a
        // crash before its index append; it never held committed data.
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| BinlogError::append_failed(format!("cannot create {}", name), e))?;

        let alg = self.options.checksum;
        let mut buf = FileHeader::new_active(alg).encode().to_vec();
        let cipher = match &self.options.keys {
            Some(keys) => {
                let cipher = RecordCipher::for_new_file(keys.as_ref())?;
                LogRecord::start_encryption(&cipher.marker()).encode_stored(
                    buf.len() as u64,
                    alg,
                    None,
                    &mut buf,
                );
                Some(cipher)
            }
            None => None,
        };
        let gtid_list = LogRecord::gtid_list(&head.gtid_list);
        gtid_list.encode_stored(buf.len() as u64, alg, cipher.as_ref(), &mut buf);
        let checkpoint = LogRecord::checkpoint(&CheckpointPayload {
            oldest_file: head.checkpoint.clone().unwrap_or_else(|| name.clone()),
        });
        checkpoint.encode_stored(buf.len() as u64, alg, cipher.as_ref(), &mut buf);

        file.write_all(&buf)
            .map_err(|e| BinlogError::append_failed(format!("cannot write head of {}", name), e))?;
        file.sync_all()
            .map_err(|e| BinlogError::fsync_failed(format!("fsync of {} failed", name), e))?;
        sync_dir(&self.options.dir)?;
        self.metrics.increment_fsyncs();

        Ok(ActiveFile {
            name,
            file,
            len: buf.len() as u64,
            cipher,
        })
    }

    /// Appends every unit with a single write and returns each unit's span.
    ///
    /// Units are laid out in the given order; nothing is fsynced here.
    pub fn append_units(&mut self, units: &[Vec<LogRecord>]) -> BinlogResult<Vec<UnitSpan>> {
        self.check_usable()?;
        let alg = self.options.checksum;
        let active = self
            .active
            .as_mut()
            .ok_or_else(|| BinlogError::invalid_state("append with no active log file"))?;

        let mut buf = Vec::new();
        let mut spans = Vec::with_capacity(units.len());
        let mut records = 0u64;
        for unit in units {
            let start = active.len + buf.len() as u64;
            let mut last_record = start;
            for record in unit {
                last_record = active.len + buf.len() as u64;
                record.encode_stored(last_record, alg, active.cipher.as_ref(), &mut buf);
                records += 1;
            }
            spans.push(UnitSpan {
                start,
                last_record,
                end: active.len + buf.len() as u64,
            });
        }

        let written = if std::mem::take(&mut self.fail_next_write) {
            Err(io::Error::new(io::ErrorKind::Other, "injected write failure"))
        } else {
            active.file.write_all(&buf)
        };
        let name = active.name.clone();
        match written {
            Ok(()) => {
                active.len += buf.len() as u64;
                self.metrics.add_bytes_written(buf.len() as u64);
                self.metrics.add_records_written(records);
                Ok(spans)
            }
            Err(e) => Err(self.fail(BinlogError::append_failed(
                format!("write of {} bytes to {} failed", buf.len(), name),
                e,
            ))),
        }
    }

    /// Count `commits` toward the sync period and fsync when it is reached.
    ///
    /// Returns whether an fsync was issued.
    pub fn sync_if_due(&mut self, commits: u32) -> BinlogResult<bool> {
        self.check_usable()?;
        self.unsynced_commits = self.unsynced_commits.saturating_add(commits);
        if self.options.sync_period == 0 || self.unsynced_commits < self.options.sync_period {
            return Ok(false);
        }
        self.sync_now()?;
        Ok(true)
    }

    /// fsync the active file unconditionally
    pub fn sync_now(&mut self) -> BinlogResult<()> {
        self.check_usable()?;
        let active = self
            .active
            .as_mut()
            .ok_or_else(|| BinlogError::invalid_state("sync with no active log file"))?;
        let name = active.name.clone();
        match active.file.sync_data() {
            Ok(()) => {
                self.unsynced_commits = 0;
                self.metrics.increment_fsyncs();
                Ok(())
            }
            Err(e) => Err(self.fail(BinlogError::fsync_failed(
                format!("fsync of {} failed", name),
                e,
            ))),
        }
    }

    pub fn should_rotate(&self) -> bool {
        self.active
            .as_ref()
            .is_some_and(|a| a.len >= self.options.max_file_size)
    }

    /// Close the active file with a rotate marker and switch to a new one
    pub fn rotate(&mut self, head: &FileHead) -> BinlogResult<RotateOutcome> {
        self.check_usable()?;
        let old_name = self
            .active_name()
            .ok_or_else(|| BinlogError::invalid_state("rotate with no active log file"))?
            .to_string();
        let new_name = self.index.next_file_name();

        let rotate = LogRecord::rotate(&RotatePayload {
            next_file: new_name.clone(),
            position: HEADER_LEN as u64,
        });
        self.append_units(&[vec![rotate]])?;
        self.sync_now()?;

        let next = match self.write_new_file(head) {
            Ok(next) => next,
            Err(e) => return Err(self.fail(e)),
        };
        maybe_crash(points::ROTATE_BEFORE_INDEX);
        if let Err(e) = self.index.append(&next.name) {
            return Err(self.fail(e));
        }
        maybe_crash(points::ROTATE_AFTER_INDEX);

        if let Some(mut old) = self.active.replace(next) {
            if let Err(e) = mark_closed(&old.name, &mut old.file) {
                return Err(self.fail(e));
            }
        }
        self.metrics.increment_rotations();
        log_event_with_fields(
            Event::FileRotated,
            &[("from", &old_name), ("to", &new_name)],
        );
        Ok(RotateOutcome {
            old_file: old_name,
            new_file: new_name,
        })
    }

    /// Append a single out-of-band record (checkpoint, incident) and fsync
    pub fn append_marker(&mut self, record: LogRecord) -> BinlogResult<UnitSpan> {
        let spans = self.append_units(&[vec![record]])?;
        self.sync_now()?;
        spans
            .into_iter()
            .next()
            .ok_or_else(|| BinlogError::invalid_state("marker append produced no span"))
    }

    /// Delete every file before `to`, stopping at the first file that is
    /// active, open by a reader, or still needed by crash recovery.
    pub fn purge_to(
        &mut self,
        to: &str,
        needed_by_recovery: &dyn Fn(&str) -> bool,
    ) -> BinlogResult<PurgeOutcome> {
        let end = self
            .index
            .position(to)
            .ok_or_else(|| BinlogError::invalid_state(format!("{} is not in the log index", to)))?;

        let mut outcome = PurgeOutcome::default();
        for name in &self.index.entries()[..end] {
            let block = if Some(name.as_str()) == self.active_name() {
                Some(PurgeBlock::Active(name.clone()))
            } else if self.pins.is_pinned(name)? {
                Some(PurgeBlock::Pinned(name.clone()))
            } else if needed_by_recovery(name) {
                Some(PurgeBlock::NeededByRecovery(name.clone()))
            } else {
                None
            };
            if let Some(block) = block {
                log_event_with_fields(Event::PurgeBlocked, &[("file", name)]);
                outcome.blocked = Some(block);
                break;
            }
            outcome.purged.push(name.clone());
        }

        self.index.purge(&outcome.purged)?;
        self.metrics.add_purged_files(outcome.purged.len() as u64);
        for name in &outcome.purged {
            log_event_with_fields(Event::FilePurged, &[("file", name)]);
        }
        Ok(outcome)
    }

    /// Open a reader on an indexed file, pinning it against purge
    pub fn open_reader(&self, name: &str) -> BinlogResult<LogReader> {
        if !self.index.contains(name) {
            return Err(BinlogError::invalid_state(format!("{} is not in the log index", name)));
        }
        let pin = self.pins.pin(name)?;
        let reader = LogReader::open(&self.index.file_path(name), name, self.options.keys.clone())?;
        Ok(reader.with_pin(pin))
    }

    /// Clean close: fsync and clear the in-use flag. A broken store leaves
    /// the flag set so the next start runs crash recovery.
    pub fn close(&mut self) -> BinlogResult<()> {
        let Some(mut active) = self.active.take() else {
            return Ok(());
        };
        if self.broken.is_some() {
            return Ok(());
        }
        active
            .file
            .sync_all()
            .map_err(|e| BinlogError::fsync_failed(format!("fsync of {} failed", active.name), e))?;
        mark_closed(&active.name, &mut active.file)?;
        log_event_with_fields(Event::FileClosed, &[("file", &active.name)]);
        Ok(())
    }

    fn check_usable(&self) -> BinlogResult<()> {
        match &self.broken {
            Some(reason) => Err(BinlogError::log_disabled(reason.clone())),
            None => Ok(()),
        }
    }

    /// Stop taking writes; later calls fail with `LogDisabled`. The first
    /// reason sticks.
    pub fn disable(&mut self, reason: impl Into<String>) {
        if self.broken.is_none() {
            let reason = reason.into();
            log_event_with_fields(Event::LogDisabled, &[("reason", &reason)]);
            self.broken = Some(reason);
        }
    }

    /// Record the first failure and disable the store
    fn fail(&mut self, err: BinlogError) -> BinlogError {
        if err.code().disables_logging() {
            self.disable(err.to_string());
        }
        err
    }
}

/// Size of a file on disk
pub fn file_len(path: &Path) -> BinlogResult<u64> {
    std::fs::metadata(path)
        .map(|m| m.len())
        .map_err(|e| BinlogError::io(format!("cannot stat {}", path.display()), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binlog::record::{CommitPayload, RecordType};
    use crate::gtid::Gtid;
    use tempfile::TempDir;

    fn options(dir: &Path) -> StoreOptions {
        StoreOptions {
            dir: dir.to_path_buf(),
            basename: "binlog".into(),
            max_file_size: 1 << 20,
            sync_period: 1,
            checksum: ChecksumAlg::Crc32,
            keys: None,
        }
    }

    fn head() -> FileHead {
        FileHead {
            gtid_list: GtidListPayload::complete(vec![Gtid::new(0, 1, 4)]),
            checkpoint: None,
        }
    }

    fn unit(tag: &[u8]) -> Vec<LogRecord> {
        vec![
            LogRecord::data_change(tag.to_vec(), true),
            LogRecord::commit(&CommitPayload::plain()),
        ]
    }

    fn open(dir: &Path) -> (LogFileStore, Arc<MetricsRegistry>) {
        let metrics = Arc::new(MetricsRegistry::new());
        let store = LogFileStore::open(options(dir), Arc::clone(&metrics)).unwrap();
        (store, metrics)
    }

    #[test]
    fn test_create_and_append() {
        let dir = TempDir::new().unwrap();
        let (mut store, metrics) = open(dir.path());
        let name = store.create_new_file(&head()).unwrap();
        assert_eq!(name, "binlog.000001");

        let spans = store.append_units(&[unit(b"a"), unit(b"b")]).unwrap();
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0].end, spans[1].start);
        assert!(spans[1].last_record > spans[1].start);
        assert!(store.sync_if_due(2).unwrap());
        assert_eq!(metrics.snapshot().records_written, 4);

        let mut reader = store.open_reader(&name).unwrap();
        let records = reader.read_all().unwrap();
        assert_eq!(records[0].record.record_type, RecordType::GtidList);
        assert_eq!(records[1].record.record_type, RecordType::Checkpoint);
        assert_eq!(records.len(), 6);
        assert_eq!(records[5].offset, spans[1].last_record);
    }

    #[test]
    fn test_sync_period_throttles() {
        let dir = TempDir::new().unwrap();
        let mut opts = options(dir.path());
        opts.sync_period = 3;
        let metrics = Arc::new(MetricsRegistry::new());
        let mut store = LogFileStore::open(opts, Arc::clone(&metrics)).unwrap();
        store.create_new_file(&head()).unwrap();
        let before = metrics.fsyncs();
        assert!(!store.sync_if_due(1).unwrap());
        assert!(!store.sync_if_due(1).unwrap());
        assert!(store.sync_if_due(1).unwrap());
        assert_eq!(metrics.fsyncs(), before + 1);
    }

    #[test]
    fn test_rotate_keeps_both_files_valid() {
        let dir = TempDir::new().unwrap();
        let (mut store, _) = open(dir.path());
        store.create_new_file(&head()).unwrap();
        store.append_units(&[unit(b"a")]).unwrap();
        let outcome = store.rotate(&head()).unwrap();
        assert_eq!(outcome.old_file, "binlog.000001");
        assert_eq!(outcome.new_file, "binlog.000002");
        assert_eq!(store.file_names(), vec!["binlog.000001", "binlog.000002"]);

        let mut old = store.open_reader("binlog.000001").unwrap();
        assert!(!old.header().is_in_use());
        let last = old.read_all().unwrap().pop().unwrap();
        assert_eq!(last.record.record_type, RecordType::Rotate);

        let new = store.open_reader("binlog.000002").unwrap();
        assert!(new.header().is_in_use());
    }

    #[test]
    fn test_close_clears_in_use() {
        let dir = TempDir::new().unwrap();
        let (mut store, _) = open(dir.path());
        store.create_new_file(&head()).unwrap();
        store.close().unwrap();
        let reader = store.open_reader("binlog.000001").unwrap();
        assert!(!reader.header().is_in_use());
    }

    #[test]
    fn test_purge_guards() {
        let dir = TempDir::new().unwrap();
        let (mut store, _) = open(dir.path());
        store.create_new_file(&head()).unwrap();
        store.rotate(&head()).unwrap();
        store.rotate(&head()).unwrap();
        store.rotate(&head()).unwrap();

        // Reader pin on the second file stops the purge there
        let pinned = store.open_reader("binlog.000002").unwrap();
        let outcome = store.purge_to("binlog.000004", &|_| false).unwrap();
        assert_eq!(outcome.purged, vec!["binlog.000001"]);
        assert_eq!(outcome.blocked, Some(PurgeBlock::Pinned("binlog.000002".into())));
        drop(pinned);

        let outcome = store
            .purge_to("binlog.000004", &|name| name == "binlog.000003")
            .unwrap();
        assert_eq!(outcome.purged, vec!["binlog.000002"]);
        assert_eq!(
            outcome.blocked,
            Some(PurgeBlock::NeededByRecovery("binlog.000003".into()))
        );

        assert!(store.purge_to("binlog.000099", &|_| false).is_err());
        assert_eq!(store.file_names(), vec!["binlog.000003", "binlog.000004"]);
    }

    #[test]
    fn test_encrypted_store() {
        use crate::binlog::crypto::StaticKeyProvider;

        let dir = TempDir::new().unwrap();
        let mut opts = options(dir.path());
        opts.keys = Some(Arc::new(StaticKeyProvider::new(2, vec![5u8; 32])));
        let mut store = LogFileStore::open(opts, Arc::new(MetricsRegistry::new())).unwrap();
        store.create_new_file(&head()).unwrap();
        store.append_units(&[unit(b"secret-row")]).unwrap();
        store.sync_now().unwrap();

        let raw = std::fs::read(store.file_path("binlog.000001")).unwrap();
        assert!(!raw.windows(10).any(|w| w == b"secret-row"));

        let mut reader = store.open_reader("binlog.000001").unwrap();
        let records = reader.read_all().unwrap();
        assert!(records.iter().any(|r| r.record.payload == b"secret-row"));
    }
}
