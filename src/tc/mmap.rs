//! Memory-mapped slot journal
//!
//! A fixed-size file split into pages of 8-byte slots. Each live
//! transaction id occupies one slot; zero marks a free slot. The first 16
//! bytes of page 0 hold the header:
//! - Magic (8 bytes): `BLTCLOG1`
//! - Page size (u32 LE)
//! - Page count (u32 LE)
//!
//! Writers fill slots and then wait for a sync epoch covering their write.
//! A single background thread fsyncs the file on behalf of every writer
//! that arrived since its previous fsync, so many reservations share one
//! fsync. The file exists only while the server runs; a clean close deletes
//! it, and finding it at startup means the previous run crashed.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use memmap2::MmapMut;

use crate::binlog::LogPosition;
use crate::crash_point::{maybe_crash, points};
use crate::engine::{RecoverableEngine, Xid};
use crate::observability::{log_event_with_fields, Event, MetricsRegistry};

use super::{TcError, TcResult, TcToken, TransactionCoordinatorLog};

pub const JOURNAL_FILE_NAME: &str = "tc.log";

const MAGIC: &[u8; 8] = b"BLTCLOG1";
const HEADER_LEN: usize = 16;
const SLOT_LEN: usize = 8;

struct JournalState {
    map: MmapMut,
    /// Free slot numbers; popped from the end so pages fill in order
    free: Vec<usize>,
    written_epoch: u64,
    synced_epoch: u64,
    sync_error: Option<String>,
    shutdown: bool,
}

struct Shared {
    state: Mutex<JournalState>,
    slot_freed: Condvar,
    sync_wanted: Condvar,
    synced: Condvar,
    file: File,
    metrics: Arc<MetricsRegistry>,
}

pub struct MmapTc {
    shared: Arc<Shared>,
    syncer: Mutex<Option<JoinHandle<()>>>,
    path: PathBuf,
    slots: usize,
}

fn slot_offset(slot: usize) -> usize {
    HEADER_LEN + slot * SLOT_LEN
}

impl MmapTc {
    /// Create a fresh journal at `path`.
    ///
    /// Fails with `NeedsRecovery` if a journal is already there.
    pub fn create(
        path: &Path,
        size: usize,
        page_size: usize,
        metrics: Arc<MetricsRegistry>,
    ) -> TcResult<Self> {
        if page_size < HEADER_LEN + SLOT_LEN || page_size % SLOT_LEN != 0 {
            return Err(TcError::Config(format!("bad page size {}", page_size)));
        }
        if size < page_size || size % page_size != 0 {
            return Err(TcError::Config(format!(
                "journal size {} is not a positive multiple of page size {}",
                size, page_size
            )));
        }
        if path.exists() {
            return Err(TcError::NeedsRecovery(path.to_path_buf()));
        }

        let file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(path)?;
        file.set_len(size as u64)?;
        // SAFETY: the file was just created by this process and is only
        // ever accessed through this mapping while the journal is open.
        let mut map = unsafe { MmapMut::map_mut(&file)? };
        map[0..8].copy_from_slice(MAGIC);
        map[8..12].copy_from_slice(&(page_size as u32).to_le_bytes());
        map[12..16].copy_from_slice(&((size / page_size) as u32).to_le_bytes());
        map.flush()?;
        file.sync_all()?;

        let slots = (size - HEADER_LEN) / SLOT_LEN;
        let free: Vec<usize> = (0..slots).rev().collect();
        let shared = Arc::new(Shared {
            state: Mutex::new(JournalState {
                map,
                free,
                written_epoch: 0,
                synced_epoch: 0,
                sync_error: None,
                shutdown: false,
            }),
            slot_freed: Condvar::new(),
            sync_wanted: Condvar::new(),
            synced: Condvar::new(),
            file: file.try_clone()?,
            metrics,
        });

        let worker = Arc::clone(&shared);
        let syncer = thread::Builder::new()
            .name("tc-journal-sync".into())
            .spawn(move || worker.run_syncer())?;

        Ok(Self {
            shared,
            syncer: Mutex::new(Some(syncer)),
            path: path.to_path_buf(),
            slots,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn capacity(&self) -> usize {
        self.slots
    }

    fn stop_syncer(&self) -> TcResult<()> {
        {
            let mut state = self.shared.state.lock()?;
            state.shutdown = true;
        }
        self.shared.sync_wanted.notify_all();
        self.shared.slot_freed.notify_all();
        self.shared.synced.notify_all();
        if let Some(handle) = self.syncer.lock()?.take() {
            handle
                .join()
                .map_err(|_| TcError::SyncFailed("journal sync thread panicked".into()))?;
        }
        Ok(())
    }
}

impl Shared {
    fn run_syncer(&self) {
        loop {
            let target = {
                let mut state = match self.state.lock() {
                    Ok(s) => s,
                    Err(_) => return,
                };
                while !state.shutdown && state.synced_epoch == state.written_epoch {
                    state = match self.sync_wanted.wait(state) {
                        Ok(s) => s,
                        Err(_) => return,
                    };
                }
                if state.synced_epoch == state.written_epoch {
                    return;
                }
                state.written_epoch
            };

            // Dirty mapped pages share the file's page cache, so syncing
            // the file descriptor persists them without holding the lock.
            let result = self.file.sync_data();
            maybe_crash(points::TC_AFTER_SLOT_SYNC);

            let Ok(mut state) = self.state.lock() else {
                return;
            };
            match result {
                Ok(()) => {
                    state.synced_epoch = state.synced_epoch.max(target);
                    self.metrics.increment_tc_syncs();
                }
                Err(e) => {
                    state.sync_error = Some(e.to_string());
                    state.synced_epoch = state.written_epoch;
                }
            }
            drop(state);
            self.synced.notify_all();
        }
    }
}

impl TransactionCoordinatorLog for MmapTc {
    fn name(&self) -> &'static str {
        "mmap"
    }

    fn reserve_durability_tokens(
        &self,
        _anchor: &LogPosition,
        xids: &[Xid],
    ) -> TcResult<Vec<TcToken>> {
        if xids.contains(&0) {
            return Err(TcError::ZeroXid);
        }
        // Slots held by this call are only freed after it returns
        if xids.len() > self.slots {
            log_event_with_fields(Event::TcJournalFull, &[]);
            return Err(TcError::BatchTooLarge {
                batch: xids.len(),
                capacity: self.slots,
            });
        }
        let shared = &self.shared;
        let mut state = shared.state.lock()?;
        let mut tokens = Vec::with_capacity(xids.len());
        for &xid in xids {
            let mut reported_full = false;
            let slot = loop {
                if state.shutdown {
                    return Err(TcError::Closed);
                }
                if let Some(slot) = state.free.pop() {
                    break slot;
                }
                if !reported_full {
                    log_event_with_fields(Event::TcJournalFull, &[]);
                    reported_full = true;
                }
                state = shared.slot_freed.wait(state)?;
            };
            let off = slot_offset(slot);
            state.map[off..off + SLOT_LEN].copy_from_slice(&xid.to_le_bytes());
            state.written_epoch += 1;
            tokens.push(TcToken::Slot { slot, xid });
        }
        let target = state.written_epoch;
        shared.sync_wanted.notify_one();

        while state.synced_epoch < target {
            if state.shutdown {
                return Err(TcError::Closed);
            }
            state = shared.synced.wait(state)?;
        }
        if let Some(reason) = state.sync_error.clone() {
            for token in &tokens {
                if let TcToken::Slot { slot, .. } = token {
                    let off = slot_offset(*slot);
                    state.map[off..off + SLOT_LEN].fill(0);
                    state.free.push(*slot);
                }
            }
            shared.slot_freed.notify_all();
            return Err(TcError::SyncFailed(reason));
        }
        Ok(tokens)
    }

    fn release_token(&self, token: TcToken) -> TcResult<()> {
        let TcToken::Slot { slot, xid } = token else {
            return Err(TcError::Config("log token released to the slot journal".into()));
        };
        if slot >= self.slots {
            return Err(TcError::Config(format!("slot {} out of range", slot)));
        }
        let mut state = self.shared.state.lock()?;
        let off = slot_offset(slot);
        let mut current = [0u8; SLOT_LEN];
        current.copy_from_slice(&state.map[off..off + SLOT_LEN]);
        // A slot already cleared (or reused) means this token was released
        if u64::from_le_bytes(current) == xid {
            state.map[off..off + SLOT_LEN].fill(0);
            state.free.push(slot);
            drop(state);
            self.shared.slot_freed.notify_one();
        }
        Ok(())
    }

    fn on_new_file(&self, _old_file: &str, _new_file: &str) -> TcResult<()> {
        Ok(())
    }

    fn request_durable_checkpoint(
        &self,
        _file: &str,
        engines: &[Arc<dyn RecoverableEngine>],
    ) -> TcResult<()> {
        // Recovery reads the journal, not old log files; engines are still
        // asked so they can bound their own redo.
        for engine in engines {
            engine.commit_checkpoint_request(crate::engine::CheckpointNotifier::new(|| {}));
        }
        Ok(())
    }

    fn oldest_needed_file(&self) -> Option<String> {
        None
    }

    fn is_file_needed(&self, _name: &str) -> bool {
        false
    }

    fn close(&self) -> TcResult<()> {
        self.stop_syncer()?;
        remove_journal(&self.path)
    }
}

impl Drop for MmapTc {
    fn drop(&mut self) {
        let _ = self.stop_syncer();
    }
}

/// Live transaction ids in a journal left by a crashed run, or `None` if
/// there is no journal
pub fn read_journal(path: &Path) -> TcResult<Option<Vec<Xid>>> {
    let bytes = match fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let corrupt = |reason: &str| TcError::Corrupt {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    };
    if bytes.len() < HEADER_LEN || &bytes[0..8] != MAGIC {
        return Err(corrupt("bad magic"));
    }
    let page_size = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize;
    let pages = u32::from_le_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]) as usize;
    if page_size == 0 || page_size * pages != bytes.len() {
        return Err(corrupt("size does not match header"));
    }
    let xids = bytes[HEADER_LEN..]
        .chunks_exact(SLOT_LEN)
        .filter_map(|chunk| {
            let mut raw = [0u8; SLOT_LEN];
            raw.copy_from_slice(chunk);
            let xid = u64::from_le_bytes(raw);
            (xid != 0).then_some(xid)
        })
        .collect();
    Ok(Some(xids))
}

/// Delete a journal; missing is fine
pub fn remove_journal(path: &Path) -> TcResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
