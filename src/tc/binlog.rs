//! Registrar backed by the log itself
//!
//! One `XidBookkeepingEntry` per live log file, oldest first, the active
//! file last. An entry counts transactions whose commit record is in that
//! file but which engines may not have made durable yet, plus one hold per
//! outstanding checkpoint barrier. Leading entries that reach zero are
//! dropped, and the new oldest file is announced with a `Checkpoint` record
//! so recovery knows it need not look further back.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::binlog::record::{CheckpointPayload, LogRecord};
use crate::binlog::{LogFileStore, LogPosition};
use crate::engine::{CheckpointNotifier, RecoverableEngine, Xid};
use crate::observability::{log_event_with_fields, Event, Logger, MetricsRegistry};

use super::{TcError, TcResult, TcToken, TransactionCoordinatorLog};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XidBookkeepingEntry {
    pub file: String,
    /// Logged transactions not yet released
    pub pending: usize,
    /// Checkpoint barriers not yet confirmed by every engine
    pub holds: usize,
}

impl XidBookkeepingEntry {
    fn new(file: &str) -> Self {
        Self {
            file: file.to_string(),
            pending: 0,
            holds: 0,
        }
    }

    fn is_idle(&self) -> bool {
        self.pending == 0 && self.holds == 0
    }
}

struct Inner {
    entries: Mutex<VecDeque<XidBookkeepingEntry>>,
    /// Oldest file named by the last checkpoint record written
    announced: Mutex<String>,
    store: Arc<Mutex<LogFileStore>>,
    metrics: Arc<MetricsRegistry>,
}

pub struct BinlogTc {
    inner: Arc<Inner>,
}

impl BinlogTc {
    /// Start bookkeeping with `active_file` as the only live file
    pub fn new(
        store: Arc<Mutex<LogFileStore>>,
        active_file: &str,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        let mut entries = VecDeque::new();
        entries.push_back(XidBookkeepingEntry::new(active_file));
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(entries),
                announced: Mutex::new(active_file.to_string()),
                store,
                metrics,
            }),
        }
    }

    /// Snapshot of the bookkeeping list
    pub fn entries(&self) -> TcResult<Vec<XidBookkeepingEntry>> {
        Ok(self.inner.entries.lock()?.iter().cloned().collect())
    }
}

impl Inner {
    /// Drop idle leading entries; returns whether the oldest file changed
    fn advance(entries: &mut VecDeque<XidBookkeepingEntry>) -> bool {
        let mut advanced = false;
        while entries.len() > 1 && entries.front().is_some_and(XidBookkeepingEntry::is_idle) {
            entries.pop_front();
            advanced = true;
        }
        advanced
    }

    fn release_hold(&self, file: &str) -> TcResult<()> {
        let advanced = {
            let mut entries = self.entries.lock()?;
            if let Some(entry) = entries.iter_mut().find(|e| e.file == file) {
                entry.holds = entry.holds.saturating_sub(1);
            }
            Self::advance(&mut entries)
        };
        if advanced {
            self.announce_checkpoint()?;
        }
        Ok(())
    }

    /// Write a checkpoint record if the oldest needed file moved
    fn announce_checkpoint(&self) -> TcResult<()> {
        let mut announced = self.announced.lock()?;
        let oldest = match self.entries.lock()?.front() {
            Some(entry) => entry.file.clone(),
            None => return Ok(()),
        };
        if *announced == oldest {
            return Ok(());
        }
        let record = LogRecord::checkpoint(&CheckpointPayload {
            oldest_file: oldest.clone(),
        });
        let mut store = self.store.lock()?;
        if store.is_broken() {
            return Ok(());
        }
        store.append_marker(record).map_err(TcError::from)?;
        drop(store);
        *announced = oldest.clone();
        self.metrics.increment_tc_checkpoints();
        log_event_with_fields(Event::TcCheckpoint, &[("oldest_file", &oldest)]);
        Ok(())
    }
}

impl TransactionCoordinatorLog for BinlogTc {
    fn name(&self) -> &'static str {
        "binlog"
    }

    fn reserve_durability_tokens(
        &self,
        anchor: &LogPosition,
        xids: &[Xid],
    ) -> TcResult<Vec<TcToken>> {
        let mut entries = self.inner.entries.lock()?;
        let entry = entries
            .iter_mut()
            .rev()
            .find(|e| e.file == anchor.file)
            .ok_or_else(|| {
                TcError::Config(format!("{} is not a live log file", anchor.file))
            })?;
        entry.pending += xids.len();
        Ok(xids
            .iter()
            .map(|&xid| TcToken::Binlog {
                file: anchor.file.clone(),
                xid,
            })
            .collect())
    }

    fn release_token(&self, token: TcToken) -> TcResult<()> {
        let TcToken::Binlog { file, .. } = token else {
            return Err(TcError::Config("slot token released to the log registrar".into()));
        };
        let advanced = {
            let mut entries = self.inner.entries.lock()?;
            // Entries already dropped mean the token was released before
            match entries.iter_mut().find(|e| e.file == file) {
                Some(entry) => entry.pending = entry.pending.saturating_sub(1),
                None => return Ok(()),
            }
            Inner::advance(&mut entries)
        };
        if advanced {
            self.inner.announce_checkpoint()?;
        }
        Ok(())
    }

    fn on_new_file(&self, old_file: &str, new_file: &str) -> TcResult<()> {
        let mut entries = self.inner.entries.lock()?;
        if let Some(old) = entries.iter_mut().find(|e| e.file == old_file) {
            old.holds += 1;
        }
        entries.push_back(XidBookkeepingEntry::new(new_file));
        Ok(())
    }

    fn request_durable_checkpoint(
        &self,
        file: &str,
        engines: &[Arc<dyn RecoverableEngine>],
    ) -> TcResult<()> {
        if engines.is_empty() {
            return self.inner.release_hold(file);
        }
        let remaining = Arc::new(AtomicUsize::new(engines.len()));
        for engine in engines {
            let inner = Arc::clone(&self.inner);
            let remaining = Arc::clone(&remaining);
            let file = file.to_string();
            engine.commit_checkpoint_request(CheckpointNotifier::new(move || {
                if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    if let Err(e) = inner.release_hold(&file) {
                        Logger::warn(
                            "TC_CHECKPOINT_FAILED",
                            &[("file", &file), ("reason", &e.to_string())],
                        );
                    }
                }
            }));
        }
        Ok(())
    }

    fn oldest_needed_file(&self) -> Option<String> {
        let entries = self.inner.entries.lock().ok()?;
        entries.front().map(|e| e.file.clone())
    }

    fn is_file_needed(&self, name: &str) -> bool {
        self.inner
            .entries
            .lock()
            .map(|entries| entries.iter().any(|e| e.file == name))
            .unwrap_or(true)
    }

    fn close(&self) -> TcResult<()> {
        Ok(())
    }
}
