//! Per-session transaction cache
//!
//! Two buffers of plain-framed records:
//! - the transaction buffer, flushed at commit (or at rollback when it holds
//!   a non-transactional side effect that cannot be undone)
//! - the statement buffer, for non-transactional changes made outside a
//!   transaction; flushed at statement end, or ahead of the transaction
//!   buffer when the session commits or rolls back first
//!
//! Nothing here touches the disk.

use crate::binlog::record::{IncidentPayload, LogRecord, PlainFrames, RecordType};
use crate::binlog::{BinlogError, BinlogResult};

/// Default upper bound on buffered bytes per session
pub const DEFAULT_MAX_CACHE_SIZE: usize = 4 * 1024 * 1024;

/// Multi-part record still being assembled
#[derive(Debug)]
struct PendingFragment {
    record_type: RecordType,
    flags: u8,
    bytes: Vec<u8>,
}

/// A cache buffer ready to be written as one unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheUnit {
    pub records: Vec<LogRecord>,
    /// Some change in the unit cannot be rolled back
    pub has_nontrans_write: bool,
    /// The unit ends with an integrity-lost marker
    pub incident: bool,
}

#[derive(Debug)]
pub struct SessionCache {
    trx: Vec<u8>,
    stmt: Vec<u8>,
    savepoint: usize,
    stmt_start: usize,
    pending: Option<PendingFragment>,
    trx_has_nontrans: bool,
    incident: Option<String>,
    max_size: usize,
}

impl SessionCache {
    pub fn new(max_size: usize) -> Self {
        Self {
            trx: Vec::new(),
            stmt: Vec::new(),
            savepoint: 0,
            stmt_start: 0,
            pending: None,
            trx_has_nontrans: false,
            incident: None,
            max_size,
        }
    }

    fn ensure_room(&self, extra: usize) -> BinlogResult<()> {
        let pending = self.pending.as_ref().map_or(0, |p| p.bytes.len());
        if self.trx.len() + self.stmt.len() + pending + extra > self.max_size {
            return Err(BinlogError::cache_full(self.max_size));
        }
        Ok(())
    }

    /// Buffer `record`.
    ///
    /// Transactional records always go to the transaction buffer.
    /// Non-transactional records join an open transaction that already has
    /// buffered changes (so they replicate in order with it), otherwise they
    /// go to the statement buffer.
    pub fn append(&mut self, record: &LogRecord, in_transaction: bool) -> BinlogResult<()> {
        self.ensure_room(record.plain_len())?;
        if record.is_transactional() {
            record.encode_plain(&mut self.trx);
        } else if in_transaction && !self.trx.is_empty() {
            record.encode_plain(&mut self.trx);
            self.trx_has_nontrans = true;
        } else {
            record.encode_plain(&mut self.stmt);
        }
        Ok(())
    }

    /// Add a piece of a multi-part record
    pub fn append_fragment(
        &mut self,
        record_type: RecordType,
        flags: u8,
        bytes: &[u8],
    ) -> BinlogResult<()> {
        self.ensure_room(bytes.len())?;
        match &mut self.pending {
            Some(p) if p.record_type == record_type && p.flags == flags => {
                p.bytes.extend_from_slice(bytes);
                Ok(())
            }
            Some(_) => Err(BinlogError::invalid_state(
                "fragment does not match the pending multi-part record",
            )),
            None => {
                self.pending = Some(PendingFragment {
                    record_type,
                    flags,
                    bytes: bytes.to_vec(),
                });
                Ok(())
            }
        }
    }

    /// Complete the pending multi-part record and buffer it
    pub fn finish_fragment(&mut self, in_transaction: bool) -> BinlogResult<()> {
        let pending = self
            .pending
            .take()
            .ok_or_else(|| BinlogError::invalid_state("no multi-part record pending"))?;
        let record = LogRecord::new(pending.record_type, pending.flags, pending.bytes);
        self.append(&record, in_transaction)
    }

    pub fn has_pending_fragment(&self) -> bool {
        self.pending.is_some()
    }

    /// Remember and return the current end of the transaction buffer
    pub fn mark_savepoint(&mut self) -> usize {
        self.savepoint = self.trx.len();
        self.savepoint
    }

    pub fn savepoint(&self) -> usize {
        self.savepoint
    }

    /// Discard everything after `offset` in the transaction buffer,
    /// including any incomplete multi-part record
    pub fn truncate(&mut self, offset: usize) -> BinlogResult<()> {
        if offset > self.trx.len() {
            return Err(BinlogError::invalid_state(format!(
                "truncate to {} beyond buffer end {}",
                offset,
                self.trx.len()
            )));
        }
        self.trx.truncate(offset);
        self.pending = None;
        if self.savepoint > offset {
            self.savepoint = offset;
        }
        if self.stmt_start > offset {
            self.stmt_start = offset;
        }
        Ok(())
    }

    pub fn start_statement(&mut self) {
        self.stmt_start = self.trx.len();
    }

    /// Undo the transactional part of the current statement
    pub fn rollback_statement(&mut self) -> BinlogResult<()> {
        self.truncate(self.stmt_start)
    }

    /// Partial write into the cache failed; readers must be warned
    pub fn set_incident(&mut self, reason: impl Into<String>) {
        self.incident = Some(reason.into());
    }

    pub fn has_incident(&self) -> bool {
        self.incident.is_some()
    }

    pub fn trx_bytes(&self) -> &[u8] {
        &self.trx
    }

    pub fn trx_is_empty(&self) -> bool {
        self.trx.is_empty() && self.incident.is_none()
    }

    pub fn stmt_is_empty(&self) -> bool {
        self.stmt.is_empty()
    }

    pub fn trx_has_nontrans_write(&self) -> bool {
        self.trx_has_nontrans
    }

    /// Take the transaction buffer as a unit and reset it.
    ///
    /// Returns `None` when there is nothing to log.
    pub fn flush_trx(&mut self) -> BinlogResult<Option<CacheUnit>> {
        let bytes = std::mem::take(&mut self.trx);
        let has_nontrans_write = std::mem::take(&mut self.trx_has_nontrans);
        let incident = self.incident.take();
        self.savepoint = 0;
        self.stmt_start = 0;
        self.pending = None;
        Self::into_unit(&bytes, has_nontrans_write, incident)
    }

    /// Take the statement buffer as a unit and reset it
    pub fn flush_stmt(&mut self) -> BinlogResult<Option<CacheUnit>> {
        let bytes = std::mem::take(&mut self.stmt);
        let incident = if self.trx.is_empty() {
            self.incident.take()
        } else {
            None
        };
        Self::into_unit(&bytes, !bytes.is_empty(), incident)
    }

    fn into_unit(
        bytes: &[u8],
        has_nontrans_write: bool,
        incident: Option<String>,
    ) -> BinlogResult<Option<CacheUnit>> {
        if bytes.is_empty() && incident.is_none() {
            return Ok(None);
        }
        let mut records = PlainFrames::new(bytes).collect::<BinlogResult<Vec<_>>>()?;
        let has_incident = incident.is_some();
        if let Some(reason) = incident {
            records.push(LogRecord::incident(&IncidentPayload::lost_events(reason)));
        }
        Ok(Some(CacheUnit {
            records,
            has_nontrans_write,
            incident: has_incident,
        }))
    }

    /// Drop the transaction buffer without logging it
    pub fn discard_trx(&mut self) {
        self.trx.clear();
        self.trx_has_nontrans = false;
        self.savepoint = 0;
        self.stmt_start = 0;
        self.pending = None;
    }

    pub fn reset(&mut self) {
        self.discard_trx();
        self.stmt.clear();
        self.incident = None;
    }
}
