//! Sequential log file reader
//!
//! Validates every record frame and checksum, and decrypts payloads once
//! the file's encryption marker has been seen. Any malformed byte is
//! reported as corruption at the offending offset; `valid_pos` always
//! points just past the last good record so recovery can cut a torn tail.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::{Arc, Mutex};

use super::checksum::{verify_checksum, ChecksumAlg, CHECKSUM_LEN};
use super::crypto::{KeyProvider, RecordCipher};
use super::errors::{BinlogError, BinlogResult};
use super::header::{FileHeader, HEADER_LEN};
use super::record::{FrameHeader, LogRecord, RecordType, StartEncryptionPayload, FRAME_HEADER_LEN};

/// A record together with where it lives in its file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadRecord {
    pub offset: u64,
    pub end_offset: u64,
    pub record: LogRecord,
}

pub struct LogReader {
    name: String,
    reader: BufReader<File>,
    header: FileHeader,
    offset: u64,
    file_len: u64,
    keys: Option<Arc<dyn KeyProvider>>,
    cipher: Option<RecordCipher>,
    _pin: Option<PinGuard>,
}

impl LogReader {
    /// Opens `path` and validates its header.
    ///
    /// `keys` is required only if the file turns out to be encrypted.
    pub fn open(
        path: &Path,
        name: &str,
        keys: Option<Arc<dyn KeyProvider>>,
    ) -> BinlogResult<Self> {
        let mut file = File::open(path).map_err(|e| {
            BinlogError::corruption_at(name, 0, format!("cannot open {}: {}", path.display(), e))
        })?;
        let file_len = file
            .metadata()
            .map_err(|e| BinlogError::io(format!("cannot stat {}", name), e))?
            .len();
        let header = FileHeader::read_from(name, &mut file)?;
        file.seek(SeekFrom::Start(HEADER_LEN as u64))
            .map_err(|e| BinlogError::io(format!("cannot seek {}", name), e))?;
        Ok(Self {
            name: name.to_string(),
            reader: BufReader::new(file),
            header,
            offset: HEADER_LEN as u64,
            file_len,
            keys,
            cipher: None,
            _pin: None,
        })
    }

    /// Keep `name` pinned against purge for the lifetime of this reader
    pub fn with_pin(mut self, pin: PinGuard) -> Self {
        self._pin = Some(pin);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn header(&self) -> &FileHeader {
        &self.header
    }

    pub fn is_encrypted(&self) -> bool {
        self.cipher.is_some()
    }

    /// End of the last record read successfully
    pub fn valid_pos(&self) -> u64 {
        self.offset
    }

    pub fn file_len(&self) -> u64 {
        self.file_len
    }

    /// Reads the next record.
    ///
    /// # Returns
    ///
    /// - `Ok(Some(record))` if a record was read and validated
    /// - `Ok(None)` at a clean end of file
    /// - `Err` with `BINLOG_CORRUPTION` for truncated or damaged records
    pub fn read_next(&mut self) -> BinlogResult<Option<ReadRecord>> {
        if self.offset >= self.file_len {
            return Ok(None);
        }
        let offset = self.offset;
        let remaining = self.file_len - offset;
        if remaining < FRAME_HEADER_LEN as u64 {
            return Err(BinlogError::corruption_at(
                &self.name,
                offset,
                format!("{} trailing bytes, shorter than a frame header", remaining),
            ));
        }

        let mut head = [0u8; FRAME_HEADER_LEN];
        self.read_exact_at(offset, &mut head)?;
        let frame = FrameHeader::parse(&head)
            .map_err(|reason| BinlogError::corruption_at(&self.name, offset, reason))?;

        let trailer = self.header.checksum.trailer_len();
        let total = (FRAME_HEADER_LEN + frame.payload_len + trailer) as u64;
        if total > remaining {
            return Err(BinlogError::corruption_at(
                &self.name,
                offset,
                format!("record of {} bytes extends past end of file", total),
            ));
        }

        let mut payload = vec![0u8; frame.payload_len];
        self.read_exact_at(offset, &mut payload)?;

        if self.header.checksum == ChecksumAlg::Crc32 {
            let mut crc = [0u8; CHECKSUM_LEN];
            self.read_exact_at(offset, &mut crc)?;
            let mut covered = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
            covered.extend_from_slice(&head);
            covered.extend_from_slice(&payload);
            if !verify_checksum(&covered, u32::from_le_bytes(crc)) {
                return Err(BinlogError::corruption_at(&self.name, offset, "checksum mismatch"));
            }
        }

        if frame.record_type == RecordType::StartEncryption {
            if offset != HEADER_LEN as u64 {
                return Err(BinlogError::corruption_at(
                    &self.name,
                    offset,
                    "encryption marker not directly after header",
                ));
            }
            let marker = StartEncryptionPayload::decode(&payload)?;
            let keys = self.keys.as_deref().ok_or_else(|| {
                BinlogError::encryption(format!("{} is encrypted but no key is configured", self.name))
            })?;
            self.cipher = Some(RecordCipher::from_marker(keys, &marker)?);
        } else if let Some(cipher) = &self.cipher {
            cipher.apply(offset, &mut payload);
        }

        self.offset = offset + total;
        Ok(Some(ReadRecord {
            offset,
            end_offset: self.offset,
            record: LogRecord::new(frame.record_type, frame.flags, payload),
        }))
    }

    fn read_exact_at(&mut self, record_offset: u64, buf: &mut [u8]) -> BinlogResult<()> {
        self.reader.read_exact(buf).map_err(|e| {
            BinlogError::corruption_at(&self.name, record_offset, format!("short read: {}", e))
        })
    }

    /// Read every remaining record
    pub fn read_all(&mut self) -> BinlogResult<Vec<ReadRecord>> {
        let mut records = Vec::new();
        while let Some(record) = self.read_next()? {
            records.push(record);
        }
        Ok(records)
    }
}

/// Files currently held open by readers
#[derive(Clone, Default)]
pub struct ReaderPins {
    counts: Arc<Mutex<HashMap<String, usize>>>,
}

impl ReaderPins {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pin(&self, name: &str) -> BinlogResult<PinGuard> {
        let mut counts = self.counts.lock()?;
        *counts.entry(name.to_string()).or_insert(0) += 1;
        Ok(PinGuard {
            name: name.to_string(),
            counts: Arc::clone(&self.counts),
        })
    }

    pub fn is_pinned(&self, name: &str) -> BinlogResult<bool> {
        Ok(self.counts.lock()?.get(name).copied().unwrap_or(0) > 0)
    }
}

/// Releases its pin on drop
pub struct PinGuard {
    name: String,
    counts: Arc<Mutex<HashMap<String, usize>>>,
}

impl Drop for PinGuard {
    fn drop(&mut self) {
        if let Ok(mut counts) = self.counts.lock() {
            if let Some(count) = counts.get_mut(&self.name) {
                *count -= 1;
                if *count == 0 {
                    counts.remove(&self.name);
                }
            }
        }
    }
}
