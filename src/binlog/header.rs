//! Log file header
//!
//! Fixed 24-byte header at offset 0 of every log file:
//! - Magic (4 bytes): `\xfeBLG`
//! - Format version (u16 LE)
//! - Flags (u16 LE): bit 0 = in use (not cleanly closed)
//! - Created at (i64 LE, unix milliseconds)
//! - Checksum algorithm (u8)
//! - Reserved (3 bytes, zero)
//! - Header CRC32 (u32 LE) over the preceding 20 bytes
//!
//! The header is rewritten in place exactly once, to clear the in-use flag
//! on clean close.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

use chrono::{DateTime, TimeZone, Utc};

use super::checksum::{compute_checksum, ChecksumAlg};
use super::errors::{BinlogError, BinlogResult};

pub const MAGIC: [u8; 4] = [0xFE, b'B', b'L', b'G'];
pub const FORMAT_VERSION: u16 = 1;
pub const HEADER_LEN: usize = 24;

/// File has not been closed cleanly
pub const FLAG_IN_USE: u16 = 0x0001;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    pub version: u16,
    pub flags: u16,
    pub created_at: DateTime<Utc>,
    pub checksum: ChecksumAlg,
}

impl FileHeader {
    /// Header for a freshly created, active file
    pub fn new_active(checksum: ChecksumAlg) -> Self {
        Self {
            version: FORMAT_VERSION,
            flags: FLAG_IN_USE,
            created_at: Utc::now(),
            checksum,
        }
    }

    pub fn is_in_use(&self) -> bool {
        self.flags & FLAG_IN_USE != 0
    }

    pub fn closed(mut self) -> Self {
        self.flags &= !FLAG_IN_USE;
        self
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(&MAGIC);
        buf[4..6].copy_from_slice(&self.version.to_le_bytes());
        buf[6..8].copy_from_slice(&self.flags.to_le_bytes());
        buf[8..16].copy_from_slice(&self.created_at.timestamp_millis().to_le_bytes());
        buf[16] = self.checksum as u8;
        let crc = compute_checksum(&buf[0..20]);
        buf[20..24].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    pub fn decode(file_name: &str, buf: &[u8]) -> BinlogResult<Self> {
        if buf.len() < HEADER_LEN {
            return Err(BinlogError::corruption_at(file_name, 0, "file shorter than header"));
        }
        if buf[0..4] != MAGIC {
            return Err(BinlogError::corruption_at(file_name, 0, "bad magic"));
        }
        let stored_crc = u32::from_le_bytes([buf[20], buf[21], buf[22], buf[23]]);
        if compute_checksum(&buf[0..20]) != stored_crc {
            return Err(BinlogError::corruption_at(file_name, 0, "header checksum mismatch"));
        }
        let version = u16::from_le_bytes([buf[4], buf[5]]);
        if version != FORMAT_VERSION {
            return Err(BinlogError::corruption_at(
                file_name,
                0,
                format!("unsupported format version {}", version),
            ));
        }
        let flags = u16::from_le_bytes([buf[6], buf[7]]);
        let mut millis = [0u8; 8];
        millis.copy_from_slice(&buf[8..16]);
        let created_at = Utc
            .timestamp_millis_opt(i64::from_le_bytes(millis))
            .single()
            .ok_or_else(|| BinlogError::corruption_at(file_name, 0, "bad creation time"))?;
        let checksum = ChecksumAlg::from_u8(buf[16]).ok_or_else(|| {
            BinlogError::corruption_at(file_name, 0, format!("unknown checksum alg {}", buf[16]))
        })?;
        Ok(Self {
            version,
            flags,
            created_at,
            checksum,
        })
    }

    /// Read and validate the header of an open file
    pub fn read_from(file_name: &str, file: &mut File) -> BinlogResult<Self> {
        let mut buf = [0u8; HEADER_LEN];
        file.seek(SeekFrom::Start(0))
            .and_then(|_| file.read_exact(&mut buf))
            .map_err(|e| {
                BinlogError::corruption_at(file_name, 0, format!("cannot read header: {}", e))
            })?;
        Self::decode(file_name, &buf)
    }
}

/// Clear the in-use flag of a file in place and fsync it
pub fn mark_closed(file_name: &str, file: &mut File) -> BinlogResult<()> {
    let header = FileHeader::read_from(file_name, file)?;
    if !header.is_in_use() {
        return Ok(());
    }
    let bytes = header.closed().encode();
    file.seek(SeekFrom::Start(0))
        .and_then(|_| file.write_all(&bytes))
        .map_err(|e| BinlogError::append_failed(format!("cannot rewrite header of {}", file_name), e))?;
    file.sync_all()
        .map_err(|e| BinlogError::fsync_failed(format!("fsync of {} header failed", file_name), e))?;
    file.seek(SeekFrom::End(0))
        .map_err(|e| BinlogError::io(format!("cannot seek {}", file_name), e))?;
    Ok(())
}
