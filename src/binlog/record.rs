//! Log records and their payloads
//!
//! On-disk frame of every record:
//! - Record Type (u8)
//! - Flags (u8): transactional bit, artificial-origin bit
//! - Payload Length (u32 LE)
//! - Payload (variable, encrypted when the file carries an encryption marker)
//! - Checksum (u32 LE, present when the file's checksum algorithm is CRC32)
//!
//! Session caches hold records in the same frame without checksum and
//! without encryption ("plain frames"); the store re-frames them at write
//! time because both depend on the final file offset.

use crate::gtid::Gtid;

use super::checksum::{compute_checksum, ChecksumAlg};
use super::crypto::RecordCipher;
use super::errors::{BinlogError, BinlogResult};

/// Type + flags + length
pub const FRAME_HEADER_LEN: usize = 6;

/// Upper bound on a single payload (guards against garbage lengths)
pub const MAX_PAYLOAD_LEN: usize = 64 * 1024 * 1024;

/// Record flag bits
pub mod flags {
    /// Change belongs to a transactional engine
    pub const TRANSACTIONAL: u8 = 0x01;
    /// Record was generated by the server, not by a client statement
    pub const ARTIFICIAL: u8 = 0x20;
}

/// Record type tags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RecordType {
    /// Opaque change supplied by the caller
    DataChange = 1,
    /// Start of a transaction group, carries its position
    Gtid = 2,
    /// Terminal commit record, optionally carrying an xid
    Commit = 3,
    /// Terminal rollback record
    Rollback = 4,
    /// Last record of a file, names its successor
    Rotate = 5,
    /// Names the oldest file still needed by crash recovery
    Checkpoint = 6,
    /// Position-list snapshot at the head of a file
    GtidList = 7,
    /// Encryption scheme and key version for the rest of the file
    StartEncryption = 8,
    /// Buffered data was lost; readers must not trust continuity
    Incident = 9,
}

impl RecordType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(RecordType::DataChange),
            2 => Some(RecordType::Gtid),
            3 => Some(RecordType::Commit),
            4 => Some(RecordType::Rollback),
            5 => Some(RecordType::Rotate),
            6 => Some(RecordType::Checkpoint),
            7 => Some(RecordType::GtidList),
            8 => Some(RecordType::StartEncryption),
            9 => Some(RecordType::Incident),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            RecordType::DataChange => "data_change",
            RecordType::Gtid => "gtid",
            RecordType::Commit => "commit",
            RecordType::Rollback => "rollback",
            RecordType::Rotate => "rotate",
            RecordType::Checkpoint => "checkpoint",
            RecordType::GtidList => "gtid_list",
            RecordType::StartEncryption => "start_encryption",
            RecordType::Incident => "incident",
        }
    }

    /// Terminal records close a transaction group
    pub fn is_terminal(self) -> bool {
        matches!(self, RecordType::Commit | RecordType::Rollback)
    }
}

/// A single log record. Immutable once written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub record_type: RecordType,
    pub flags: u8,
    pub payload: Vec<u8>,
}

impl LogRecord {
    pub fn new(record_type: RecordType, flags: u8, payload: Vec<u8>) -> Self {
        Self {
            record_type,
            flags,
            payload,
        }
    }

    /// Opaque change from a client statement
    pub fn data_change(payload: Vec<u8>, transactional: bool) -> Self {
        let flags = if transactional { flags::TRANSACTIONAL } else { 0 };
        Self::new(RecordType::DataChange, flags, payload)
    }

    pub fn gtid(payload: &GtidPayload) -> Self {
        Self::new(RecordType::Gtid, flags::ARTIFICIAL, payload.encode())
    }

    pub fn commit(payload: &CommitPayload) -> Self {
        Self::new(RecordType::Commit, flags::TRANSACTIONAL, payload.encode())
    }

    pub fn rollback() -> Self {
        Self::new(RecordType::Rollback, 0, Vec::new())
    }

    pub fn rotate(payload: &RotatePayload) -> Self {
        Self::new(RecordType::Rotate, flags::ARTIFICIAL, payload.encode())
    }

    pub fn checkpoint(payload: &CheckpointPayload) -> Self {
        Self::new(RecordType::Checkpoint, flags::ARTIFICIAL, payload.encode())
    }

    pub fn gtid_list(payload: &GtidListPayload) -> Self {
        Self::new(RecordType::GtidList, flags::ARTIFICIAL, payload.encode())
    }

    pub fn start_encryption(payload: &StartEncryptionPayload) -> Self {
        Self::new(RecordType::StartEncryption, flags::ARTIFICIAL, payload.encode())
    }

    pub fn incident(payload: &IncidentPayload) -> Self {
        Self::new(RecordType::Incident, flags::ARTIFICIAL, payload.encode())
    }

    pub fn is_transactional(&self) -> bool {
        self.flags & flags::TRANSACTIONAL != 0
    }

    pub fn is_artificial(&self) -> bool {
        self.flags & flags::ARTIFICIAL != 0
    }

    /// Size of the plain frame (no checksum)
    pub fn plain_len(&self) -> usize {
        FRAME_HEADER_LEN + self.payload.len()
    }

    /// Append the plain frame to `buf`
    pub fn encode_plain(&self, buf: &mut Vec<u8>) {
        buf.push(self.record_type.as_u8());
        buf.push(self.flags);
        buf.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.payload);
    }

    /// Size of the on-disk frame under `checksum`
    pub fn stored_len(&self, checksum: ChecksumAlg) -> usize {
        self.plain_len() + checksum.trailer_len()
    }

    /// Append the on-disk frame for a record that will start at file
    /// offset `offset`: payload encrypted under `cipher`, checksum over the
    /// frame as stored.
    pub fn encode_stored(
        &self,
        offset: u64,
        checksum: ChecksumAlg,
        cipher: Option<&RecordCipher>,
        buf: &mut Vec<u8>,
    ) {
        let start = buf.len();
        self.encode_plain(buf);
        if let Some(cipher) = cipher {
            cipher.apply(offset, &mut buf[start + FRAME_HEADER_LEN..]);
        }
        if checksum == ChecksumAlg::Crc32 {
            let crc = compute_checksum(&buf[start..]);
            buf.extend_from_slice(&crc.to_le_bytes());
        }
    }

    /// Decode the typed payload
    pub fn body(&self) -> BinlogResult<RecordBody> {
        let body = match self.record_type {
            RecordType::DataChange => RecordBody::DataChange(self.payload.clone()),
            RecordType::Gtid => RecordBody::Gtid(GtidPayload::decode(&self.payload)?),
            RecordType::Commit => RecordBody::Commit(CommitPayload::decode(&self.payload)?),
            RecordType::Rollback => RecordBody::Rollback,
            RecordType::Rotate => RecordBody::Rotate(RotatePayload::decode(&self.payload)?),
            RecordType::Checkpoint => {
                RecordBody::Checkpoint(CheckpointPayload::decode(&self.payload)?)
            }
            RecordType::GtidList => RecordBody::GtidList(GtidListPayload::decode(&self.payload)?),
            RecordType::StartEncryption => {
                RecordBody::StartEncryption(StartEncryptionPayload::decode(&self.payload)?)
            }
            RecordType::Incident => RecordBody::Incident(IncidentPayload::decode(&self.payload)?),
        };
        Ok(body)
    }
}

/// Parsed frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub record_type: RecordType,
    pub flags: u8,
    pub payload_len: usize,
}

impl FrameHeader {
    pub fn parse(bytes: &[u8]) -> Result<Self, String> {
        if bytes.len() < FRAME_HEADER_LEN {
            return Err(format!("frame header needs {} bytes", FRAME_HEADER_LEN));
        }
        let record_type = RecordType::from_u8(bytes[0])
            .ok_or_else(|| format!("unknown record type {}", bytes[0]))?;
        let payload_len = u32::from_le_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]) as usize;
        if payload_len > MAX_PAYLOAD_LEN {
            return Err(format!("payload length {} exceeds limit", payload_len));
        }
        Ok(Self {
            record_type,
            flags: bytes[1],
            payload_len,
        })
    }
}

/// Iterator over plain frames held in a session cache buffer
pub struct PlainFrames<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PlainFrames<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }
}

impl<'a> Iterator for PlainFrames<'a> {
    type Item = BinlogResult<LogRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.data.len() {
            return None;
        }
        let rest = &self.data[self.pos..];
        let header = match FrameHeader::parse(rest) {
            Ok(h) => h,
            Err(reason) => {
                self.pos = self.data.len();
                return Some(Err(BinlogError::invalid_state(format!(
                    "malformed cache frame at {}: {}",
                    self.pos, reason
                ))));
            }
        };
        let end = FRAME_HEADER_LEN + header.payload_len;
        if rest.len() < end {
            self.pos = self.data.len();
            return Some(Err(BinlogError::invalid_state(
                "cache ends inside a record frame",
            )));
        }
        let record = LogRecord::new(
            header.record_type,
            header.flags,
            rest[FRAME_HEADER_LEN..end].to_vec(),
        );
        self.pos += end;
        Some(Ok(record))
    }
}

/// Typed view of a record payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordBody {
    DataChange(Vec<u8>),
    Gtid(GtidPayload),
    Commit(CommitPayload),
    Rollback,
    Rotate(RotatePayload),
    Checkpoint(CheckpointPayload),
    GtidList(GtidListPayload),
    StartEncryption(StartEncryptionPayload),
    Incident(IncidentPayload),
}

/// Flags carried in the group-start record
pub mod group_flags {
    /// Group has no terminal commit record (e.g. DDL)
    pub const STANDALONE: u8 = 0x01;
    /// Group carries a group-commit batch id
    pub const GROUP_COMMIT_ID: u8 = 0x02;
    /// Every change in the group can be rolled back
    pub const TRANSACTIONAL: u8 = 0x04;
    /// Group contains DDL
    pub const DDL: u8 = 0x20;
    /// Group commits through the two-phase protocol
    pub const TWO_PHASE: u8 = 0x40;
}

/// Group-start payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GtidPayload {
    pub gtid: Gtid,
    pub flags: u8,
    /// Group-commit batch id, present when `GROUP_COMMIT_ID` is set
    pub commit_id: Option<u64>,
}

impl GtidPayload {
    pub fn new(gtid: Gtid, flags: u8) -> Self {
        Self {
            gtid,
            flags,
            commit_id: None,
        }
    }

    pub fn with_commit_id(mut self, commit_id: u64) -> Self {
        self.flags |= group_flags::GROUP_COMMIT_ID;
        self.commit_id = Some(commit_id);
        self
    }

    pub fn is_standalone(&self) -> bool {
        self.flags & group_flags::STANDALONE != 0
    }

    pub fn is_transactional(&self) -> bool {
        self.flags & group_flags::TRANSACTIONAL != 0
    }

    pub fn is_two_phase(&self) -> bool {
        self.flags & group_flags::TWO_PHASE != 0
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Gtid::ENCODED_LEN + 9);
        self.gtid.encode(&mut buf);
        buf.push(self.flags);
        if let Some(commit_id) = self.commit_id {
            buf.extend_from_slice(&commit_id.to_le_bytes());
        }
        buf
    }

    pub fn decode(data: &[u8]) -> BinlogResult<Self> {
        let gtid = Gtid::decode(data).ok_or_else(|| short("gtid"))?;
        let flags = *data.get(Gtid::ENCODED_LEN).ok_or_else(|| short("gtid"))?;
        let commit_id = if flags & group_flags::GROUP_COMMIT_ID != 0 {
            let start = Gtid::ENCODED_LEN + 1;
            Some(read_u64(data, start).ok_or_else(|| short("gtid commit id"))?)
        } else {
            None
        };
        Ok(Self {
            gtid,
            flags,
            commit_id,
        })
    }
}

/// Terminal commit payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitPayload {
    /// Two-phase transaction id
    pub xid: Option<u64>,
    /// Number of recoverable engines that prepared a branch
    pub engine_count: u32,
}

impl CommitPayload {
    pub fn plain() -> Self {
        Self {
            xid: None,
            engine_count: 0,
        }
    }

    pub fn two_phase(xid: u64, engine_count: u32) -> Self {
        Self {
            xid: Some(xid),
            engine_count,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(13);
        match self.xid {
            Some(xid) => {
                buf.push(1);
                buf.extend_from_slice(&xid.to_le_bytes());
            }
            None => {
                buf.push(0);
                buf.extend_from_slice(&0u64.to_le_bytes());
            }
        }
        buf.extend_from_slice(&self.engine_count.to_le_bytes());
        buf
    }

    pub fn decode(data: &[u8]) -> BinlogResult<Self> {
        if data.len() < 13 {
            return Err(short("commit"));
        }
        let xid = read_u64(data, 1).ok_or_else(|| short("commit"))?;
        let engine_count = read_u32(data, 9).ok_or_else(|| short("commit"))?;
        Ok(Self {
            xid: if data[0] == 1 { Some(xid) } else { None },
            engine_count,
        })
    }
}

/// Rotate payload: the successor file and where its records begin
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotatePayload {
    pub next_file: String,
    pub position: u64,
}

impl RotatePayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&self.position.to_le_bytes());
        put_str(&mut buf, &self.next_file);
        buf
    }

    pub fn decode(data: &[u8]) -> BinlogResult<Self> {
        let position = read_u64(data, 0).ok_or_else(|| short("rotate"))?;
        let (next_file, _) = get_str(data, 8).ok_or_else(|| short("rotate"))?;
        Ok(Self {
            next_file,
            position,
        })
    }
}

/// Checkpoint payload: oldest file crash recovery must still scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointPayload {
    pub oldest_file: String,
}

impl CheckpointPayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        put_str(&mut buf, &self.oldest_file);
        buf
    }

    pub fn decode(data: &[u8]) -> BinlogResult<Self> {
        let (oldest_file, _) = get_str(data, 0).ok_or_else(|| short("checkpoint"))?;
        Ok(Self { oldest_file })
    }
}

/// Position-list payload at the head of a file.
///
/// `complete == false` means the list is silent: readers must keep scanning
/// older files to learn the state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GtidListPayload {
    pub complete: bool,
    pub gtids: Vec<Gtid>,
}

impl GtidListPayload {
    pub fn complete(gtids: Vec<Gtid>) -> Self {
        Self {
            complete: true,
            gtids,
        }
    }

    pub fn silent() -> Self {
        Self {
            complete: false,
            gtids: Vec::new(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(5 + self.gtids.len() * Gtid::ENCODED_LEN);
        buf.push(u8::from(self.complete));
        buf.extend_from_slice(&(self.gtids.len() as u32).to_le_bytes());
        for gtid in &self.gtids {
            gtid.encode(&mut buf);
        }
        buf
    }

    pub fn decode(data: &[u8]) -> BinlogResult<Self> {
        let complete = *data.first().ok_or_else(|| short("gtid list"))? == 1;
        let count = read_u32(data, 1).ok_or_else(|| short("gtid list"))? as usize;
        let body = &data[5..];
        if body.len() < count * Gtid::ENCODED_LEN {
            return Err(short("gtid list"));
        }
        let gtids = body
            .chunks_exact(Gtid::ENCODED_LEN)
            .take(count)
            .filter_map(Gtid::decode)
            .collect();
        Ok(Self { complete, gtids })
    }
}

/// Encryption marker payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartEncryptionPayload {
    pub scheme: u8,
    pub key_version: u32,
    pub nonce_base: [u8; 12],
}

impl StartEncryptionPayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(17);
        buf.push(self.scheme);
        buf.extend_from_slice(&self.key_version.to_le_bytes());
        buf.extend_from_slice(&self.nonce_base);
        buf
    }

    pub fn decode(data: &[u8]) -> BinlogResult<Self> {
        if data.len() < 17 {
            return Err(short("start encryption"));
        }
        let key_version = read_u32(data, 1).ok_or_else(|| short("start encryption"))?;
        let mut nonce_base = [0u8; 12];
        nonce_base.copy_from_slice(&data[5..17]);
        Ok(Self {
            scheme: data[0],
            key_version,
            nonce_base,
        })
    }
}

/// Kind of integrity loss
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum IncidentKind {
    /// Changes were applied but could not be logged
    LostEvents = 1,
}

/// Incident payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncidentPayload {
    pub kind: IncidentKind,
    pub message: String,
}

impl IncidentPayload {
    pub fn lost_events(message: impl Into<String>) -> Self {
        Self {
            kind: IncidentKind::LostEvents,
            message: message.into(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![self.kind as u8];
        put_str(&mut buf, &self.message);
        buf
    }

    pub fn decode(data: &[u8]) -> BinlogResult<Self> {
        let kind = match data.first() {
            Some(1) => IncidentKind::LostEvents,
            _ => return Err(short("incident")),
        };
        let (message, _) = get_str(data, 1).ok_or_else(|| short("incident"))?;
        Ok(Self { kind, message })
    }
}

fn short(what: &str) -> BinlogError {
    BinlogError::corruption(format!("{} payload truncated or malformed", what))
}

fn read_u32(data: &[u8], at: usize) -> Option<u32> {
    Some(u32::from_le_bytes(data.get(at..at + 4)?.try_into().ok()?))
}

fn read_u64(data: &[u8], at: usize) -> Option<u64> {
    Some(u64::from_le_bytes(data.get(at..at + 8)?.try_into().ok()?))
}

fn put_str(buf: &mut Vec<u8>, s: &str) {
    let bytes = s.as_bytes();
    let len = bytes.len().min(u16::MAX as usize);
    buf.extend_from_slice(&(len as u16).to_le_bytes());
    buf.extend_from_slice(&bytes[..len]);
}

fn get_str(data: &[u8], at: usize) -> Option<(String, usize)> {
    let len = u16::from_le_bytes(data.get(at..at + 2)?.try_into().ok()?) as usize;
    let bytes = data.get(at + 2..at + 2 + len)?;
    let s = String::from_utf8(bytes.to_vec()).ok()?;
    Some((s, at + 2 + len))
}
