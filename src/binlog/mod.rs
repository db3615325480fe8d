//! Binary log storage
//!
//! A binlog is a sequence of log files named `<basename>.NNNNNN` plus an
//! index listing them. Each file is a 24-byte header followed by framed
//! records. See `record` for the frame layout and `header` for the header.
//!
//! Exactly one file is active at a time. Files before it end with a
//! `Rotate` record and have their in-use flag cleared.

pub mod checksum;
pub mod crypto;
pub mod errors;
pub mod header;
pub mod index;
pub mod reader;
pub mod record;
pub mod store;

pub use checksum::ChecksumAlg;
pub use crypto::{KeyProvider, RecordCipher, StaticKeyProvider};
pub use errors::{BinlogError, BinlogErrorCode, BinlogResult, Severity};
pub use header::FileHeader;
pub use index::LogFileIndex;
pub use reader::{LogReader, ReadRecord, ReaderPins};
pub use record::{LogRecord, RecordBody, RecordType};
pub use store::{
    FileHead, LogFileStore, LogPosition, PurgeBlock, PurgeOutcome, RotateOutcome, StoreOptions,
    UnitSpan,
};
