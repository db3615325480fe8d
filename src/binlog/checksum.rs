//! Record checksums
//!
//! Each record may carry a trailing CRC32 (IEEE polynomial) covering its
//! frame header and payload as stored on disk. The algorithm is fixed per
//! log file and recorded in the file header.

use crc32fast::Hasher;

/// Length of a trailing CRC32 checksum
pub const CHECKSUM_LEN: usize = 4;

/// Checksum algorithm applied to every record of a log file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChecksumAlg {
    /// No trailing checksum
    Off = 0,
    /// Trailing CRC32
    Crc32 = 1,
}

impl ChecksumAlg {
    /// Convert from the on-disk byte
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(ChecksumAlg::Off),
            1 => Some(ChecksumAlg::Crc32),
            _ => None,
        }
    }

    /// Number of trailing bytes this algorithm adds to a record
    pub fn trailer_len(self) -> usize {
        match self {
            ChecksumAlg::Off => 0,
            ChecksumAlg::Crc32 => CHECKSUM_LEN,
        }
    }

    /// Parse from a configuration string
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "none" | "off" => Some(ChecksumAlg::Off),
            "crc32" => Some(ChecksumAlg::Crc32),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ChecksumAlg::Off => "none",
            ChecksumAlg::Crc32 => "crc32",
        }
    }
}

/// Computes a CRC32 checksum over the provided data.
pub fn compute_checksum(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Verifies that the computed checksum matches the expected checksum.
pub fn verify_checksum(data: &[u8], expected: u32) -> bool {
    compute_checksum(data) == expected
}
