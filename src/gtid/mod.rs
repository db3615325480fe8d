//! Global Position Tracker
//!
//! Process-wide mapping `(domain, server) -> last sequence number`.
//!
//! - `GtidState` is the plain data structure (also reconstructed by recovery)
//! - `GtidTracker` wraps it behind a lock and owns allocation policy
//! - `state_file` persists a snapshot at clean shutdown
//!
//! Sequence numbers are allocated from a per-domain counter, so for a fixed
//! `(domain, server)` pair allocated values strictly increase and are never
//! reused within a process lifetime.

mod errors;
mod state;
mod state_file;

pub use errors::{GtidError, GtidResult};
pub use state::GtidState;
pub use state_file::{read_state_file, remove_state_file, write_state_file};

use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

/// A `(domain, server, sequence)` position identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Gtid {
    pub domain_id: u32,
    pub server_id: u32,
    pub seq_no: u64,
}

impl Gtid {
    pub fn new(domain_id: u32, server_id: u32, seq_no: u64) -> Self {
        Self {
            domain_id,
            server_id,
            seq_no,
        }
    }

    /// Encoded size in bytes
    pub const ENCODED_LEN: usize = 16;

    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.domain_id.to_le_bytes());
        buf.extend_from_slice(&self.server_id.to_le_bytes());
        buf.extend_from_slice(&self.seq_no.to_le_bytes());
    }

    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() < Self::ENCODED_LEN {
            return None;
        }
        Some(Self {
            domain_id: u32::from_le_bytes(data[0..4].try_into().ok()?),
            server_id: u32::from_le_bytes(data[4..8].try_into().ok()?),
            seq_no: u64::from_le_bytes(data[8..16].try_into().ok()?),
        })
    }
}

impl fmt::Display for Gtid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.domain_id, self.server_id, self.seq_no)
    }
}

impl FromStr for Gtid {
    type Err = GtidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split('-').collect();
        if parts.len() != 3 {
            return Err(GtidError::Parse(s.to_string()));
        }
        let parse_err = || GtidError::Parse(s.to_string());
        Ok(Gtid {
            domain_id: parts[0].parse().map_err(|_| parse_err())?,
            server_id: parts[1].parse().map_err(|_| parse_err())?,
            seq_no: parts[2].parse().map_err(|_| parse_err())?,
        })
    }
}

/// Lock-protected tracker shared by every session of a service.
///
/// All mutation goes through the inner mutex; the tracker is an explicitly
/// constructed object injected wherever positions are allocated.
#[derive(Debug)]
pub struct GtidTracker {
    state: Mutex<GtidState>,
    strict: bool,
}

impl GtidTracker {
    pub fn new(initial: GtidState, strict: bool) -> Self {
        Self {
            state: Mutex::new(initial),
            strict,
        }
    }

    /// Whether out-of-order positions are rejected
    pub fn is_strict(&self) -> bool {
        self.strict
    }

    /// Allocate the next position for `(domain, server)`.
    pub fn allocate_next(&self, domain_id: u32, server_id: u32) -> GtidResult<Gtid> {
        let mut state = self.state.lock().map_err(|_| GtidError::Poisoned)?;
        Ok(state.update_with_next(domain_id, server_id))
    }

    /// Record a position produced elsewhere (e.g. replicated).
    ///
    /// In strict mode a seq_no not above the domain's last one is rejected.
    pub fn record(&self, gtid: Gtid) -> GtidResult<()> {
        let mut state = self.state.lock().map_err(|_| GtidError::Poisoned)?;
        state.update(gtid, self.strict)
    }

    /// Validate a position without recording it
    pub fn check_strict_sequence(&self, gtid: Gtid) -> GtidResult<()> {
        let state = self.state.lock().map_err(|_| GtidError::Poisoned)?;
        state.check_strict_sequence(gtid)
    }

    /// Advance a domain counter past a seq_no observed but not logged
    pub fn bump_seq_no_if_needed(&self, domain_id: u32, seq_no: u64) -> GtidResult<()> {
        let mut state = self.state.lock().map_err(|_| GtidError::Poisoned)?;
        state.bump_seq_no_if_needed(domain_id, seq_no);
        Ok(())
    }

    /// Copy of the current state
    pub fn snapshot(&self) -> GtidResult<GtidState> {
        let state = self.state.lock().map_err(|_| GtidError::Poisoned)?;
        Ok(state.clone())
    }
}
