//! Position state: `(domain, server) -> last seq_no`

use std::collections::BTreeMap;

use super::errors::{GtidError, GtidResult};
use super::Gtid;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct DomainState {
    /// Last seq_no logged per server within this domain
    servers: BTreeMap<u32, u64>,
    /// Server of the most recently logged position in this domain
    last_server: Option<u32>,
    /// Highest seq_no seen or allocated in this domain
    seq_no_counter: u64,
}

impl DomainState {
    fn last_gtid(&self, domain_id: u32) -> Option<Gtid> {
        let server_id = self.last_server?;
        let seq_no = *self.servers.get(&server_id)?;
        Some(Gtid::new(domain_id, server_id, seq_no))
    }
}

/// Snapshot-able position state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GtidState {
    domains: BTreeMap<u32, DomainState>,
}

impl GtidState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a state from a list, in list order
    pub fn from_list(list: &[Gtid]) -> Self {
        let mut state = Self::new();
        for gtid in list {
            // Non-strict load never fails
            let _ = state.update(*gtid, false);
        }
        state
    }

    pub fn is_empty(&self) -> bool {
        self.domains.values().all(|d| d.servers.is_empty())
    }

    /// Number of `(domain, server)` entries
    pub fn count(&self) -> usize {
        self.domains.values().map(|d| d.servers.len()).sum()
    }

    /// Record a position.
    pub fn update(&mut self, gtid: Gtid, strict: bool) -> GtidResult<()> {
        if strict {
            self.check_strict_sequence(gtid)?;
        }
        let domain = self.domains.entry(gtid.domain_id).or_default();
        if domain.seq_no_counter < gtid.seq_no {
            domain.seq_no_counter = gtid.seq_no;
        }
        domain.servers.insert(gtid.server_id, gtid.seq_no);
        domain.last_server = Some(gtid.server_id);
        Ok(())
    }

    /// Allocate and record the next position in `domain_id` for `server_id`
    pub fn update_with_next(&mut self, domain_id: u32, server_id: u32) -> Gtid {
        let domain = self.domains.entry(domain_id).or_default();
        domain.seq_no_counter += 1;
        let gtid = Gtid::new(domain_id, server_id, domain.seq_no_counter);
        domain.servers.insert(server_id, gtid.seq_no);
        domain.last_server = Some(server_id);
        gtid
    }

    /// Reject a position that would not be after the domain's last position
    pub fn check_strict_sequence(&self, gtid: Gtid) -> GtidResult<()> {
        if let Some(last) = self.find_most_recent(gtid.domain_id) {
            if last.seq_no >= gtid.seq_no {
                return Err(GtidError::StrictOutOfOrder {
                    domain_id: gtid.domain_id,
                    server_id: gtid.server_id,
                    seq_no: gtid.seq_no,
                    last_server_id: last.server_id,
                    last_seq_no: last.seq_no,
                });
            }
        }
        Ok(())
    }

    /// Make sure the next allocation in `domain_id` is above `seq_no`
    pub fn bump_seq_no_if_needed(&mut self, domain_id: u32, seq_no: u64) {
        let domain = self.domains.entry(domain_id).or_default();
        if domain.seq_no_counter < seq_no {
            domain.seq_no_counter = seq_no;
        }
    }

    pub fn find(&self, domain_id: u32, server_id: u32) -> Option<Gtid> {
        let seq_no = *self.domains.get(&domain_id)?.servers.get(&server_id)?;
        Some(Gtid::new(domain_id, server_id, seq_no))
    }

    pub fn find_most_recent(&self, domain_id: u32) -> Option<Gtid> {
        self.domains.get(&domain_id)?.last_gtid(domain_id)
    }

    /// Full list; within each domain the most recent entry comes last
    pub fn to_list(&self) -> Vec<Gtid> {
        let mut list = Vec::with_capacity(self.count());
        for (&domain_id, domain) in &self.domains {
            for (&server_id, &seq_no) in &domain.servers {
                if Some(server_id) != domain.last_server {
                    list.push(Gtid::new(domain_id, server_id, seq_no));
                }
            }
            if let Some(last) = domain.last_gtid(domain_id) {
                list.push(last);
            }
        }
        list
    }

    /// True when every `(domain, server)` of `other` is known here at an
    /// equal or higher seq_no
    pub fn is_superset_of(&self, other: &GtidState) -> bool {
        other.to_list().iter().all(|gtid| {
            self.find(gtid.domain_id, gtid.server_id)
                .map(|mine| mine.seq_no >= gtid.seq_no)
                .unwrap_or(false)
        })
    }
}
