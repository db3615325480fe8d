//! Truncation-based crash recovery planning
//!
//! Instead of committing in-doubt transactions, the log is cut back to the
//! start of the earliest group whose two-phase transaction is still
//! prepared in an engine, and everything after it is rolled back. That is
//! only possible if no group after the cut has effects that can no longer
//! be undone: a non-transactional change, or a two-phase transaction the
//! engines already committed.

use std::collections::HashSet;

use serde::Serialize;

use crate::engine::Xid;

use super::scanner::{CompletedGroup, FileScan, GroupEnd};

/// Why the log cannot be cut back
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TruncationConflict {
    pub file: String,
    pub safe_boundary: u64,
    pub unsafe_end: u64,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TruncationPlan {
    /// No in-doubt group in the scanned range
    Nothing,
    Truncate { file: String, offset: u64 },
    Conflict(TruncationConflict),
}

/// A group whose effects survive a rollback
fn is_unsafe(group: &CompletedGroup, in_doubt: &HashSet<Xid>) -> bool {
    match group.xid {
        Some(xid) => group.end_kind == GroupEnd::Commit && !in_doubt.contains(&xid),
        None => group.has_nontrans || group.end_kind != GroupEnd::Rollback,
    }
}

/// Plan the cut for `scans` (oldest first; the last one is the active
/// file) given the xids engines still hold prepared.
pub fn plan_truncation(scans: &[FileScan], in_doubt: &HashSet<Xid>) -> TruncationPlan {
    let last = match scans.last() {
        Some(last) => last,
        None => return TruncationPlan::Nothing,
    };

    let mut boundary: Option<(&str, u64)> = None;
    for scan in scans {
        let first = scan
            .groups
            .iter()
            .find(|g| g.xid.map_or(false, |x| in_doubt.contains(&x)));
        if let Some(g) = first {
            boundary = Some((&scan.name, g.start));
            break;
        }
    }
    let (file, safe) = match boundary {
        Some(b) => b,
        None => return TruncationPlan::Nothing,
    };

    if file != last.name {
        return TruncationPlan::Conflict(TruncationConflict {
            file: file.to_string(),
            safe_boundary: safe,
            unsafe_end: last.file_len,
            reason: "in-doubt transaction precedes the active log file".to_string(),
        });
    }

    let furthest_unsafe = last
        .groups
        .iter()
        .filter(|g| g.start >= safe && is_unsafe(g, in_doubt))
        .map(|g| g.end)
        .max();

    match furthest_unsafe {
        Some(end) if end > safe => TruncationPlan::Conflict(TruncationConflict {
            file: last.name.clone(),
            safe_boundary: safe,
            unsafe_end: end,
            reason: "a group after the boundary cannot be rolled back".to_string(),
        }),
        _ => TruncationPlan::Truncate {
            file: last.name.clone(),
            offset: safe,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binlog::record::group_flags;
    use crate::gtid::Gtid;

    fn group(seq: u64, start: u64, end: u64, xid: Option<Xid>, nontrans: bool) -> CompletedGroup {
        CompletedGroup {
            gtid: Gtid::new(0, 1, seq),
            flags: if xid.is_some() { group_flags::TWO_PHASE } else { 0 },
            start,
            end,
            end_kind: GroupEnd::Commit,
            xid,
            engine_count: xid.map_or(0, |_| 1),
            has_nontrans: nontrans,
            incident: false,
            body: Vec::new(),
        }
    }

    fn scan(name: &str, groups: Vec<CompletedGroup>) -> FileScan {
        FileScan {
            name: name.to_string(),
            in_use: true,
            file_len: groups.last().map_or(100, |g| g.end),
            groups,
            gtid_list: None,
            checkpoints: Vec::new(),
            rotate_to: None,
            incidents: 0,
            torn: None,
        }
    }

    fn doubt(xids: &[Xid]) -> HashSet<Xid> {
        xids.iter().copied().collect()
    }

    #[test]
    fn test_nothing_in_doubt() {
        let scans = vec![scan("b.000001", vec![group(1, 100, 200, Some(1), false)])];
        assert_eq!(plan_truncation(&scans, &doubt(&[])), TruncationPlan::Nothing);
    }

    #[test]
    fn test_truncates_at_earliest_in_doubt_group() {
        let scans = vec![scan(
            "b.000001",
            vec![
                group(1, 100, 200, Some(1), false),
                group(2, 200, 300, Some(2), false),
                group(3, 300, 400, Some(3), false),
            ],
        )];
        assert_eq!(
            plan_truncation(&scans, &doubt(&[2, 3])),
            TruncationPlan::Truncate {
                file: "b.000001".into(),
                offset: 200
            }
        );
    }

    #[test]
    fn test_nontransactional_group_after_boundary_conflicts() {
        let scans = vec![scan(
            "b.000001",
            vec![
                group(1, 100, 200, Some(1), false),
                group(2, 200, 300, None, true),
            ],
        )];
        match plan_truncation(&scans, &doubt(&[1])) {
            TruncationPlan::Conflict(c) => {
                assert_eq!(c.safe_boundary, 100);
                assert_eq!(c.unsafe_end, 300);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_committed_two_phase_group_after_boundary_conflicts() {
        let scans = vec![scan(
            "b.000001",
            vec![
                group(1, 100, 200, Some(1), false),
                group(2, 200, 300, Some(2), false),
            ],
        )];
        assert!(matches!(
            plan_truncation(&scans, &doubt(&[1])),
            TruncationPlan::Conflict(_)
        ));
    }

    #[test]
    fn test_rolled_back_transactional_group_is_safe() {
        let mut rolled = group(2, 200, 300, None, false);
        rolled.end_kind = GroupEnd::Rollback;
        let scans = vec![scan(
            "b.000001",
            vec![group(1, 100, 200, Some(1), false), rolled],
        )];
        assert!(matches!(
            plan_truncation(&scans, &doubt(&[1])),
            TruncationPlan::Truncate { offset: 100, .. }
        ));
    }

    #[test]
    fn test_in_doubt_group_in_older_file_conflicts() {
        let scans = vec![
            scan("b.000001", vec![group(1, 100, 200, Some(1), false)]),
            scan("b.000002", vec![group(2, 100, 200, Some(2), false)]),
        ];
        match plan_truncation(&scans, &doubt(&[1, 2])) {
            TruncationPlan::Conflict(c) => assert_eq!(c.file, "b.000001"),
            other => panic!("unexpected {:?}", other),
        }
    }
}
