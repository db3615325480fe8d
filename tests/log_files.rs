//! Log File Lifecycle Tests
//!
//! - Records written across rotations come back whole and in order
//! - Purge skips files still open by a reader
//! - Old files are expired after rotation when configured
//! - Clean shutdown leaves a state file and no in-use flag

mod common;

use binlog::binlog::{LogRecord, PurgeBlock, RecordBody};
use binlog::gtid::{Gtid, GtidState};
use binlog::observability::MetricsRegistry;
use binlog::recovery::{GroupEnd, RecoveryManager};
use binlog::BinlogService;
use common::config;
use std::sync::Arc;
use tempfile::TempDir;

/// Data-change payloads in log order, one entry per group
fn logged_groups(dir: &std::path::Path) -> Vec<Vec<Vec<u8>>> {
    let cfg = config(dir);
    RecoveryManager::new(cfg.recovery_options().unwrap(), Arc::new(MetricsRegistry::new()))
        .scan_groups()
        .unwrap()
        .iter()
        .map(|g| {
            g.body
                .iter()
                .filter_map(|r| match r.body() {
                    Ok(RecordBody::DataChange(bytes)) => Some(bytes),
                    _ => None,
                })
                .collect()
        })
        .collect()
}

fn commit_row(service: &Arc<BinlogService>, payload: &[u8]) {
    let mut session = service.session();
    session.begin();
    session.write(LogRecord::data_change(payload.to_vec(), true)).unwrap();
    session.commit().unwrap().expect("logged");
}

// =============================================================================
// Rotation
// =============================================================================

/// N records split across rotations scan back as exactly N records.
#[test]
fn test_rotation_round_trip() {
    let temp_dir = TempDir::new().unwrap();
    let service = BinlogService::init(config(temp_dir.path()), Vec::new()).unwrap();
    for i in 0..10u8 {
        commit_row(&service, &[b'r', i]);
        if i == 3 || i == 7 {
            service.rotate().unwrap();
        }
    }
    service.shutdown().unwrap();
    assert_eq!(
        service.file_names().unwrap(),
        vec!["binlog.000001", "binlog.000002", "binlog.000003"]
    );

    let cfg = config(temp_dir.path());
    let groups = RecoveryManager::new(cfg.recovery_options().unwrap(), Arc::new(MetricsRegistry::new()))
        .scan_groups()
        .unwrap();
    assert_eq!(groups.len(), 10);

    let payloads: Vec<Vec<u8>> = groups
        .iter()
        .flat_map(|g| g.body.iter())
        .filter_map(|r| match r.body() {
            Ok(RecordBody::DataChange(bytes)) => Some(bytes),
            _ => None,
        })
        .collect();
    let expected: Vec<Vec<u8>> = (0..10u8).map(|i| vec![b'r', i]).collect();
    assert_eq!(payloads, expected);
    assert!(groups.iter().all(|g| g.end_kind == GroupEnd::Commit));
}

/// Size-triggered rotation keeps every group in one piece.
#[test]
fn test_size_rotation_never_splits_a_group() {
    let temp_dir = TempDir::new().unwrap();
    let mut cfg = config(temp_dir.path());
    cfg.max_file_size = 4096;
    let service = BinlogService::init(cfg.clone(), Vec::new()).unwrap();
    for i in 0..40u32 {
        commit_row(&service, &vec![i as u8; 300]);
    }
    service.shutdown().unwrap();
    assert!(service.file_names().unwrap().len() > 2);
    assert!(service.metrics().snapshot().rotations > 1);

    let groups = RecoveryManager::new(cfg.recovery_options().unwrap(), Arc::new(MetricsRegistry::new()))
        .scan_groups()
        .unwrap();
    assert_eq!(groups.len(), 40);
    let seqs: Vec<u64> = groups.iter().map(|g| g.gtid.seq_no).collect();
    assert_eq!(seqs, (1..=40).collect::<Vec<_>>());
}

// =============================================================================
// Non-transactional changes
// =============================================================================

#[test]
fn test_autocommit_nontrans_write_is_logged_at_commit() {
    let temp_dir = TempDir::new().unwrap();
    let service = BinlogService::init(config(temp_dir.path()), Vec::new()).unwrap();
    let mut session = service.session();
    session.write(LogRecord::data_change(b"nontrans".to_vec(), false)).unwrap();
    assert!(session.commit().unwrap().is_some());
    drop(session);
    service.shutdown().unwrap();

    assert_eq!(logged_groups(temp_dir.path()), vec![vec![b"nontrans".to_vec()]]);
}

/// A non-transactional change made before any transactional one is
/// logged first, as its own group.
#[test]
fn test_nontrans_then_trans_keeps_execution_order() {
    let temp_dir = TempDir::new().unwrap();
    let service = BinlogService::init(config(temp_dir.path()), Vec::new()).unwrap();
    let mut session = service.session();
    session.begin();
    session.write(LogRecord::data_change(b"n-first".to_vec(), false)).unwrap();
    session.write(LogRecord::data_change(b"t-second".to_vec(), true)).unwrap();
    session.commit().unwrap().expect("logged");
    assert!(session.statement_end().unwrap().is_none());
    drop(session);
    service.shutdown().unwrap();

    assert_eq!(
        logged_groups(temp_dir.path()),
        vec![vec![b"n-first".to_vec()], vec![b"t-second".to_vec()]]
    );
}

#[test]
fn test_rollback_still_logs_statement_changes() {
    let temp_dir = TempDir::new().unwrap();
    let service = BinlogService::init(config(temp_dir.path()), Vec::new()).unwrap();
    let mut session = service.session();
    session.begin();
    session.write(LogRecord::data_change(b"n".to_vec(), false)).unwrap();
    session.write(LogRecord::data_change(b"t".to_vec(), true)).unwrap();
    assert!(session.rollback().unwrap().is_some());
    drop(session);
    service.shutdown().unwrap();

    assert_eq!(logged_groups(temp_dir.path()), vec![vec![b"n".to_vec()]]);
}

#[test]
fn test_dropped_session_logs_pending_nontrans_write() {
    let temp_dir = TempDir::new().unwrap();
    let service = BinlogService::init(config(temp_dir.path()), Vec::new()).unwrap();
    let mut session = service.session();
    session.write(LogRecord::data_change(b"orphan".to_vec(), false)).unwrap();
    drop(session);
    service.shutdown().unwrap();

    assert_eq!(logged_groups(temp_dir.path()), vec![vec![b"orphan".to_vec()]]);
}

// =============================================================================
// File heads
// =============================================================================

/// Every file opens with a position list covering all groups logged in the
/// files before it.
#[test]
fn test_file_head_covers_earlier_files() {
    let temp_dir = TempDir::new().unwrap();
    let service = BinlogService::init(config(temp_dir.path()), Vec::new()).unwrap();
    commit_row(&service, b"a");
    commit_row(&service, b"b");
    service.rotate().unwrap();

    let mut session = service.session();
    session.set_gtid(Gtid::new(1, 7, 40));
    session.begin();
    session.write(LogRecord::data_change(b"replicated".to_vec(), true)).unwrap();
    session.commit().unwrap().expect("logged");
    drop(session);
    service.rotate().unwrap();
    commit_row(&service, b"c");
    service.rotate().unwrap();

    let mut seen = GtidState::new();
    for name in service.file_names().unwrap() {
        let records = service.open_reader(&name).unwrap().read_all().unwrap();
        let head = records
            .iter()
            .find_map(|r| match r.record.body() {
                Ok(RecordBody::GtidList(list)) => Some(GtidState::from_list(&list.gtids)),
                _ => None,
            })
            .expect("file starts with a position list");
        assert!(head.is_superset_of(&seen), "{} head misses earlier positions", name);

        for r in &records {
            if let Ok(RecordBody::Gtid(p)) = r.record.body() {
                seen.update(p.gtid, false).unwrap();
            }
        }
    }
    assert_eq!(seen.find(1, 7), Some(Gtid::new(1, 7, 40)));
    assert_eq!(seen.find_most_recent(0), Some(Gtid::new(0, 1, 3)));
    service.shutdown().unwrap();
}

// =============================================================================
// Purge
// =============================================================================

#[test]
fn test_purge_stops_at_open_reader() {
    let temp_dir = TempDir::new().unwrap();
    let service = BinlogService::init(config(temp_dir.path()), Vec::new()).unwrap();
    for _ in 0..3 {
        commit_row(&service, b"x");
        service.rotate().unwrap();
    }

    let reader = service.open_reader("binlog.000002").unwrap();
    let outcome = service.purge_logs_to("binlog.000004").unwrap();
    assert_eq!(outcome.purged, vec!["binlog.000001".to_string()]);
    assert_eq!(outcome.blocked, Some(PurgeBlock::Pinned("binlog.000002".to_string())));
    assert!(!temp_dir.path().join("binlog.000001").exists());

    drop(reader);
    let outcome = service.purge_logs_to("binlog.000004").unwrap();
    assert_eq!(outcome.purged, vec!["binlog.000002".to_string(), "binlog.000003".to_string()]);
    assert_eq!(service.file_names().unwrap(), vec!["binlog.000004"]);
    service.shutdown().unwrap();
}

#[test]
fn test_purge_never_removes_active_file() {
    let temp_dir = TempDir::new().unwrap();
    let service = BinlogService::init(config(temp_dir.path()), Vec::new()).unwrap();
    assert!(service.purge_logs_to("binlog.000001").unwrap().purged.is_empty());
    assert!(service.purge_logs_to("binlog.000009").is_err());
    service.shutdown().unwrap();
}

#[test]
fn test_expire_logs_after_rotation() {
    let temp_dir = TempDir::new().unwrap();
    let mut cfg = config(temp_dir.path());
    cfg.expire_logs_keep = 2;
    let service = BinlogService::init(cfg, Vec::new()).unwrap();
    for _ in 0..4 {
        commit_row(&service, b"x");
        service.rotate().unwrap();
    }
    assert_eq!(
        service.file_names().unwrap(),
        vec!["binlog.000004", "binlog.000005"]
    );
    service.shutdown().unwrap();
}

// =============================================================================
// Shutdown
// =============================================================================

#[test]
fn test_clean_shutdown_needs_no_recovery() {
    let temp_dir = TempDir::new().unwrap();
    {
        let service = BinlogService::init(config(temp_dir.path()), Vec::new()).unwrap();
        commit_row(&service, b"a");
        commit_row(&service, b"b");
        service.shutdown().unwrap();
    }
    let state = std::fs::read_to_string(temp_dir.path().join("binlog.state")).unwrap();
    assert_eq!(state.trim(), "0-1-2");

    let service = BinlogService::init(config(temp_dir.path()), Vec::new()).unwrap();
    let report = service.recovery_report();
    assert!(!report.was_crashed);
    assert!(report.committed.is_empty());
    assert_eq!(
        service.gtid().snapshot().unwrap().to_list(),
        vec![Gtid::new(0, 1, 2)]
    );
    service.shutdown().unwrap();
}

/// A standalone group (e.g. DDL) is one record with no commit marker.
#[test]
fn test_standalone_group_round_trip() {
    let temp_dir = TempDir::new().unwrap();
    let service = BinlogService::init(config(temp_dir.path()), Vec::new()).unwrap();
    service
        .log_standalone(LogRecord::data_change(b"CREATE".to_vec(), false), true)
        .unwrap();
    commit_row(&service, b"after");
    service.shutdown().unwrap();

    let cfg = config(temp_dir.path());
    let groups = RecoveryManager::new(cfg.recovery_options().unwrap(), Arc::new(MetricsRegistry::new()))
        .scan_groups()
        .unwrap();
    assert_eq!(groups.len(), 2);
    assert_eq!(groups[0].end_kind, GroupEnd::Standalone);
    assert_eq!(groups[0].body.len(), 1);
    assert_eq!(groups[1].end_kind, GroupEnd::Commit);
}
