//! Group Commit Tests
//!
//! - Concurrent commits share fsyncs, never more than one per session
//! - A commit that depends on another is written after it
//! - A failed batch write is seen by every member
//! - Non-two-phase commits keep going, unlogged, once logging is disabled
//! - Killing a session parked on a prior commit interrupts it
//! - A coordinator failure after the write keeps the logged commits

mod common;

use std::sync::{mpsc, Arc, Barrier, Mutex};
use std::thread;
use std::time::Duration;

use binlog::binlog::{BinlogErrorCode, LogPosition, LogRecord};
use binlog::engine::Xid;
use binlog::group_commit::{AfterSyncHook, CommitOutcome};
use binlog::tc::TcBackend;
use binlog::{BinlogService, ServiceError};
use common::{config, engines, MemoryEngine};
use tempfile::TempDir;

fn row(tag: &str) -> LogRecord {
    LogRecord::data_change(tag.as_bytes().to_vec(), true)
}

fn xid_of(outcome: &CommitOutcome) -> Option<Xid> {
    outcome.token.as_ref().map(|t| t.xid())
}

fn commit_one(service: &Arc<BinlogService>, tag: &str) -> CommitOutcome {
    let mut session = service.session();
    session.begin();
    session.write(row(tag)).unwrap();
    session.commit().unwrap().expect("commit was logged")
}

// =============================================================================
// Batching
// =============================================================================

/// Two independent sessions with a batch threshold of one never cost more
/// than one fsync each.
#[test]
fn test_concurrent_commits_fsync_at_most_once_each() {
    let temp_dir = TempDir::new().unwrap();
    let mut cfg = config(temp_dir.path());
    cfg.group_commit_wait_count = 1;
    cfg.group_commit_wait_usec = 1_000;
    let service = BinlogService::init(cfg, Vec::new()).unwrap();
    let before = service.metrics().fsyncs();

    let barrier = Arc::new(Barrier::new(2));
    let handles: Vec<_> = (0..2)
        .map(|i| {
            let service = Arc::clone(&service);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                commit_one(&service, &format!("s{}", i))
            })
        })
        .collect();
    let outcomes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let fsyncs = service.metrics().fsyncs() - before;
    assert!(fsyncs >= 1);
    assert!(fsyncs <= 2, "{} fsyncs for 2 sessions", fsyncs);
    assert!(outcomes.iter().all(|o| o.synced));
    assert_ne!(outcomes[0].position, outcomes[1].position);
    service.shutdown().unwrap();
}

/// A leader that waits for company takes the others into its batch.
#[test]
fn test_leader_wait_gathers_a_batch() {
    let temp_dir = TempDir::new().unwrap();
    let mut cfg = config(temp_dir.path());
    cfg.group_commit_wait_count = 4;
    cfg.group_commit_wait_usec = 500_000;
    let service = BinlogService::init(cfg, Vec::new()).unwrap();
    let before = service.metrics().fsyncs();

    let barrier = Arc::new(Barrier::new(4));
    let handles: Vec<_> = (0..4)
        .map(|i| {
            let service = Arc::clone(&service);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                commit_one(&service, &format!("s{}", i))
            })
        })
        .collect();
    let outcomes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert!(outcomes.iter().any(|o| o.group_size > 1));
    assert_eq!(outcomes.iter().filter(|o| o.leader).count() as u64, service.metrics().fsyncs() - before);

    let mut seqs: Vec<u64> = outcomes.iter().map(|o| o.gtid.seq_no).collect();
    seqs.sort_unstable();
    assert_eq!(seqs, vec![1, 2, 3, 4]);
    service.shutdown().unwrap();
}

/// Ordered engine hooks run in the order the batch was written.
#[test]
fn test_commit_ordered_follows_log_order() {
    let temp_dir = TempDir::new().unwrap();
    let engine = MemoryEngine::new("mem");
    let service = BinlogService::init(config(temp_dir.path()), engines(&[&engine])).unwrap();

    let positions = Arc::new(Mutex::new(Vec::new()));
    let handles: Vec<_> = (0..4)
        .map(|i| {
            let service = Arc::clone(&service);
            let engine = Arc::clone(&engine);
            let positions = Arc::clone(&positions);
            thread::spawn(move || {
                let mut session = service.session();
                session.begin();
                session.enlist(engine);
                session.write(row(&format!("t{}", i))).unwrap();
                let outcome = session.commit().unwrap().unwrap();
                let xid = outcome.token.as_ref().map(|t| t.xid());
                positions.lock().unwrap().push((outcome.position, xid));
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let mut by_position = positions.lock().unwrap().clone();
    by_position.sort();
    let logged: Vec<_> = by_position.into_iter().map(|(_, xid)| xid).collect();
    assert_eq!(engine.ordered(), logged);
    assert_eq!(engine.committed().len(), 4);
    assert!(engine.prepared().is_empty());
    service.shutdown().unwrap();
}

// =============================================================================
// Dependencies
// =============================================================================

/// A commit that waits on another lands after it in the file, even when it
/// asks to commit first.
#[test]
fn test_waiter_is_written_after_its_prior_commit() {
    let temp_dir = TempDir::new().unwrap();
    let service = BinlogService::init(config(temp_dir.path()), Vec::new()).unwrap();

    let mut first = service.session();
    let prior = first.commit_ticket().unwrap();

    let waiter = {
        let service = Arc::clone(&service);
        thread::spawn(move || {
            let mut second = service.session();
            second.wait_for_prior_commit(prior);
            second.begin();
            second.write(row("second")).unwrap();
            second.commit().unwrap().unwrap()
        })
    };
    thread::sleep(Duration::from_millis(50));

    first.begin();
    first.write(row("first")).unwrap();
    let a = first.commit().unwrap().unwrap();
    let b = waiter.join().unwrap();

    assert!(a.position < b.position);
    assert!(a.gtid.seq_no < b.gtid.seq_no);
    service.shutdown().unwrap();
}

/// A waiter that finds its prior commit already queued is placed right
/// after it, ahead of a commit that arrived earlier.
#[test]
fn test_waiter_spliced_behind_queued_prior() {
    let temp_dir = TempDir::new().unwrap();
    let mut cfg = config(temp_dir.path());
    cfg.group_commit_wait_count = 3;
    cfg.group_commit_wait_usec = 5_000_000;
    let engine = MemoryEngine::new("mem");
    let service = BinlogService::init(cfg, engines(&[&engine])).unwrap();

    let spawn_commit = |mut session: binlog::Session, tag: &'static str| {
        let engine = Arc::clone(&engine);
        thread::spawn(move || {
            session.begin();
            session.enlist(engine);
            session.write(row(tag)).unwrap();
            session.commit().unwrap().unwrap()
        })
    };

    let mut first = service.session();
    let prior = first.commit_ticket().unwrap();
    // Leads and waits for two more members
    let a = spawn_commit(first, "first");
    thread::sleep(Duration::from_millis(50));
    let c = spawn_commit(service.session(), "unrelated");
    thread::sleep(Duration::from_millis(50));
    let mut waiter = service.session();
    waiter.wait_for_prior_commit(prior);
    let b = spawn_commit(waiter, "waiter");

    let (a, b, c) = (a.join().unwrap(), b.join().unwrap(), c.join().unwrap());
    assert_eq!(a.group_size, 3);
    assert!(a.position < b.position);
    assert!(b.position < c.position);
    assert_eq!(engine.ordered(), vec![xid_of(&a), xid_of(&b), xid_of(&c)]);
    service.shutdown().unwrap();
}

/// A waiter arriving while its prior commit's batch is being written waits
/// for that batch to finish before it is written itself.
#[test]
fn test_waiter_waits_out_prior_batch_in_flight() {
    let temp_dir = TempDir::new().unwrap();
    let (entered_tx, entered_rx) = mpsc::channel::<()>();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let gate = Mutex::new(Some((entered_tx, release_rx)));
    let hook: AfterSyncHook = Arc::new(move |_: &LogPosition| {
        let held = gate.lock().unwrap().take();
        if let Some((entered, release)) = held {
            entered.send(()).unwrap();
            release.recv().unwrap();
        }
    });
    let engine = MemoryEngine::new("mem");
    let service = BinlogService::init_with_after_sync(
        config(temp_dir.path()),
        engines(&[&engine]),
        Some(hook),
    )
    .unwrap();
    let batches_before = service.metrics().snapshot().group_commit_batches;

    let mut first = service.session();
    let prior = first.commit_ticket().unwrap();
    let a = {
        let engine = Arc::clone(&engine);
        thread::spawn(move || {
            first.begin();
            first.enlist(engine);
            first.write(row("first")).unwrap();
            first.commit().unwrap().unwrap()
        })
    };
    // The first batch is written and held in the post-write stage
    entered_rx.recv().unwrap();

    let b = {
        let service = Arc::clone(&service);
        let engine = Arc::clone(&engine);
        thread::spawn(move || {
            let mut second = service.session();
            second.wait_for_prior_commit(prior);
            second.begin();
            second.enlist(engine);
            second.write(row("second")).unwrap();
            second.commit().unwrap().unwrap()
        })
    };
    thread::sleep(Duration::from_millis(50));
    assert_eq!(
        service.metrics().snapshot().group_commit_batches,
        batches_before + 1,
        "waiter was written while its prior batch was still in flight"
    );

    release_tx.send(()).unwrap();
    let (a, b) = (a.join().unwrap(), b.join().unwrap());
    assert!(a.position < b.position);
    assert_eq!(a.group_size, 1);
    assert_eq!(engine.ordered(), vec![xid_of(&a), xid_of(&b)]);
    service.shutdown().unwrap();
}

/// A prior commit that turns out empty releases its waiter.
#[test]
fn test_empty_prior_commit_releases_waiter() {
    let temp_dir = TempDir::new().unwrap();
    let service = BinlogService::init(config(temp_dir.path()), Vec::new()).unwrap();

    let mut first = service.session();
    let prior = first.commit_ticket().unwrap();
    let waiter = {
        let service = Arc::clone(&service);
        thread::spawn(move || {
            let mut second = service.session();
            second.wait_for_prior_commit(prior);
            second.begin();
            second.write(row("second")).unwrap();
            second.commit().unwrap()
        })
    };
    thread::sleep(Duration::from_millis(20));
    first.begin();
    assert!(first.commit().unwrap().is_none());

    assert!(waiter.join().unwrap().is_some());
    service.shutdown().unwrap();
}

/// Kill wakes a session parked on a prior commit that never comes.
#[test]
fn test_kill_interrupts_wait_for_prior() {
    let temp_dir = TempDir::new().unwrap();
    let service = BinlogService::init(config(temp_dir.path()), Vec::new()).unwrap();

    let mut first = service.session();
    let prior = first.commit_ticket().unwrap();

    let mut second = service.session();
    let kill = second.kill_handle();
    let waiter = thread::spawn(move || {
        second.wait_for_prior_commit(prior);
        second.begin();
        second.write(row("second")).unwrap();
        second.commit()
    });
    thread::sleep(Duration::from_millis(30));
    kill.kill();

    match waiter.join().unwrap() {
        Err(ServiceError::Binlog(e)) => assert_eq!(e.code(), BinlogErrorCode::Interrupted),
        other => panic!("expected interruption, got {:?}", other.map(|o| o.is_some())),
    }

    // The prior session is unaffected
    first.begin();
    first.write(row("first")).unwrap();
    assert!(first.commit().unwrap().is_some());
    service.shutdown().unwrap();
}

// =============================================================================
// Failure
// =============================================================================

/// One failed write fails every two-phase member, and their engines roll
/// back.
#[test]
fn test_write_failure_is_shared_by_two_phase_members() {
    let temp_dir = TempDir::new().unwrap();
    let mut cfg = config(temp_dir.path());
    cfg.group_commit_wait_count = 3;
    cfg.group_commit_wait_usec = 200_000;
    let engine = MemoryEngine::new("mem");
    let service = BinlogService::init(cfg, engines(&[&engine])).unwrap();
    service.inject_write_failure().unwrap();

    let barrier = Arc::new(Barrier::new(3));
    let handles: Vec<_> = (0..3)
        .map(|i| {
            let service = Arc::clone(&service);
            let engine = Arc::clone(&engine);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let mut session = service.session();
                session.begin();
                session.enlist(engine);
                session.write(row(&format!("t{}", i))).unwrap();
                barrier.wait();
                session.commit()
            })
        })
        .collect();

    for h in handles {
        match h.join().unwrap() {
            Err(ServiceError::Binlog(e)) => assert!(e.code().disables_logging()),
            other => panic!("expected failure, got {:?}", other.map(|o| o.is_some())),
        }
    }
    assert!(service.is_log_disabled().unwrap());
    assert!(engine.committed().is_empty());
    assert_eq!(engine.rolled_back().len(), 3);
    assert!(engine.prepared().is_empty());
}

/// Without two-phase commit, a disabled log no longer blocks commits.
#[test]
fn test_plain_commit_fails_open_after_log_disabled() {
    let temp_dir = TempDir::new().unwrap();
    let service = BinlogService::init(config(temp_dir.path()), Vec::new()).unwrap();
    service.inject_write_failure().unwrap();

    let mut session = service.session();
    session.begin();
    session.write(row("a")).unwrap();
    assert!(session.commit().unwrap().is_none());
    assert!(service.is_log_disabled().unwrap());

    session.begin();
    session.write(row("b")).unwrap();
    assert!(session.commit().unwrap().is_none());

    let last: Option<LogPosition> = service.status().unwrap().last_committed;
    assert!(last.is_none());
}

/// A commit whose prior commit failed because logging broke still fails
/// open.
#[test]
fn test_waiter_on_failed_prior_fails_open() {
    let temp_dir = TempDir::new().unwrap();
    let service = BinlogService::init(config(temp_dir.path()), Vec::new()).unwrap();

    let mut first = service.session();
    let prior = first.commit_ticket().unwrap();
    service.inject_write_failure().unwrap();
    first.begin();
    first.write(row("first")).unwrap();
    assert!(first.commit().unwrap().is_none());

    let mut second = service.session();
    second.wait_for_prior_commit(prior);
    second.begin();
    second.write(row("second")).unwrap();
    assert!(second.commit().unwrap().is_none());
    service.shutdown().unwrap();
}

/// A batch too large for the slot journal is already in the log when the
/// reservation fails: its members stay committed and logging stops.
#[test]
fn test_reservation_failure_after_write_keeps_commits() {
    let temp_dir = TempDir::new().unwrap();
    let mut cfg = config(temp_dir.path());
    cfg.tc_backend = TcBackend::Mmap;
    cfg.tc_page_size = 64;
    // (192 - 16) / 8 = 22 slots
    cfg.tc_mmap_size = 192;
    cfg.group_commit_wait_count = 24;
    cfg.group_commit_wait_usec = 5_000_000;
    let engine = MemoryEngine::new("mem");
    let service = BinlogService::init(cfg, engines(&[&engine])).unwrap();

    let barrier = Arc::new(Barrier::new(24));
    let handles: Vec<_> = (0..24)
        .map(|i| {
            let service = Arc::clone(&service);
            let engine = Arc::clone(&engine);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let mut session = service.session();
                session.begin();
                session.enlist(engine);
                session.write(row(&format!("t{}", i))).unwrap();
                barrier.wait();
                session.commit().unwrap().expect("logged")
            })
        })
        .collect();
    let outcomes: Vec<CommitOutcome> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert!(outcomes.iter().all(|o| o.group_size == 24 && o.token.is_none()));
    assert_eq!(engine.committed().len(), 24);
    assert!(engine.rolled_back().is_empty());
    assert!(service.is_log_disabled().unwrap());

    let mut session = service.session();
    session.begin();
    session.write(row("after")).unwrap();
    assert!(session.commit().unwrap().is_none());
    service.shutdown().unwrap();
}

// =============================================================================
// Durability
// =============================================================================

/// The last committed position only moves when a batch is fsynced.
#[test]
fn test_last_committed_waits_for_fsync() {
    let temp_dir = TempDir::new().unwrap();
    let mut cfg = config(temp_dir.path());
    cfg.sync_period = 3;
    let service = BinlogService::init(cfg, Vec::new()).unwrap();

    let a = commit_one(&service, "a");
    let b = commit_one(&service, "b");
    assert!(!a.synced && !b.synced);
    assert_eq!(service.status().unwrap().last_committed, None);

    let c = commit_one(&service, "c");
    assert!(c.synced);
    assert_eq!(service.status().unwrap().last_committed, Some(c.position));
    service.shutdown().unwrap();
}

/// The after-sync hook sees every durable batch end before its members
/// return.
#[test]
fn test_after_sync_hook_sees_each_batch() {
    let temp_dir = TempDir::new().unwrap();
    let seen: Arc<Mutex<Vec<LogPosition>>> = Arc::new(Mutex::new(Vec::new()));
    let hook: AfterSyncHook = {
        let seen = Arc::clone(&seen);
        Arc::new(move |pos: &LogPosition| seen.lock().unwrap().push(pos.clone()))
    };
    let service =
        BinlogService::init_with_after_sync(config(temp_dir.path()), Vec::new(), Some(hook)).unwrap();

    let a = commit_one(&service, "a");
    assert_eq!(seen.lock().unwrap().last(), Some(&a.position));
    let b = commit_one(&service, "b");
    assert_eq!(seen.lock().unwrap().last(), Some(&b.position));
    assert_eq!(service.status().unwrap().last_committed, Some(b.position));
    service.shutdown().unwrap();
}
