//! Batch leader and follower logic

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::binlog::record::{group_flags, GtidListPayload, GtidPayload};
use crate::binlog::{
    BinlogError, BinlogResult, FileHead, LogFileStore, LogPosition, LogRecord, RotateOutcome,
    UnitSpan,
};
use crate::crash_point::{maybe_crash, points};
use crate::engine::RecoverableEngine;
use crate::gtid::{Gtid, GtidTracker};
use crate::observability::{log_event_with_fields, Event, Logger, MetricsRegistry};
use crate::tc::{TcToken, TransactionCoordinatorLog};

use super::promise::Promise;
use super::queue::{CommitArena, SlotStatus};
use super::{CommitOutcome, CommitRequest, GroupCommitConfig, KillSwitch, Terminal};

/// How often a parked session rechecks its kill switch
const KILL_POLL: Duration = Duration::from_millis(10);

const INITIAL_SLOTS: usize = 64;

/// Called under the post-write lock after every durable batch
pub type AfterSyncHook = Arc<dyn Fn(&LogPosition) + Send + Sync>;

type DoneSignal = Arc<Promise<BinlogResult<()>>>;
type ResultCell = Arc<Promise<BinlogResult<CommitOutcome>>>;

/// Handle on a registered commit. Clones can be given to later commits as
/// their waitee.
#[derive(Clone)]
pub struct CommitTicket {
    slot: usize,
    generation: u64,
    done: DoneSignal,
}

impl CommitTicket {
    /// Result of the commit once it has finished, logged or not
    pub fn finished(&self) -> BinlogResult<Option<BinlogResult<()>>> {
        self.done.try_get()
    }
}

impl std::fmt::Debug for CommitTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommitTicket")
            .field("slot", &self.slot)
            .field("generation", &self.generation)
            .finish()
    }
}

struct Member {
    request: CommitRequest,
    result: ResultCell,
    done: DoneSignal,
}

enum PriorWait<'a> {
    /// Taken into a batch (or failed) while parked; just wait for the result
    Spliced,
    Proceed(MutexGuard<'a, CommitArena<Member>>),
}

struct BatchWrite {
    results: Vec<BinlogResult<CommitOutcome>>,
    anchor: Option<LogPosition>,
    rotated: Option<RotateOutcome>,
}

pub struct GroupCommitCoordinator {
    config: GroupCommitConfig,
    store: Arc<Mutex<LogFileStore>>,
    tc: Arc<dyn TransactionCoordinatorLog>,
    gtid: Arc<GtidTracker>,
    /// Every engine; asked to checkpoint after a rotation
    engines: Vec<Arc<dyn RecoverableEngine>>,
    metrics: Arc<MetricsRegistry>,
    queue: Mutex<CommitArena<Member>>,
    queue_changed: Condvar,
    post_write: Mutex<()>,
    commit_order: Mutex<()>,
    after_sync: Option<AfterSyncHook>,
    last_committed: Mutex<Option<LogPosition>>,
}

impl GroupCommitCoordinator {
    pub fn new(
        config: GroupCommitConfig,
        store: Arc<Mutex<LogFileStore>>,
        tc: Arc<dyn TransactionCoordinatorLog>,
        gtid: Arc<GtidTracker>,
        engines: Vec<Arc<dyn RecoverableEngine>>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            config,
            store,
            tc,
            gtid,
            engines,
            metrics,
            queue: Mutex::new(CommitArena::with_capacity(INITIAL_SLOTS)),
            queue_changed: Condvar::new(),
            post_write: Mutex::new(()),
            commit_order: Mutex::new(()),
            after_sync: None,
            last_committed: Mutex::new(None),
        }
    }

    pub fn with_after_sync(mut self, hook: AfterSyncHook) -> Self {
        self.after_sync = Some(hook);
        self
    }

    pub fn config(&self) -> &GroupCommitConfig {
        &self.config
    }

    /// End of the last batch made durable by an fsync
    pub fn last_committed(&self) -> BinlogResult<Option<LogPosition>> {
        Ok(self.last_committed.lock()?.clone())
    }

    /// Reserve a slot for a commit that others may declare a dependency on
    pub fn register(&self) -> BinlogResult<CommitTicket> {
        let (slot, generation) = self.queue.lock()?.alloc();
        Ok(CommitTicket {
            slot,
            generation,
            done: Arc::new(Promise::new()),
        })
    }

    /// The commit finished without anything to log. Dependents parked on
    /// it go ahead on their own.
    pub fn abandon(&self, ticket: CommitTicket) -> BinlogResult<()> {
        let mut q = self.queue.lock()?;
        if !q.is_current(ticket.slot, ticket.generation)
            || q.status(ticket.slot) != SlotStatus::Registered
        {
            return Ok(());
        }
        ticket.done.fulfill(Ok(()))?;
        for dep in q.take_subsequents(ticket.slot) {
            q.set_status(dep, SlotStatus::Registered);
        }
        q.release(ticket.slot);
        self.queue_changed.notify_all();
        Ok(())
    }

    /// Log `request` as part of the next batch and wait until it is
    /// written (and fsynced, per the sync period).
    pub fn commit(&self, ticket: CommitTicket, request: CommitRequest) -> BinlogResult<CommitOutcome> {
        let waitee = request.waitee.clone();
        let result: ResultCell = Arc::new(Promise::new());
        let me = ticket.slot;

        let mut q = self.queue.lock()?;
        if !q.is_current(me, ticket.generation) || q.status(me) != SlotStatus::Registered {
            return Err(BinlogError::invalid_state("commit ticket already used"));
        }
        q.set_member(
            me,
            Member {
                request,
                result: Arc::clone(&result),
                done: Arc::clone(&ticket.done),
            },
        );

        if let Some(waitee) = waitee {
            match self.wait_for_prior(q, &ticket, &waitee)? {
                PriorWait::Spliced => return result.wait()?,
                PriorWait::Proceed(guard) => q = guard,
            }
        }

        let leader = q.enqueue(me);
        self.queue_changed.notify_all();
        drop(q);

        if leader {
            self.lead(me, &result)
        } else {
            result.wait()?
        }
    }

    /// Park behind `waitee` until it is frozen into a batch (taking us
    /// along) or finishes. Wakes early on kill.
    fn wait_for_prior<'a>(
        &'a self,
        mut q: MutexGuard<'a, CommitArena<Member>>,
        ticket: &CommitTicket,
        waitee: &CommitTicket,
    ) -> BinlogResult<PriorWait<'a>> {
        let me = ticket.slot;

        if q.is_current(waitee.slot, waitee.generation) && q.status(waitee.slot) != SlotStatus::Frozen {
            q.subscribe(me, waitee.slot);
            // A leader gathering members stops waiting once a queued commit has a waiter
            self.queue_changed.notify_all();
            let kill = Self::kill_switch_of(&q, me);
            loop {
                if !q.is_current(me, ticket.generation) || q.status(me) == SlotStatus::Frozen {
                    return Ok(PriorWait::Spliced);
                }
                if q.status(me) == SlotStatus::Registered {
                    return Ok(PriorWait::Proceed(q));
                }
                if kill.as_ref().is_some_and(|k| k.is_killed()) {
                    q.unsubscribe(me);
                    let err = BinlogError::interrupted("killed while waiting for a prior commit");
                    self.fail_member(&mut q, me, err.clone())?;
                    self.queue_changed.notify_all();
                    return Err(err);
                }
                q = self.queue_changed.wait_timeout(q, KILL_POLL)?.0;
            }
        }

        let prior = if q.is_current(waitee.slot, waitee.generation) {
            // Its batch is being written; wait it out, then queue normally
            let kill = Self::kill_switch_of(&q, me);
            drop(q);
            let prior = loop {
                if kill.as_ref().is_some_and(|k| k.is_killed()) {
                    let err = BinlogError::interrupted("killed while waiting for a prior commit");
                    let mut q = self.queue.lock()?;
                    self.fail_member(&mut q, me, err.clone())?;
                    self.queue_changed.notify_all();
                    return Err(err);
                }
                if let Some(r) = waitee.done.wait_timeout(KILL_POLL)? {
                    break r;
                }
            };
            q = self.queue.lock()?;
            prior
        } else {
            // Finished before we got here; its signal is already set
            waitee.done.try_get()?.unwrap_or(Ok(()))
        };

        if let Err(e) = prior {
            let err = prior_failure(&e);
            self.fail_member(&mut q, me, err.clone())?;
            self.queue_changed.notify_all();
            return Err(err);
        }
        Ok(PriorWait::Proceed(q))
    }

    fn kill_switch_of(q: &CommitArena<Member>, idx: usize) -> Option<KillSwitch> {
        q.member(idx).and_then(|m| m.request.kill.clone())
    }

    /// Fail an unwritten commit and, transitively, everything parked on it
    fn fail_member(&self, q: &mut CommitArena<Member>, idx: usize, err: BinlogError) -> BinlogResult<()> {
        if let Some(member) = q.take_member(idx) {
            member.result.fulfill(Err(err.clone()))?;
            member.done.fulfill(Err(err.clone()))?;
        }
        for dep in q.take_subsequents(idx) {
            self.fail_member(q, dep, prior_failure(&err))?;
        }
        q.release(idx);
        Ok(())
    }

    /// Wait for more members if configured to
    fn wait_for_members(&self) -> BinlogResult<()> {
        if !self.config.waits() {
            return Ok(());
        }
        let deadline = Instant::now() + Duration::from_micros(self.config.wait_usec);
        let mut q = self.queue.lock()?;
        loop {
            if q.queue_len() >= self.config.wait_count || q.queued_has_waiters() {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            q = self.queue_changed.wait_timeout(q, deadline - now)?.0;
        }
    }

    fn lead(&self, me: usize, own: &ResultCell) -> BinlogResult<CommitOutcome> {
        self.wait_for_members()?;

        let mut store = self.store.lock()?;
        let batch: Vec<(usize, Member)> = {
            let mut q = self.queue.lock()?;
            let order = q.freeze();
            let batch: Vec<(usize, Member)> = order
                .into_iter()
                .filter_map(|idx| q.take_member(idx).map(|m| (idx, m)))
                .collect();
            for (_, m) in &batch {
                for engine in &m.request.engines {
                    engine.prepare_ordered(m.request.terminal.xid());
                }
            }
            batch
        };

        let written = self.write_batch(&mut store, &batch);

        let post_write = self.post_write.lock()?;
        drop(store);
        if let (Some(hook), Some(anchor)) = (&self.after_sync, &written.anchor) {
            hook(anchor);
        }
        let commit_order = self.commit_order.lock()?;
        drop(post_write);
        for ((_, m), r) in batch.iter().zip(&written.results) {
            if r.is_ok() {
                for engine in &m.request.engines {
                    engine.commit_ordered(m.request.terminal.xid());
                }
            }
        }
        drop(commit_order);

        let mut mine = None;
        {
            let mut q = self.queue.lock()?;
            for ((idx, m), mut r) in batch.into_iter().zip(written.results) {
                if let Ok(outcome) = r.as_mut() {
                    outcome.leader = idx == me;
                    if idx == me {
                        outcome.rotated = written.rotated.clone();
                    }
                }
                m.done.fulfill(r.as_ref().map(|_| ()).map_err(Clone::clone))?;
                m.result.fulfill(r.clone())?;
                if idx == me {
                    mine = Some(r);
                }
                q.release(idx);
            }
            self.queue_changed.notify_all();
        }

        if let Some(rotated) = &written.rotated {
            self.checkpoint_after_rotate(rotated);
        }
        match mine {
            Some(r) => r,
            None => own.wait()?,
        }
    }

    fn assign_gtid(&self, request: &CommitRequest) -> BinlogResult<Gtid> {
        if request.terminal == Terminal::Standalone && request.body.len() != 1 {
            return Err(BinlogError::invalid_state(format!(
                "standalone group needs exactly one record, got {}",
                request.body.len()
            )));
        }
        let assigned = match request.gtid {
            Some(gtid) => self.gtid.record(gtid).map(|_| gtid),
            None => self
                .gtid
                .allocate_next(self.config.domain_id, self.config.server_id),
        };
        assigned.map_err(|e| BinlogError::invalid_state(e.to_string()))
    }

    fn build_unit(request: &CommitRequest, gtid: Gtid, commit_id: Option<u64>) -> Vec<LogRecord> {
        let mut flags = 0u8;
        if !request.has_nontrans() {
            flags |= group_flags::TRANSACTIONAL;
        }
        if request.ddl {
            flags |= group_flags::DDL;
        }
        match request.terminal {
            Terminal::Standalone => flags |= group_flags::STANDALONE,
            Terminal::Commit { xid: Some(_), .. } => flags |= group_flags::TWO_PHASE,
            _ => {}
        }
        let mut payload = GtidPayload::new(gtid, flags);
        if let Some(id) = commit_id {
            payload = payload.with_commit_id(id);
        }

        let mut unit = Vec::with_capacity(request.body.len() + 2);
        unit.push(LogRecord::gtid(&payload));
        unit.extend(request.body.iter().cloned());
        unit.extend(request.terminal.record());
        unit
    }

    fn append_and_sync(
        store: &mut LogFileStore,
        units: &[Vec<LogRecord>],
    ) -> BinlogResult<(Vec<UnitSpan>, bool)> {
        maybe_crash(points::GROUP_COMMIT_BEFORE_WRITE);
        let spans = store.append_units(units)?;
        maybe_crash(points::GROUP_COMMIT_AFTER_WRITE);
        maybe_crash(points::GROUP_COMMIT_BEFORE_FSYNC);
        let synced = store.sync_if_due(units.len() as u32)?;
        maybe_crash(points::GROUP_COMMIT_AFTER_FSYNC);
        Ok((spans, synced))
    }

    /// Write one frozen batch. Runs under the append lock.
    fn write_batch(&self, store: &mut LogFileStore, batch: &[(usize, Member)]) -> BatchWrite {
        let gtids: Vec<BinlogResult<Gtid>> = batch
            .iter()
            .map(|(_, m)| self.assign_gtid(&m.request))
            .collect();
        let writable = gtids.iter().filter(|g| g.is_ok()).count();
        let commit_id = if writable > 1 {
            gtids.iter().find_map(|g| g.as_ref().ok()).map(|g| g.seq_no)
        } else {
            None
        };

        let mut units = Vec::with_capacity(writable);
        for ((_, m), gtid) in batch.iter().zip(&gtids) {
            if let Ok(gtid) = gtid {
                units.push(Self::build_unit(&m.request, *gtid, commit_id));
            }
        }

        let mut written = BatchWrite {
            results: Vec::with_capacity(batch.len()),
            anchor: None,
            rotated: None,
        };
        if units.is_empty() {
            written.results = gtids
                .into_iter()
                .map(|g| g.and_then(|_| Err(BinlogError::invalid_state("member not written"))))
                .collect();
            return written;
        }

        let file = store.active_name().unwrap_or_default().to_string();
        let (spans, synced) = match Self::append_and_sync(store, &units) {
            Ok(r) => r,
            Err(e) => {
                written.results = gtids.into_iter().map(|g| g.and(Err(e.clone()))).collect();
                return written;
            }
        };

        let anchor = LogPosition {
            file: file.clone(),
            offset: spans.last().map_or(0, |s| s.end),
        };
        if synced {
            match self.last_committed.lock() {
                Ok(mut last) => *last = Some(anchor.clone()),
                Err(e) => Logger::error("LAST_COMMITTED_POISONED", &[("error", &e.to_string())]),
            }
        }

        let xids: Vec<u64> = batch
            .iter()
            .zip(&gtids)
            .filter(|(_, g)| g.is_ok())
            .filter_map(|((_, m), _)| m.request.terminal.xid())
            .collect();
        let tokens: Vec<TcToken> = if xids.is_empty() {
            Vec::new()
        } else {
            match self.tc.reserve_durability_tokens(&anchor, &xids) {
                Ok(tokens) => tokens,
                Err(e) => {
                    // The commit records are already written and recovery
                    // will commit them; the members stay committed and the
                    // log takes no further writes.
                    let reason = format!("coordinator log: {}", e);
                    Logger::error("TC_RESERVE_FAILED", &[("error", &reason)]);
                    store.disable(reason);
                    Vec::new()
                }
            }
        };

        let mut span_iter = spans.iter();
        for ((_, m), gtid) in batch.iter().zip(gtids) {
            let r = gtid.and_then(|gtid| {
                let span = span_iter
                    .next()
                    .ok_or_else(|| BinlogError::invalid_state("batch span missing"))?;
                let token = m
                    .request
                    .terminal
                    .xid()
                    .and_then(|xid| tokens.iter().find(|t| t.xid() == xid).cloned());
                Ok(CommitOutcome {
                    gtid,
                    position: LogPosition {
                        file: file.clone(),
                        offset: span.end,
                    },
                    token,
                    group_size: units.len(),
                    leader: false,
                    synced,
                    rotated: None,
                })
            });
            written.results.push(r);
        }

        self.metrics.record_group_commit(units.len() as u64);
        let members = units.len().to_string();
        let end = anchor.offset.to_string();
        log_event_with_fields(
            Event::GroupCommitBatch,
            &[
                ("members", &members),
                ("file", &anchor.file),
                ("end", &end),
                ("synced", if synced { "true" } else { "false" }),
            ],
        );
        written.anchor = Some(anchor);

        if store.should_rotate() {
            match self.rotate_locked(store) {
                Ok(rotated) => written.rotated = Some(rotated),
                // The batch is durable; the broken store fails later commits
                Err(e) => Logger::error("ROTATE_FAILED", &[("error", &e.to_string())]),
            }
        }
        written
    }

    fn rotate_locked(&self, store: &mut LogFileStore) -> BinlogResult<RotateOutcome> {
        let snapshot = self
            .gtid
            .snapshot()
            .map_err(|e| BinlogError::invalid_state(e.to_string()))?;
        let head = FileHead {
            gtid_list: GtidListPayload::complete(snapshot.to_list()),
            checkpoint: self.tc.oldest_needed_file(),
        };
        let rotated = store.rotate(&head)?;
        self.tc
            .on_new_file(&rotated.old_file, &rotated.new_file)
            .map_err(|e| BinlogError::invalid_state(format!("coordinator log: {}", e)))?;
        Ok(rotated)
    }

    /// Switch to a new file now (explicit log flush)
    pub fn rotate(&self) -> BinlogResult<RotateOutcome> {
        let rotated = {
            let mut store = self.store.lock()?;
            self.rotate_locked(&mut store)?
        };
        self.checkpoint_after_rotate(&rotated);
        Ok(rotated)
    }

    /// Deferred work after a rotation; runs with no coordinator lock held
    fn checkpoint_after_rotate(&self, rotated: &RotateOutcome) {
        if let Err(e) = self
            .tc
            .request_durable_checkpoint(&rotated.old_file, &self.engines)
        {
            Logger::error(
                "TC_CHECKPOINT_FAILED",
                &[("file", &rotated.old_file), ("error", &e.to_string())],
            );
        }
    }
}

/// Error for a commit whose prior commit failed. A prior that failed
/// because logging broke passes that on, so the dependent can fail open.
fn prior_failure(err: &BinlogError) -> BinlogError {
    let message = format!("prior commit failed: {}", err);
    if err.code().disables_logging() {
        BinlogError::log_disabled(message)
    } else {
        BinlogError::prior_commit_failed(message)
    }
}
