//! Binlog lifecycle service and sessions
//!
//! `BinlogService::init` brings the log up in a fixed order:
//!
//! 1. Open the index and run crash recovery
//! 2. Load the position state (state file, else the recovered one)
//! 3. Open the registrar backend
//! 4. Start a fresh log file headed by the position list and a checkpoint
//! 5. Remove the state file the new file supersedes
//!
//! `shutdown` writes the state file, closes the active file cleanly and
//! closes the registrar. Dropping the service without `shutdown` is what a
//! crash looks like to the next start.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use thiserror::Error;

use crate::binlog::record::GtidListPayload;
use crate::binlog::{
    BinlogError, FileHead, LogFileStore, LogPosition, LogReader, LogRecord, PurgeOutcome,
    RecordType, RotateOutcome,
};
use crate::cache::SessionCache;
use crate::config::{BinlogConfig, ConfigError};
use crate::crash_point::{maybe_crash, points};
use crate::engine::{EngineError, RecoverableEngine, Xid};
use crate::group_commit::{
    AfterSyncHook, CommitOutcome, CommitRequest, CommitTicket, GroupCommitCoordinator, KillSwitch,
    Terminal,
};
use crate::gtid::{
    read_state_file, remove_state_file, write_state_file, Gtid, GtidError, GtidTracker,
};
use crate::observability::{
    log_event, log_event_with_fields, Event, Logger, MetricsRegistry, MetricsSnapshot,
    ObservationScope,
};
use crate::recovery::{RecoveryError, RecoveryManager, RecoveryReport, TruncationConflict};
use crate::tc::{BinlogTc, MmapTc, TcBackend, TcError, TransactionCoordinatorLog};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Recovery(#[from] RecoveryError),

    #[error(transparent)]
    Binlog(#[from] BinlogError),

    #[error("coordinator log: {0}")]
    Tc(#[from] TcError),

    #[error("position tracker: {0}")]
    Gtid(#[from] GtidError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(
        "recovery refused to truncate {} at {}: {} (unsafe group ends at {})",
        .0.file, .0.safe_boundary, .0.reason, .0.unsafe_end
    )]
    TruncationRefused(TruncationConflict),

    #[error("service is shut down")]
    ShutDown,
}

pub type ServiceResult<T> = Result<T, ServiceError>;

/// Externally visible state of the log
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub active_file: Option<String>,
    /// End of the last batch made durable
    pub last_committed: Option<LogPosition>,
    pub files: Vec<String>,
    pub log_disabled: bool,
    pub gtid_list: Vec<Gtid>,
    pub metrics: MetricsSnapshot,
}

pub struct BinlogService {
    config: BinlogConfig,
    engines: Vec<Arc<dyn RecoverableEngine>>,
    metrics: Arc<MetricsRegistry>,
    store: Arc<Mutex<LogFileStore>>,
    tc: Arc<dyn TransactionCoordinatorLog>,
    gtid: Arc<GtidTracker>,
    coordinator: GroupCommitCoordinator,
    next_xid: AtomicU64,
    recovery: RecoveryReport,
    shut_down: AtomicBool,
}

impl BinlogService {
    pub fn init(
        config: BinlogConfig,
        engines: Vec<Arc<dyn RecoverableEngine>>,
    ) -> ServiceResult<Arc<Self>> {
        Self::init_with_after_sync(config, engines, None)
    }

    /// `init`, with a hook run after every durable batch
    pub fn init_with_after_sync(
        config: BinlogConfig,
        engines: Vec<Arc<dyn RecoverableEngine>>,
        after_sync: Option<AfterSyncHook>,
    ) -> ServiceResult<Arc<Self>> {
        config.validate()?;
        let dir = config.data_dir.display().to_string();
        log_event_with_fields(Event::ServiceInitBegin, &[("data_dir", &dir)]);
        let metrics = Arc::new(MetricsRegistry::new());

        let recovery = RecoveryManager::new(config.recovery_options()?, Arc::clone(&metrics))
            .recover(&engines)?;
        if let Some(conflict) = recovery.conflict.clone() {
            return Err(ServiceError::TruncationRefused(conflict));
        }

        let state_path = config.state_file_path();
        let state = match read_state_file(&state_path)? {
            Some(state) => state,
            None => recovery.gtid_state(),
        };
        let gtid = Arc::new(GtidTracker::new(state, config.gtid_strict_mode));

        let store = LogFileStore::open(config.store_options()?, Arc::clone(&metrics))?;
        let first_file = store.index().next_file_name();
        let store = Arc::new(Mutex::new(store));

        let tc: Arc<dyn TransactionCoordinatorLog> = match config.tc_backend {
            TcBackend::Binlog => Arc::new(BinlogTc::new(
                Arc::clone(&store),
                &first_file,
                Arc::clone(&metrics),
            )),
            TcBackend::Mmap => Arc::new(MmapTc::create(
                &config.tc_journal_path(),
                config.tc_mmap_size,
                config.tc_page_size,
                Arc::clone(&metrics),
            )?),
        };

        let head = FileHead {
            gtid_list: GtidListPayload::complete(gtid.snapshot()?.to_list()),
            checkpoint: None,
        };
        let created = store.lock().map_err(BinlogError::from)?.create_new_file(&head)?;
        if created != first_file {
            return Err(BinlogError::invalid_state(format!(
                "expected to create {} but created {}",
                first_file, created
            ))
            .into());
        }
        remove_state_file(&state_path)?;

        let mut coordinator = GroupCommitCoordinator::new(
            config.group_commit_config(),
            Arc::clone(&store),
            Arc::clone(&tc),
            Arc::clone(&gtid),
            engines.clone(),
            Arc::clone(&metrics),
        );
        if let Some(hook) = after_sync {
            coordinator = coordinator.with_after_sync(hook);
        }

        log_event_with_fields(
            Event::ServiceReady,
            &[("file", &created), ("tc", tc.name())],
        );
        Ok(Arc::new(Self {
            config,
            engines,
            metrics,
            store,
            tc,
            gtid,
            coordinator,
            next_xid: AtomicU64::new(1),
            recovery,
            shut_down: AtomicBool::new(false),
        }))
    }

    /// Clean shutdown. Idempotent.
    pub fn shutdown(&self) -> ServiceResult<()> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        log_event(Event::ShutdownBegin);
        write_state_file(&self.config.state_file_path(), &self.gtid.snapshot()?)?;
        self.store.lock().map_err(BinlogError::from)?.close()?;
        self.tc.close()?;
        log_event(Event::ShutdownComplete);
        Ok(())
    }

    fn check_running(&self) -> ServiceResult<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(ServiceError::ShutDown);
        }
        Ok(())
    }

    pub fn config(&self) -> &BinlogConfig {
        &self.config
    }

    pub fn engines(&self) -> &[Arc<dyn RecoverableEngine>] {
        &self.engines
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    pub fn gtid(&self) -> &Arc<GtidTracker> {
        &self.gtid
    }

    pub fn registrar(&self) -> &Arc<dyn TransactionCoordinatorLog> {
        &self.tc
    }

    pub fn coordinator(&self) -> &GroupCommitCoordinator {
        &self.coordinator
    }

    /// What startup recovery did
    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.recovery
    }

    pub fn session(self: &Arc<Self>) -> Session {
        Session::new(Arc::clone(self))
    }

    fn next_xid(&self) -> Xid {
        self.next_xid.fetch_add(1, Ordering::SeqCst)
    }

    pub fn is_log_disabled(&self) -> ServiceResult<bool> {
        Ok(self.store.lock().map_err(BinlogError::from)?.is_broken())
    }

    pub fn file_names(&self) -> ServiceResult<Vec<String>> {
        Ok(self.store.lock().map_err(BinlogError::from)?.file_names())
    }

    pub fn status(&self) -> ServiceResult<ServiceStatus> {
        let (active_file, files, log_disabled) = {
            let store = self.store.lock().map_err(BinlogError::from)?;
            (
                store.active_name().map(str::to_string),
                store.file_names(),
                store.is_broken(),
            )
        };
        Ok(ServiceStatus {
            active_file,
            last_committed: self.coordinator.last_committed()?,
            files,
            log_disabled,
            gtid_list: self.gtid.snapshot()?.to_list(),
            metrics: self.metrics.snapshot(),
        })
    }

    /// Read an indexed file. The file cannot be purged while the reader
    /// is open.
    pub fn open_reader(&self, name: &str) -> ServiceResult<LogReader> {
        Ok(self.store.lock().map_err(BinlogError::from)?.open_reader(name)?)
    }

    /// Switch to a new log file now
    pub fn rotate(&self) -> ServiceResult<RotateOutcome> {
        self.check_running()?;
        let rotated = self.coordinator.rotate()?;
        self.expire_logs()?;
        Ok(rotated)
    }

    /// Delete files before `to` that nothing needs any more
    pub fn purge_logs_to(&self, to: &str) -> ServiceResult<PurgeOutcome> {
        self.check_running()?;
        let scope = ObservationScope::new("PURGE", &[("to", to)]);
        let tc = Arc::clone(&self.tc);
        let outcome = self
            .store
            .lock()
            .map_err(BinlogError::from)?
            .purge_to(to, &|name: &str| tc.is_file_needed(name));
        match outcome {
            Ok(outcome) => {
                let purged = outcome.purged.len().to_string();
                scope.complete(&[("purged", &purged)]);
                Ok(outcome)
            }
            Err(e) => {
                scope.complete(&[("error", &e.to_string())]);
                Err(e.into())
            }
        }
    }

    /// Keep at most `expire_logs_keep` files
    fn expire_logs(&self) -> ServiceResult<()> {
        let keep = self.config.expire_logs_keep;
        if keep == 0 {
            return Ok(());
        }
        let files = self.file_names()?;
        if files.len() <= keep {
            return Ok(());
        }
        let to = files[files.len() - keep].clone();
        self.purge_logs_to(&to)?;
        Ok(())
    }

    /// Make the next batch write fail, as a full disk would
    #[doc(hidden)]
    pub fn inject_write_failure(&self) -> ServiceResult<()> {
        self.store.lock().map_err(BinlogError::from)?.inject_write_failure();
        Ok(())
    }

    /// Log one self-contained group outside any transaction (e.g. DDL)
    pub fn log_standalone(&self, record: LogRecord, ddl: bool) -> ServiceResult<CommitOutcome> {
        self.check_running()?;
        let ticket = self.coordinator.register()?;
        let mut request = CommitRequest::new(vec![record], Terminal::Standalone);
        if ddl {
            request = request.ddl();
        }
        let outcome = self.coordinator.commit(ticket, request)?;
        self.after_commit(&outcome)?;
        Ok(outcome)
    }

    fn after_commit(&self, outcome: &CommitOutcome) -> ServiceResult<()> {
        if outcome.rotated.is_some() {
            self.expire_logs()?;
        }
        Ok(())
    }
}

/// One client connection's view of the log.
///
/// The cache is created on the first write. A transaction's participating
/// engines are prepared and committed here; the log is their coordinator.
pub struct Session {
    service: Arc<BinlogService>,
    cache: Option<SessionCache>,
    in_transaction: bool,
    participants: Vec<Arc<dyn RecoverableEngine>>,
    kill: KillSwitch,
    ticket: Option<CommitTicket>,
    waitee: Option<CommitTicket>,
    gtid: Option<Gtid>,
}

impl Session {
    fn new(service: Arc<BinlogService>) -> Self {
        Self {
            service,
            cache: None,
            in_transaction: false,
            participants: Vec::new(),
            kill: KillSwitch::new(),
            ticket: None,
            waitee: None,
            gtid: None,
        }
    }

    fn cache(&mut self) -> &mut SessionCache {
        let max = self.service.config.max_cache_size;
        self.cache.get_or_insert_with(|| SessionCache::new(max))
    }

    pub fn has_cache(&self) -> bool {
        self.cache.is_some()
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    /// Handle another thread can use to interrupt a wait on a prior commit
    pub fn kill_handle(&self) -> KillSwitch {
        self.kill.clone()
    }

    pub fn begin(&mut self) {
        self.in_transaction = true;
        self.statement_start();
    }

    /// Take part in two-phase commit with `engine` for this transaction
    pub fn enlist(&mut self, engine: Arc<dyn RecoverableEngine>) {
        if !self
            .participants
            .iter()
            .any(|e| Arc::ptr_eq(e, &engine))
        {
            self.participants.push(engine);
        }
    }

    /// Log the next commit under this position instead of allocating one
    pub fn set_gtid(&mut self, gtid: Gtid) {
        self.gtid = Some(gtid);
    }

    /// Handle on this session's next commit, for others to wait on
    pub fn commit_ticket(&mut self) -> ServiceResult<CommitTicket> {
        if let Some(ticket) = &self.ticket {
            return Ok(ticket.clone());
        }
        let ticket = self.service.coordinator.register()?;
        self.ticket = Some(ticket.clone());
        Ok(ticket)
    }

    /// The next commit must be logged after `prior`
    pub fn wait_for_prior_commit(&mut self, prior: CommitTicket) {
        self.waitee = Some(prior);
    }

    pub fn write(&mut self, record: LogRecord) -> ServiceResult<()> {
        self.service.check_running()?;
        let in_transaction = self.in_transaction;
        self.cache().append(&record, in_transaction)?;
        Ok(())
    }

    /// Add a piece of a record written in several parts
    pub fn write_fragment(
        &mut self,
        record_type: RecordType,
        flags: u8,
        bytes: &[u8],
    ) -> ServiceResult<()> {
        self.cache().append_fragment(record_type, flags, bytes)?;
        Ok(())
    }

    pub fn finish_fragment(&mut self) -> ServiceResult<()> {
        let in_transaction = self.in_transaction;
        self.cache().finish_fragment(in_transaction)?;
        Ok(())
    }

    /// A partial write was lost; the commit will carry an incident marker
    pub fn mark_incident(&mut self, reason: impl Into<String>) {
        self.cache().set_incident(reason);
    }

    pub fn savepoint(&mut self) -> usize {
        self.cache().mark_savepoint()
    }

    pub fn rollback_to_savepoint(&mut self, offset: usize) -> ServiceResult<()> {
        self.cache().truncate(offset)?;
        Ok(())
    }

    pub fn statement_start(&mut self) {
        if let Some(cache) = self.cache.as_mut() {
            cache.start_statement();
        }
    }

    /// Undo the current statement's transactional changes
    pub fn statement_rollback(&mut self) -> ServiceResult<()> {
        self.cache().rollback_statement()?;
        Ok(())
    }

    /// End of statement: non-transactional changes outside a transaction
    /// are logged now as their own group.
    pub fn statement_end(&mut self) -> ServiceResult<Option<CommitOutcome>> {
        let unit = match self.cache.as_mut() {
            Some(cache) => cache.flush_stmt()?,
            None => None,
        };
        let Some(unit) = unit else {
            return Ok(None);
        };
        self.note_incident(unit.incident);
        let ticket = self.service.coordinator.register()?;
        let request =
            CommitRequest::new(unit.records, Terminal::commit()).with_kill(self.kill.clone());
        self.submit(ticket, request, false)
    }

    /// Log whatever the statement buffer still holds ahead of the
    /// transaction. If that fails the transaction unit ends with an
    /// incident marker in its place.
    fn flush_pending_statement(&mut self) -> Option<CommitOutcome> {
        match self.statement_end() {
            Ok(outcome) => outcome,
            Err(e) => {
                Logger::warn("STATEMENT_CACHE_LOST", &[("error", &e.to_string())]);
                self.cache()
                    .set_incident(format!("non-transactional changes not logged: {}", e));
                None
            }
        }
    }

    /// Commit the transaction.
    ///
    /// Returns `None` when nothing needed logging, or when logging has
    /// been disabled by an earlier failure and the commit is not two-phase.
    pub fn commit(&mut self) -> ServiceResult<Option<CommitOutcome>> {
        self.service.check_running()?;
        self.in_transaction = false;
        let stmt_outcome = self.flush_pending_statement();
        let unit = match self.cache.as_mut() {
            Some(cache) => cache.flush_trx()?,
            None => None,
        };
        let participants = std::mem::take(&mut self.participants);
        let gtid = self.gtid.take();
        let waitee = self.waitee.take();

        let Some(unit) = unit else {
            if let Some(ticket) = self.ticket.take() {
                self.service.coordinator.abandon(ticket)?;
            }
            return Ok(stmt_outcome);
        };
        self.note_incident(unit.incident);

        let ticket = match self.ticket.take() {
            Some(ticket) => ticket,
            None => self.service.coordinator.register()?,
        };

        let two_phase = !participants.is_empty();
        let terminal = if two_phase {
            let xid = self.service.next_xid();
            for (i, engine) in participants.iter().enumerate() {
                if let Err(e) = engine.prepare(xid) {
                    for prepared in &participants[..i] {
                        if let Err(re) = prepared.rollback_by_xid(xid) {
                            Logger::error("ENGINE_ROLLBACK_FAILED", &[("error", &re.to_string())]);
                        }
                    }
                    self.service.coordinator.abandon(ticket)?;
                    return Err(e.into());
                }
            }
            Terminal::two_phase(xid, participants.len() as u32)
        } else {
            Terminal::commit()
        };

        let mut request = CommitRequest::new(unit.records, terminal)
            .with_engines(participants.clone())
            .with_kill(self.kill.clone());
        if let Some(gtid) = gtid {
            request = request.with_gtid(gtid);
        }
        if let Some(waitee) = waitee {
            request = request.after(waitee);
        }

        let result = self.submit(ticket, request, two_phase);
        let Some(xid) = terminal.xid() else {
            return result;
        };

        match result {
            Ok(Some(outcome)) => {
                maybe_crash(points::COMMIT_BEFORE_ENGINE_COMMIT);
                let committed = participants
                    .iter()
                    .try_for_each(|engine| engine.commit_by_xid(xid));
                if let Some(token) = outcome.token.clone() {
                    self.service.tc.release_token(token)?;
                }
                committed?;
                Ok(Some(outcome))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                for engine in &participants {
                    if let Err(re) = engine.rollback_by_xid(xid) {
                        Logger::error("ENGINE_ROLLBACK_FAILED", &[("error", &re.to_string())]);
                    }
                }
                Err(e)
            }
        }
    }

    /// Roll the transaction back. Changes that cannot be undone are still
    /// logged, closed by a rollback record.
    pub fn rollback(&mut self) -> ServiceResult<Option<CommitOutcome>> {
        self.in_transaction = false;
        self.participants.clear();
        self.gtid = None;
        self.waitee = None;
        let stmt_outcome = self.flush_pending_statement();
        let keep = self
            .cache
            .as_ref()
            .is_some_and(|c| c.trx_has_nontrans_write() || c.has_incident());
        if !keep {
            if let Some(cache) = self.cache.as_mut() {
                cache.discard_trx();
            }
            if let Some(ticket) = self.ticket.take() {
                self.service.coordinator.abandon(ticket)?;
            }
            return Ok(stmt_outcome);
        }
        let unit = match self.cache.as_mut() {
            Some(cache) => cache.flush_trx()?,
            None => None,
        };
        let Some(unit) = unit else {
            return Ok(stmt_outcome);
        };
        self.note_incident(unit.incident);
        let ticket = match self.ticket.take() {
            Some(ticket) => ticket,
            None => self.service.coordinator.register()?,
        };
        let request =
            CommitRequest::new(unit.records, Terminal::Rollback).with_kill(self.kill.clone());
        self.submit(ticket, request, false)
    }

    fn note_incident(&self, incident: bool) {
        if incident {
            self.service.metrics.increment_incidents();
            log_event(Event::IncidentWritten);
        }
    }

    /// Hand a request to group commit. A failure that disabled logging is
    /// swallowed unless the commit is two-phase.
    fn submit(
        &mut self,
        ticket: CommitTicket,
        request: CommitRequest,
        two_phase: bool,
    ) -> ServiceResult<Option<CommitOutcome>> {
        match self.service.coordinator.commit(ticket, request) {
            Ok(outcome) => {
                self.service.after_commit(&outcome)?;
                Ok(Some(outcome))
            }
            Err(e) if !two_phase && disables_logging(&e) => {
                Logger::warn("COMMIT_UNLOGGED", &[("reason", e.message())]);
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn disables_logging(err: &BinlogError) -> bool {
    err.code().disables_logging()
}

impl Drop for Session {
    fn drop(&mut self) {
        let unlogged = self.cache.as_ref().is_some_and(|c| {
            !c.stmt_is_empty() || c.trx_has_nontrans_write() || c.has_incident()
        });
        if unlogged && self.service.check_running().is_ok() {
            if let Err(e) = self.rollback() {
                Logger::warn("SESSION_CLOSE_UNLOGGED", &[("error", &e.to_string())]);
            }
        }
        if let Some(ticket) = self.ticket.take() {
            if let Err(e) = self.service.coordinator.abandon(ticket) {
                Logger::warn("SESSION_TICKET_LEAKED", &[("error", &e.to_string())]);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> BinlogConfig {
        BinlogConfig::for_dir(dir.path())
    }

    #[test]
    fn test_init_creates_first_file() {
        let dir = TempDir::new().unwrap();
        let service = BinlogService::init(config(&dir), Vec::new()).unwrap();
        let status = service.status().unwrap();
        assert_eq!(status.active_file.as_deref(), Some("binlog.000001"));
        assert!(!status.log_disabled);
        service.shutdown().unwrap();
        assert!(dir.path().join("binlog.state").exists());
    }

    #[test]
    fn test_commit_and_positions() {
        let dir = TempDir::new().unwrap();
        let service = BinlogService::init(config(&dir), Vec::new()).unwrap();
        let mut session = service.session();
        assert!(!session.has_cache());
        session.begin();
        session.write(LogRecord::data_change(b"row".to_vec(), true)).unwrap();
        let first = session.commit().unwrap().unwrap();
        session.begin();
        session.write(LogRecord::data_change(b"row2".to_vec(), true)).unwrap();
        let second = session.commit().unwrap().unwrap();
        assert_eq!(first.gtid, Gtid::new(0, 1, 1));
        assert_eq!(second.gtid, Gtid::new(0, 1, 2));
        assert!(first.position < second.position);
        service.shutdown().unwrap();
    }

    #[test]
    fn test_empty_commit_is_elided() {
        let dir = TempDir::new().unwrap();
        let service = BinlogService::init(config(&dir), Vec::new()).unwrap();
        let mut session = service.session();
        session.begin();
        assert!(session.commit().unwrap().is_none());
        assert_eq!(service.metrics().snapshot().group_commit_batches, 0);
    }

    #[test]
    fn test_rollback_logs_only_nontrans_work() {
        let dir = TempDir::new().unwrap();
        let service = BinlogService::init(config(&dir), Vec::new()).unwrap();
        let mut session = service.session();

        session.begin();
        session.write(LogRecord::data_change(b"t".to_vec(), true)).unwrap();
        assert!(session.rollback().unwrap().is_none());

        session.begin();
        session.write(LogRecord::data_change(b"t".to_vec(), true)).unwrap();
        session.write(LogRecord::data_change(b"n".to_vec(), false)).unwrap();
        assert!(session.rollback().unwrap().is_some());
    }

    #[test]
    fn test_state_survives_restart() {
        let dir = TempDir::new().unwrap();
        {
            let service = BinlogService::init(config(&dir), Vec::new()).unwrap();
            let mut session = service.session();
            session.begin();
            session.write(LogRecord::data_change(b"x".to_vec(), true)).unwrap();
            session.commit().unwrap();
            service.shutdown().unwrap();
        }
        let service = BinlogService::init(config(&dir), Vec::new()).unwrap();
        assert_eq!(
            service.gtid().snapshot().unwrap().to_list(),
            vec![Gtid::new(0, 1, 1)]
        );
        assert!(!dir.path().join("binlog.state").exists());
        assert_eq!(service.file_names().unwrap().len(), 2);
    }

    #[test]
    fn test_calls_after_shutdown_fail() {
        let dir = TempDir::new().unwrap();
        let service = BinlogService::init(config(&dir), Vec::new()).unwrap();
        service.shutdown().unwrap();
        service.shutdown().unwrap();
        assert!(matches!(service.rotate(), Err(ServiceError::ShutDown)));
    }
}
