//! Shared helpers for integration tests

#![allow(dead_code)]

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Arc, Mutex};

use binlog::engine::{EngineError, EngineResult, PreparedXid, RecoverableEngine, Xid};
use binlog::BinlogConfig;

#[derive(Debug, Default)]
struct EngineState {
    prepared: BTreeSet<Xid>,
    committed: Vec<Xid>,
    rolled_back: Vec<Xid>,
    external: Vec<String>,
    ordered: Vec<Option<Xid>>,
    /// Process is "dead": calls are accepted but change nothing
    crashed: bool,
    crash_after_prepare: bool,
    fail_prepare: bool,
}

/// In-memory recoverable engine whose prepared set survives a simulated
/// crash of the service.
#[derive(Debug)]
pub struct MemoryEngine {
    name: String,
    state: Mutex<EngineState>,
}

impl MemoryEngine {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            state: Mutex::new(EngineState::default()),
        })
    }

    /// Engine state as left by an earlier run
    pub fn with_prepared(name: &str, xids: &[Xid]) -> Arc<Self> {
        let engine = Self::new(name);
        engine.state.lock().unwrap().prepared.extend(xids.iter().copied());
        engine
    }

    pub fn add_external(&self, id: &str) {
        self.state.lock().unwrap().external.push(id.to_string());
    }

    /// The process dies right after the next prepare becomes durable
    pub fn crash_after_next_prepare(&self) {
        self.state.lock().unwrap().crash_after_prepare = true;
    }

    pub fn fail_next_prepare(&self) {
        self.state.lock().unwrap().fail_prepare = true;
    }

    /// Come back up after a simulated crash
    pub fn restart(&self) {
        let mut state = self.state.lock().unwrap();
        state.crashed = false;
        state.ordered.clear();
    }

    pub fn prepared(&self) -> Vec<Xid> {
        self.state.lock().unwrap().prepared.iter().copied().collect()
    }

    pub fn committed(&self) -> Vec<Xid> {
        self.state.lock().unwrap().committed.clone()
    }

    pub fn rolled_back(&self) -> Vec<Xid> {
        self.state.lock().unwrap().rolled_back.clone()
    }

    pub fn ordered(&self) -> Vec<Option<Xid>> {
        self.state.lock().unwrap().ordered.clone()
    }
}

impl RecoverableEngine for MemoryEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn prepare(&self, xid: Xid) -> EngineResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.crashed {
            return Ok(());
        }
        if std::mem::take(&mut state.fail_prepare) {
            return Err(EngineError::new(&self.name, "prepare refused"));
        }
        state.prepared.insert(xid);
        if std::mem::take(&mut state.crash_after_prepare) {
            state.crashed = true;
        }
        Ok(())
    }

    fn commit_by_xid(&self, xid: Xid) -> EngineResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.crashed {
            return Ok(());
        }
        state.prepared.remove(&xid);
        state.committed.push(xid);
        Ok(())
    }

    fn rollback_by_xid(&self, xid: Xid) -> EngineResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.crashed {
            return Ok(());
        }
        state.prepared.remove(&xid);
        state.rolled_back.push(xid);
        Ok(())
    }

    fn recover_prepared(&self) -> EngineResult<Vec<PreparedXid>> {
        let state = self.state.lock().unwrap();
        let mut out: Vec<PreparedXid> = state.prepared.iter().map(|x| PreparedXid::Local(*x)).collect();
        out.extend(state.external.iter().cloned().map(PreparedXid::External));
        Ok(out)
    }

    fn commit_ordered(&self, xid: Option<Xid>) {
        let mut state = self.state.lock().unwrap();
        if !state.crashed {
            state.ordered.push(xid);
        }
    }
}

pub fn engines(list: &[&Arc<MemoryEngine>]) -> Vec<Arc<dyn RecoverableEngine>> {
    list.iter()
        .map(|e| Arc::clone(*e) as Arc<dyn RecoverableEngine>)
        .collect()
}

pub fn config(dir: &Path) -> BinlogConfig {
    BinlogConfig::for_dir(dir)
}
