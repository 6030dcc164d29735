//! Transaction boundary coordinator
//!
//! ## State Machine
//! ```text
//!   prepare ──► Active ──► Prepared ──► Committed
//!                  │           │
//!                  └───────────┴──────► RolledBack
//! ```
//!
//! Records outlive the engine's transaction so repeated boundaries are answered from the
//! table: a second prepare of a prepared transaction returns `XA_OK` without touching the
//! cache again. Committed and rolled back records are kept for a retention period and then
//! dropped by [`TransactionCoordinator::reap_completed`]; a boundary arriving after that is
//! answered with `XAER_NOTA`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::cache::{CacheConfiguration, IsolationLevel, LockingMode, Metadata, TransactionEngine, TxOperation};
use crate::error::{CacheError, HotRodError, Result};
use crate::protocol::constants::*;
use crate::topology::{ClusterView, NodeId};

use super::{TransactionDecodeContext, TxState, TxWrite, Xid};

/// Outcome of a prepare request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrepareOutcome {
    /// Finished with this XA code
    Completed(i32),
    /// Another prepare of the same transaction is still running on a live node
    NotExecuted,
}

#[derive(Debug, Clone)]
struct TxRecord {
    state: TxState,
    originator: NodeId,
    /// When the record reached Committed or RolledBack
    completed_at: Option<Instant>,
}

impl TxRecord {
    fn active(originator: NodeId) -> Self {
        Self {
            state: TxState::Active,
            originator,
            completed_at: None,
        }
    }
}

/// Client transactions known to this server, keyed by cache and xid
#[derive(Default)]
pub struct TxTable {
    records: Mutex<HashMap<(String, Xid), TxRecord>>,
}

impl TxTable {
    pub fn state(&self, cache: &str, xid: &Xid) -> Option<TxState> {
        self.records
            .lock()
            .get(&(cache.to_string(), xid.clone()))
            .map(|r| r.state)
    }

    fn set_state(&self, cache: &str, xid: &Xid, state: TxState) {
        if let Some(record) = self.records.lock().get_mut(&(cache.to_string(), xid.clone())) {
            record.state = state;
            record.completed_at = match state {
                TxState::Committed | TxState::RolledBack => Some(Instant::now()),
                TxState::Active | TxState::Prepared => None,
            };
        }
    }

    /// Drop records completed more than `retention` ago
    fn remove_completed(&self, retention: Duration) -> usize {
        let mut records = self.records.lock();
        let before = records.len();
        records.retain(|_, record| match record.completed_at {
            Some(at) => at.elapsed() < retention,
            None => true,
        });
        before - records.len()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

enum Existing {
    Answer(PrepareOutcome),
    Stale,
    Created,
}

/// Drives prepare / commit / rollback against a cache's transaction engine
pub struct TransactionCoordinator {
    cluster: Arc<dyn ClusterView>,
    table: TxTable,
    /// Caches whose configuration error was already logged
    misconfigured: Mutex<HashSet<String>>,
}

impl TransactionCoordinator {
    pub fn new(cluster: Arc<dyn ClusterView>) -> Self {
        Self {
            cluster,
            table: TxTable::default(),
            misconfigured: Mutex::new(HashSet::new()),
        }
    }

    pub fn table(&self) -> &TxTable {
        &self.table
    }

    /// Forget committed and rolled back transactions older than `retention`
    pub fn reap_completed(&self, retention: Duration) -> usize {
        let reaped = self.table.remove_completed(retention);
        if reaped > 0 {
            tracing::debug!("Dropped {} completed transaction records", reaped);
        }
        reaped
    }

    /// Client transactions need a transactional, repeatable-read, pessimistic cache
    pub fn validate_configuration(&self, cache: &str, config: &CacheConfiguration) -> Result<()> {
        let tx = &config.transaction;
        let reason = if !config.is_transactional() {
            Some("cache is not transactional")
        } else if tx.isolation != IsolationLevel::RepeatableRead {
            Some("isolation level must be REPEATABLE_READ")
        } else if tx.locking != LockingMode::Pessimistic {
            Some("locking mode must be PESSIMISTIC")
        } else if tx.total_order {
            Some("total order protocol is not supported")
        } else {
            None
        };
        let Some(reason) = reason else {
            return Ok(());
        };
        if self.misconfigured.lock().insert(cache.to_string()) {
            tracing::error!("Cache '{}' cannot run client transactions: {}", cache, reason);
        }
        Err(HotRodError::IllegalTransactionConfiguration {
            cache: cache.to_string(),
            reason: reason.to_string(),
        })
    }

    /// Look at an existing record, or create one (insert-if-absent)
    fn claim(&self, cache: &str, xid: &Xid) -> Existing {
        let key = (cache.to_string(), xid.clone());
        let mut records = self.table.records.lock();
        if let Some(record) = records.get(&key) {
            return match record.state {
                TxState::Prepared | TxState::Committed => Existing::Answer(PrepareOutcome::Completed(XA_OK)),
                TxState::RolledBack => Existing::Answer(PrepareOutcome::Completed(XA_RBROLLBACK)),
                TxState::Active if self.cluster.is_member(&record.originator) => {
                    Existing::Answer(PrepareOutcome::NotExecuted)
                }
                TxState::Active => {
                    tracing::warn!(
                        "Originator {} of {} left the cluster; rolling back the stale transaction",
                        record.originator,
                        xid
                    );
                    records.insert(key, TxRecord::active(self.cluster.local_node()));
                    Existing::Stale
                }
            };
        }
        records.insert(key, TxRecord::active(self.cluster.local_node()));
        Existing::Created
    }

    /// Validate and apply the client's writes, then run the first (or only) phase
    pub fn prepare(
        &self,
        cache: &str,
        config: &CacheConfiguration,
        engine: &dyn TransactionEngine,
        request: &TransactionDecodeContext,
    ) -> Result<PrepareOutcome> {
        self.validate_configuration(cache, config)?;
        let xid = &request.xid;

        match self.claim(cache, xid) {
            Existing::Answer(outcome) => {
                tracing::debug!("Prepare of {} answered from the table: {:?}", xid, outcome);
                return Ok(outcome);
            }
            Existing::Stale => {
                if let Err(e) = engine.rollback(xid) {
                    tracing::debug!("Stale rollback of {} failed: {}", xid, e);
                }
            }
            Existing::Created => {}
        }

        let code = match self.run_prepare(config, engine, request) {
            Ok(code) => code,
            Err(e) => {
                tracing::debug!("Prepare of {} failed: {}", xid, e);
                if let Err(rollback_err) = engine.rollback(xid) {
                    tracing::trace!("Rollback after failed prepare of {}: {}", xid, rollback_err);
                }
                xa_code(&e)
            }
        };

        let state = match code {
            XA_OK if !request.one_phase => TxState::Prepared,
            XA_OK | XA_RDONLY => TxState::Committed,
            XA_HEURCOM | XA_HEURMIX => TxState::Committed,
            _ => TxState::RolledBack,
        };
        self.table.set_state(cache, xid, state);
        tracing::debug!("Prepared {} on '{}': code={} state={:?}", xid, cache, code, state);
        Ok(PrepareOutcome::Completed(code))
    }

    fn run_prepare(
        &self,
        config: &CacheConfiguration,
        engine: &dyn TransactionEngine,
        request: &TransactionDecodeContext,
    ) -> std::result::Result<i32, CacheError> {
        let xid = &request.xid;
        engine.begin(xid)?;

        for write in &request.writes {
            let current = engine.read_for_update(xid, &write.key)?;
            if !is_valid(write, current.as_ref().map(|e| e.version)) {
                tracing::debug!("Write validation failed for {}; marking rollback-only", xid);
                engine.mark_rollback_only(xid)?;
                break;
            }
            engine.write(xid, to_operation(write, config))?;
        }

        if request.one_phase {
            engine.commit(xid, true)?;
            Ok(XA_OK)
        } else {
            engine.prepare(xid)
        }
    }

    /// Second phase; unknown transactions get `XAER_NOTA`
    pub fn commit(&self, cache: &str, engine: &dyn TransactionEngine, xid: &Xid) -> i32 {
        match self.table.state(cache, xid) {
            None => XAER_NOTA,
            Some(TxState::Committed) => XA_OK,
            Some(TxState::RolledBack) => XA_RBROLLBACK,
            Some(TxState::Active | TxState::Prepared) => {
                let (code, state) = match engine.commit(xid, false) {
                    Ok(()) => (XA_OK, TxState::Committed),
                    Err(e) => {
                        let code = xa_code(&e);
                        let state = if matches!(code, XA_RBROLLBACK | XA_HEURRB) {
                            TxState::RolledBack
                        } else {
                            TxState::Committed
                        };
                        tracing::warn!("Commit of {} on '{}' ended with {}: {}", xid, cache, code, e);
                        (code, state)
                    }
                };
                self.table.set_state(cache, xid, state);
                code
            }
        }
    }

    /// Abort; unknown transactions get `XAER_NOTA`
    pub fn rollback(&self, cache: &str, engine: &dyn TransactionEngine, xid: &Xid) -> i32 {
        match self.table.state(cache, xid) {
            None => XAER_NOTA,
            Some(TxState::RolledBack) => XA_OK,
            Some(TxState::Committed) => XA_HEURCOM,
            Some(TxState::Active | TxState::Prepared) => {
                let code = match engine.rollback(xid) {
                    Ok(()) => XA_OK,
                    Err(e) => {
                        tracing::warn!("Rollback of {} on '{}' failed: {}", xid, cache, e);
                        xa_code(&e)
                    }
                };
                let state = if code == XA_HEURCOM || code == XA_HEURMIX {
                    TxState::Committed
                } else {
                    TxState::RolledBack
                };
                self.table.set_state(cache, xid, state);
                code
            }
        }
    }
}

/// Whether `write` still holds given the stored version (`None` = absent)
pub(crate) fn is_valid(write: &TxWrite, current_version: Option<u64>) -> bool {
    if write.control.not_read() {
        return true;
    }
    if write.control.non_existing() {
        return current_version.is_none();
    }
    current_version == Some(write.version_read)
}

fn to_operation(write: &TxWrite, config: &CacheConfiguration) -> TxOperation {
    match (&write.value, write.is_remove()) {
        (Some(value), false) => TxOperation::Put {
            key: write.key.clone(),
            value: value.clone(),
            metadata: Metadata::resolve(write.lifespan, write.max_idle, config),
        },
        _ => TxOperation::Remove { key: write.key.clone() },
    }
}

/// XA code for an engine failure
pub(crate) fn xa_code(error: &CacheError) -> i32 {
    match error {
        CacheError::RolledBack(_) => XA_RBROLLBACK,
        CacheError::HeuristicMixed(_) => XA_HEURMIX,
        CacheError::HeuristicRollback(_) => XA_HEURRB,
        CacheError::UnknownTransaction(_) => XAER_NOTA,
        CacheError::Wrapped { cause, .. } => xa_code(cause),
        _ => XAER_RMERR,
    }
}
