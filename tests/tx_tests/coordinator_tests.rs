//! Coordinator Tests
//!
//! Tests for client transaction boundaries: prepare, commit and rollback against the
//! in-memory cache and against engines reporting heuristic outcomes.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hotrodkv::cache::{
    Cache, CacheConfiguration, CacheEntry, CacheFlags, LockingMode, Metadata, TransactionEngine, TxOperation,
};
use hotrodkv::error::{CacheError, CacheResult};
use hotrodkv::protocol::constants::*;
use hotrodkv::topology::{NodeId, StaticClusterView};
use hotrodkv::tx::{ControlByte, PrepareOutcome, TransactionCoordinator, TransactionDecodeContext, TxState, TxWrite, Xid};
use hotrodkv::{HotRodError, LocalCache};

const CACHE: &str = "tx";

fn setup() -> (TransactionCoordinator, LocalCache) {
    let coordinator = TransactionCoordinator::new(Arc::new(StaticClusterView::new("node-1")));
    let cache = LocalCache::new(CACHE, CacheConfiguration::transactional());
    (coordinator, cache)
}

fn xid(n: u8) -> Xid {
    Xid::new(1, vec![n; 4], vec![0xB0, n])
}

fn request(xid: Xid, one_phase: bool, writes: Vec<TxWrite>) -> TransactionDecodeContext {
    let mut tx = TransactionDecodeContext::new(xid, one_phase, writes.len());
    tx.writes = writes;
    tx
}

fn prepare(coordinator: &TransactionCoordinator, cache: &LocalCache, tx: &TransactionDecodeContext) -> PrepareOutcome {
    coordinator
        .prepare(CACHE, cache.configuration(), cache, tx)
        .unwrap()
}

fn value_of(cache: &LocalCache, key: &[u8]) -> Option<Vec<u8>> {
    cache.get(key, CacheFlags::none()).unwrap().map(|e| e.value)
}

// =============================================================================
// Prepare and Commit
// =============================================================================

#[test]
fn test_one_phase_commit_applies_writes() {
    let (coordinator, cache) = setup();
    let tx = request(xid(1), true, vec![TxWrite::put("k", "v").with_control(ControlByte::NOT_READ)]);

    assert_eq!(prepare(&coordinator, &cache, &tx), PrepareOutcome::Completed(XA_OK));
    assert_eq!(value_of(&cache, b"k"), Some(b"v".to_vec()));
    assert_eq!(coordinator.table().state(CACHE, &tx.xid), Some(TxState::Committed));
}

#[test]
fn test_two_phase_commit() {
    let (coordinator, cache) = setup();
    let tx = request(xid(2), false, vec![TxWrite::put("k", "v").with_control(ControlByte::NON_EXISTING)]);

    assert_eq!(prepare(&coordinator, &cache, &tx), PrepareOutcome::Completed(XA_OK));
    assert_eq!(coordinator.table().state(CACHE, &tx.xid), Some(TxState::Prepared));
    assert_eq!(value_of(&cache, b"k"), None);

    // The prepared transaction holds the key
    let res = cache.put(b"k".to_vec(), b"other".to_vec(), Metadata::immortal(), CacheFlags::none());
    assert!(matches!(res, Err(CacheError::Timeout(_))));

    assert_eq!(coordinator.commit(CACHE, &cache, &tx.xid), XA_OK);
    assert_eq!(value_of(&cache, b"k"), Some(b"v".to_vec()));
    assert_eq!(coordinator.table().state(CACHE, &tx.xid), Some(TxState::Committed));

    // Repeated commit is answered from the table
    assert_eq!(coordinator.commit(CACHE, &cache, &tx.xid), XA_OK);
}

#[test]
fn test_repeated_prepare_does_not_reapply() {
    let (coordinator, cache) = setup();
    let tx = request(xid(3), true, vec![TxWrite::put("k", "v").with_control(ControlByte::NOT_READ)]);

    assert_eq!(prepare(&coordinator, &cache, &tx), PrepareOutcome::Completed(XA_OK));
    let version = cache.get(b"k", CacheFlags::none()).unwrap().unwrap().version;

    assert_eq!(prepare(&coordinator, &cache, &tx), PrepareOutcome::Completed(XA_OK));
    assert_eq!(cache.get(b"k", CacheFlags::none()).unwrap().unwrap().version, version);
    assert_eq!(cache.stats().stores, 1);
}

#[test]
fn test_repeated_prepare_of_prepared_transaction() {
    let (coordinator, cache) = setup();
    let tx = request(xid(4), false, vec![TxWrite::remove("gone").with_control(ControlByte::NOT_READ)]);

    assert_eq!(prepare(&coordinator, &cache, &tx), PrepareOutcome::Completed(XA_OK));
    assert_eq!(prepare(&coordinator, &cache, &tx), PrepareOutcome::Completed(XA_OK));
    assert_eq!(coordinator.table().state(CACHE, &tx.xid), Some(TxState::Prepared));
    assert_eq!(coordinator.table().len(), 1);
}

#[test]
fn test_empty_transaction_is_read_only() {
    let (coordinator, cache) = setup();
    let tx = request(xid(5), false, Vec::new());
    assert_eq!(prepare(&coordinator, &cache, &tx), PrepareOutcome::Completed(XA_RDONLY));
    assert_eq!(coordinator.table().state(CACHE, &tx.xid), Some(TxState::Committed));
}

// =============================================================================
// Write Validation
// =============================================================================

#[test]
fn test_expected_absent_key_that_exists_rolls_back() {
    let (coordinator, cache) = setup();
    cache
        .put(b"k".to_vec(), b"old".to_vec(), Metadata::immortal(), CacheFlags::none())
        .unwrap();

    let tx = request(xid(6), false, vec![TxWrite::put("k", "new").with_control(ControlByte::NON_EXISTING)]);
    assert_eq!(prepare(&coordinator, &cache, &tx), PrepareOutcome::Completed(XA_RBROLLBACK));
    assert_eq!(coordinator.table().state(CACHE, &tx.xid), Some(TxState::RolledBack));
    assert_eq!(value_of(&cache, b"k"), Some(b"old".to_vec()));

    // Locks were released
    cache
        .put(b"k".to_vec(), b"after".to_vec(), Metadata::immortal(), CacheFlags::none())
        .unwrap();
}

#[test]
fn test_version_mismatch_rolls_back() {
    let (coordinator, cache) = setup();
    cache
        .put(b"k".to_vec(), b"v1".to_vec(), Metadata::immortal(), CacheFlags::none())
        .unwrap();
    let current = cache.get(b"k", CacheFlags::none()).unwrap().unwrap().version;

    let stale = request(xid(7), true, vec![TxWrite::put("k", "v2").with_version(current + 10)]);
    assert_eq!(prepare(&coordinator, &cache, &stale), PrepareOutcome::Completed(XA_RBROLLBACK));

    let fresh = request(xid(8), true, vec![TxWrite::put("k", "v3").with_version(current)]);
    assert_eq!(prepare(&coordinator, &cache, &fresh), PrepareOutcome::Completed(XA_OK));
    assert_eq!(value_of(&cache, b"k"), Some(b"v3".to_vec()));
}

// =============================================================================
// Rollback and Unknown Transactions
// =============================================================================

#[test]
fn test_rollback_of_prepared_transaction() {
    let (coordinator, cache) = setup();
    let tx = request(xid(9), false, vec![TxWrite::put("k", "v").with_control(ControlByte::NOT_READ)]);
    prepare(&coordinator, &cache, &tx);

    assert_eq!(coordinator.rollback(CACHE, &cache, &tx.xid), XA_OK);
    assert_eq!(coordinator.table().state(CACHE, &tx.xid), Some(TxState::RolledBack));
    assert_eq!(value_of(&cache, b"k"), None);

    assert_eq!(coordinator.commit(CACHE, &cache, &tx.xid), XA_RBROLLBACK);
    assert_eq!(coordinator.rollback(CACHE, &cache, &tx.xid), XA_OK);
}

#[test]
fn test_rollback_after_commit_is_heuristic() {
    let (coordinator, cache) = setup();
    let tx = request(xid(10), true, vec![TxWrite::put("k", "v").with_control(ControlByte::NOT_READ)]);
    prepare(&coordinator, &cache, &tx);
    assert_eq!(coordinator.rollback(CACHE, &cache, &tx.xid), XA_HEURCOM);
}

#[test]
fn test_unknown_transaction() {
    let (coordinator, cache) = setup();
    assert_eq!(coordinator.commit(CACHE, &cache, &xid(11)), XAER_NOTA);
    assert_eq!(coordinator.rollback(CACHE, &cache, &xid(11)), XAER_NOTA);
    assert!(coordinator.table().is_empty());
}

// =============================================================================
// Configuration
// =============================================================================

#[test]
fn test_rejects_unsuitable_caches() {
    let (coordinator, _) = setup();

    let plain = LocalCache::new("plain", CacheConfiguration::default());
    let tx = request(xid(12), true, Vec::new());
    let res = coordinator.prepare("plain", plain.configuration(), &plain, &tx);
    assert!(matches!(res, Err(HotRodError::IllegalTransactionConfiguration { .. })));

    let mut optimistic = CacheConfiguration::transactional();
    optimistic.transaction.locking = LockingMode::Optimistic;
    assert!(coordinator.validate_configuration("opt", &optimistic).is_err());
    assert!(coordinator
        .validate_configuration("ok", &CacheConfiguration::transactional())
        .is_ok());
}

// =============================================================================
// Heuristic Outcomes
// =============================================================================

/// Engine whose commit ends with a heuristic mixed outcome
#[derive(Default)]
struct HeuristicEngine {
    writes: AtomicUsize,
}

impl TransactionEngine for HeuristicEngine {
    fn begin(&self, _xid: &Xid) -> CacheResult<()> {
        Ok(())
    }

    fn read_for_update(&self, _xid: &Xid, _key: &[u8]) -> CacheResult<Option<CacheEntry>> {
        Ok(None)
    }

    fn write(&self, _xid: &Xid, _operation: TxOperation) -> CacheResult<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn mark_rollback_only(&self, _xid: &Xid) -> CacheResult<()> {
        Ok(())
    }

    fn prepare(&self, _xid: &Xid) -> CacheResult<i32> {
        Ok(XA_OK)
    }

    fn commit(&self, _xid: &Xid, _one_phase: bool) -> CacheResult<()> {
        Err(CacheError::wrap(
            "commit failed",
            CacheError::HeuristicMixed("one of two stores committed".to_string()),
        ))
    }

    fn rollback(&self, _xid: &Xid) -> CacheResult<()> {
        Ok(())
    }
}

#[test]
fn test_heuristic_mixed_commit() {
    let (coordinator, _) = setup();
    let engine = HeuristicEngine::default();
    let config = CacheConfiguration::transactional();
    let tx = request(xid(13), false, vec![TxWrite::put("k", "v").with_control(ControlByte::NON_EXISTING)]);

    let outcome = coordinator.prepare(CACHE, &config, &engine, &tx).unwrap();
    assert_eq!(outcome, PrepareOutcome::Completed(XA_OK));
    assert_eq!(engine.writes.load(Ordering::SeqCst), 1);

    assert_eq!(coordinator.commit(CACHE, &engine, &tx.xid), XA_HEURMIX);
    assert_eq!(coordinator.table().state(CACHE, &tx.xid), Some(TxState::Committed));
}

// =============================================================================
// Completed Record Retention
// =============================================================================

#[test]
fn test_completed_records_are_reaped_after_retention() {
    let (coordinator, cache) = setup();
    let committed = request(xid(20), true, vec![TxWrite::put("a", "1").with_control(ControlByte::NOT_READ)]);
    let rolled_back = request(xid(21), false, vec![TxWrite::put("b", "2").with_control(ControlByte::NOT_READ)]);
    let prepared = request(xid(22), false, vec![TxWrite::put("c", "3").with_control(ControlByte::NOT_READ)]);

    prepare(&coordinator, &cache, &committed);
    prepare(&coordinator, &cache, &rolled_back);
    assert_eq!(coordinator.rollback(CACHE, &cache, &rolled_back.xid), XA_OK);
    prepare(&coordinator, &cache, &prepared);
    assert_eq!(coordinator.table().len(), 3);

    // Within the retention period everything is remembered
    assert_eq!(coordinator.reap_completed(Duration::from_secs(3600)), 0);
    assert_eq!(coordinator.commit(CACHE, &cache, &committed.xid), XA_OK);
    assert_eq!(coordinator.rollback(CACHE, &cache, &rolled_back.xid), XA_OK);

    assert_eq!(coordinator.reap_completed(Duration::ZERO), 2);
    assert_eq!(coordinator.table().len(), 1);
    assert_eq!(coordinator.table().state(CACHE, &prepared.xid), Some(TxState::Prepared));
    assert_eq!(coordinator.table().state(CACHE, &committed.xid), None);
    assert_eq!(coordinator.commit(CACHE, &cache, &committed.xid), XAER_NOTA);

    // The prepared transaction still completes normally
    assert_eq!(coordinator.commit(CACHE, &cache, &prepared.xid), XA_OK);
    assert_eq!(value_of(&cache, b"c"), Some(b"3".to_vec()));
}

#[test]
fn test_prepared_records_are_never_reaped() {
    let (coordinator, cache) = setup();
    let tx = request(xid(23), false, vec![TxWrite::put("k", "v").with_control(ControlByte::NOT_READ)]);
    prepare(&coordinator, &cache, &tx);

    std::thread::sleep(Duration::from_millis(5));
    assert_eq!(coordinator.reap_completed(Duration::ZERO), 0);
    assert_eq!(coordinator.table().state(CACHE, &tx.xid), Some(TxState::Prepared));
}

// =============================================================================
// Concurrent Prepare of the Same Transaction
// =============================================================================

/// Engine that issues a second prepare of the same transaction from inside `begin`,
/// while the first one's record is still Active
struct ReentrantEngine {
    coordinator: Arc<TransactionCoordinator>,
    cluster: Arc<StaticClusterView>,
    xid: Xid,
    /// Drop the originator from the cluster before the second prepare
    originator_leaves: bool,
    entered: AtomicBool,
    nested: Mutex<Option<PrepareOutcome>>,
    log: Mutex<Vec<&'static str>>,
}

impl ReentrantEngine {
    fn new(originator_leaves: bool) -> Self {
        let cluster = Arc::new(StaticClusterView::new("node-1"));
        Self {
            coordinator: Arc::new(TransactionCoordinator::new(cluster.clone())),
            cluster,
            xid: xid(30),
            originator_leaves,
            entered: AtomicBool::new(false),
            nested: Mutex::new(None),
            log: Mutex::new(Vec::new()),
        }
    }

    fn request(&self) -> TransactionDecodeContext {
        request(self.xid.clone(), false, vec![TxWrite::put("k", "v").with_control(ControlByte::NOT_READ)])
    }

    fn calls(&self) -> Vec<&'static str> {
        self.log.lock().unwrap().clone()
    }
}

impl TransactionEngine for ReentrantEngine {
    fn begin(&self, _xid: &Xid) -> CacheResult<()> {
        self.log.lock().unwrap().push("begin");
        if !self.entered.swap(true, Ordering::SeqCst) {
            if self.originator_leaves {
                self.cluster.set_members(vec![NodeId::from("node-2")]);
            }
            let outcome = self
                .coordinator
                .prepare(CACHE, &CacheConfiguration::transactional(), self, &self.request())
                .unwrap();
            *self.nested.lock().unwrap() = Some(outcome);
        }
        Ok(())
    }

    fn read_for_update(&self, _xid: &Xid, _key: &[u8]) -> CacheResult<Option<CacheEntry>> {
        Ok(None)
    }

    fn write(&self, _xid: &Xid, _operation: TxOperation) -> CacheResult<()> {
        self.log.lock().unwrap().push("write");
        Ok(())
    }

    fn mark_rollback_only(&self, _xid: &Xid) -> CacheResult<()> {
        Ok(())
    }

    fn prepare(&self, _xid: &Xid) -> CacheResult<i32> {
        self.log.lock().unwrap().push("prepare");
        Ok(XA_OK)
    }

    fn commit(&self, _xid: &Xid, _one_phase: bool) -> CacheResult<()> {
        Ok(())
    }

    fn rollback(&self, _xid: &Xid) -> CacheResult<()> {
        self.log.lock().unwrap().push("rollback");
        Ok(())
    }
}

#[test]
fn test_concurrent_prepare_with_live_originator_is_not_executed() {
    let engine = ReentrantEngine::new(false);
    let outcome = engine
        .coordinator
        .prepare(CACHE, &CacheConfiguration::transactional(), &engine, &engine.request())
        .unwrap();

    assert_eq!(*engine.nested.lock().unwrap(), Some(PrepareOutcome::NotExecuted));
    assert_eq!(outcome, PrepareOutcome::Completed(XA_OK));
    assert_eq!(engine.calls(), vec!["begin", "write", "prepare"]);
    assert_eq!(engine.coordinator.table().state(CACHE, &engine.xid), Some(TxState::Prepared));
    assert_eq!(engine.coordinator.table().len(), 1);
}

#[test]
fn test_prepare_after_originator_left_rolls_back_stale_transaction() {
    let engine = ReentrantEngine::new(true);
    let outcome = engine
        .coordinator
        .prepare(CACHE, &CacheConfiguration::transactional(), &engine, &engine.request())
        .unwrap();

    // The second prepare rolled back the stale attempt and ran again
    assert_eq!(*engine.nested.lock().unwrap(), Some(PrepareOutcome::Completed(XA_OK)));
    assert_eq!(
        engine.calls(),
        vec!["begin", "rollback", "begin", "write", "prepare", "write", "prepare"]
    );
    assert_eq!(outcome, PrepareOutcome::Completed(XA_OK));
    assert_eq!(engine.coordinator.table().state(CACHE, &engine.xid), Some(TxState::Prepared));
    assert_eq!(engine.coordinator.table().len(), 1);
}
