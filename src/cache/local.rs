//! In-memory cache
//!
//! A single node cache behind the [`Cache`] and [`TransactionEngine`] traits.
//!
//! ## Concurrency Model
//! - **Data**: one `RwLock<HashMap>`; reads that touch access times take the write lock
//! - **Listeners**: notified after the data lock is released, so a listener may call back
//!   into the cache
//! - **Transactions**: pessimistic per-key write locks owned by an [`Xid`]; a non
//!   transactional write to a locked key fails with a lock timeout

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};

use crate::error::{CacheError, CacheResult};
use crate::protocol::constants::{XA_OK, XA_RDONLY};
use crate::topology::murmur3_32;
use crate::tx::Xid;

use super::{
    Cache, CacheConfiguration, CacheEntry, CacheEvent, CacheFlags, CacheListener, CacheStats, EventKind,
    ListenerStatus, Metadata, TransactionEngine, TxOperation, VersionedOutcome,
};

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

#[derive(Default)]
struct StatsCounters {
    stores: AtomicU64,
    retrievals: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    remove_hits: AtomicU64,
    remove_misses: AtomicU64,
}

#[derive(Default)]
struct LocalTransaction {
    writes: Vec<TxOperation>,
    locked: Vec<Vec<u8>>,
    rollback_only: bool,
    prepared: bool,
}

/// In-memory cache with versions, expiration, listeners and pessimistic transactions
pub struct LocalCache {
    name: String,
    config: CacheConfiguration,
    data: RwLock<HashMap<Vec<u8>, CacheEntry>>,
    next_version: AtomicU64,

    listeners: RwLock<Vec<(u64, Arc<dyn CacheListener>)>>,
    next_listener_id: AtomicU64,

    started: Instant,
    stats: StatsCounters,

    transactions: Mutex<HashMap<Xid, LocalTransaction>>,
    /// key → owning transaction
    locks: Mutex<HashMap<Vec<u8>, Xid>>,
}

impl LocalCache {
    pub fn new(name: impl Into<String>, config: CacheConfiguration) -> Self {
        Self {
            name: name.into(),
            config,
            data: RwLock::new(HashMap::new()),
            next_version: AtomicU64::new(1),
            listeners: RwLock::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
            started: Instant::now(),
            stats: StatsCounters::default(),
            transactions: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn next_version(&self) -> u64 {
        self.next_version.fetch_add(1, Ordering::Relaxed)
    }

    fn new_entry(&self, key: Vec<u8>, value: Vec<u8>, metadata: Metadata, created: Option<i64>) -> CacheEntry {
        let now = now_millis();
        CacheEntry {
            key,
            value,
            version: self.next_version(),
            created: created.unwrap_or(now),
            last_used: now,
            lifespan: metadata.lifespan,
            max_idle: metadata.max_idle,
        }
    }

    /// Fail when a transaction holds the write lock of `key`
    fn check_unlocked(&self, key: &[u8]) -> CacheResult<()> {
        match self.locks.lock().get(key) {
            Some(owner) => Err(CacheError::Timeout(format!(
                "unable to acquire lock on key held by {}",
                owner
            ))),
            None => Ok(()),
        }
    }

    /// Live entry for `key`, expiring it first when due
    fn live_entry(
        data: &mut HashMap<Vec<u8>, CacheEntry>,
        key: &[u8],
        now: i64,
        events: &mut Vec<CacheEvent>,
    ) -> Option<CacheEntry> {
        let expired = data.get(key).is_some_and(|e| e.is_expired(now));
        if expired {
            if let Some(entry) = data.remove(key) {
                events.push(CacheEvent {
                    kind: EventKind::Expired,
                    key: entry.key,
                    value: Some(entry.value),
                    old_value: None,
                    version: entry.version,
                    retried: false,
                });
            }
            return None;
        }
        data.get(key).cloned()
    }

    fn store(
        &self,
        data: &mut HashMap<Vec<u8>, CacheEntry>,
        key: Vec<u8>,
        value: Vec<u8>,
        metadata: Metadata,
        previous: Option<&CacheEntry>,
        events: &mut Vec<CacheEvent>,
    ) {
        let entry = self.new_entry(key.clone(), value, metadata, None);
        events.push(CacheEvent {
            kind: if previous.is_some() {
                EventKind::Modified
            } else {
                EventKind::Created
            },
            key: key.clone(),
            value: Some(entry.value.clone()),
            old_value: previous.map(|p| p.value.clone()),
            version: entry.version,
            retried: false,
        });
        self.stats.stores.fetch_add(1, Ordering::Relaxed);
        data.insert(key, entry);
    }

    fn delete(data: &mut HashMap<Vec<u8>, CacheEntry>, key: &[u8], events: &mut Vec<CacheEvent>) -> Option<CacheEntry> {
        let removed = data.remove(key)?;
        events.push(CacheEvent {
            kind: EventKind::Removed,
            key: removed.key.clone(),
            value: None,
            old_value: Some(removed.value.clone()),
            version: removed.version,
            retried: false,
        });
        Some(removed)
    }

    /// Run a mutation under the data lock, then notify listeners
    fn mutate<T>(
        &self,
        flags: CacheFlags,
        f: impl FnOnce(&mut HashMap<Vec<u8>, CacheEntry>, i64, &mut Vec<CacheEvent>) -> T,
    ) -> T {
        let mut events = Vec::new();
        let result = {
            let mut data = self.data.write();
            f(&mut data, now_millis(), &mut events)
        };
        let expirations_only = events.iter().all(|e| e.kind == EventKind::Expired);
        if !flags.contains(CacheFlags::SKIP_LISTENER_NOTIFICATION) || expirations_only {
            self.notify(&events);
        }
        result
    }

    fn notify(&self, events: &[CacheEvent]) {
        if events.is_empty() {
            return;
        }
        let listeners: Vec<(u64, Arc<dyn CacheListener>)> = self.listeners.read().clone();
        let mut dropped = Vec::new();
        for (id, listener) in &listeners {
            for event in events {
                if listener.on_event(event) == ListenerStatus::Remove {
                    dropped.push(*id);
                    break;
                }
            }
        }
        if !dropped.is_empty() {
            tracing::debug!("Cache '{}' dropping {} listeners", self.name, dropped.len());
            self.listeners.write().retain(|(id, _)| !dropped.contains(id));
        }
    }

    fn release_locks(&self, xid: &Xid, keys: &[Vec<u8>]) {
        let mut locks = self.locks.lock();
        for key in keys {
            if locks.get(key) == Some(xid) {
                locks.remove(key);
            }
        }
    }

    fn lock_for(&self, xid: &Xid, key: &[u8]) -> CacheResult<()> {
        let mut locks = self.locks.lock();
        match locks.get(key) {
            Some(owner) if owner == xid => Ok(()),
            Some(owner) => Err(CacheError::Timeout(format!(
                "unable to acquire lock for {}: held by {}",
                xid, owner
            ))),
            None => {
                locks.insert(key.to_vec(), xid.clone());
                let mut txs = self.transactions.lock();
                if let Some(tx) = txs.get_mut(xid) {
                    tx.locked.push(key.to_vec());
                }
                Ok(())
            }
        }
    }

    fn apply(&self, operation: TxOperation) {
        self.mutate(CacheFlags::none(), |data, now, events| {
            let previous = Self::live_entry(data, operation.key(), now, events);
            match operation {
                TxOperation::Put { key, value, metadata } => {
                    self.store(data, key, value, metadata, previous.as_ref(), events);
                }
                TxOperation::Remove { key } => {
                    Self::delete(data, &key, events);
                }
            }
        });
    }
}

impl Cache for LocalCache {
    fn name(&self) -> &str {
        &self.name
    }

    fn configuration(&self) -> &CacheConfiguration {
        &self.config
    }

    fn get(&self, key: &[u8], flags: CacheFlags) -> CacheResult<Option<CacheEntry>> {
        self.stats.retrievals.fetch_add(1, Ordering::Relaxed);
        let found = self.mutate(flags, |data, now, events| {
            let live = Self::live_entry(data, key, now, events);
            if live.is_some() {
                if let Some(entry) = data.get_mut(key) {
                    entry.last_used = now;
                }
            }
            live
        });
        let counter = if found.is_some() { &self.stats.hits } else { &self.stats.misses };
        counter.fetch_add(1, Ordering::Relaxed);
        Ok(found)
    }

    fn put(&self, key: Vec<u8>, value: Vec<u8>, metadata: Metadata, flags: CacheFlags) -> CacheResult<Option<CacheEntry>> {
        self.check_unlocked(&key)?;
        Ok(self.mutate(flags, |data, now, events| {
            let previous = Self::live_entry(data, &key, now, events);
            self.store(data, key, value, metadata, previous.as_ref(), events);
            previous
        }))
    }

    fn put_if_absent(
        &self,
        key: Vec<u8>,
        value: Vec<u8>,
        metadata: Metadata,
        flags: CacheFlags,
    ) -> CacheResult<Option<CacheEntry>> {
        self.check_unlocked(&key)?;
        Ok(self.mutate(flags, |data, now, events| {
            match Self::live_entry(data, &key, now, events) {
                Some(existing) => Some(existing),
                None => {
                    self.store(data, key, value, metadata, None, events);
                    None
                }
            }
        }))
    }

    fn replace(&self, key: Vec<u8>, value: Vec<u8>, metadata: Metadata, flags: CacheFlags) -> CacheResult<Option<CacheEntry>> {
        self.check_unlocked(&key)?;
        Ok(self.mutate(flags, |data, now, events| {
            let previous = Self::live_entry(data, &key, now, events)?;
            self.store(data, key, value, metadata, Some(&previous), events);
            Some(previous)
        }))
    }

    fn replace_if_version(
        &self,
        key: Vec<u8>,
        expected_version: u64,
        value: Vec<u8>,
        metadata: Metadata,
        flags: CacheFlags,
    ) -> CacheResult<VersionedOutcome> {
        self.check_unlocked(&key)?;
        Ok(self.mutate(flags, |data, now, events| {
            match Self::live_entry(data, &key, now, events) {
                None => VersionedOutcome::Missing,
                Some(current) if current.version != expected_version => VersionedOutcome::Mismatch(current),
                Some(current) => {
                    self.store(data, key, value, metadata, Some(&current), events);
                    VersionedOutcome::Applied(current)
                }
            }
        }))
    }

    fn remove(&self, key: &[u8], flags: CacheFlags) -> CacheResult<Option<CacheEntry>> {
        self.check_unlocked(key)?;
        let removed = self.mutate(flags, |data, now, events| {
            Self::live_entry(data, key, now, events)?;
            Self::delete(data, key, events)
        });
        let counter = if removed.is_some() {
            &self.stats.remove_hits
        } else {
            &self.stats.remove_misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        Ok(removed)
    }

    fn remove_if_version(&self, key: &[u8], expected_version: u64, flags: CacheFlags) -> CacheResult<VersionedOutcome> {
        self.check_unlocked(key)?;
        Ok(self.mutate(flags, |data, now, events| {
            match Self::live_entry(data, key, now, events) {
                None => VersionedOutcome::Missing,
                Some(current) if current.version != expected_version => VersionedOutcome::Mismatch(current),
                Some(current) => {
                    Self::delete(data, key, events);
                    VersionedOutcome::Applied(current)
                }
            }
        }))
    }

    fn clear(&self) -> CacheResult<()> {
        self.mutate(CacheFlags::none(), |data, _, events| {
            let keys: Vec<Vec<u8>> = data.keys().cloned().collect();
            for key in keys {
                Self::delete(data, &key, events);
            }
        });
        Ok(())
    }

    fn size(&self) -> CacheResult<u64> {
        let now = now_millis();
        Ok(self.data.read().values().filter(|e| !e.is_expired(now)).count() as u64)
    }

    fn entries(&self) -> CacheResult<Vec<CacheEntry>> {
        let now = now_millis();
        Ok(self
            .data
            .read()
            .values()
            .filter(|e| !e.is_expired(now))
            .cloned()
            .collect())
    }

    fn stats(&self) -> CacheStats {
        let current = self.size().unwrap_or_default();
        let stores = self.stats.stores.load(Ordering::Relaxed);
        CacheStats {
            time_since_start_secs: self.started.elapsed().as_secs(),
            current_entries: current,
            total_entries: stores,
            stores,
            retrievals: self.stats.retrievals.load(Ordering::Relaxed),
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            remove_hits: self.stats.remove_hits.load(Ordering::Relaxed),
            remove_misses: self.stats.remove_misses.load(Ordering::Relaxed),
        }
    }

    fn segment_of(&self, key: &[u8]) -> usize {
        let segments = self.config.num_segments.max(1);
        (murmur3_32(key, 0) as usize) % segments
    }

    fn add_listener(&self, listener: Arc<dyn CacheListener>) -> u64 {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.write().push((id, listener));
        id
    }

    fn remove_listener(&self, id: u64) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    fn transaction_engine(&self) -> Option<&dyn TransactionEngine> {
        if self.config.is_transactional() {
            Some(self)
        } else {
            None
        }
    }
}

impl TransactionEngine for LocalCache {
    fn begin(&self, xid: &Xid) -> CacheResult<()> {
        self.transactions.lock().entry(xid.clone()).or_default();
        Ok(())
    }

    fn read_for_update(&self, xid: &Xid, key: &[u8]) -> CacheResult<Option<CacheEntry>> {
        self.lock_for(xid, key)?;
        let now = now_millis();
        let entry = self.data.read().get(key).filter(|e| !e.is_expired(now)).cloned();
        Ok(entry)
    }

    fn write(&self, xid: &Xid, operation: TxOperation) -> CacheResult<()> {
        self.lock_for(xid, operation.key())?;
        let mut txs = self.transactions.lock();
        let tx = txs
            .get_mut(xid)
            .ok_or_else(|| CacheError::UnknownTransaction(xid.to_string()))?;
        tx.writes.push(operation);
        Ok(())
    }

    fn mark_rollback_only(&self, xid: &Xid) -> CacheResult<()> {
        let mut txs = self.transactions.lock();
        let tx = txs
            .get_mut(xid)
            .ok_or_else(|| CacheError::UnknownTransaction(xid.to_string()))?;
        tx.rollback_only = true;
        Ok(())
    }

    fn prepare(&self, xid: &Xid) -> CacheResult<i32> {
        let mut txs = self.transactions.lock();
        let tx = txs
            .get_mut(xid)
            .ok_or_else(|| CacheError::UnknownTransaction(xid.to_string()))?;
        if tx.rollback_only {
            let locked = std::mem::take(&mut tx.locked);
            txs.remove(xid);
            drop(txs);
            self.release_locks(xid, &locked);
            return Err(CacheError::RolledBack(format!("{} is marked rollback-only", xid)));
        }
        if tx.writes.is_empty() {
            let locked = std::mem::take(&mut tx.locked);
            txs.remove(xid);
            drop(txs);
            self.release_locks(xid, &locked);
            return Ok(XA_RDONLY);
        }
        tx.prepared = true;
        Ok(XA_OK)
    }

    fn commit(&self, xid: &Xid, one_phase: bool) -> CacheResult<()> {
        let tx = self
            .transactions
            .lock()
            .remove(xid)
            .ok_or_else(|| CacheError::UnknownTransaction(xid.to_string()))?;
        if tx.rollback_only {
            self.release_locks(xid, &tx.locked);
            return Err(CacheError::RolledBack(format!("{} is marked rollback-only", xid)));
        }
        if !one_phase && !tx.prepared {
            tracing::debug!("Committing {} without a prepare phase", xid);
        }
        // Locks stay held while applying; `apply` bypasses the lock check
        let count = tx.writes.len();
        for operation in tx.writes {
            self.apply(operation);
        }
        self.release_locks(xid, &tx.locked);
        tracing::debug!("Committed {} ({} writes) on '{}'", xid, count, self.name);
        Ok(())
    }

    fn rollback(&self, xid: &Xid) -> CacheResult<()> {
        let tx = self
            .transactions
            .lock()
            .remove(xid)
            .ok_or_else(|| CacheError::UnknownTransaction(xid.to_string()))?;
        self.release_locks(xid, &tx.locked);
        tracing::debug!("Rolled back {} on '{}'", xid, self.name);
        Ok(())
    }
}
