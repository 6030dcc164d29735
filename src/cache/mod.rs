//! Cache Module
//!
//! The seam between the protocol engine and the cache engine behind it.
//!
//! ## Responsibilities
//! - [`Cache`]: key/value operations, listeners, statistics
//! - [`TransactionEngine`]: the cache's own transactions, driven by client prepare/commit
//! - [`CacheManager`]: name → cache registry injected into the request processor
//! - [`LocalCache`]: an in-memory single node implementation of both traits

mod local;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use crate::error::{CacheError, CacheResult};
use crate::protocol::Expiration;
use crate::topology::CacheMode;
use crate::tx::Xid;

pub use local::LocalCache;

// =============================================================================
// Entries
// =============================================================================

/// A stored entry with its metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub version: u64,
    /// Creation time, epoch milliseconds
    pub created: i64,
    /// Last access time, epoch milliseconds
    pub last_used: i64,
    /// `None` = never expires
    pub lifespan: Option<Duration>,
    /// `None` = never expires from idleness
    pub max_idle: Option<Duration>,
}

impl CacheEntry {
    pub fn is_expired(&self, now_millis: i64) -> bool {
        let lifespan_over = self
            .lifespan
            .is_some_and(|l| now_millis >= self.created.saturating_add(l.as_millis() as i64));
        let idle_over = self
            .max_idle
            .is_some_and(|m| now_millis >= self.last_used.saturating_add(m.as_millis() as i64));
        lifespan_over || idle_over
    }
}

/// Expiration settings of a write
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Metadata {
    pub lifespan: Option<Duration>,
    pub max_idle: Option<Duration>,
}

impl Metadata {
    pub fn immortal() -> Self {
        Self::default()
    }

    /// Resolve client expirations against the cache defaults
    pub fn resolve(lifespan: Expiration, max_idle: Expiration, config: &CacheConfiguration) -> Self {
        let pick = |exp: Expiration, default: Option<Duration>| match exp {
            Expiration::Default => default,
            Expiration::Infinite => None,
            Expiration::After(d) => Some(d),
        };
        Self {
            lifespan: pick(lifespan, config.default_lifespan),
            max_idle: pick(max_idle, config.default_max_idle),
        }
    }
}

/// Per-invocation cache flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheFlags(pub u32);

impl CacheFlags {
    pub const SKIP_CACHE_LOAD: u32 = 0x01;
    pub const SKIP_INDEXING: u32 = 0x02;
    pub const IGNORE_RETURN_VALUES: u32 = 0x04;
    pub const SKIP_LISTENER_NOTIFICATION: u32 = 0x08;

    pub fn none() -> Self {
        Self(0)
    }

    pub fn with(self, flag: u32) -> Self {
        Self(self.0 | flag)
    }

    pub fn contains(&self, flag: u32) -> bool {
        self.0 & flag == flag
    }
}

/// Result of a versioned conditional write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionedOutcome {
    /// No entry for the key
    Missing,
    /// The stored version differs; carries the current entry
    Mismatch(CacheEntry),
    /// Applied; carries the replaced or removed entry
    Applied(CacheEntry),
}

// =============================================================================
// Events
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Created,
    Modified,
    Removed,
    Expired,
}

/// Notification delivered to cache listeners after a change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEvent {
    pub kind: EventKind,
    pub key: Vec<u8>,
    /// New value for created/modified events
    pub value: Option<Vec<u8>>,
    pub old_value: Option<Vec<u8>>,
    pub version: u64,
    pub retried: bool,
}

/// What a listener wants after handling an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerStatus {
    Keep,
    /// Unregister this listener
    Remove,
}

pub trait CacheListener: Send + Sync {
    fn on_event(&self, event: &CacheEvent) -> ListenerStatus;
}

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionMode {
    NonTransactional,
    Transactional,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadCommitted,
    RepeatableRead,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockingMode {
    Optimistic,
    Pessimistic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionConfiguration {
    pub mode: TransactionMode,
    pub isolation: IsolationLevel,
    pub locking: LockingMode,
    pub total_order: bool,
}

impl Default for TransactionConfiguration {
    fn default() -> Self {
        Self {
            mode: TransactionMode::NonTransactional,
            isolation: IsolationLevel::RepeatableRead,
            locking: LockingMode::Optimistic,
            total_order: false,
        }
    }
}

impl TransactionConfiguration {
    /// The only shape client transactions run on
    pub fn pessimistic_repeatable_read() -> Self {
        Self {
            mode: TransactionMode::Transactional,
            isolation: IsolationLevel::RepeatableRead,
            locking: LockingMode::Pessimistic,
            total_order: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfiguration {
    pub mode: CacheMode,
    pub transaction: TransactionConfiguration,
    /// Values are stored as objects rather than bytes
    pub object_storage: bool,
    pub default_lifespan: Option<Duration>,
    pub default_max_idle: Option<Duration>,
    pub num_segments: usize,
}

impl Default for CacheConfiguration {
    fn default() -> Self {
        Self {
            mode: CacheMode::Local,
            transaction: TransactionConfiguration::default(),
            object_storage: false,
            default_lifespan: None,
            default_max_idle: None,
            num_segments: 256,
        }
    }
}

impl CacheConfiguration {
    pub fn transactional() -> Self {
        Self {
            transaction: TransactionConfiguration::pessimistic_repeatable_read(),
            ..Self::default()
        }
    }

    pub fn is_transactional(&self) -> bool {
        self.transaction.mode == TransactionMode::Transactional
    }

    pub fn is_clustered(&self) -> bool {
        self.mode.is_clustered()
    }
}

/// Counters reported by the Stats operation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub time_since_start_secs: u64,
    pub current_entries: u64,
    pub total_entries: u64,
    pub stores: u64,
    pub retrievals: u64,
    pub hits: u64,
    pub misses: u64,
    pub remove_hits: u64,
    pub remove_misses: u64,
}

// =============================================================================
// Cache
// =============================================================================

/// Key/value operations of the cache engine
pub trait Cache: Send + Sync {
    fn name(&self) -> &str;

    fn configuration(&self) -> &CacheConfiguration;

    fn get(&self, key: &[u8], flags: CacheFlags) -> CacheResult<Option<CacheEntry>>;

    fn contains_key(&self, key: &[u8], flags: CacheFlags) -> CacheResult<bool> {
        Ok(self.get(key, flags)?.is_some())
    }

    /// Store unconditionally; returns the previous entry
    fn put(&self, key: Vec<u8>, value: Vec<u8>, metadata: Metadata, flags: CacheFlags) -> CacheResult<Option<CacheEntry>>;

    /// Store only when absent; returns the existing entry when not stored
    fn put_if_absent(
        &self,
        key: Vec<u8>,
        value: Vec<u8>,
        metadata: Metadata,
        flags: CacheFlags,
    ) -> CacheResult<Option<CacheEntry>>;

    /// Store only when present; returns the replaced entry, `None` when absent
    fn replace(&self, key: Vec<u8>, value: Vec<u8>, metadata: Metadata, flags: CacheFlags) -> CacheResult<Option<CacheEntry>>;

    fn replace_if_version(
        &self,
        key: Vec<u8>,
        expected_version: u64,
        value: Vec<u8>,
        metadata: Metadata,
        flags: CacheFlags,
    ) -> CacheResult<VersionedOutcome>;

    fn remove(&self, key: &[u8], flags: CacheFlags) -> CacheResult<Option<CacheEntry>>;

    fn remove_if_version(&self, key: &[u8], expected_version: u64, flags: CacheFlags) -> CacheResult<VersionedOutcome>;

    fn put_all(&self, entries: Vec<(Vec<u8>, Vec<u8>)>, metadata: Metadata, flags: CacheFlags) -> CacheResult<()> {
        for (key, value) in entries {
            self.put(key, value, metadata, flags.with(CacheFlags::IGNORE_RETURN_VALUES))?;
        }
        Ok(())
    }

    /// Entries found for `keys`; missing keys are left out
    fn get_all(&self, keys: &[Vec<u8>], flags: CacheFlags) -> CacheResult<Vec<CacheEntry>> {
        let mut found = Vec::new();
        for key in keys {
            if let Some(entry) = self.get(key, flags)? {
                found.push(entry);
            }
        }
        Ok(found)
    }

    fn clear(&self) -> CacheResult<()>;

    fn size(&self) -> CacheResult<u64>;

    /// Snapshot of every live entry
    fn entries(&self) -> CacheResult<Vec<CacheEntry>>;

    fn stats(&self) -> CacheStats;

    /// Segment a key belongs to
    fn segment_of(&self, key: &[u8]) -> usize;

    /// Register a listener; the returned id unregisters it
    fn add_listener(&self, listener: Arc<dyn CacheListener>) -> u64;

    fn remove_listener(&self, id: u64) -> bool;

    /// The transaction engine, when the cache is transactional
    fn transaction_engine(&self) -> Option<&dyn TransactionEngine>;
}

// =============================================================================
// Transaction Engine
// =============================================================================

/// A write applied inside a transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxOperation {
    Put {
        key: Vec<u8>,
        value: Vec<u8>,
        metadata: Metadata,
    },
    Remove {
        key: Vec<u8>,
    },
}

impl TxOperation {
    pub fn key(&self) -> &[u8] {
        match self {
            TxOperation::Put { key, .. } | TxOperation::Remove { key } => key,
        }
    }
}

/// The cache's own transaction machinery
pub trait TransactionEngine: Send + Sync {
    fn begin(&self, xid: &Xid) -> CacheResult<()>;

    /// Read `key` under a write lock held by `xid`
    fn read_for_update(&self, xid: &Xid, key: &[u8]) -> CacheResult<Option<CacheEntry>>;

    fn write(&self, xid: &Xid, operation: TxOperation) -> CacheResult<()>;

    fn mark_rollback_only(&self, xid: &Xid) -> CacheResult<()>;

    /// First phase; returns an XA code (`XA_OK` or `XA_RDONLY`)
    fn prepare(&self, xid: &Xid) -> CacheResult<i32>;

    fn commit(&self, xid: &Xid, one_phase: bool) -> CacheResult<()>;

    fn rollback(&self, xid: &Xid) -> CacheResult<()>;
}

// =============================================================================
// Cache Manager
// =============================================================================

/// Registry of the caches served by this node
pub struct CacheManager {
    default_cache_name: String,
    caches: RwLock<HashMap<String, Arc<dyn Cache>>>,
}

impl CacheManager {
    pub fn new(default_cache_name: impl Into<String>) -> Self {
        Self {
            default_cache_name: default_cache_name.into(),
            caches: RwLock::new(HashMap::new()),
        }
    }

    pub fn default_cache_name(&self) -> &str {
        &self.default_cache_name
    }

    pub fn register(&self, cache: Arc<dyn Cache>) {
        let name = cache.name().to_string();
        tracing::info!("Registered cache '{}' ({:?})", name, cache.configuration().mode);
        self.caches.write().insert(name, cache);
    }

    /// Name a request refers to; the empty name means the default cache
    pub fn resolve_name<'a>(&'a self, name: &'a str) -> &'a str {
        if name.is_empty() {
            &self.default_cache_name
        } else {
            name
        }
    }

    pub fn get(&self, name: &str) -> CacheResult<Arc<dyn Cache>> {
        let name = self.resolve_name(name);
        self.caches
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| CacheError::CacheNotFound(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.caches.read().keys().cloned().collect();
        names.sort();
        names
    }
}
