//! Client-driven transactions
//!
//! A remote client runs a transaction locally and ships its writes at prepare time. The
//! [`TransactionCoordinator`] validates those writes against the cache and drives the
//! cache's transaction engine through prepare, commit and rollback.
//!
//! ## Prepare Wire Format (2.7+)
//! ```text
//! ┌─────┬───────────┬─────────────┬──────────────────────────────────┐
//! │ Xid │ OnePhase  │ WriteCount  │ Write * WriteCount               │
//! │     │ (1 byte)  │ (vint)      │                                  │
//! └─────┴───────────┴─────────────┴──────────────────────────────────┘
//!
//! Xid   = format id (signed vint) + global id (ranged) + branch qualifier (ranged)
//! Write = key (ranged) + control (1 byte)
//!         + version (i64)             unless NOT_READ or NON_EXISTING
//!         + expiration + value        unless REMOVE
//! ```

mod coordinator;

use std::fmt;

use crate::protocol::Expiration;

pub use coordinator::{PrepareOutcome, TransactionCoordinator, TxTable};

/// Global transaction identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Xid {
    pub format_id: i32,
    pub global_id: Vec<u8>,
    pub branch_qualifier: Vec<u8>,
}

impl Xid {
    pub fn new(format_id: i32, global_id: impl Into<Vec<u8>>, branch_qualifier: impl Into<Vec<u8>>) -> Self {
        Self {
            format_id,
            global_id: global_id.into(),
            branch_qualifier: branch_qualifier.into(),
        }
    }
}

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Xid{{format={}, gtrid=", self.format_id)?;
        for b in &self.global_id {
            write!(f, "{:02x}", b)?;
        }
        write!(f, ", bqual=")?;
        for b in &self.branch_qualifier {
            write!(f, "{:02x}", b)?;
        }
        write!(f, "}}")
    }
}

/// Control bits of a transactional write
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControlByte(pub u8);

impl ControlByte {
    pub const NOT_READ: u8 = 0x01;
    pub const NON_EXISTING: u8 = 0x02;
    pub const REMOVE: u8 = 0x04;

    /// The client never read the key, so there is nothing to validate
    pub fn not_read(&self) -> bool {
        self.0 & Self::NOT_READ != 0
    }

    /// The client saw the key as absent
    pub fn non_existing(&self) -> bool {
        self.0 & Self::NON_EXISTING != 0
    }

    pub fn remove(&self) -> bool {
        self.0 & Self::REMOVE != 0
    }

    /// Whether a version follows the control byte on the wire
    pub fn has_version(&self) -> bool {
        !self.not_read() && !self.non_existing()
    }
}

/// One write shipped by the client at prepare time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxWrite {
    pub key: Vec<u8>,
    pub control: ControlByte,
    /// Version the client read; meaningful only when `control.has_version()`
    pub version_read: u64,
    pub lifespan: Expiration,
    pub max_idle: Expiration,
    /// `None` for removals
    pub value: Option<Vec<u8>>,
}

impl TxWrite {
    pub fn put(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            control: ControlByte::default(),
            version_read: 0,
            lifespan: Expiration::Default,
            max_idle: Expiration::Default,
            value: Some(value.into()),
        }
    }

    pub fn remove(key: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            control: ControlByte(ControlByte::REMOVE),
            version_read: 0,
            lifespan: Expiration::Default,
            max_idle: Expiration::Default,
            value: None,
        }
    }

    pub fn with_control(mut self, bits: u8) -> Self {
        self.control = ControlByte(self.control.0 | bits);
        self
    }

    pub fn with_version(mut self, version: u64) -> Self {
        self.version_read = version;
        self
    }

    pub fn is_remove(&self) -> bool {
        self.control.remove()
    }
}

/// Prepare request, filled write by write while decoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionDecodeContext {
    pub xid: Xid,
    pub one_phase: bool,
    pub expected_writes: usize,
    pub writes: Vec<TxWrite>,
}

impl TransactionDecodeContext {
    pub fn new(xid: Xid, one_phase: bool, expected_writes: usize) -> Self {
        Self {
            xid,
            one_phase,
            expected_writes,
            writes: Vec::with_capacity(expected_writes.min(1024)),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.writes.len() >= self.expected_writes
    }
}

/// Lifecycle of a client transaction on this server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Active,
    Prepared,
    Committed,
    RolledBack,
}
