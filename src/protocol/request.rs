//! Decoded requests
//!
//! A [`RequestContext`] is what the frame decoder hands to the request processor: the
//! header plus an operation-specific [`RequestBody`].

use std::time::Duration;

use crate::error::{DecodeError, DecodeResult};
use crate::tx::{TransactionDecodeContext, Xid};

use super::constants::*;
use super::header::RequestHeader;

// =============================================================================
// Expiration
// =============================================================================

/// Lifespan or max-idle requested by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiration {
    /// Use the cache's configured default
    Default,
    /// Never expire
    Infinite,
    After(Duration),
}

impl Expiration {
    /// Pre-2.2 encoding: a number of seconds where `<= 0` falls back to the flag
    pub fn from_seconds(seconds: i32, use_default: bool) -> Self {
        if seconds <= 0 {
            if use_default {
                Expiration::Default
            } else {
                Expiration::Infinite
            }
        } else {
            Expiration::After(Duration::from_secs(seconds as u64))
        }
    }

    /// Whole seconds for the pre-2.2 encoding; default and infinite are both `0`
    pub fn as_seconds(&self) -> i32 {
        match self {
            Expiration::After(d) => d.as_secs().min(i32::MAX as u64) as i32,
            _ => 0,
        }
    }

    /// Sentinel-aware duration: `EXPIRATION_DEFAULT`, `EXPIRATION_NONE` or milliseconds
    pub fn as_millis_or_sentinel(&self) -> i64 {
        match self {
            Expiration::Default => EXPIRATION_DEFAULT,
            Expiration::Infinite => EXPIRATION_NONE,
            Expiration::After(d) => d.as_millis().min(i64::MAX as u128) as i64,
        }
    }
}

/// Time unit nibble used from 2.2 on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeUnitCode {
    Seconds,
    Milliseconds,
    Nanoseconds,
    Microseconds,
    Minutes,
    Hours,
    Days,
    Default,
    Infinite,
}

impl TimeUnitCode {
    pub fn from_code(code: u8) -> DecodeResult<Self> {
        let unit = match code {
            0 => TimeUnitCode::Seconds,
            1 => TimeUnitCode::Milliseconds,
            2 => TimeUnitCode::Nanoseconds,
            3 => TimeUnitCode::Microseconds,
            4 => TimeUnitCode::Minutes,
            5 => TimeUnitCode::Hours,
            6 => TimeUnitCode::Days,
            7 => TimeUnitCode::Default,
            8 => TimeUnitCode::Infinite,
            other => {
                return Err(DecodeError::Malformed(format!("unknown time unit {}", other)));
            }
        };
        Ok(unit)
    }

    pub fn code(&self) -> u8 {
        match self {
            TimeUnitCode::Seconds => 0,
            TimeUnitCode::Milliseconds => 1,
            TimeUnitCode::Nanoseconds => 2,
            TimeUnitCode::Microseconds => 3,
            TimeUnitCode::Minutes => 4,
            TimeUnitCode::Hours => 5,
            TimeUnitCode::Days => 6,
            TimeUnitCode::Default => 7,
            TimeUnitCode::Infinite => 8,
        }
    }

    /// Whether a duration follows on the wire
    pub fn carries_duration(&self) -> bool {
        !matches!(self, TimeUnitCode::Default | TimeUnitCode::Infinite)
    }

    /// Combine the unit with the duration read from the wire
    pub fn to_expiration(&self, amount: i64) -> Expiration {
        if amount < 0 {
            return Expiration::Infinite;
        }
        let amount = amount as u64;
        match self {
            TimeUnitCode::Default => Expiration::Default,
            TimeUnitCode::Infinite => Expiration::Infinite,
            TimeUnitCode::Seconds => Expiration::After(Duration::from_secs(amount)),
            TimeUnitCode::Milliseconds => Expiration::After(Duration::from_millis(amount)),
            TimeUnitCode::Nanoseconds => Expiration::After(Duration::from_nanos(amount)),
            TimeUnitCode::Microseconds => Expiration::After(Duration::from_micros(amount)),
            TimeUnitCode::Minutes => Expiration::After(Duration::from_secs(amount.saturating_mul(60))),
            TimeUnitCode::Hours => Expiration::After(Duration::from_secs(amount.saturating_mul(3600))),
            TimeUnitCode::Days => Expiration::After(Duration::from_secs(amount.saturating_mul(86_400))),
        }
    }

    /// Unit used when writing an expiration; durations go out in milliseconds
    pub fn for_expiration(expiration: &Expiration) -> Self {
        match expiration {
            Expiration::Default => TimeUnitCode::Default,
            Expiration::Infinite => TimeUnitCode::Infinite,
            Expiration::After(_) => TimeUnitCode::Milliseconds,
        }
    }
}

// =============================================================================
// Operation Parameters
// =============================================================================

/// Fields read in the `Parameters` decode state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestParameters {
    pub lifespan: Expiration,
    pub max_idle: Expiration,
    /// Version for the *IfUnmodified operations
    pub stream_version: u64,
    /// Value length, or entry count for PutAll / GetAll
    pub value_length: usize,
}

impl Default for RequestParameters {
    fn default() -> Self {
        Self {
            lifespan: Expiration::Default,
            max_idle: Expiration::Default,
            stream_version: 0,
            value_length: 0,
        }
    }
}

/// A factory name and its marshalled parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedFactory {
    pub name: String,
    pub params: Vec<Vec<u8>>,
}

/// AddClientListener request fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerRequest {
    pub listener_id: Vec<u8>,
    pub include_current_state: bool,
    pub filter: Option<NamedFactory>,
    pub converter: Option<NamedFactory>,
    pub use_raw_data: bool,
    /// Interest bitmask; `0` means every event type
    pub interests: u32,
}

/// IterationStart request fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IterationRequest {
    /// Bitset of requested segments, `None` for all
    pub segments: Option<Vec<u8>>,
    pub filter: Option<NamedFactory>,
    pub batch_size: u32,
    pub metadata: bool,
}

// =============================================================================
// Request Body
// =============================================================================

/// Operation-specific request fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestBody {
    /// Ping, Stats, Clear, Size
    Empty,

    /// Get, ContainsKey, GetWithVersion, GetWithMetadata, Remove
    Key { key: Vec<u8> },

    /// RemoveIfUnmodified
    KeyVersion { key: Vec<u8>, version: u64 },

    /// Put, PutIfAbsent, Replace, ReplaceIfUnmodified
    KeyValue {
        key: Vec<u8>,
        value: Vec<u8>,
        params: RequestParameters,
    },

    /// BulkGet (count) and BulkGetKeys (scope)
    Bulk { count: u32 },

    AddListener(ListenerRequest),

    RemoveListener { listener_id: Vec<u8> },

    PutAll {
        entries: Vec<(Vec<u8>, Vec<u8>)>,
        params: RequestParameters,
    },

    GetAll { keys: Vec<Vec<u8>> },

    IterationStart(IterationRequest),

    /// IterationNext, IterationEnd
    Iteration { iteration_id: String },

    Prepare(TransactionDecodeContext),

    /// CommitTx, RollbackTx
    TxBoundary { xid: Xid },
}

/// A fully decoded request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub header: RequestHeader,
    pub body: RequestBody,
}

impl RequestContext {
    pub fn key(&self) -> Option<&[u8]> {
        match &self.body {
            RequestBody::Key { key } | RequestBody::KeyVersion { key, .. } | RequestBody::KeyValue { key, .. } => {
                Some(key)
            }
            _ => None,
        }
    }
}
