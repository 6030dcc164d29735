//! Error types for hotrodkv
//!
//! Three layers of errors:
//! - [`DecodeError`]: framing and field parsing inside the protocol decoder
//! - [`CacheError`]: failures reported by the cache / transaction engine
//! - [`HotRodError`]: the unified error for everything else (I/O, network, configuration)

use thiserror::Error;

/// Result type alias using HotRodError
pub type Result<T> = std::result::Result<T, HotRodError>;

/// Result type alias for decoder primitives
pub type DecodeResult<T> = std::result::Result<T, DecodeError>;

/// Result type alias for cache collaborators
pub type CacheResult<T> = std::result::Result<T, CacheError>;

/// Unified error type for hotrodkv operations
#[derive(Debug, Error)]
pub enum HotRodError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Protocol Errors
    // -------------------------------------------------------------------------
    #[error("Invalid magic byte: expected {expected:#04x}, found {found:#04x}")]
    InvalidMagic { expected: u8, found: u8 },

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Protocol error: {0}")]
    Protocol(String),

    // -------------------------------------------------------------------------
    // Cache Errors
    // -------------------------------------------------------------------------
    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("Listener error: {0}")]
    Listener(String),

    #[error("Iteration error: {0}")]
    Iteration(String),

    // -------------------------------------------------------------------------
    // Transaction Errors
    // -------------------------------------------------------------------------
    #[error("Cache '{cache}' cannot run client transactions: {reason}")]
    IllegalTransactionConfiguration { cache: String, reason: String },

    // -------------------------------------------------------------------------
    // Network Errors
    // -------------------------------------------------------------------------
    #[error("Network error: {0}")]
    Network(String),

    #[error("Channel closed")]
    ChannelClosed,

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Errors raised while decoding a request frame
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Not enough bytes buffered yet; nothing was consumed
    #[error("insufficient data")]
    Incomplete,

    #[error("unknown operation code {0:#04x}")]
    UnknownOperation(u8),

    #[error("{what} length {len} exceeds limit {max}")]
    LimitExceeded {
        what: &'static str,
        len: usize,
        max: usize,
    },

    #[error("malformed request: {0}")]
    Malformed(String),
}

impl DecodeError {
    pub fn is_incomplete(&self) -> bool {
        matches!(self, DecodeError::Incomplete)
    }
}

/// Errors reported by the cache engine and its transaction engine
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("node suspected: {0}")]
    NodeSuspected(String),

    #[error("illegal lifecycle state: {0}")]
    IllegalLifecycleState(String),

    #[error("operation interrupted")]
    Interrupted,

    #[error("cache '{0}' not found")]
    CacheNotFound(String),

    #[error("transaction rolled back: {0}")]
    RolledBack(String),

    #[error("heuristic mixed outcome: {0}")]
    HeuristicMixed(String),

    #[error("heuristic rollback outcome: {0}")]
    HeuristicRollback(String),

    #[error("unknown transaction: {0}")]
    UnknownTransaction(String),

    /// A cache error carrying another cache error as its cause
    #[error("{message}")]
    Wrapped {
        message: String,
        #[source]
        cause: Box<CacheError>,
    },

    #[error("{0}")]
    Other(String),
}

impl CacheError {
    pub fn wrap(message: impl Into<String>, cause: CacheError) -> Self {
        CacheError::Wrapped {
            message: message.into(),
            cause: Box::new(cause),
        }
    }
}
