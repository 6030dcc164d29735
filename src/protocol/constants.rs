//! Wire constants shared by every protocol version

/// First byte of every request frame
pub const MAGIC_REQ: u8 = 0xA0;

/// First byte of every response and event frame
pub const MAGIC_RES: u8 = 0xA1;

// =============================================================================
// Protocol Versions
// =============================================================================

pub const VERSION_10: u8 = 10;
pub const VERSION_11: u8 = 11;
pub const VERSION_12: u8 = 12;
pub const VERSION_13: u8 = 13;
pub const VERSION_20: u8 = 20;
pub const VERSION_21: u8 = 21;
pub const VERSION_22: u8 = 22;
pub const VERSION_23: u8 = 23;
pub const VERSION_24: u8 = 24;
pub const VERSION_25: u8 = 25;
pub const VERSION_26: u8 = 26;
pub const VERSION_27: u8 = 27;
pub const VERSION_28: u8 = 28;

/// Versions handled by the 1.x codec
pub const VERSIONS_1X: std::ops::RangeInclusive<u8> = VERSION_10..=VERSION_13;

/// Versions handled by the 2.x codec
pub const VERSIONS_2X: std::ops::RangeInclusive<u8> = VERSION_20..=VERSION_28;

pub fn is_version_1x(version: u8) -> bool {
    VERSIONS_1X.contains(&version)
}

// =============================================================================
// Client Intelligence
// =============================================================================

pub const INTELLIGENCE_BASIC: u8 = 0x01;
pub const INTELLIGENCE_TOPOLOGY_AWARE: u8 = 0x02;
pub const INTELLIGENCE_HASH_DISTRIBUTION_AWARE: u8 = 0x03;

// =============================================================================
// Expiration
// =============================================================================

/// Sentinel duration meaning "never expires"
pub const EXPIRATION_NONE: i64 = -1;

/// Sentinel duration meaning "use the cache's configured default"
pub const EXPIRATION_DEFAULT: i64 = -2;

// =============================================================================
// Hashing
// =============================================================================

/// Hash function id advertised to 1.x clients (MurmurHash3 over a 31-bit space)
pub const HASH_FUNCTION_V1: u8 = 2;

/// Hash function id advertised to 2.x clients (segment based MurmurHash3)
pub const HASH_FUNCTION_V2: u8 = 3;

/// Hash space advertised to 1.x clients
pub const LEGACY_HASH_SPACE: i32 = i32::MAX;

// =============================================================================
// Response Metadata Flags (GetWithMetadata, IterationNext)
// =============================================================================

pub const INFINITE_LIFESPAN: u8 = 0x01;
pub const INFINITE_MAXIDLE: u8 = 0x02;

// =============================================================================
// Listener Interests (2.6+)
// =============================================================================

pub const INTEREST_CREATED: u32 = 0x01;
pub const INTEREST_MODIFIED: u32 = 0x02;
pub const INTEREST_REMOVED: u32 = 0x04;
pub const INTEREST_EXPIRED: u32 = 0x08;
pub const INTEREST_ALL: u32 = INTEREST_CREATED | INTEREST_MODIFIED | INTEREST_REMOVED | INTEREST_EXPIRED;

// =============================================================================
// XA Return Codes
// =============================================================================

pub const XA_OK: i32 = 0;
pub const XA_RDONLY: i32 = 3;
pub const XA_HEURMIX: i32 = 5;
pub const XA_HEURRB: i32 = 6;
pub const XA_HEURCOM: i32 = 7;
pub const XA_RBROLLBACK: i32 = 100;
pub const XAER_RMERR: i32 = -3;
pub const XAER_NOTA: i32 = -4;
pub const XAER_PROTO: i32 = -6;
