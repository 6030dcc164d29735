//! Request header
//!
//! Everything a request carries before its operation-specific fields. The header is filled
//! in by the versioned decoder, stays immutable once dispatched and is echoed (partially)
//! into the response for correlation.

use super::constants::*;
use super::Operation;

/// Header flag bitset
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProtocolFlags(pub u32);

impl ProtocolFlags {
    pub const FORCE_RETURN_PREVIOUS_VALUE: u32 = 0x01;
    pub const DEFAULT_LIFESPAN: u32 = 0x02;
    pub const DEFAULT_MAXIDLE: u32 = 0x04;
    pub const SKIP_CACHE_LOAD: u32 = 0x08;
    pub const SKIP_INDEXING: u32 = 0x10;
    pub const SKIP_LISTENER_NOTIFICATION: u32 = 0x20;

    pub fn contains(&self, flag: u32) -> bool {
        self.0 & flag == flag
    }

    pub fn force_return_previous(&self) -> bool {
        self.contains(Self::FORCE_RETURN_PREVIOUS_VALUE)
    }
}

/// How much routing information the client can use
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientIntelligence {
    Basic,
    TopologyAware,
    HashDistributionAware,
}

impl ClientIntelligence {
    /// Unknown levels are treated as basic
    pub fn from_code(code: u8) -> Self {
        match code {
            INTELLIGENCE_TOPOLOGY_AWARE => ClientIntelligence::TopologyAware,
            INTELLIGENCE_HASH_DISTRIBUTION_AWARE => ClientIntelligence::HashDistributionAware,
            _ => ClientIntelligence::Basic,
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            ClientIntelligence::Basic => INTELLIGENCE_BASIC,
            ClientIntelligence::TopologyAware => INTELLIGENCE_TOPOLOGY_AWARE,
            ClientIntelligence::HashDistributionAware => INTELLIGENCE_HASH_DISTRIBUTION_AWARE,
        }
    }
}

/// Media type announced for keys or values (2.8+)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaType {
    /// Well-known type referenced by id
    Predefined {
        id: u32,
        params: Vec<(String, String)>,
    },
    /// Free-form type name such as `application/json`
    Custom {
        name: String,
        params: Vec<(String, String)>,
    },
}

/// Decoded request header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHeader {
    pub version: u8,
    pub message_id: u64,
    pub op: Operation,
    pub cache_name: String,
    pub flags: ProtocolFlags,
    pub client_intelligence: ClientIntelligence,
    pub topology_id: i32,
    pub key_media_type: Option<MediaType>,
    pub value_media_type: Option<MediaType>,
}

impl RequestHeader {
    pub fn is_1x(&self) -> bool {
        is_version_1x(self.version)
    }

    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags.contains(flag)
    }
}
