//! Responses
//!
//! A [`Response`] is version neutral: the processor states what happened and the versioned
//! encoder decides the final status byte and payload layout.

use crate::cache::CacheEntry;
use crate::iteration::IterationBatch;

use super::header::{ClientIntelligence, RequestHeader};
use super::operation::ERROR_RESPONSE;
use super::status::OperationStatus;
use super::Operation;

/// Header fields echoed back to the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHeader {
    pub version: u8,
    pub message_id: u64,
    /// Request operation; `None` when the request never got that far
    pub op: Option<Operation>,
    pub cache_name: String,
    pub client_intelligence: ClientIntelligence,
    pub topology_id: i32,
}

impl ResponseHeader {
    /// Header for errors raised before the request header was fully known
    pub fn minimal(version: u8, message_id: u64) -> Self {
        Self {
            version,
            message_id,
            op: None,
            cache_name: String::new(),
            client_intelligence: ClientIntelligence::Basic,
            topology_id: 0,
        }
    }
}

impl From<&RequestHeader> for ResponseHeader {
    fn from(header: &RequestHeader) -> Self {
        Self {
            version: header.version,
            message_id: header.message_id,
            op: Some(header.op),
            cache_name: header.cache_name.clone(),
            client_intelligence: header.client_intelligence,
            topology_id: header.topology_id,
        }
    }
}

/// Operation-specific response payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseBody {
    Empty,

    /// Write operations with force-return-previous; `None` when there was no previous value
    Previous(Option<Vec<u8>>),

    Value(Vec<u8>),

    ValueWithVersion { value: Vec<u8>, version: u64 },

    ValueWithMetadata(CacheEntry),

    Stats(Vec<(String, String)>),

    Size(u64),

    BulkEntries(Vec<(Vec<u8>, Vec<u8>)>),

    BulkKeys(Vec<Vec<u8>>),

    /// GetAll
    Entries(Vec<(Vec<u8>, Vec<u8>)>),

    IterationStart { iteration_id: String },

    IterationNext(IterationBatch),

    /// XA return code of a transaction boundary
    Transaction(i32),

    Error(String),
}

/// A response ready to be encoded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub header: ResponseHeader,
    pub status: OperationStatus,
    pub body: ResponseBody,
}

impl Response {
    pub fn new(header: impl Into<ResponseHeader>, status: OperationStatus, body: ResponseBody) -> Self {
        Self {
            header: header.into(),
            status,
            body,
        }
    }

    pub fn empty(header: impl Into<ResponseHeader>, status: OperationStatus) -> Self {
        Self::new(header, status, ResponseBody::Empty)
    }

    pub fn success(header: impl Into<ResponseHeader>) -> Self {
        Self::empty(header, OperationStatus::Success)
    }

    pub fn error(header: impl Into<ResponseHeader>, status: OperationStatus, message: impl Into<String>) -> Self {
        Self::new(header, status, ResponseBody::Error(message.into()))
    }

    /// Op code written on the wire
    pub fn op_code(&self) -> u8 {
        match (self.status.is_error(), self.header.op) {
            (false, Some(op)) => op.response_code(),
            _ => ERROR_RESPONSE,
        }
    }
}
