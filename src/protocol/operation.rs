//! Operations and their static descriptors
//!
//! Each operation knows its request code (the response code is always request + 1), the
//! first protocol version that supports it, and the decode stages that follow the header.

use super::constants::*;
use super::decoder::DecodeState;
use super::decoder::DecodeState::*;

/// Op code of every error response, whatever the request was
pub const ERROR_RESPONSE: u8 = 0x50;

/// Protocol operations known to this server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    // --- Basic key/value ---
    Put,
    Get,
    PutIfAbsent,
    Replace,
    ReplaceIfUnmodified,
    Remove,
    RemoveIfUnmodified,
    ContainsKey,
    GetWithVersion,
    Clear,
    Stats,
    Ping,
    BulkGet,
    GetWithMetadata,
    BulkGetKeys,

    // --- 2.x additions ---
    AddClientListener,
    RemoveClientListener,
    Size,
    PutAll,
    GetAll,
    IterationStart,
    IterationNext,
    IterationEnd,

    // --- Transactions (2.7+) ---
    PrepareTx,
    CommitTx,
    RollbackTx,
}

/// Static per-operation metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationDescriptor {
    pub requires_auth: bool,
    pub can_skip_cache_load: bool,
    pub can_skip_indexing: bool,
    pub is_conditional: bool,
    pub can_return_previous: bool,
    /// Decode states visited after the header, in order
    pub stages: &'static [DecodeState],
}

impl OperationDescriptor {
    const fn new(stages: &'static [DecodeState]) -> Self {
        Self {
            requires_auth: true,
            can_skip_cache_load: false,
            can_skip_indexing: false,
            is_conditional: false,
            can_return_previous: false,
            stages,
        }
    }

    const fn read(mut self) -> Self {
        self.can_skip_cache_load = true;
        self
    }

    const fn write(mut self) -> Self {
        self.can_skip_cache_load = true;
        self.can_skip_indexing = true;
        self.can_return_previous = true;
        self
    }

    const fn conditional(mut self) -> Self {
        self.is_conditional = true;
        self
    }

    const fn anonymous(mut self) -> Self {
        self.requires_auth = false;
        self
    }

    pub fn requires_key(&self) -> bool {
        self.stages.contains(&Key)
    }

    pub fn requires_value(&self) -> bool {
        self.stages.contains(&Value)
    }

    /// The last decode state this operation needs; `Header` when the header is enough
    pub fn completion_level(&self) -> DecodeState {
        self.stages.last().copied().unwrap_or(Header)
    }
}

const KEY_ONLY: &[DecodeState] = &[Key];
const KEY_VALUE: &[DecodeState] = &[Key, Parameters, Value];
const KEY_PARAMS: &[DecodeState] = &[Key, Parameters];
const HEADER_ONLY: &[DecodeState] = &[];
const CUSTOM_KEY: &[DecodeState] = &[KeyCustom];
const CUSTOM_VALUE: &[DecodeState] = &[Parameters, ValueCustom];
const CUSTOM_HEADER: &[DecodeState] = &[HeaderCustom];

impl Operation {
    pub const ALL: [Operation; 26] = [
        Operation::Put,
        Operation::Get,
        Operation::PutIfAbsent,
        Operation::Replace,
        Operation::ReplaceIfUnmodified,
        Operation::Remove,
        Operation::RemoveIfUnmodified,
        Operation::ContainsKey,
        Operation::GetWithVersion,
        Operation::Clear,
        Operation::Stats,
        Operation::Ping,
        Operation::BulkGet,
        Operation::GetWithMetadata,
        Operation::BulkGetKeys,
        Operation::AddClientListener,
        Operation::RemoveClientListener,
        Operation::Size,
        Operation::PutAll,
        Operation::GetAll,
        Operation::IterationStart,
        Operation::IterationNext,
        Operation::IterationEnd,
        Operation::PrepareTx,
        Operation::CommitTx,
        Operation::RollbackTx,
    ];

    pub fn request_code(&self) -> u8 {
        match self {
            Operation::Put => 0x01,
            Operation::Get => 0x03,
            Operation::PutIfAbsent => 0x05,
            Operation::Replace => 0x07,
            Operation::ReplaceIfUnmodified => 0x09,
            Operation::Remove => 0x0B,
            Operation::RemoveIfUnmodified => 0x0D,
            Operation::ContainsKey => 0x0F,
            Operation::GetWithVersion => 0x11,
            Operation::Clear => 0x13,
            Operation::Stats => 0x15,
            Operation::Ping => 0x17,
            Operation::BulkGet => 0x19,
            Operation::GetWithMetadata => 0x1B,
            Operation::BulkGetKeys => 0x1D,
            Operation::AddClientListener => 0x25,
            Operation::RemoveClientListener => 0x27,
            Operation::Size => 0x29,
            Operation::PutAll => 0x2D,
            Operation::GetAll => 0x2F,
            Operation::IterationStart => 0x31,
            Operation::IterationNext => 0x33,
            Operation::IterationEnd => 0x35,
            Operation::PrepareTx => 0x3B,
            Operation::CommitTx => 0x3D,
            Operation::RollbackTx => 0x3F,
        }
    }

    pub fn response_code(&self) -> u8 {
        self.request_code() + 1
    }

    /// First protocol version that understands this operation
    pub fn min_version(&self) -> u8 {
        match self {
            Operation::AddClientListener | Operation::RemoveClientListener | Operation::Size => VERSION_20,
            Operation::PutAll | Operation::GetAll => VERSION_21,
            Operation::IterationStart | Operation::IterationNext | Operation::IterationEnd => VERSION_23,
            Operation::PrepareTx | Operation::CommitTx | Operation::RollbackTx => VERSION_27,
            Operation::GetWithMetadata => VERSION_12,
            _ => VERSION_10,
        }
    }

    /// Resolve a request code for the given version
    pub fn from_request_code(code: u8, version: u8) -> Option<Operation> {
        Self::ALL
            .iter()
            .copied()
            .find(|op| op.request_code() == code)
            .filter(|op| version >= op.min_version())
    }

    pub fn descriptor(&self) -> OperationDescriptor {
        match self {
            Operation::Put => OperationDescriptor::new(KEY_VALUE).write(),
            Operation::PutIfAbsent => OperationDescriptor::new(KEY_VALUE).write().conditional(),
            Operation::Replace => OperationDescriptor::new(KEY_VALUE).write().conditional(),
            Operation::ReplaceIfUnmodified => OperationDescriptor::new(KEY_VALUE).write().conditional(),
            Operation::Remove => OperationDescriptor::new(KEY_ONLY).write(),
            Operation::RemoveIfUnmodified => OperationDescriptor::new(KEY_PARAMS).write().conditional(),
            Operation::Get
            | Operation::ContainsKey
            | Operation::GetWithVersion
            | Operation::GetWithMetadata => OperationDescriptor::new(KEY_ONLY).read(),
            Operation::Ping => OperationDescriptor::new(HEADER_ONLY).anonymous(),
            Operation::Clear | Operation::Stats | Operation::Size => OperationDescriptor::new(HEADER_ONLY),
            Operation::BulkGet | Operation::BulkGetKeys => OperationDescriptor::new(CUSTOM_KEY).read(),
            Operation::AddClientListener
            | Operation::RemoveClientListener
            | Operation::IterationStart
            | Operation::IterationNext
            | Operation::IterationEnd => OperationDescriptor::new(CUSTOM_KEY),
            Operation::PutAll => {
                let mut d = OperationDescriptor::new(CUSTOM_VALUE).write();
                d.can_return_previous = false;
                d
            }
            Operation::GetAll => OperationDescriptor::new(CUSTOM_VALUE).read(),
            Operation::PrepareTx | Operation::CommitTx | Operation::RollbackTx => {
                OperationDescriptor::new(CUSTOM_HEADER)
            }
        }
    }
}
