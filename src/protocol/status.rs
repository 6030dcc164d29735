//! Response status codes

/// Status byte of a response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationStatus {
    // --- Success family ---
    Success,
    OperationNotExecuted,
    KeyDoesNotExist,
    SuccessWithPrevious,
    NotExecutedWithPrevious,
    InvalidIteration,

    // --- Success family, object storage variants (2.4+) ---
    SuccessObjStorage,
    SuccessWithPreviousObjStorage,
    NotExecutedWithPreviousObjStorage,
    InvalidIterationObjStorage,

    // --- Errors ---
    InvalidMagicOrMsgId,
    UnknownOperation,
    UnknownVersion,
    ParseError,
    ServerError,
    OperationTimedOut,
    NodeSuspected,
    IllegalLifecycleState,
}

impl OperationStatus {
    pub fn code(&self) -> u8 {
        match self {
            OperationStatus::Success => 0x00,
            OperationStatus::OperationNotExecuted => 0x01,
            OperationStatus::KeyDoesNotExist => 0x02,
            OperationStatus::SuccessWithPrevious => 0x03,
            OperationStatus::NotExecutedWithPrevious => 0x04,
            OperationStatus::InvalidIteration => 0x05,
            OperationStatus::SuccessObjStorage => 0x06,
            OperationStatus::SuccessWithPreviousObjStorage => 0x07,
            OperationStatus::NotExecutedWithPreviousObjStorage => 0x08,
            OperationStatus::InvalidIterationObjStorage => 0x09,
            OperationStatus::InvalidMagicOrMsgId => 0x81,
            OperationStatus::UnknownOperation => 0x82,
            OperationStatus::UnknownVersion => 0x83,
            OperationStatus::ParseError => 0x84,
            OperationStatus::ServerError => 0x85,
            OperationStatus::OperationTimedOut => 0x86,
            OperationStatus::NodeSuspected => 0x87,
            OperationStatus::IllegalLifecycleState => 0x88,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        let status = match code {
            0x00 => OperationStatus::Success,
            0x01 => OperationStatus::OperationNotExecuted,
            0x02 => OperationStatus::KeyDoesNotExist,
            0x03 => OperationStatus::SuccessWithPrevious,
            0x04 => OperationStatus::NotExecutedWithPrevious,
            0x05 => OperationStatus::InvalidIteration,
            0x06 => OperationStatus::SuccessObjStorage,
            0x07 => OperationStatus::SuccessWithPreviousObjStorage,
            0x08 => OperationStatus::NotExecutedWithPreviousObjStorage,
            0x09 => OperationStatus::InvalidIterationObjStorage,
            0x81 => OperationStatus::InvalidMagicOrMsgId,
            0x82 => OperationStatus::UnknownOperation,
            0x83 => OperationStatus::UnknownVersion,
            0x84 => OperationStatus::ParseError,
            0x85 => OperationStatus::ServerError,
            0x86 => OperationStatus::OperationTimedOut,
            0x87 => OperationStatus::NodeSuspected,
            0x88 => OperationStatus::IllegalLifecycleState,
            _ => return None,
        };
        Some(status)
    }

    pub fn is_error(&self) -> bool {
        self.code() >= 0x80
    }

    /// Variant telling the client that values are stored as objects
    ///
    /// Statuses without an object storage counterpart are returned unchanged.
    pub fn with_object_storage(self) -> Self {
        match self {
            OperationStatus::Success => OperationStatus::SuccessObjStorage,
            OperationStatus::SuccessWithPrevious => OperationStatus::SuccessWithPreviousObjStorage,
            OperationStatus::NotExecutedWithPrevious => OperationStatus::NotExecutedWithPreviousObjStorage,
            OperationStatus::InvalidIteration => OperationStatus::InvalidIterationObjStorage,
            other => other,
        }
    }
}
