use ibtrs_types::{ProtoCode, Status, status_code_t};
use thiserror::Error;

use crate::message::MsgType;

/// A malformed or mismatched wire message.
///
/// Always rejected; none of the message's fields may be used.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtoError {
    /// The buffer is shorter than the header or than the declared size.
    #[error("truncated message: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },

    #[error("unknown message type {0}")]
    UnknownType(u16),

    /// A fixed-size message, or a variable one whose size follows from its
    /// count field, declares the wrong total size.
    #[error("{msg_type}: declared size {declared}, expected {expected}")]
    SizeMismatch {
        msg_type: MsgType,
        declared: usize,
        expected: usize,
    },

    #[error("{msg_type}: declared size {declared}, must be at least {min}")]
    TooShort {
        msg_type: MsgType,
        declared: usize,
        min: usize,
    },

    #[error("{msg_type}: declared size {declared} exceeds {max}")]
    TooLarge {
        msg_type: MsgType,
        declared: usize,
        max: usize,
    },

    #[error("protocol version {got} not supported, expected {expected}")]
    VersionNotSupported { got: u8, expected: u8 },

    #[error("queue depth {got} does not match expected {expected}")]
    QueueDepthMismatch { got: u16, expected: u16 },

    #[error("{msg_type}: invalid {field}: {reason}")]
    InvalidField {
        msg_type: MsgType,
        field: &'static str,
        reason: String,
    },
}

impl ProtoError {
    pub fn code(&self) -> status_code_t {
        match self {
            ProtoError::Truncated { .. } => ProtoCode::TRUNCATED,
            ProtoError::UnknownType(_) => ProtoCode::INVALID_MESSAGE_TYPE,
            ProtoError::SizeMismatch { .. } | ProtoError::TooShort { .. } => ProtoCode::SIZE_MISMATCH,
            ProtoError::TooLarge { .. } => ProtoCode::MESSAGE_TOO_LARGE,
            ProtoError::VersionNotSupported { .. } => ProtoCode::VERSION_NOT_SUPPORTED,
            ProtoError::QueueDepthMismatch { .. } => ProtoCode::QUEUE_DEPTH_MISMATCH,
            ProtoError::InvalidField { .. } => ProtoCode::INVALID_FIELD,
        }
    }

    /// Positive errno reported to errno-speaking consumers.
    pub fn errno(&self) -> i32 {
        ibtrs_types::to_errno(self.code())
    }
}

impl From<ProtoError> for Status {
    fn from(e: ProtoError) -> Self {
        Status::with_message(e.code(), e.to_string())
    }
}
