use ibtrs_config::ConfigError;
use ibtrs_proto::{MsgType, ProtoError};
use ibtrs_types::{Address, Status, StatusCode, TransportCode, status_code_t};
use thiserror::Error;

/// Failures reported by the RDMA capability.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RdmaError {
    #[error("peer {0} unreachable")]
    Unreachable(Address),

    #[error("path is down")]
    PathDown,

    #[error("work request flushed")]
    Flushed,

    #[error("remote access error: key {key:#x} addr {addr:#x} len {len}")]
    RemoteAccess { key: u32, addr: u64, len: usize },

    #[error("local access error: key {key:#x} addr {addr:#x} len {len}")]
    LocalAccess { key: u32, addr: u64, len: usize },

    #[error("dma mapping failed: {0}")]
    MapFailed(String),

    #[error("handshake not supported on this end of the path")]
    NotInitiator,
}

/// Errors returned synchronously by transport operations.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Every tag or message credit is in use. Retry later.
    #[error("no resources available")]
    NoResources,

    #[error("session not connected")]
    NotConnected,

    #[error("session closed")]
    SessionClosed,

    #[error("session still referenced by {refs} holders")]
    SessionBusy { refs: usize },

    #[error("i/o of {size} bytes exceeds maximum {max}")]
    IoTooLarge { size: usize, max: usize },

    #[error("message of {size} bytes exceeds maximum {max}")]
    MsgTooLarge { size: usize, max: usize },

    #[error("{count} segments, at most {max} allowed")]
    TooManySegments { count: usize, max: usize },

    #[error("a consumer is already registered")]
    AlreadyRegistered,

    #[error("no consumer registered")]
    NotRegistered,

    #[error("{0} sessions still open")]
    SessionsOpen(usize),

    #[error("unexpected {0} message")]
    UnexpectedMessage(MsgType),

    #[error("peer rejected with errno {errno}")]
    Remote { errno: i32 },

    #[error("protocol error: {0}")]
    Proto(#[from] ProtoError),

    #[error("rdma error: {0}")]
    Rdma(#[from] RdmaError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

impl TransportError {
    /// Resource exhaustion is the only condition a caller should back off
    /// and retry on; everything else is a hard failure.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransportError::NoResources)
    }

    pub fn code(&self) -> status_code_t {
        match self {
            TransportError::NoResources => TransportCode::NO_RESOURCES,
            TransportError::NotConnected => TransportCode::NOT_CONNECTED,
            TransportError::SessionClosed => TransportCode::SESSION_CLOSED,
            TransportError::SessionBusy { .. } => TransportCode::SESSION_BUSY,
            TransportError::IoTooLarge { .. } | TransportError::TooManySegments { .. } => {
                TransportCode::IO_TOO_LARGE
            }
            TransportError::MsgTooLarge { .. } => TransportCode::MSG_TOO_LARGE,
            TransportError::AlreadyRegistered => TransportCode::ALREADY_REGISTERED,
            TransportError::NotRegistered => TransportCode::NOT_REGISTERED,
            TransportError::SessionsOpen(_) => TransportCode::SESSIONS_OPEN,
            TransportError::UnexpectedMessage(_) => ibtrs_types::ProtoCode::INVALID_MESSAGE_TYPE,
            TransportError::Remote { .. } => TransportCode::REMOTE_ERROR,
            TransportError::Proto(e) => e.code(),
            TransportError::Rdma(RdmaError::Unreachable(_)) => TransportCode::CONNECT_FAILED,
            TransportError::Rdma(RdmaError::MapFailed(_)) => TransportCode::DMA_MAP_FAILED,
            TransportError::Rdma(RdmaError::PathDown) => TransportCode::NOT_CONNECTED,
            TransportError::Rdma(_) => TransportCode::RDMA_ERROR,
            TransportError::Config(_) => StatusCode::INVALID_CONFIG,
        }
    }

    /// Positive errno, for consumers that speak errno.
    pub fn errno(&self) -> i32 {
        match self {
            TransportError::Remote { errno } => errno.abs(),
            other => ibtrs_types::to_errno(other.code()),
        }
    }
}

impl From<TransportError> for Status {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Remote { errno } => Status::from_remote_errno(errno),
            other => Status::with_message(other.code(), other.to_string()),
        }
    }
}

impl From<RdmaError> for Status {
    fn from(e: RdmaError) -> Self {
        TransportError::from(e).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_no_resources_is_retryable() {
        assert!(TransportError::NoResources.is_retryable());
        assert!(!TransportError::NotConnected.is_retryable());
        assert!(!TransportError::IoTooLarge { size: 2, max: 1 }.is_retryable());
        assert_eq!(TransportError::NoResources.errno(), libc::EAGAIN);
    }

    #[test]
    fn test_proto_error_keeps_code() {
        let e: TransportError = ProtoError::UnknownType(42).into();
        assert_eq!(e.code(), ibtrs_types::ProtoCode::INVALID_MESSAGE_TYPE);
        assert_eq!(e.errno(), libc::EINVAL);
    }

    #[test]
    fn test_remote_errno_passes_through() {
        let e = TransportError::Remote { errno: libc::ENOSPC };
        assert_eq!(e.errno(), libc::ENOSPC);
        let status: Status = e.into();
        assert_eq!(status.errno(), libc::ENOSPC);
    }

    #[test]
    fn test_rdma_error_status() {
        let status: Status = RdmaError::Flushed.into();
        assert_eq!(status.code(), TransportCode::RDMA_ERROR);
        assert!(status.describe().contains("flushed"));
    }
}
