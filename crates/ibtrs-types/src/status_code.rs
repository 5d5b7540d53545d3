/// Status code type alias.
#[allow(non_camel_case_types)]
pub type status_code_t = u16;

/// Common status codes (0-999).
pub mod StatusCode {
    use super::status_code_t;

    pub const OK: status_code_t = 0;
    pub const NOT_IMPLEMENTED: status_code_t = 1;
    pub const INVALID_ARG: status_code_t = 3;
    pub const INVALID_CONFIG: status_code_t = 4;
    pub const NOT_ENOUGH_MEMORY: status_code_t = 26;
    pub const INTERRUPTED: status_code_t = 27;
    pub const IO_ERROR: status_code_t = 69;
    pub const FOUND_BUG: status_code_t = 998;
    pub const UNKNOWN: status_code_t = 999;
}

/// Wire protocol status codes (1xxx).
///
/// Every code in this range is a protocol error: a malformed or mismatched
/// message that was rejected before any of its fields were trusted.
pub mod ProtoCode {
    use super::status_code_t;

    pub const INVALID_MESSAGE_TYPE: status_code_t = 1000;
    pub const SIZE_MISMATCH: status_code_t = 1001;
    pub const TRUNCATED: status_code_t = 1002;
    pub const VERSION_NOT_SUPPORTED: status_code_t = 1003;
    pub const QUEUE_DEPTH_MISMATCH: status_code_t = 1004;
    pub const INVALID_FIELD: status_code_t = 1005;
    pub const MESSAGE_TOO_LARGE: status_code_t = 1006;
}

/// Transport status codes (2xxx).
pub mod TransportCode {
    use super::status_code_t;

    pub const NO_RESOURCES: status_code_t = 2000;
    pub const NOT_CONNECTED: status_code_t = 2001;
    pub const SESSION_CLOSED: status_code_t = 2002;
    pub const CONNECT_FAILED: status_code_t = 2003;
    pub const HEARTBEAT_TIMEOUT: status_code_t = 2004;
    pub const MAX_RECONNECT_EXCEEDED: status_code_t = 2005;
    pub const RDMA_POST_FAILED: status_code_t = 2006;
    pub const RDMA_ERROR: status_code_t = 2007;
    pub const CONNECTION_RESET: status_code_t = 2008;
    pub const ALREADY_REGISTERED: status_code_t = 2009;
    pub const NOT_REGISTERED: status_code_t = 2010;
    pub const SESSIONS_OPEN: status_code_t = 2011;
    pub const SESSION_BUSY: status_code_t = 2012;
    pub const IO_TOO_LARGE: status_code_t = 2013;
    pub const MSG_TOO_LARGE: status_code_t = 2014;
    pub const REMOTE_ERROR: status_code_t = 2015;
    pub const DRAIN_TIMEOUT: status_code_t = 2016;
    pub const DMA_MAP_FAILED: status_code_t = 2017;
}

/// Classification of status code ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i8)]
pub enum StatusCodeType {
    Invalid = -1,
    Common = 0,
    Proto = 1,
    Transport = 2,
}

/// Determine the type/category of a status code.
pub fn type_of(code: status_code_t) -> StatusCodeType {
    match code {
        0..=999 => StatusCodeType::Common,
        1000..=1999 => StatusCodeType::Proto,
        2000..=2999 => StatusCodeType::Transport,
        _ => StatusCodeType::Invalid,
    }
}

/// Convert a status code to its human-readable name.
pub fn to_string(code: status_code_t) -> &'static str {
    match code {
        // Common
        StatusCode::OK => "OK",
        StatusCode::NOT_IMPLEMENTED => "NotImplemented",
        StatusCode::INVALID_ARG => "InvalidArg",
        StatusCode::INVALID_CONFIG => "InvalidConfig",
        StatusCode::NOT_ENOUGH_MEMORY => "NotEnoughMemory",
        StatusCode::INTERRUPTED => "Interrupted",
        StatusCode::IO_ERROR => "IOError",
        StatusCode::FOUND_BUG => "FoundBug",
        StatusCode::UNKNOWN => "Unknown",

        // Proto
        ProtoCode::INVALID_MESSAGE_TYPE => "Proto::InvalidMessageType",
        ProtoCode::SIZE_MISMATCH => "Proto::SizeMismatch",
        ProtoCode::TRUNCATED => "Proto::Truncated",
        ProtoCode::VERSION_NOT_SUPPORTED => "Proto::VersionNotSupported",
        ProtoCode::QUEUE_DEPTH_MISMATCH => "Proto::QueueDepthMismatch",
        ProtoCode::INVALID_FIELD => "Proto::InvalidField",
        ProtoCode::MESSAGE_TOO_LARGE => "Proto::MessageTooLarge",

        // Transport
        TransportCode::NO_RESOURCES => "Transport::NoResources",
        TransportCode::NOT_CONNECTED => "Transport::NotConnected",
        TransportCode::SESSION_CLOSED => "Transport::SessionClosed",
        TransportCode::CONNECT_FAILED => "Transport::ConnectFailed",
        TransportCode::HEARTBEAT_TIMEOUT => "Transport::HeartbeatTimeout",
        TransportCode::MAX_RECONNECT_EXCEEDED => "Transport::MaxReconnectExceeded",
        TransportCode::RDMA_POST_FAILED => "Transport::RdmaPostFailed",
        TransportCode::RDMA_ERROR => "Transport::RdmaError",
        TransportCode::CONNECTION_RESET => "Transport::ConnectionReset",
        TransportCode::ALREADY_REGISTERED => "Transport::AlreadyRegistered",
        TransportCode::NOT_REGISTERED => "Transport::NotRegistered",
        TransportCode::SESSIONS_OPEN => "Transport::SessionsOpen",
        TransportCode::SESSION_BUSY => "Transport::SessionBusy",
        TransportCode::IO_TOO_LARGE => "Transport::IoTooLarge",
        TransportCode::MSG_TOO_LARGE => "Transport::MsgTooLarge",
        TransportCode::REMOTE_ERROR => "Transport::RemoteError",
        TransportCode::DRAIN_TIMEOUT => "Transport::DrainTimeout",
        TransportCode::DMA_MAP_FAILED => "Transport::DmaMapFailed",

        _ => "UnknownStatusCode",
    }
}

/// Whether a status code signals a transient shortage the caller should
/// retry later instead of failing the operation.
pub fn is_retryable(code: status_code_t) -> bool {
    code == TransportCode::NO_RESOURCES
}

/// Convert a status code to the corresponding POSIX errno value (positive).
///
/// Uses libc constants on the target platform.
pub fn to_errno(code: status_code_t) -> i32 {
    match code {
        c if c == StatusCode::OK => 0,
        c if c == StatusCode::INVALID_ARG => libc::EINVAL,
        c if c == StatusCode::INVALID_CONFIG => libc::EINVAL,
        c if c == StatusCode::NOT_IMPLEMENTED => libc::ENOSYS,
        c if c == StatusCode::NOT_ENOUGH_MEMORY => libc::ENOMEM,
        c if c == StatusCode::INTERRUPTED => libc::EINTR,

        c if c == ProtoCode::VERSION_NOT_SUPPORTED => libc::EPROTONOSUPPORT,
        c if type_of(c) == StatusCodeType::Proto => libc::EINVAL,

        c if c == TransportCode::NO_RESOURCES => libc::EAGAIN,
        c if c == TransportCode::NOT_CONNECTED => libc::ECOMM,
        c if c == TransportCode::SESSION_CLOSED => libc::ECOMM,
        c if c == TransportCode::CONNECT_FAILED => libc::ECONNREFUSED,
        c if c == TransportCode::HEARTBEAT_TIMEOUT => libc::ETIMEDOUT,
        c if c == TransportCode::MAX_RECONNECT_EXCEEDED => libc::EHOSTUNREACH,
        c if c == TransportCode::CONNECTION_RESET => libc::ECONNRESET,
        c if c == TransportCode::ALREADY_REGISTERED => libc::ENOTSUP,
        c if c == TransportCode::SESSIONS_OPEN => libc::EBUSY,
        c if c == TransportCode::SESSION_BUSY => libc::EBUSY,
        c if c == TransportCode::IO_TOO_LARGE => libc::EINVAL,
        c if c == TransportCode::MSG_TOO_LARGE => libc::EINVAL,
        c if c == TransportCode::DRAIN_TIMEOUT => libc::ETIMEDOUT,
        c if c == TransportCode::DMA_MAP_FAILED => libc::ENOMEM,

        _ => libc::EIO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_code_values() {
        assert_eq!(StatusCode::OK, 0);
        assert_eq!(StatusCode::UNKNOWN, 999);
        assert_eq!(ProtoCode::INVALID_MESSAGE_TYPE, 1000);
        assert_eq!(TransportCode::NO_RESOURCES, 2000);
    }

    #[test]
    fn test_type_of() {
        assert_eq!(type_of(StatusCode::OK), StatusCodeType::Common);
        assert_eq!(type_of(ProtoCode::SIZE_MISMATCH), StatusCodeType::Proto);
        assert_eq!(type_of(TransportCode::NOT_CONNECTED), StatusCodeType::Transport);
        assert_eq!(type_of(9000), StatusCodeType::Invalid);
    }

    #[test]
    fn test_to_string() {
        assert_eq!(to_string(StatusCode::OK), "OK");
        assert_eq!(to_string(ProtoCode::SIZE_MISMATCH), "Proto::SizeMismatch");
        assert_eq!(to_string(TransportCode::NO_RESOURCES), "Transport::NoResources");
        assert_eq!(to_string(12345), "UnknownStatusCode");
    }

    #[test]
    fn test_retryable_only_for_resource_shortage() {
        assert!(is_retryable(TransportCode::NO_RESOURCES));
        assert!(!is_retryable(TransportCode::NOT_CONNECTED));
        assert!(!is_retryable(ProtoCode::SIZE_MISMATCH));
    }

    #[test]
    fn test_to_errno() {
        assert_eq!(to_errno(StatusCode::OK), 0);
        assert_eq!(to_errno(StatusCode::INVALID_ARG), libc::EINVAL);
        assert_eq!(to_errno(ProtoCode::SIZE_MISMATCH), libc::EINVAL);
        assert_eq!(to_errno(ProtoCode::VERSION_NOT_SUPPORTED), libc::EPROTONOSUPPORT);
        assert_eq!(to_errno(TransportCode::NO_RESOURCES), libc::EAGAIN);
        assert_eq!(to_errno(TransportCode::NOT_CONNECTED), libc::ECOMM);
        assert_eq!(to_errno(TransportCode::CONNECTION_RESET), libc::ECONNRESET);
        assert_eq!(to_errno(TransportCode::REMOTE_ERROR), libc::EIO);
    }
}
