use std::fmt;

use crate::status_code::{self, StatusCode, TransportCode, status_code_t};

/// Outcome attached to every completion handed to a user callback.
///
/// Carries a code plus an optional message. A failure reported by the peer
/// through immediate data keeps the peer's errno so the caller can surface
/// it unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub struct Status {
    code: status_code_t,
    message: Option<String>,
    remote_errno: Option<i32>,
}

impl Status {
    /// Create a status with just a code.
    pub fn new(code: status_code_t) -> Self {
        Self {
            code,
            message: None,
            remote_errno: None,
        }
    }

    /// The success status.
    pub fn ok() -> Self {
        Self::new(StatusCode::OK)
    }

    /// Create a status with a code and a descriptive message.
    pub fn with_message(code: status_code_t, msg: impl Into<String>) -> Self {
        Self {
            code,
            message: Some(msg.into()),
            remote_errno: None,
        }
    }

    /// Build a status from an errno reported by the peer. Zero means success.
    pub fn from_remote_errno(errno: i32) -> Self {
        if errno == 0 {
            return Self::ok();
        }
        Self {
            code: TransportCode::REMOTE_ERROR,
            message: Some(format!("peer errno {}", errno)),
            remote_errno: Some(errno),
        }
    }

    /// Return the numeric status code.
    pub fn code(&self) -> status_code_t {
        self.code
    }

    /// Return the optional message.
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Whether this status represents success (code == OK).
    pub fn is_ok(&self) -> bool {
        self.code == StatusCode::OK
    }

    /// Whether the failure is a transient shortage worth retrying.
    pub fn is_retryable(&self) -> bool {
        status_code::is_retryable(self.code)
    }

    /// Positive errno for this status, preferring the peer's own value.
    pub fn errno(&self) -> i32 {
        match self.remote_errno {
            Some(e) => e.abs(),
            None => status_code::to_errno(self.code),
        }
    }

    /// Produce a human-readable description like `"Transport::NoResources(2000) queue full"`.
    pub fn describe(&self) -> String {
        let name = status_code::to_string(self.code);
        match &self.message {
            Some(msg) => format!("{}({}) {}", name, self.code, msg),
            None => format!("{}({})", name, self.code),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

impl std::error::Error for Status {}

impl From<status_code_t> for Status {
    fn from(code: status_code_t) -> Self {
        Self::new(code)
    }
}
