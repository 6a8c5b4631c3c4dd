//! Socket-layer error reporting.

use std::error;
use std::fmt;
use std::io;

/// What went wrong on a socket, as surfaced through `on_err`.
///
/// `Timeout` covers both connect and send timeouts; the reason string tells
/// them apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Peer closed the connection.
    Eof,
    /// A timer expired before the operation completed.
    Timeout,
    /// Connection refused by the peer.
    Refused,
    /// Host name resolution failed.
    Dns,
    /// Local, intentional teardown (user shutdown or server teardown).
    Shutdown,
    /// Anything else, usually carrying an OS error in the reason.
    Other,
}

impl ErrorKind {
    fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Eof => "end of file",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Refused => "connection refused",
            ErrorKind::Dns => "dns resolution failed",
            ErrorKind::Shutdown => "shutdown",
            ErrorKind::Other => "other",
        }
    }
}

/// The error value delivered to socket and session callbacks.
///
/// Guaranteed to be delivered at most once per socket lifetime. The
/// `custom_code` slot is reserved for applications; the core never sets it.
#[derive(Debug, Clone)]
pub struct SockError {
    kind: ErrorKind,
    reason: String,
    custom_code: i32,
}

impl SockError {
    pub fn new(kind: ErrorKind, reason: impl Into<String>) -> SockError {
        SockError {
            kind,
            reason: reason.into(),
            custom_code: 0,
        }
    }

    pub fn with_custom_code(mut self, code: i32) -> SockError {
        self.custom_code = code;
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn custom_code(&self) -> i32 {
        self.custom_code
    }

    /// Map an OS-level error observed on a socket to the user-facing kind.
    pub fn from_os(err: io::Error) -> SockError {
        let kind = match err.raw_os_error() {
            Some(libc::ECONNREFUSED) => ErrorKind::Refused,
            Some(libc::ETIMEDOUT) => ErrorKind::Timeout,
            Some(libc::ECONNRESET) | Some(libc::EPIPE) => ErrorKind::Eof,
            _ => ErrorKind::Other,
        };
        SockError::new(kind, err.to_string())
    }
}

impl fmt::Display for SockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.reason.is_empty() {
            write!(f, "{}", self.kind.as_str())
        } else {
            write!(f, "{}: {}", self.kind.as_str(), self.reason)
        }
    }
}

impl error::Error for SockError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn os_error_mapping() {
        let err = SockError::from_os(io::Error::from_raw_os_error(libc::ECONNREFUSED));
        assert_eq!(err.kind(), ErrorKind::Refused);

        let err = SockError::from_os(io::Error::from_raw_os_error(libc::ECONNRESET));
        assert_eq!(err.kind(), ErrorKind::Eof);

        let err = SockError::from_os(io::Error::from_raw_os_error(libc::ENOBUFS));
        assert_eq!(err.kind(), ErrorKind::Other);
    }

    #[test]
    fn display_includes_reason() {
        let err = SockError::new(ErrorKind::Timeout, "send timeout");
        assert_eq!(err.to_string(), "timeout: send timeout");
    }
}
