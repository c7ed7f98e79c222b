//! Guest-visible error codes and host-side error types.
//!
//! Every capability function returns an `i32`: a non-negative value is a
//! handle or byte count, a negative value is one of the [`ErrorCode`]s
//! below. Host functions never trap on an I/O failure; the guest decides
//! whether to retry, fall back, or give up.

use std::fmt;
use std::io;

/// Negative status codes returned to the guest by capability functions.
///
/// These repr values are part of the version-0 ABI and MUST NOT change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    Ok = 0,
    Generic = -1,
    InvalidArgument = -2,
    InvalidFd = -3,
    NotImplemented = -4,
    DoubleInit = -5,
    FailedIo = -6,
    Timeout = -7,
    Closed = -8,
    DialFailed = -9,
    BadPointer = -10,
    Internal = -11,
}

impl ErrorCode {
    /// Convert from an `i32` returned across the guest boundary.
    pub fn from_i32(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::Ok),
            -1 => Some(Self::Generic),
            -2 => Some(Self::InvalidArgument),
            -3 => Some(Self::InvalidFd),
            -4 => Some(Self::NotImplemented),
            -5 => Some(Self::DoubleInit),
            -6 => Some(Self::FailedIo),
            -7 => Some(Self::Timeout),
            -8 => Some(Self::Closed),
            -9 => Some(Self::DialFailed),
            -10 => Some(Self::BadPointer),
            -11 => Some(Self::Internal),
            _ => None,
        }
    }

    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// Map an I/O failure on a raw connection to the code the guest sees.
    pub fn from_io_kind(kind: io::ErrorKind) -> Self {
        match kind {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Self::Timeout,
            io::ErrorKind::NotConnected
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset => Self::Closed,
            io::ErrorKind::InvalidInput => Self::InvalidArgument,
            _ => Self::FailedIo,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ok => "OK",
            Self::Generic => "ERR_GENERIC",
            Self::InvalidArgument => "ERR_INVALID_ARGUMENT",
            Self::InvalidFd => "ERR_INVALID_FD",
            Self::NotImplemented => "ERR_NOT_IMPLEMENTED",
            Self::DoubleInit => "ERR_DOUBLE_INIT",
            Self::FailedIo => "ERR_FAILED_IO",
            Self::Timeout => "ERR_TIMEOUT",
            Self::Closed => "ERR_CLOSED",
            Self::DialFailed => "ERR_DIAL_FAILED",
            Self::BadPointer => "ERR_BAD_POINTER",
            Self::Internal => "ERR_INTERNAL",
        };
        f.write_str(name)
    }
}

/// Host-side error produced while servicing a capability call.
///
/// Guests only ever see [`to_error_code`](HostError::to_error_code); the
/// wrapped I/O error stays on the host for logging.
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    /// A status the shim decided on directly.
    #[error("host error: {0}")]
    Code(ErrorCode),

    /// The raw connection failed.
    #[error("raw connection i/o: {0}")]
    Io(#[from] io::Error),

    /// Host invariant broken; reported to the guest as `ERR_INTERNAL`.
    #[error("internal host error: {0}")]
    Internal(String),
}

impl HostError {
    pub fn to_error_code(&self) -> i32 {
        match self {
            Self::Code(code) => code.as_i32(),
            Self::Io(err) => ErrorCode::from_io_kind(err.kind()).as_i32(),
            Self::Internal(_) => ErrorCode::Internal.as_i32(),
        }
    }

    /// True if the failure was a deadline expiring on the raw connection.
    pub fn is_timeout(&self) -> bool {
        self.to_error_code() == ErrorCode::Timeout.as_i32()
    }

    pub fn invalid_fd() -> Self {
        Self::Code(ErrorCode::InvalidFd)
    }

    pub fn not_implemented() -> Self {
        Self::Code(ErrorCode::NotImplemented)
    }

    pub fn double_init() -> Self {
        Self::Code(ErrorCode::DoubleInit)
    }

    pub fn timeout() -> Self {
        Self::Code(ErrorCode::Timeout)
    }

    pub fn closed() -> Self {
        Self::Code(ErrorCode::Closed)
    }

    pub fn dial_failed() -> Self {
        Self::Code(ErrorCode::DialFailed)
    }
}

impl From<ErrorCode> for HostError {
    fn from(code: ErrorCode) -> Self {
        Self::Code(code)
    }
}

/// Failure of a [`ManagedDialer`](crate::ManagedDialer) to reach its bound target.
#[derive(Debug, thiserror::Error)]
#[error("dial {network} {address}: {source}")]
pub struct DialError {
    pub network: String,
    pub address: String,
    #[source]
    pub source: io::Error,
}

impl DialError {
    pub fn kind(&self) -> io::ErrorKind {
        self.source.kind()
    }
}
