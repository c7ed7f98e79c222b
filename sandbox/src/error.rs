//! Sandbox error types.

use std::fmt;
use std::io;

use water_hostapi::DialError;

/// Where a guest fault came from. Only used for diagnostics: callers treat
/// every kind the same way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// The guest trapped (unreachable, out of fuel, stack overflow, ...).
    Trap,
    /// The guest returned a negative status from an export.
    Status,
    /// A host copy into or out of guest memory was out of range.
    Memory,
}

/// A failure originating inside the guest.
///
/// Carries only owned data; nothing here points back into guest memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    pub kind: FaultKind,
    pub message: String,
    pub code: Option<i32>,
}

impl Fault {
    pub fn trap(message: impl Into<String>) -> Self {
        Self {
            kind: FaultKind::Trap,
            message: message.into(),
            code: None,
        }
    }

    pub fn status(export: &str, code: i32) -> Self {
        Self {
            kind: FaultKind::Status,
            message: format!("{export} returned {code}"),
            code: Some(code),
        }
    }

    pub fn memory(message: impl Into<String>) -> Self {
        Self {
            kind: FaultKind::Memory,
            message: message.into(),
            code: None,
        }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            FaultKind::Trap => write!(f, "trap: {}", self.message),
            FaultKind::Status => write!(f, "status: {}", self.message),
            FaultKind::Memory => write!(f, "memory fault: {}", self.message),
        }
    }
}

/// Top-level error type for the sandbox crate.
#[derive(Debug, thiserror::Error)]
pub enum WaterError {
    /// No constructor registered for this ABI version.
    #[error("water: unknown version: {0}")]
    UnknownVersion(i32),

    /// Malformed transport module bytecode.
    #[error("water: compile error: {0}")]
    Compile(String),

    /// Module does not conform to the host ABI, or instantiation failed.
    #[error("water: instantiate error: {0}")]
    Instantiate(String),

    /// The managed dialer could not reach its destination.
    #[error("water: {0}")]
    Dial(#[from] DialError),

    /// The guest trapped or reported an error. Fatal to the connection.
    #[error("water: guest fault: {0}")]
    GuestFault(Fault),

    /// A deadline elapsed. The connection stays usable.
    #[error("water: i/o timeout")]
    Timeout,

    /// The connection was closed or has faulted.
    #[error("water: use of closed connection")]
    UseOfClosedConnection,

    /// Host-side resource failure.
    #[error("water: i/o: {0}")]
    Io(#[from] io::Error),
}

impl From<Fault> for WaterError {
    fn from(fault: Fault) -> Self {
        Self::GuestFault(fault)
    }
}

impl WaterError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}

impl From<WaterError> for io::Error {
    fn from(err: WaterError) -> Self {
        match err {
            WaterError::Io(e) => e,
            WaterError::Timeout => io::Error::new(io::ErrorKind::TimedOut, err),
            WaterError::UseOfClosedConnection => io::Error::new(io::ErrorKind::NotConnected, err),
            WaterError::Dial(ref d) => {
                let kind = d.kind();
                io::Error::new(kind, err)
            }
            other => io::Error::other(other),
        }
    }
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, WaterError>;
