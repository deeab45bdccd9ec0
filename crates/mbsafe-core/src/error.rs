//! Error types for mbsafe sessions

use core::fmt;
use std::os::unix::io::RawFd;

use crate::codes::ErrorCode;
use crate::mapping::MappingId;

/// Result type for session operations
pub type Result<T> = core::result::Result<T, ModbusError>;

/// Result type for protocol engine primitives
pub type EngineResult<T> = core::result::Result<T, ErrorCode>;

/// Errors that can occur in session operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModbusError {
    /// The session lock could not be created or acquired
    Lock(LockError),

    /// Socket registry is at its ceiling
    Capacity { capacity: usize },

    /// Descriptor is not tracked by this session
    UnknownSocket(RawFd),

    /// Mapping was not created by this session or was already freed
    UnknownMapping(MappingId),

    /// A readiness wait was aborted by a concurrent close or cancel signal
    Cancelled,

    /// The protocol engine reported a failure
    Engine(ErrorCode),

    /// The session has been released
    UseAfterRelease,

    /// Server operation on a session that is not listening
    NotListening,

    /// Argument rejected before reaching the engine
    InvalidArgument(&'static str),
}

impl ModbusError {
    /// True if this is a cancelled wait rather than a real I/O failure.
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ModbusError::Cancelled)
    }

    /// Engine error code, if the failure came from the engine.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            ModbusError::Engine(code) => Some(*code),
            _ => None,
        }
    }

    /// True if the engine reported that the peer went away.
    pub fn is_disconnect(&self) -> bool {
        self.code().is_some_and(ErrorCode::is_disconnect)
    }
}

impl fmt::Display for ModbusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModbusError::Lock(e) => write!(f, "lock error: {}", e),
            ModbusError::Capacity { capacity } => {
                write!(f, "socket registry full (capacity {})", capacity)
            }
            ModbusError::UnknownSocket(fd) => write!(f, "unknown socket {}", fd),
            ModbusError::UnknownMapping(id) => write!(f, "unknown mapping {}", id),
            ModbusError::Cancelled => write!(f, "wait cancelled"),
            ModbusError::Engine(code) => write!(f, "engine error: {}", code),
            ModbusError::UseAfterRelease => write!(f, "session already released"),
            ModbusError::NotListening => write!(f, "session is not listening"),
            ModbusError::InvalidArgument(what) => write!(f, "invalid argument: {}", what),
        }
    }
}

impl std::error::Error for ModbusError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ModbusError::Lock(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ErrorCode> for ModbusError {
    fn from(code: ErrorCode) -> Self {
        ModbusError::Engine(code)
    }
}

impl From<LockError> for ModbusError {
    fn from(e: LockError) -> Self {
        ModbusError::Lock(e)
    }
}

/// Lock-related errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    /// A thread panicked while holding the lock bookkeeping
    Poisoned,

    /// Recursive acquisition depth overflowed
    DepthOverflow,
}

impl fmt::Display for LockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockError::Poisoned => write!(f, "lock state poisoned"),
            LockError::DepthOverflow => write!(f, "recursive lock depth overflow"),
        }
    }
}

impl std::error::Error for LockError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codes::ExceptionCode;

    #[test]
    fn test_error_display() {
        let e = ModbusError::Capacity { capacity: 2 };
        assert_eq!(format!("{}", e), "socket registry full (capacity 2)");

        let e = ModbusError::Lock(LockError::Poisoned);
        assert_eq!(format!("{}", e), "lock error: lock state poisoned");
    }

    #[test]
    fn test_cancelled_is_not_engine_error() {
        let e = ModbusError::Cancelled;
        assert!(e.is_cancelled());
        assert_eq!(e.code(), None);

        let e: ModbusError = ErrorCode::TimedOut.into();
        assert!(!e.is_cancelled());
        assert_eq!(e.code(), Some(ErrorCode::TimedOut));
    }

    #[test]
    fn test_disconnect() {
        let e: ModbusError = ErrorCode::ConnectionReset.into();
        assert!(e.is_disconnect());
        let e: ModbusError = ErrorCode::Exception(ExceptionCode::IllegalFunction).into();
        assert!(!e.is_disconnect());
    }
}
