//! Closed enumerations for function codes, exception codes and error numbers
//!
//! Engine-native error numbers (POSIX errno values plus the Modbus block
//! starting at [`ENOBASE`]) are normalized into [`ErrorCode`] so callers can
//! match exhaustively instead of comparing magic integers.

use core::fmt;
use std::borrow::Cow;

// Linux errno values surfaced by the engines.
pub const ERRNO_EAGAIN: i32 = 11;
pub const ERRNO_EPIPE: i32 = 32;
pub const ERRNO_ECONNRESET: i32 = 104;
pub const ERRNO_ETIMEDOUT: i32 = 110;
pub const ERRNO_ECONNREFUSED: i32 = 111;

/// Base of the Modbus-specific error number block.
pub const ENOBASE: i32 = 112_345_678;

/// Modbus function codes handled by the engines.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FunctionCode {
    ReadCoils = 1,
    ReadDiscreteInputs = 2,
    ReadHoldingRegisters = 3,
    ReadInputRegisters = 4,
    WriteSingleCoil = 5,
    WriteSingleRegister = 6,
    WriteMultipleCoils = 15,
    WriteMultipleRegisters = 16,
    WriteAndReadRegisters = 23,
}

impl FunctionCode {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(FunctionCode::ReadCoils),
            2 => Some(FunctionCode::ReadDiscreteInputs),
            3 => Some(FunctionCode::ReadHoldingRegisters),
            4 => Some(FunctionCode::ReadInputRegisters),
            5 => Some(FunctionCode::WriteSingleCoil),
            6 => Some(FunctionCode::WriteSingleRegister),
            15 => Some(FunctionCode::WriteMultipleCoils),
            16 => Some(FunctionCode::WriteMultipleRegisters),
            23 => Some(FunctionCode::WriteAndReadRegisters),
            _ => None,
        }
    }

    #[inline]
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Plain read requests (1 to 4).
    pub fn is_read(self) -> bool {
        matches!(
            self,
            FunctionCode::ReadCoils
                | FunctionCode::ReadDiscreteInputs
                | FunctionCode::ReadHoldingRegisters
                | FunctionCode::ReadInputRegisters
        )
    }

    /// Plain write requests (5, 6, 15, 16).
    pub fn is_write(self) -> bool {
        matches!(
            self,
            FunctionCode::WriteSingleCoil
                | FunctionCode::WriteSingleRegister
                | FunctionCode::WriteMultipleCoils
                | FunctionCode::WriteMultipleRegisters
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            FunctionCode::ReadCoils => "READ_COILS",
            FunctionCode::ReadDiscreteInputs => "READ_DISCRETE_INPUTS",
            FunctionCode::ReadHoldingRegisters => "READ_HOLDING_REGISTERS",
            FunctionCode::ReadInputRegisters => "READ_INPUT_REGISTERS",
            FunctionCode::WriteSingleCoil => "WRITE_SINGLE_COIL",
            FunctionCode::WriteSingleRegister => "WRITE_SINGLE_REGISTER",
            FunctionCode::WriteMultipleCoils => "WRITE_MULTIPLE_COILS",
            FunctionCode::WriteMultipleRegisters => "WRITE_MULTIPLE_REGISTERS",
            FunctionCode::WriteAndReadRegisters => "WRITE_AND_READ_REGISTERS",
        }
    }
}

impl fmt::Display for FunctionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Protocol exception codes carried in exception responses.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExceptionCode {
    IllegalFunction = 1,
    IllegalDataAddress = 2,
    IllegalDataValue = 3,
    SlaveOrServerFailure = 4,
    Acknowledge = 5,
    SlaveOrServerBusy = 6,
    NegativeAcknowledge = 7,
    MemoryParity = 8,
    NotDefined = 9,
    GatewayPath = 10,
    GatewayTarget = 11,
}

impl ExceptionCode {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(ExceptionCode::IllegalFunction),
            2 => Some(ExceptionCode::IllegalDataAddress),
            3 => Some(ExceptionCode::IllegalDataValue),
            4 => Some(ExceptionCode::SlaveOrServerFailure),
            5 => Some(ExceptionCode::Acknowledge),
            6 => Some(ExceptionCode::SlaveOrServerBusy),
            7 => Some(ExceptionCode::NegativeAcknowledge),
            8 => Some(ExceptionCode::MemoryParity),
            9 => Some(ExceptionCode::NotDefined),
            10 => Some(ExceptionCode::GatewayPath),
            11 => Some(ExceptionCode::GatewayTarget),
            _ => None,
        }
    }

    #[inline]
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn description(self) -> &'static str {
        match self {
            ExceptionCode::IllegalFunction => "Illegal function",
            ExceptionCode::IllegalDataAddress => "Illegal data address",
            ExceptionCode::IllegalDataValue => "Illegal data value",
            ExceptionCode::SlaveOrServerFailure => "Slave device or server failure",
            ExceptionCode::Acknowledge => "Acknowledge",
            ExceptionCode::SlaveOrServerBusy => "Slave device or server is busy",
            ExceptionCode::NegativeAcknowledge => "Negative acknowledge",
            ExceptionCode::MemoryParity => "Memory parity error",
            ExceptionCode::NotDefined => "Not defined",
            ExceptionCode::GatewayPath => "Gateway path unavailable",
            ExceptionCode::GatewayTarget => "Target device failed to respond",
        }
    }
}

/// Stable, cross-platform error number.
///
/// `raw()` reproduces the engine-native number; `from_raw()` is its inverse.
/// Protocol exceptions live at `ENOBASE + exception code`, the synthetic
/// framing errors directly above them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// EAGAIN: try again
    WouldBlock,
    /// EPIPE
    BrokenPipe,
    /// ECONNRESET: connection reset by peer
    ConnectionReset,
    /// ETIMEDOUT
    TimedOut,
    /// ECONNREFUSED
    ConnectionRefused,
    /// Exception response received from (or sent by) a server.
    Exception(ExceptionCode),
    /// ENOBASE + 12: CRC mismatch
    BadCrc,
    /// ENOBASE + 13: invalid transaction or protocol id, malformed data
    BadData,
    /// ENOBASE + 14: invalid exception code
    BadException,
    /// ENOBASE + 15: unknown exception code
    UnknownException,
    /// ENOBASE + 16: too many data
    TooMuchData,
    /// ENOBASE + 17: response not from requested slave
    BadSlave,
    /// Any other OS errno, kept verbatim.
    Os(i32),
}

const EMBBADCRC: i32 = ENOBASE + 12;
const EMBBADDATA: i32 = ENOBASE + 13;
const EMBBADEXC: i32 = ENOBASE + 14;
const EMBUNKEXC: i32 = ENOBASE + 15;
const EMBMDATA: i32 = ENOBASE + 16;
const EMBBADSLAVE: i32 = ENOBASE + 17;

impl ErrorCode {
    /// Normalize an OS errno.
    pub fn from_errno(errno: i32) -> Self {
        match errno {
            ERRNO_EAGAIN => ErrorCode::WouldBlock,
            ERRNO_EPIPE => ErrorCode::BrokenPipe,
            ERRNO_ECONNRESET => ErrorCode::ConnectionReset,
            ERRNO_ETIMEDOUT => ErrorCode::TimedOut,
            ERRNO_ECONNREFUSED => ErrorCode::ConnectionRefused,
            other => ErrorCode::Os(other),
        }
    }

    /// Normalize any engine-native error number (errno or Modbus block).
    pub fn from_raw(raw: i32) -> Self {
        if raw > ENOBASE && raw <= ENOBASE + 11 {
            // range checked above
            if let Some(exc) = ExceptionCode::from_u8((raw - ENOBASE) as u8) {
                return ErrorCode::Exception(exc);
            }
        }
        match raw {
            EMBBADCRC => ErrorCode::BadCrc,
            EMBBADDATA => ErrorCode::BadData,
            EMBBADEXC => ErrorCode::BadException,
            EMBUNKEXC => ErrorCode::UnknownException,
            EMBMDATA => ErrorCode::TooMuchData,
            EMBBADSLAVE => ErrorCode::BadSlave,
            other => ErrorCode::from_errno(other),
        }
    }

    /// Engine-native number.
    pub fn raw(self) -> i32 {
        match self {
            ErrorCode::WouldBlock => ERRNO_EAGAIN,
            ErrorCode::BrokenPipe => ERRNO_EPIPE,
            ErrorCode::ConnectionReset => ERRNO_ECONNRESET,
            ErrorCode::TimedOut => ERRNO_ETIMEDOUT,
            ErrorCode::ConnectionRefused => ERRNO_ECONNREFUSED,
            ErrorCode::Exception(exc) => ENOBASE + exc.as_u8() as i32,
            ErrorCode::BadCrc => EMBBADCRC,
            ErrorCode::BadData => EMBBADDATA,
            ErrorCode::BadException => EMBBADEXC,
            ErrorCode::UnknownException => EMBUNKEXC,
            ErrorCode::TooMuchData => EMBMDATA,
            ErrorCode::BadSlave => EMBBADSLAVE,
            ErrorCode::Os(errno) => errno,
        }
    }

    /// Capture `errno` of the last failed syscall on this thread.
    pub fn last_os_error() -> Self {
        Self::from_errno(std::io::Error::last_os_error().raw_os_error().unwrap_or(0))
    }

    /// Human-readable text, the `strerror` of this namespace.
    pub fn description(self) -> Cow<'static, str> {
        match self {
            ErrorCode::WouldBlock => Cow::Borrowed("Resource temporarily unavailable"),
            ErrorCode::BrokenPipe => Cow::Borrowed("Broken pipe"),
            ErrorCode::ConnectionReset => Cow::Borrowed("Connection reset by peer"),
            ErrorCode::TimedOut => Cow::Borrowed("Connection timed out"),
            ErrorCode::ConnectionRefused => Cow::Borrowed("Connection refused"),
            ErrorCode::Exception(exc) => Cow::Borrowed(exc.description()),
            ErrorCode::BadCrc => Cow::Borrowed("Invalid CRC"),
            ErrorCode::BadData => Cow::Borrowed("Invalid data"),
            ErrorCode::BadException => Cow::Borrowed("Invalid exception code"),
            ErrorCode::UnknownException => Cow::Borrowed("Unknown exception code"),
            ErrorCode::TooMuchData => Cow::Borrowed("Too many data"),
            ErrorCode::BadSlave => Cow::Borrowed("Response not from requested slave"),
            ErrorCode::Os(errno) => {
                Cow::Owned(std::io::Error::from_raw_os_error(errno).to_string())
            }
        }
    }

    /// True for failures that mean the peer is gone.
    pub fn is_disconnect(self) -> bool {
        matches!(self, ErrorCode::ConnectionReset | ErrorCode::BrokenPipe)
    }
}

impl From<ExceptionCode> for ErrorCode {
    fn from(exc: ExceptionCode) -> Self {
        ErrorCode::Exception(exc)
    }
}

impl From<std::io::Error> for ErrorCode {
    fn from(err: std::io::Error) -> Self {
        match err.raw_os_error() {
            Some(errno) => ErrorCode::from_errno(errno),
            None => match err.kind() {
                std::io::ErrorKind::WouldBlock => ErrorCode::WouldBlock,
                std::io::ErrorKind::BrokenPipe => ErrorCode::BrokenPipe,
                std::io::ErrorKind::ConnectionReset => ErrorCode::ConnectionReset,
                std::io::ErrorKind::TimedOut => ErrorCode::TimedOut,
                std::io::ErrorKind::ConnectionRefused => ErrorCode::ConnectionRefused,
                _ => ErrorCode::BadData,
            },
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.description(), self.raw())
    }
}
