//! # mbsafe - Thread-safe Modbus sessions
//!
//! A concurrency and socket-lifecycle layer in front of a blocking Modbus
//! protocol engine (TCP-PI or RTU).
//!
//! ## Features
//!
//! - **Serialized access**: every engine call runs under a reentrant,
//!   per-session lock; callers can hold it across several calls
//! - **Cancellable waits**: `receive`, `accept` and `select_read` wait on a
//!   self-pipe as well as the sockets, so `close` from another thread
//!   unblocks them
//! - **Bounded connections**: accepted sockets are tracked in a fixed-size
//!   registry; peers past capacity are closed right away
//! - **Shared mappings**: the coil/register tables the engine answers from
//!   are the same memory the application reads and writes
//! - **Slave loop**: [`ModbusSlave`] serves many masters from one thread and
//!   pulls data from a [`SlaveProcessor`]
//!
//! ## Quick Start
//!
//! ```ignore
//! use mbsafe::ModbusTcpPi;
//!
//! let client = ModbusTcpPi::new_tcp_pi("127.0.0.1", "1502")?;
//! client.connect()?;
//! let mut regs = [0u16; 4];
//! client.read_registers(0, &mut regs)?;
//! client.close()?;
//! ```
//!
//! Serving a field list:
//!
//! ```ignore
//! use mbsafe::{field::FieldProcessor, ModbusSlave};
//!
//! let mut slave = ModbusSlave::new(FieldProcessor::new(fields, handler), 4);
//! slave.open(502)?;
//! slave.run()?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 ModbusSlave / RtuGateway                    │
//! │        accept, dispatch, per-request mapping sizing         │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     ProtocolSession                         │
//! │   reentrant lock, socket registry, cancellable poller       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!          ┌───────────────────┴───────────────────┐
//!          ▼                                       ▼
//!    ┌───────────┐                           ┌───────────┐
//!    │  TCP-PI   │                           │    RTU    │
//!    │  engine   │                           │  engine   │
//!    └───────────┘                           └───────────┘
//! ```

pub mod field;
pub mod gateway;
pub mod slave;

// Re-export core types
pub use mbsafe_core::{
    ErrorCode,
    Exception,
    ExceptionCode,
    FunctionCode,
    ListeningEngine,
    LockError,
    Mapping,
    MappingId,
    ModbusError,
    ProtocolEngine,
    ReentrantLock,
    Result,
    ScopedLockGuard,
    SerialEngine,
    SerialMode,
    SocketRegistry,
};
pub use mbsafe_core::{constants, values};
pub use mbsafe_core::exception;

// Re-export logging macros
pub use mbsafe_core::{kprintln, kerror, kwarn, kinfo, kdebug, ktrace};
pub use mbsafe_core::kprint::{LogLevel, init as init_logging, level_enabled, set_log_level};

// Re-export env utilities
pub use mbsafe_core::{env_get, env_get_bool, env_get_millis, env_get_opt};

// Re-export runtime types
pub use mbsafe_runtime::{
    CancellablePoller,
    ConfigError,
    ModbusRtu,
    ModbusTcpPi,
    Parity,
    ProtocolSession,
    SessionConfig,
    SessionLock,
    WaitOutcome,
    WaitState,
};

pub use field::{DataType, Field, FieldHandler, FieldProcessor, FieldValue, RegisterType};
pub use gateway::RtuGateway;
pub use slave::{ModbusSlave, SlaveError, SlaveHandle, SlaveProcessor};
