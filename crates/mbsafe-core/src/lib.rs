//! # mbsafe-core
//!
//! Core types and traits for mbsafe, a thread-safe session layer in front of
//! a blocking Modbus protocol engine.
//!
//! This crate contains no syscalls. Sockets, pipes, serial lines and the
//! engines themselves live in `mbsafe-runtime`.
//!
//! ## Modules
//!
//! - `lock` - Reentrant lock and releasable scoped guard
//! - `registry` - Bounded set of active socket descriptors
//! - `mapping` - Shared coil/register tables
//! - `traits` - Protocol engine traits
//! - `codes` - Function codes, exception codes, error numbers
//! - `error` - Error types
//! - `exception` - Chained, located exception values
//! - `values` - Bit/word/float packing helpers
//! - `kprint` - Leveled stderr logging and frame dumps
//! - `env` - Environment variable utilities

cfg_if::cfg_if! {
    if #[cfg(not(unix))] {
        compile_error!("mbsafe requires a unix target (raw descriptors and poll)");
    }
}

pub mod codes;
pub mod env;
pub mod error;
pub mod exception;
pub mod kprint;
pub mod lock;
pub mod mapping;
pub mod registry;
pub mod traits;
pub mod values;

// Re-exports for convenience
pub use codes::{ErrorCode, ExceptionCode, FunctionCode, ENOBASE};
pub use env::{env_get, env_get_bool, env_get_millis, env_get_opt};
pub use error::{EngineResult, LockError, ModbusError, Result};
pub use exception::Exception;
pub use lock::{ReentrantLock, ScopedLockGuard};
pub use mapping::{Mapping, MappingId};
pub use registry::SocketRegistry;
pub use traits::{ListeningEngine, ProtocolEngine, SerialEngine, SerialMode};

/// Protocol limits
pub mod constants {
    /// MBAP header (7) + PDU (253)
    pub const MODBUS_TCP_MAX_ADU_LENGTH: usize = 260;

    /// Address (1) + PDU (253) + CRC (2)
    pub const MODBUS_RTU_MAX_ADU_LENGTH: usize = 256;

    pub const MODBUS_MAX_PDU_LENGTH: usize = 253;

    pub const MODBUS_TCP_HEADER_LENGTH: usize = 7;
    pub const MODBUS_RTU_HEADER_LENGTH: usize = 1;
    pub const MODBUS_RTU_CHECKSUM_LENGTH: usize = 2;

    pub const MODBUS_MAX_READ_BITS: usize = 2000;
    pub const MODBUS_MAX_WRITE_BITS: usize = 1968;
    pub const MODBUS_MAX_READ_REGISTERS: usize = 125;
    pub const MODBUS_MAX_WRITE_REGISTERS: usize = 123;
    pub const MODBUS_MAX_WR_WRITE_REGISTERS: usize = 121;
    pub const MODBUS_MAX_WR_READ_REGISTERS: usize = 125;

    /// Default Modbus TCP port
    pub const MODBUS_TCP_DEFAULT_PORT: u16 = 502;

    /// Slave id addressing every RTU device
    pub const MODBUS_BROADCAST_ADDRESS: u8 = 0;

    /// Unit id used by TCP when no gateway routing is wanted
    pub const MODBUS_TCP_SLAVE: u8 = 0xFF;
}
