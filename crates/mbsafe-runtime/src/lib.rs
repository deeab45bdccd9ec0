//! # mbsafe-runtime
//!
//! Platform-specific runtime for mbsafe.
//!
//! This crate provides:
//! - The self-pipe poller used to cancel blocking readiness waits
//! - Default protocol engines (Modbus TCP-PI and Modbus RTU)
//! - `ProtocolSession`, the thread-safe front of an engine
//! - Session configuration (defaults + environment overrides)

pub mod config;
pub mod engine;
pub mod poller;
pub mod session;

// Re-exports
pub use config::{ConfigError, SessionConfig};
pub use engine::{ModbusEngine, Parity, RtuEngine, TcpEngine, Transport};
pub use poller::{CancellablePoller, WaitOutcome};
pub use session::{ModbusRtu, ModbusTcpPi, ProtocolSession, SessionLock, WaitState};

// Platform detection
cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        // errno access, accept4 and TIOCSRS485 are Linux interfaces
    } else {
        compile_error!("Unsupported platform");
    }
}
