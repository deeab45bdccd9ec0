//! Library defaults for session configuration
//!
//! Values mirror what a libmodbus context starts with.

/// Response timeout (0.5 s)
pub const RESPONSE_TIMEOUT_MS: u64 = 500;

/// Inter-byte timeout (0.5 s)
pub const BYTE_TIMEOUT_MS: u64 = 500;

/// Connection ceiling for a listening server
pub const MAX_CONNECTIONS: usize = 5;

/// Engine frame dumps on stderr
pub const DEBUG: bool = false;

/// Slave id; `None` leaves the engine default
pub const SLAVE_ID: Option<u8> = None;

/// How long a slave's `close` waits for its loop to acknowledge
pub const CLOSE_TIMEOUT_MS: u64 = 3000;
