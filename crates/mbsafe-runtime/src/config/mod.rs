//! Session configuration
//!
//! Compile-time defaults with runtime environment overrides.
//!
//! # Configuration Priority (highest wins)
//!
//! 1. Builder calls
//! 2. Environment variables (`from_env`)
//! 3. Library defaults (`defaults`)
//!
//! # Example
//!
//! ```rust,ignore
//! use mbsafe_runtime::config::SessionConfig;
//!
//! let config = SessionConfig::from_env()
//!     .max_connections(2)
//!     .response_timeout(Duration::from_secs(1));
//! let session = ModbusTcpPi::with_config("::0", "1502", &config)?;
//! ```

pub mod defaults;

use std::time::Duration;

use mbsafe_core::env::{env_get, env_get_bool, env_get_millis, env_get_opt};

/// Session configuration with builder pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// How long a client waits for a response
    pub response_timeout: Duration,
    /// Maximum gap between two bytes of one frame
    pub byte_timeout: Duration,
    /// Connection ceiling for `listen`
    pub max_connections: usize,
    /// Engine debug mode (frame dumps)
    pub debug: bool,
    /// Slave id applied at construction
    pub slave_id: Option<u8>,
    /// Slave shutdown handshake timeout
    pub close_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionConfig {
    /// Library defaults, no environment lookup.
    pub fn new() -> Self {
        Self {
            response_timeout: Duration::from_millis(defaults::RESPONSE_TIMEOUT_MS),
            byte_timeout: Duration::from_millis(defaults::BYTE_TIMEOUT_MS),
            max_connections: defaults::MAX_CONNECTIONS,
            debug: defaults::DEBUG,
            slave_id: defaults::SLAVE_ID,
            close_timeout: Duration::from_millis(defaults::CLOSE_TIMEOUT_MS),
        }
    }

    /// Defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `MBS_RESPONSE_TIMEOUT_MS` - Response timeout in milliseconds
    /// - `MBS_BYTE_TIMEOUT_MS` - Inter-byte timeout in milliseconds
    /// - `MBS_MAX_CONNECTIONS` - Connection ceiling of a listening server
    /// - `MBS_DEBUG` - Engine frame dumps (0/1)
    /// - `MBS_SLAVE_ID` - Slave id
    /// - `MBS_CLOSE_TIMEOUT_MS` - Slave shutdown timeout in milliseconds
    pub fn from_env() -> Self {
        let base = Self::new();
        Self {
            response_timeout: env_get_millis("MBS_RESPONSE_TIMEOUT_MS", base.response_timeout),
            byte_timeout: env_get_millis("MBS_BYTE_TIMEOUT_MS", base.byte_timeout),
            max_connections: env_get("MBS_MAX_CONNECTIONS", base.max_connections),
            debug: env_get_bool("MBS_DEBUG", base.debug),
            slave_id: env_get_opt("MBS_SLAVE_ID").or(base.slave_id),
            close_timeout: env_get_millis("MBS_CLOSE_TIMEOUT_MS", base.close_timeout),
        }
    }

    // Builder methods

    pub fn response_timeout(mut self, d: Duration) -> Self {
        self.response_timeout = d;
        self
    }

    pub fn byte_timeout(mut self, d: Duration) -> Self {
        self.byte_timeout = d;
        self
    }

    pub fn max_connections(mut self, n: usize) -> Self {
        self.max_connections = n;
        self
    }

    pub fn debug(mut self, enable: bool) -> Self {
        self.debug = enable;
        self
    }

    pub fn slave_id(mut self, id: u8) -> Self {
        self.slave_id = Some(id);
        self
    }

    pub fn close_timeout(mut self, d: Duration) -> Self {
        self.close_timeout = d;
        self
    }

    /// Validate configuration and return errors if invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError::InvalidValue("max_connections must be > 0"));
        }
        if self.response_timeout.is_zero() {
            return Err(ConfigError::InvalidValue("response_timeout must be > 0"));
        }
        if self.slave_id.is_some_and(|id| id > 247 && id != 255) {
            return Err(ConfigError::InvalidValue("slave_id must be 0..=247 or 255"));
        }
        Ok(())
    }

    /// Print configuration (for debugging)
    pub fn print(&self) {
        mbsafe_core::kprintln!("mbsafe Configuration:");
        mbsafe_core::kprintln!("  response_timeout:  {:?}", self.response_timeout);
        mbsafe_core::kprintln!("  byte_timeout:      {:?}", self.byte_timeout);
        mbsafe_core::kprintln!("  max_connections:   {}", self.max_connections);
        mbsafe_core::kprintln!("  debug:             {}", self.debug);
        mbsafe_core::kprintln!("  slave_id:          {:?}", self.slave_id);
        mbsafe_core::kprintln!("  close_timeout:     {:?}", self.close_timeout);
    }
}

/// Configuration error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    InvalidValue(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidValue(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_valid() {
        let config = SessionConfig::new();
        assert_eq!(config.max_connections, defaults::MAX_CONNECTIONS);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = SessionConfig::new()
            .max_connections(2)
            .response_timeout(Duration::from_millis(50))
            .slave_id(17)
            .debug(true);

        assert_eq!(config.max_connections, 2);
        assert_eq!(config.response_timeout, Duration::from_millis(50));
        assert_eq!(config.slave_id, Some(17));
        assert!(config.debug);
    }

    #[test]
    fn test_validation() {
        assert!(SessionConfig::new().max_connections(0).validate().is_err());
        assert!(SessionConfig::new().slave_id(250).validate().is_err());
        assert!(SessionConfig::new().slave_id(255).validate().is_ok());
        assert!(SessionConfig::new()
            .response_timeout(Duration::ZERO)
            .validate()
            .is_err());
    }

    #[test]
    fn test_from_env_override() {
        std::env::set_var("MBS_MAX_CONNECTIONS", "9");
        std::env::set_var("MBS_RESPONSE_TIMEOUT_MS", "1500");
        let config = SessionConfig::from_env();
        std::env::remove_var("MBS_MAX_CONNECTIONS");
        std::env::remove_var("MBS_RESPONSE_TIMEOUT_MS");

        assert_eq!(config.max_connections, 9);
        assert_eq!(config.response_timeout, Duration::from_millis(1500));
    }
}
