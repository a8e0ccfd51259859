//! Server configuration
//!
//! Library defaults with runtime environment overrides.
//!
//! # Configuration Priority (highest wins)
//!
//! 1. Builder calls
//! 2. Environment variables (`from_env()` only)
//! 3. Library defaults
//!
//! # Example
//!
//! ```rust,ignore
//! use rpcd_server::ServerConfig;
//!
//! let config = ServerConfig::from_env()
//!     .backlog(64)
//!     .accept_retry_interval(Duration::from_millis(250));
//! config.validate()?;
//! ```

pub mod defaults;

use std::fmt;
use std::time::Duration;

use rpcd_core::{env_get, env_get_bool};

use crate::error::ConfigError;

/// Server configuration with builder pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// listen(2) backlog used by `Server::bind`
    pub backlog: i32,
    /// How long the listener stays unmonitored after a failed accept
    pub accept_retry_interval: Duration,
    /// Free descriptors required to admit a connection (0 disables the check)
    pub fd_reserve: usize,
    /// Register the introspection methods when the server is built
    pub introspection: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            backlog: defaults::BACKLOG,
            accept_retry_interval: Duration::from_millis(defaults::ACCEPT_RETRY_MS),
            fd_reserve: defaults::FD_RESERVE,
            introspection: defaults::INTROSPECTION,
        }
    }
}

impl ServerConfig {
    /// Library defaults, no environment lookups.
    pub fn new() -> Self {
        Self::default()
    }

    /// Library defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `RPCD_BACKLOG` - listen(2) backlog
    /// - `RPCD_ACCEPT_RETRY_MS` - accept retry interval in milliseconds
    /// - `RPCD_FD_RESERVE` - free descriptor reserve
    /// - `RPCD_INTROSPECTION` - register introspection methods (0/1, true/false)
    pub fn from_env() -> Self {
        Self {
            backlog: env_get("RPCD_BACKLOG", defaults::BACKLOG),
            accept_retry_interval: Duration::from_millis(env_get(
                "RPCD_ACCEPT_RETRY_MS",
                defaults::ACCEPT_RETRY_MS,
            )),
            fd_reserve: env_get("RPCD_FD_RESERVE", defaults::FD_RESERVE),
            introspection: env_get_bool("RPCD_INTROSPECTION", defaults::INTROSPECTION),
        }
    }

    pub fn backlog(mut self, backlog: i32) -> Self {
        self.backlog = backlog;
        self
    }

    pub fn accept_retry_interval(mut self, d: Duration) -> Self {
        self.accept_retry_interval = d;
        self
    }

    pub fn fd_reserve(mut self, reserve: usize) -> Self {
        self.fd_reserve = reserve;
        self
    }

    pub fn introspection(mut self, enable: bool) -> Self {
        self.introspection = enable;
        self
    }

    /// Validate configuration and return errors if invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backlog <= 0 {
            return Err(ConfigError::InvalidValue("backlog must be > 0"));
        }
        if self.accept_retry_interval.is_zero() {
            return Err(ConfigError::InvalidValue("accept_retry_interval must be > 0"));
        }
        Ok(())
    }

    /// Log the effective configuration.
    pub fn log(&self) {
        tracing::debug!(
            backlog = self.backlog,
            accept_retry_ms = self.accept_retry_interval.as_millis() as u64,
            fd_reserve = self.fd_reserve,
            introspection = self.introspection,
            "server configuration"
        );
    }
}

impl fmt::Display for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ServerConfig {{ backlog: {}, accept_retry: {:?}, fd_reserve: {}, introspection: {} }}",
            self.backlog, self.accept_retry_interval, self.fd_reserve, self.introspection
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::new();
        assert_eq!(config.backlog, 5);
        assert_eq!(config.accept_retry_interval, Duration::from_secs(1));
        assert_eq!(config.fd_reserve, 32);
        assert!(!config.introspection);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_env_keeps_unset_defaults() {
        // Nothing in the test environment sets this one
        let config = ServerConfig::from_env();
        if std::env::var_os("RPCD_ACCEPT_RETRY_MS").is_none() {
            assert_eq!(config.accept_retry_interval, Duration::from_secs(1));
        }
    }

    #[test]
    fn test_builder() {
        let config = ServerConfig::new()
            .backlog(128)
            .accept_retry_interval(Duration::from_millis(250))
            .fd_reserve(0)
            .introspection(true);

        assert_eq!(config.backlog, 128);
        assert_eq!(config.accept_retry_interval, Duration::from_millis(250));
        assert_eq!(config.fd_reserve, 0);
        assert!(config.introspection);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        let err = ServerConfig::new().backlog(0).validate().unwrap_err();
        assert_eq!(err, ConfigError::InvalidValue("backlog must be > 0"));

        let config = ServerConfig::new().accept_retry_interval(Duration::ZERO);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_display() {
        let s = ServerConfig::new().to_string();
        assert!(s.contains("backlog: 5"), "{}", s);
    }
}
