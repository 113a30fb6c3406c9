//! Server Configuration Module
//!
//! Listener addresses, long-poll keepalive, history capacity and login
//! limits. Loaded from environment variables with defaults suitable for
//! development.

use meridian_core::ConfigError;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the protocol listener binds to.
    pub bind: SocketAddr,

    /// Optional Unix-domain socket path (Unix platforms only).
    pub unix_socket: Option<PathBuf>,

    /// Whether TCP connections are considered secure (TLS terminated upstream).
    pub secure: bool,

    /// Long-poll wait before an empty keepalive is sent.
    pub keepalive: Duration,

    /// Number of entries kept in the command history ring.
    pub history_capacity: usize,

    /// Handshake attempts allowed per connection.
    pub max_login_attempts: u32,

    /// Concurrent background-class operations.
    pub background_permits: usize,

    /// Optional admin HTTP listener (health and metrics).
    pub admin_bind: Option<SocketAddr>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 4582)),
            unix_socket: None,
            secure: false,
            keepalive: Duration::from_secs(60),
            history_capacity: 100,
            max_login_attempts: 3,
            background_permits: 2,
            admin_bind: None,
        }
    }
}

fn parse_var<T: std::str::FromStr>(name: &str) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                field: name.to_string(),
                value,
                reason: e.to_string(),
            }),
        _ => Ok(None),
    }
}

impl ServerConfig {
    /// Create ServerConfig from environment variables.
    ///
    /// Environment variables:
    /// - `MERIDIAN_BIND`: listener IP (default: 0.0.0.0)
    /// - `MERIDIAN_PORT`: listener port (default: 4582)
    /// - `MERIDIAN_UNIX_SOCKET`: Unix socket path (default: none)
    /// - `MERIDIAN_SECURE`: "true" when TLS is terminated upstream (default: false)
    /// - `MERIDIAN_KEEPALIVE_SECS`: long-poll keepalive (default: 60)
    /// - `MERIDIAN_HISTORY_CAPACITY`: history ring size (default: 100)
    /// - `MERIDIAN_MAX_LOGIN_ATTEMPTS`: handshake attempts (default: 3)
    /// - `MERIDIAN_BACKGROUND_PERMITS`: background lane width (default: 2)
    /// - `MERIDIAN_ADMIN_BIND`: admin HTTP address, e.g. 127.0.0.1:9090 (default: disabled)
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let ip = parse_var::<std::net::IpAddr>("MERIDIAN_BIND")?.unwrap_or(defaults.bind.ip());
        let port = parse_var::<u16>("MERIDIAN_PORT")?.unwrap_or(defaults.bind.port());

        let unix_socket = std::env::var("MERIDIAN_UNIX_SOCKET")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from);

        let secure = std::env::var("MERIDIAN_SECURE")
            .ok()
            .map(|s| s.to_lowercase() == "true")
            .unwrap_or(defaults.secure);

        let keepalive = parse_var::<u64>("MERIDIAN_KEEPALIVE_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.keepalive);

        let history_capacity =
            parse_var::<usize>("MERIDIAN_HISTORY_CAPACITY")?.unwrap_or(defaults.history_capacity);
        let max_login_attempts = parse_var::<u32>("MERIDIAN_MAX_LOGIN_ATTEMPTS")?
            .unwrap_or(defaults.max_login_attempts);
        let background_permits = parse_var::<usize>("MERIDIAN_BACKGROUND_PERMITS")?
            .unwrap_or(defaults.background_permits);
        let admin_bind = parse_var::<SocketAddr>("MERIDIAN_ADMIN_BIND")?;

        let config = Self {
            bind: SocketAddr::new(ip, port),
            unix_socket,
            secure,
            keepalive,
            history_capacity,
            max_login_attempts,
            background_permits,
            admin_bind,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.keepalive.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "MERIDIAN_KEEPALIVE_SECS".to_string(),
                value: "0".to_string(),
                reason: "keepalive must be positive".to_string(),
            });
        }
        if self.history_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "MERIDIAN_HISTORY_CAPACITY".to_string(),
                value: "0".to_string(),
                reason: "history ring needs at least one slot".to_string(),
            });
        }
        if self.max_login_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "MERIDIAN_MAX_LOGIN_ATTEMPTS".to_string(),
                value: "0".to_string(),
                reason: "at least one attempt is required".to_string(),
            });
        }
        if self.background_permits == 0 {
            return Err(ConfigError::InvalidValue {
                field: "MERIDIAN_BACKGROUND_PERMITS".to_string(),
                value: "0".to_string(),
                reason: "background lane needs at least one permit".to_string(),
            });
        }
        Ok(())
    }
}
