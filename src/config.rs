//! TOML-based daemon configuration.

use std::fs;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

/// Top-level daemon configuration parsed from TOML.
///
/// All fields have defaults matching a Datamanager on the local network and
/// an unauthenticated openHAB instance. Load from TOML with
/// [`AppConfig::from_toml_file`] or use [`AppConfig::default`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Modbus TCP endpoint parameters.
    #[serde(default)]
    pub modbus: ModbusConfig,
    /// openHAB gateway parameters.
    #[serde(default)]
    pub gateway: GatewayConfig,
    /// Poll cadence parameters.
    #[serde(default)]
    pub poll: PollConfig,
}

/// Modbus TCP endpoint parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ModbusConfig {
    /// Datamanager host name or address.
    pub host: String,
    /// Modbus TCP port.
    pub port: u16,
    /// Per-read timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for ModbusConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 502,
            timeout_secs: 5,
        }
    }
}

impl ModbusConfig {
    /// Resolves the configured endpoint to a socket address.
    ///
    /// # Errors
    ///
    /// Returns an `io::Error` when resolution fails or yields no address.
    pub fn socket_addr(&self) -> io::Result<SocketAddr> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no address for {}:{}", self.host, self.port),
                )
            })
    }
}

/// openHAB gateway parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GatewayConfig {
    /// Base URL of the openHAB instance.
    pub base_url: String,
    /// Optional API token sent as a bearer header.
    pub api_token: Option<String>,
    /// HTTP request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            api_token: None,
            timeout_secs: 10,
        }
    }
}

/// Poll cadence parameters, counted in ticks of `tick_secs` seconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PollConfig {
    /// Seconds per scheduler tick.
    pub tick_secs: u64,
    /// Storage batch fetch period (ticks).
    pub storage_period_ticks: u64,
    /// Medium queue drain period (ticks).
    pub medium_send_ticks: u64,
    /// Slow queue drain period (ticks).
    pub slow_send_ticks: u64,
    /// Modbus reconnect period (ticks).
    pub reconnect_ticks: u64,
    /// Stop after this many ticks; `None` runs until killed.
    pub cycles: Option<u64>,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            tick_secs: 2,
            storage_period_ticks: 30,
            medium_send_ticks: 30,
            slow_send_ticks: 150,
            reconnect_ticks: 200,
            cycles: None,
        }
    }
}

/// Configuration error with field path and constraint description.
#[derive(Debug, Error)]
#[error("config error: {field} — {message}")]
pub struct ConfigError {
    /// Dotted field path (e.g., `"poll.tick_secs"`).
    pub field: String,
    /// Human-readable constraint description.
    pub message: String,
}

impl AppConfig {
    /// Parses a configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if the file cannot be read or the TOML is
    /// invalid.
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError {
            field: "config".to_string(),
            message: format!("cannot read \"{}\": {e}", path.display()),
        })?;
        Self::from_toml_str(&content)
    }

    /// Parses a configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if the TOML is invalid or contains unknown
    /// fields.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        toml::from_str(s).map_err(|e| ConfigError {
            field: "toml".to_string(),
            message: e.to_string(),
        })
    }

    /// Validates all fields and returns a list of errors.
    ///
    /// Returns an empty vector if the configuration is valid.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();

        if self.modbus.host.is_empty() {
            errors.push(ConfigError {
                field: "modbus.host".into(),
                message: "must not be empty".into(),
            });
        }
        if self.modbus.timeout_secs == 0 {
            errors.push(ConfigError {
                field: "modbus.timeout_secs".into(),
                message: "must be > 0".into(),
            });
        }

        if self.gateway.base_url.is_empty() {
            errors.push(ConfigError {
                field: "gateway.base_url".into(),
                message: "must not be empty".into(),
            });
        }
        if self.gateway.timeout_secs == 0 {
            errors.push(ConfigError {
                field: "gateway.timeout_secs".into(),
                message: "must be > 0".into(),
            });
        }

        let p = &self.poll;
        if p.tick_secs == 0 {
            errors.push(ConfigError {
                field: "poll.tick_secs".into(),
                message: "must be > 0".into(),
            });
        }
        for (field, ticks) in [
            ("poll.storage_period_ticks", p.storage_period_ticks),
            ("poll.medium_send_ticks", p.medium_send_ticks),
            ("poll.slow_send_ticks", p.slow_send_ticks),
            ("poll.reconnect_ticks", p.reconnect_ticks),
        ] {
            if ticks == 0 {
                errors.push(ConfigError {
                    field: field.into(),
                    message: "must be > 0".into(),
                });
            }
        }

        errors
    }
}
