//! Configuration types for rust-tunnel
//!
//! This module defines all configuration structures used by the tunnel.
//! Configuration is loaded from JSON files and can be validated at startup.

use std::net::{Ipv4Addr, SocketAddrV4};

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default FakeTCP tunnel port
pub const DEFAULT_PORT: u16 = 19986;

/// Tunnel role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// LAN-side node intercepting source traffic
    Client,
    /// Public node re-emitting traffic toward destinations
    Server,
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Tunnel role
    pub mode: Mode,

    /// Source CIDRs to intercept (client only)
    #[serde(default)]
    pub sources: Vec<Ipv4Net>,

    /// Server address, e.g. "203.0.113.1:19986" (client only)
    #[serde(default)]
    pub server: Option<SocketAddrV4>,

    /// FakeTCP port: the server's listen port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Client-side local FakeTCP port; random ephemeral when absent
    #[serde(default)]
    pub local_port: Option<u16>,

    /// Upstream device name; auto-selected by gateway subnet when absent
    #[serde(default)]
    pub upstream: Option<String>,

    /// Listen device names; all paired devices when empty
    #[serde(default)]
    pub listen_devices: Vec<String>,

    /// Gateway IPv4 address; the upstream subnet's first host when absent
    #[serde(default)]
    pub gateway: Option<Ipv4Addr>,

    /// Encryption settings
    #[serde(default)]
    pub crypto: CryptoConfig,

    /// NAT settings (server only)
    #[serde(default)]
    pub nat: NatConfig,

    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
}

impl Config {
    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if validation fails.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::ValidationError(
                "Tunnel port must be nonzero".into(),
            ));
        }

        if self.mode == Mode::Client {
            if self.sources.is_empty() {
                return Err(ConfigError::ValidationError(
                    "Client mode requires at least one source CIDR".into(),
                ));
            }
            let server = self.server.ok_or_else(|| {
                ConfigError::ValidationError("Client mode requires a server address".into())
            })?;
            if server.port() == 0 {
                return Err(ConfigError::ValidationError(
                    "Server address must carry a nonzero port".into(),
                ));
            }
            if self.local_port == Some(0) {
                return Err(ConfigError::ValidationError(
                    "Local port must be nonzero when set".into(),
                ));
            }
        }

        self.crypto.validate()?;
        self.nat.validate()?;
        self.log.validate()?;

        Ok(())
    }

    /// Minimal configuration for `mode`; CLI flags fill in the rest
    #[must_use]
    pub fn new(mode: Mode) -> Self {
        Self {
            mode,
            sources: Vec::new(),
            server: None,
            port: DEFAULT_PORT,
            local_port: None,
            upstream: None,
            listen_devices: Vec::new(),
            gateway: None,
            crypto: CryptoConfig::default(),
            nat: NatConfig::default(),
            log: LogConfig::default(),
        }
    }

    /// Create a default configuration suitable for `--generate-config`
    #[must_use]
    pub fn default_config() -> Self {
        Self {
            mode: Mode::Client,
            sources: vec!["192.168.0.0/24".parse().expect("valid default CIDR")],
            server: Some(SocketAddrV4::new(
                Ipv4Addr::new(203, 0, 113, 1),
                DEFAULT_PORT,
            )),
            port: DEFAULT_PORT,
            local_port: None,
            upstream: None,
            listen_devices: Vec::new(),
            gateway: None,
            crypto: CryptoConfig::default(),
            nat: NatConfig::default(),
            log: LogConfig::default(),
        }
    }
}

/// Encryption settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CryptoConfig {
    /// One of: plain, aes-128-gcm, aes-192-gcm, aes-256-gcm,
    /// chacha20-poly1305, xchacha20-poly1305
    #[serde(default = "default_method")]
    pub method: String,

    /// Pre-shared passphrase; required for every method except plain
    #[serde(default)]
    pub password: Option<String>,
}

impl CryptoConfig {
    /// Validate method name and password presence
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` on an unknown method or a
    /// missing password for a non-plain method.
    pub fn validate(&self) -> Result<(), ConfigError> {
        const METHODS: &[&str] = &[
            "plain",
            "aes-128-gcm",
            "aes-192-gcm",
            "aes-256-gcm",
            "chacha20-poly1305",
            "xchacha20-poly1305",
        ];
        if !METHODS.contains(&self.method.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Unknown encryption method: {}",
                self.method
            )));
        }
        if self.method != "plain" && self.password.as_deref().unwrap_or("").is_empty() {
            return Err(ConfigError::ValidationError(format!(
                "Method {} requires a password",
                self.method
            )));
        }
        Ok(())
    }
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            method: default_method(),
            password: None,
        }
    }
}

/// NAT settings (server side)
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NatConfig {
    /// First allocatable port
    #[serde(default = "default_port_min")]
    pub port_min: u16,

    /// Last allocatable port (inclusive)
    #[serde(default = "default_port_max")]
    pub port_max: u16,

    /// Idle seconds after which a UDP or ICMP mapping expires
    #[serde(default = "default_idle_secs")]
    pub idle_timeout_secs: u64,

    /// Idle seconds after which an established TCP mapping expires
    #[serde(default = "default_tcp_established_secs")]
    pub tcp_established_timeout_secs: u64,
}

impl NatConfig {
    /// Validate the port range
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` on an empty or inverted range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port_min == 0 || self.port_min > self.port_max {
            return Err(ConfigError::ValidationError(format!(
                "Invalid NAT port range {}-{}",
                self.port_min, self.port_max
            )));
        }
        Ok(())
    }
}

impl Default for NatConfig {
    fn default() -> Self {
        Self {
            port_min: default_port_min(),
            port_max: default_port_max(),
            idle_timeout_secs: default_idle_secs(),
            tcp_established_timeout_secs: default_tcp_established_secs(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl LogConfig {
    /// Validate the level name
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` on an unknown level.
    pub fn validate(&self) -> Result<(), ConfigError> {
        const LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];
        if !LEVELS.contains(&self.level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Unknown log level: {}",
                self.level
            )));
        }
        Ok(())
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_method() -> String {
    "plain".into()
}

fn default_port_min() -> u16 {
    32768
}

fn default_port_max() -> u16 {
    60999
}

fn default_idle_secs() -> u64 {
    60
}

fn default_tcp_established_secs() -> u64 {
    7200
}

fn default_log_level() -> String {
    "info".into()
}
