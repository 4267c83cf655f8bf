//! Configuration loading and management
//!
//! This module handles loading configuration from files and environment variables.

use std::path::Path;

use tracing::{debug, info};

use super::types::Config;
use crate::error::ConfigError;

/// Load configuration from a JSON file
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be read or parsed.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();

    debug!("Loading configuration from {:?}", path);

    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.display().to_string(),
        });
    }

    let contents = std::fs::read_to_string(path)?;

    let config: Config = serde_json::from_str(&contents)
        .map_err(|e| ConfigError::ParseError(format!("Failed to parse JSON: {e} at {path:?}")))?;

    config.validate()?;

    info!(
        "Configuration loaded: mode={:?}, port={}, method={}",
        config.mode, config.port, config.crypto.method
    );

    Ok(config)
}

/// Load configuration from a JSON string
///
/// # Errors
///
/// Returns `ConfigError` if parsing or validation fails.
pub fn load_config_str(json: &str) -> Result<Config, ConfigError> {
    let config: Config =
        serde_json::from_str(json).map_err(|e| ConfigError::ParseError(e.to_string()))?;

    config.validate()?;

    Ok(config)
}

/// Load configuration with environment variable overrides
///
/// Environment variables:
/// - `RUST_TUNNEL_SERVER`: Override server address
/// - `RUST_TUNNEL_PORT`: Override tunnel port
/// - `RUST_TUNNEL_LOG_LEVEL`: Override log level
/// - `RUST_TUNNEL_PASSWORD`: Override pre-shared passphrase
///
/// # Errors
///
/// Returns `ConfigError` if loading or parsing fails.
pub fn load_config_with_env(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let mut config = load_config(path)?;

    if let Ok(addr) = std::env::var("RUST_TUNNEL_SERVER") {
        config.server = Some(addr.parse().map_err(|_| ConfigError::EnvError {
            name: "RUST_TUNNEL_SERVER".into(),
            reason: format!("Invalid socket address: {addr}"),
        })?);
        debug!("Server address overridden to {}", addr);
    }

    if let Ok(port) = std::env::var("RUST_TUNNEL_PORT") {
        config.port = port.parse().map_err(|_| ConfigError::EnvError {
            name: "RUST_TUNNEL_PORT".into(),
            reason: format!("Invalid port: {port}"),
        })?;
        debug!("Tunnel port overridden to {}", config.port);
    }

    if let Ok(level) = std::env::var("RUST_TUNNEL_LOG_LEVEL") {
        config.log.level = level;
        debug!("Log level overridden to {}", config.log.level);
    }

    if let Ok(password) = std::env::var("RUST_TUNNEL_PASSWORD") {
        config.crypto.password = Some(password);
        debug!("Password overridden from environment");
    }

    // Re-validate after overrides
    config.validate()?;

    Ok(config)
}

/// Create a default configuration file at the given path
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be written.
pub fn create_default_config(path: impl AsRef<Path>) -> Result<(), ConfigError> {
    let config = Config::default_config();
    let json = serde_json::to_string_pretty(&config)
        .map_err(|e| ConfigError::ParseError(format!("Failed to serialize config: {e}")))?;
    std::fs::write(path.as_ref(), json)?;
    info!("Default configuration written to {:?}", path.as_ref());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::Mode;

    #[test]
    fn test_load_config_str() {
        let json = r#"{
            "mode": "client",
            "sources": ["10.0.0.0/24"],
            "server": "203.0.113.1:19986"
        }"#;
        let config = load_config_str(json).unwrap();
        assert_eq!(config.mode, Mode::Client);
        assert_eq!(config.sources.len(), 1);
        assert_eq!(config.port, 19986);
        assert_eq!(config.crypto.method, "plain");
    }

    #[test]
    fn test_load_config_str_rejects_invalid() {
        let json = r#"{ "mode": "client", "sources": [] }"#;
        assert!(load_config_str(json).is_err());
    }

    #[test]
    fn test_load_config_missing_file() {
        let err = load_config("/nonexistent/rust-tunnel.json").unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }

    #[test]
    fn test_server_config_round_trip() {
        let json = r#"{
            "mode": "server",
            "port": 29100,
            "crypto": { "method": "aes-256-gcm", "password": "hunter2" },
            "nat": { "port_min": 40000, "port_max": 50000 }
        }"#;
        let config = load_config_str(json).unwrap();
        assert_eq!(config.mode, Mode::Server);
        assert_eq!(config.port, 29100);
        assert_eq!(config.nat.port_min, 40000);
        let reserialized = serde_json::to_string(&config).unwrap();
        let config2 = load_config_str(&reserialized).unwrap();
        assert_eq!(config2.nat.port_max, 50000);
    }
}
