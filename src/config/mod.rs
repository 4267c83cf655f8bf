//! Configuration types and loading

mod loader;
mod types;

pub use loader::{create_default_config, load_config, load_config_str, load_config_with_env};
pub use types::{Config, CryptoConfig, LogConfig, Mode, NatConfig, DEFAULT_PORT};
