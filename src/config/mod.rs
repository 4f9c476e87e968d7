//! Configuration
//!
//! TOML configuration for the demo server. Library users can embed
//! [`ProxyProtocolConfig`] in their own configuration.

mod proxy;

pub use proxy::{ProxyProtocolConfig, ReadHeaderTimeout};

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Top-level configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Address the server listens on
    pub listen: String,

    pub proxy_protocol: ProxyProtocolConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:7000".to_string(),
            proxy_protocol: ProxyProtocolConfig::default(),
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_toml() {
        let config = Config::from_toml(
            r#"
            listen = "0.0.0.0:9000"

            [proxy_protocol]
            enabled = true
            read_header_timeout_ms = 1500
            "#,
        )
        .unwrap();
        assert_eq!(config.listen, "0.0.0.0:9000");
        assert!(config.proxy_protocol.enabled);
        assert_eq!(config.proxy_protocol.read_header_timeout_ms, 1500);
    }

    #[test]
    fn test_invalid_toml() {
        assert!(matches!(
            Config::from_toml("listen = ["),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            Config::load("/nonexistent/proxyproto.toml"),
            Err(ConfigError::Io(_))
        ));
    }
}
