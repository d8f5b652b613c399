//! Configuration loader

use std::net::SocketAddr;
use std::path::Path;

use netlab_utils::{config_file, NetlabError, Result};

use super::AppConfig;

/// Configuration loader
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from default location
    pub fn load() -> Result<AppConfig> {
        let path = config_file();
        if path.exists() {
            Self::load_from_path(&path)
        } else {
            Ok(AppConfig::default())
        }
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<AppConfig> {
        let content = std::fs::read_to_string(path).map_err(|e| NetlabError::FileRead {
            path: path.to_path_buf(),
            source: e,
        })?;

        Self::parse(&content, path)
    }

    /// Parse configuration from string
    pub fn parse(content: &str, path: &Path) -> Result<AppConfig> {
        toml::from_str(content).map_err(|e| NetlabError::ConfigInvalid {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Validate configuration
    pub fn validate(config: &AppConfig) -> Result<()> {
        if config.console.connect_delay_ms == 0 {
            return Err(NetlabError::config("connect_delay_ms must be greater than 0"));
        }

        if config.console.handshake_timeout_ms == 0 {
            return Err(NetlabError::config(
                "handshake_timeout_ms must be greater than 0",
            ));
        }

        if config.console.bind_host.is_empty() || config.console.upstream_host.is_empty() {
            return Err(NetlabError::config("console hosts must not be empty"));
        }

        if config.watcher.retry_interval_ms == 0 {
            return Err(NetlabError::config(
                "retry_interval_ms must be greater than 0",
            ));
        }

        if config.watcher.max_attempts == 0 {
            return Err(NetlabError::config("max_attempts must be at least 1"));
        }

        if config.broker.enabled && config.broker.listen.parse::<SocketAddr>().is_err() {
            return Err(NetlabError::config(format!(
                "broker listen address is not a socket address: {}",
                config.broker.listen
            )));
        }

        Ok(())
    }

    /// Load from `path` when given, otherwise the default location, and validate
    pub fn load_and_validate(path: Option<&Path>) -> Result<AppConfig> {
        let config = match path {
            Some(path) => Self::load_from_path(path)?,
            None => Self::load()?,
        };
        Self::validate(&config)?;
        Ok(config)
    }
}
