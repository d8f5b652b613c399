//! Configuration schema structs

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use netlab_utils::paths::DEFAULT_WORKSPACE_ROOT;

/// Root configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub general: GeneralConfig,
    pub broker: BrokerConfig,
    pub console: ConsoleConfig,
    pub watcher: WatcherConfig,
    pub netkit: NetkitConfig,
}

/// Deployment environment, part of every queue name
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Test,
    Production,
}

impl Environment {
    pub fn as_str(self) -> &'static str {
        match self {
            Environment::Development => "development",
            Environment::Test => "test",
            Environment::Production => "production",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// General settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    pub environment: Environment,
    /// Directory holding one `workspace<ID>` directory per workspace
    pub workspace_root: PathBuf,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            environment: Environment::default(),
            workspace_root: PathBuf::from(DEFAULT_WORKSPACE_ROOT),
        }
    }
}

/// Local broker bridge settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Accept bridge connections
    pub enabled: bool,
    /// Bridge listen address
    pub listen: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: "127.0.0.1:5673".to_string(),
        }
    }
}

/// Console multiplexer settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleConfig {
    /// Host the downstream listener binds to
    pub bind_host: String,
    /// Host the VM console servers listen on
    pub upstream_host: String,
    /// Wait before dialing a freshly spawned VM console
    pub connect_delay_ms: u64,
    /// Upper bound on the upstream connect plus handshake
    pub handshake_timeout_ms: u64,
    /// Sent to terminal users who connect before the console is running
    pub not_ready_message: String,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            upstream_host: "127.0.0.1".to_string(),
            connect_delay_ms: 2000,
            handshake_timeout_ms: 10_000,
            not_ready_message: "Console is not ready yet, try again later.\r\n".to_string(),
        }
    }
}

impl ConsoleConfig {
    pub fn connect_delay(&self) -> Duration {
        Duration::from_millis(self.connect_delay_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

/// Network watcher settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    /// Reserve a watch console per node and monitor its addresses
    pub enabled: bool,
    /// Fixed wait between connect attempts
    pub retry_interval_ms: u64,
    /// Total connect attempts before giving up
    pub max_attempts: u32,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            retry_interval_ms: 2000,
            max_attempts: 4,
        }
    }
}

impl WatcherConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

/// Netkit driver settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetkitConfig {
    /// Overrides `NETKIT_HOME`
    pub home: Option<PathBuf>,
    /// Memory per VM in megabytes, passed as `-M`
    pub memory: Option<u32>,
}
