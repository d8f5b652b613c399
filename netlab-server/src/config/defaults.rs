//! Default configuration values
//!
//! Mirrors `Default` for [`super::AppConfig`]; kept as TOML so it can be
//! copied into `~/.config/netlab/config.toml` as a starting point.

#[cfg_attr(not(test), allow(dead_code))]
pub const DEFAULT_CONFIG_TOML: &str = r##"
# netlab configuration

[general]
environment = "development"
workspace_root = "/tmp/workspaces"

[broker]
enabled = true
listen = "127.0.0.1:5673"

[console]
bind_host = "0.0.0.0"
upstream_host = "127.0.0.1"
connect_delay_ms = 2000
handshake_timeout_ms = 10000
not_ready_message = "Console is not ready yet, try again later.\r\n"

[watcher]
enabled = true
retry_interval_ms = 2000
max_attempts = 4

[netkit]
# home = "/opt/netkit"
# memory = 64
"##;
