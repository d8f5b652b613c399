//! Error types for netlab
//!
//! Provides a unified error type used across all netlab crates.

use std::path::PathBuf;

/// Main error type for netlab operations
#[derive(Debug, thiserror::Error)]
pub enum NetlabError {
    // === IO Errors ===

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to read file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write file {path}: {source}")]
    FileWrite {
        path: PathBuf,
        source: std::io::Error,
    },

    // === Connection Errors ===

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Connection closed unexpectedly")]
    ConnectionClosed,

    // === Protocol Errors ===

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    // === Configuration Errors ===

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration at {path}: {message}")]
    ConfigInvalid { path: PathBuf, message: String },

    // === Workspace Errors ===

    #[error("Workspace not found: {0}")]
    WorkspaceNotFound(String),

    #[error("Workspace {0} already created")]
    WorkspaceExists(String),

    #[error("Missing driver: {driver}. Required by workspace {workspace}")]
    DriverNotFound { driver: String, workspace: String },

    #[error("Driver error: {0}")]
    Driver(String),

    // === Node Errors ===

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Failed to spawn process: {0}")]
    ProcessSpawn(String),

    #[error("Command {command} failed for node {node}: {message}")]
    Command {
        command: String,
        node: String,
        message: String,
    },

    // === Internal Errors ===

    #[error("Internal error: {0}")]
    Internal(String),
}

impl NetlabError {
    /// Create a connection error
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Create a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a driver error
    pub fn driver(msg: impl Into<String>) -> Self {
        Self::Driver(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create an external command failure for a node
    pub fn command(
        command: impl Into<String>,
        node: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Command {
            command: command.into(),
            node: node.into(),
            message: message.into(),
        }
    }
}

/// Result type alias using NetlabError
pub type Result<T> = std::result::Result<T, NetlabError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err = NetlabError::Io(io_err);
        assert!(err.to_string().contains("IO error"));
    }

    #[test]
    fn test_error_display_file_write() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "permission denied");
        let err = NetlabError::FileWrite {
            path: PathBuf::from("/tmp/workspaces/workspace7/config.json"),
            source: io_err,
        };
        let msg = err.to_string();
        assert!(msg.contains("Failed to write file"));
        assert!(msg.contains("workspace7/config.json"));
    }

    #[test]
    fn test_error_display_workspace_exists() {
        let err = NetlabError::WorkspaceExists("7".into());
        assert_eq!(err.to_string(), "Workspace 7 already created");
    }

    #[test]
    fn test_error_display_driver_not_found() {
        let err = NetlabError::DriverNotFound {
            driver: "qemu".into(),
            workspace: "7".into(),
        };
        assert_eq!(
            err.to_string(),
            "Missing driver: qemu. Required by workspace 7"
        );
    }

    #[test]
    fn test_error_display_command() {
        let err = NetlabError::command("vhalt", "pc1", "exit status 1");
        assert_eq!(
            err.to_string(),
            "Command vhalt failed for node pc1: exit status 1"
        );
    }

    #[test]
    fn test_error_display_config_invalid() {
        let err = NetlabError::ConfigInvalid {
            path: PathBuf::from("/home/user/.config/netlab/config.toml"),
            message: "syntax error".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("Invalid configuration"));
        assert!(msg.contains("config.toml"));
        assert!(msg.contains("syntax error"));
    }

    #[test]
    fn test_io_error_conversion() {
        fn fails() -> Result<()> {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "boom"))?;
            Ok(())
        }

        assert!(matches!(fails(), Err(NetlabError::Io(_))));
    }
}
