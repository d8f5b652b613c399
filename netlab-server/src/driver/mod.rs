//! VM drivers
//!
//! A driver owns the VMs of every workspace created on it. Drivers are
//! registered once at startup in a [`DriverRegistry`] owned by the daemon.

mod lifecycle;
mod netkit;
pub mod process;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use netlab_protocol::NodeSpec;

use crate::workspace::Workspace;

pub use lifecycle::TrackerConfig;
pub use netkit::NetkitDriver;

/// Failure of a node operation
///
/// Cloneable so one failed start reaches every caller queued on it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NodeError {
    #[error("Failed to launch node {node}: {message}")]
    Spawn { node: String, message: String },

    #[error("Console of node {node} unavailable: {message}")]
    Console { node: String, message: String },

    #[error("Cannot reserve console port: {0}")]
    Port(String),

    #[error("Command {command} failed for node {node}: {message}")]
    Command {
        command: String,
        node: String,
        message: String,
    },

    #[error("Node {0} is still running after vcrash")]
    StillRunning(String),

    #[error("Start of node {0} was abandoned")]
    Abandoned(String),

    #[error("Workspace {0} is not created on this driver")]
    UnknownWorkspace(String),

    #[error("Driver {0} is not running")]
    NotRunning(String),
}

/// Capability set of a VM driver
#[async_trait]
pub trait Driver: Send + Sync {
    fn name(&self) -> &str;

    /// Check the host environment and mark the driver running
    async fn start(&self) -> netlab_utils::Result<()>;

    /// Stop every node of every workspace
    async fn stop(&self) -> netlab_utils::Result<()>;

    fn running(&self) -> bool;

    /// Prepare for nodes in a freshly provisioned workspace
    async fn create(&self, workspace: &Workspace) -> netlab_utils::Result<()>;

    /// Stop the workspace's nodes and forget it
    async fn destroy(&self, workspace: &Workspace) -> netlab_utils::Result<()>;

    /// Start a node, returning the console port users connect to
    async fn start_vm(&self, workspace: &Workspace, node: &NodeSpec) -> Result<u16, NodeError>;

    async fn stop_vm(&self, workspace: &Workspace, node: &str) -> Result<(), NodeError>;
}

/// Drivers available to this daemon, by name
#[derive(Default)]
pub struct DriverRegistry {
    drivers: HashMap<String, Arc<dyn Driver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a driver; a name already taken keeps its first driver
    pub fn add(&mut self, driver: Arc<dyn Driver>) -> bool {
        let name = driver.name().to_string();
        if self.drivers.contains_key(&name) {
            warn!(driver = %name, "Driver already registered, ignoring");
            return false;
        }
        info!(driver = %name, "Driver registered");
        self.drivers.insert(name, driver);
        true
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Driver>> {
        self.drivers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.drivers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn all(&self) -> Vec<Arc<dyn Driver>> {
        self.drivers.values().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.drivers.is_empty()
    }
}

impl std::fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("drivers", &self.names())
            .finish()
    }
}
