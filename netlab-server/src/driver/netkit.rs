//! Netkit driver
//!
//! Runs user-mode Linux VMs through the Netkit `vstart`/`vhalt`/`vcrash`/
//! `vlist` commands found under `$NETKIT_HOME/bin`.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use netlab_protocol::{NodeSpec, WorkspaceId, WorkspaceUpdate};
use netlab_utils::{NetlabError, Result};

use super::lifecycle::{NodeTracker, TrackerConfig, VmToolkit};
use super::process::{
    CommandRunner, CommandSpec, DetachedLauncher, ProcessLauncher, SystemRunner,
};
use super::{Driver, NodeError};
use crate::config::NetkitConfig;
use crate::workspace::Workspace;

/// Commands that must exist under `$NETKIT_HOME/bin`
const REQUIRED_COMMANDS: [&str; 4] = ["vstart", "vhalt", "vcrash", "vlist"];

const NETKIT_HOME_VAR: &str = "NETKIT_HOME";

/// Netkit command lines for one workspace
#[derive(Debug, Clone)]
pub struct NetkitToolkit {
    home: PathBuf,
    memory: Option<u32>,
    work_dir: PathBuf,
    workspace: WorkspaceId,
}

impl NetkitToolkit {
    pub fn new(home: PathBuf, memory: Option<u32>, workspace: &Workspace) -> Self {
        Self {
            home,
            memory,
            work_dir: workspace.driver_dir(),
            workspace: workspace.id().clone(),
        }
    }

    fn command(&self, name: &str) -> CommandSpec {
        CommandSpec::new(self.home.join("bin").join(name))
            .env(NETKIT_HOME_VAR, self.home.display().to_string())
            .current_dir(&self.work_dir)
    }
}

impl VmToolkit for NetkitToolkit {
    fn launch(&self, node: &NodeSpec, console_port: u16, watch_port: Option<u16>) -> CommandSpec {
        let mut spec = self
            .command("vstart")
            .arg(node.name.clone())
            .arg(format!("--con0=port:{}", console_port));

        if let Some(port) = watch_port {
            spec = spec.arg(format!("--con1=port:{}", port));
        }

        for attachment in &node.network {
            spec = spec.arg(format!(
                "--{}={}_{}",
                attachment.interface, self.workspace, attachment.collision_domain
            ));
        }

        // A per-node memory size wins over the driver default
        let memory = node
            .extra
            .get("memory")
            .and_then(|value| value.as_u64())
            .or(self.memory.map(u64::from));
        if let Some(memory) = memory {
            spec = spec.arg("-M").arg(memory.to_string());
        }

        spec
    }

    fn halt(&self, node: &str) -> CommandSpec {
        self.command("vhalt").arg("-q").arg(node)
    }

    fn crash(&self, node: &str) -> CommandSpec {
        self.command("vcrash").arg("-q").arg(node)
    }

    fn list(&self) -> CommandSpec {
        self.command("vlist")
    }

    fn artifacts(&self, node: &str) -> Vec<PathBuf> {
        vec![
            self.work_dir.join(format!("{}.disk", node)),
            self.work_dir.join(format!("{}.log", node)),
        ]
    }
}

/// Netkit implementation of [`Driver`]
pub struct NetkitDriver {
    home_override: Option<PathBuf>,
    memory: Option<u32>,
    tracker_config: TrackerConfig,
    launcher: Arc<dyn ProcessLauncher>,
    runner: Arc<dyn CommandRunner>,
    updates: Option<mpsc::Sender<WorkspaceUpdate>>,
    started: AtomicBool,
    home: Mutex<Option<PathBuf>>,
    trackers: DashMap<WorkspaceId, NodeTracker>,
}

impl NetkitDriver {
    pub const NAME: &'static str = "netkit";

    pub fn new(config: &NetkitConfig, tracker_config: TrackerConfig) -> Self {
        Self::with_collaborators(
            config,
            tracker_config,
            Arc::new(DetachedLauncher),
            Arc::new(SystemRunner),
        )
    }

    pub fn with_collaborators(
        config: &NetkitConfig,
        tracker_config: TrackerConfig,
        launcher: Arc<dyn ProcessLauncher>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            home_override: config.home.clone(),
            memory: config.memory,
            tracker_config,
            launcher,
            runner,
            updates: None,
            started: AtomicBool::new(false),
            home: Mutex::new(None),
            trackers: DashMap::new(),
        }
    }

    /// Forward address changes seen by node watchers to `updates`
    pub fn with_updates(mut self, updates: mpsc::Sender<WorkspaceUpdate>) -> Self {
        self.updates = Some(updates);
        self
    }

    fn resolve_home(&self) -> Option<PathBuf> {
        self.home_override.clone().or_else(|| {
            std::env::var_os(NETKIT_HOME_VAR)
                .filter(|value| !value.is_empty())
                .map(PathBuf::from)
        })
    }

    fn tracker(&self, workspace: &WorkspaceId) -> Option<NodeTracker> {
        self.trackers.get(workspace).map(|entry| entry.value().clone())
    }

    fn new_tracker(&self, home: &Path, workspace: &Workspace) -> NodeTracker {
        NodeTracker::new(
            workspace.id().clone(),
            Arc::new(NetkitToolkit::new(home.to_path_buf(), self.memory, workspace)),
            self.launcher.clone(),
            self.runner.clone(),
            self.tracker_config.clone(),
            self.updates.clone(),
        )
    }
}

#[async_trait]
impl Driver for NetkitDriver {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn start(&self) -> Result<()> {
        let home = self
            .resolve_home()
            .ok_or_else(|| NetlabError::driver("NETKIT_HOME environment variable not found"))?;

        let mut missing = Vec::new();
        for command in REQUIRED_COMMANDS {
            let path = home.join("bin").join(command);
            if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
                missing.push(format!("Command {} does not exist.", path.display()));
            }
        }
        if !missing.is_empty() {
            return Err(NetlabError::driver(missing.join("\n")));
        }

        info!(home = %home.display(), "Netkit driver started");
        *self.home.lock() = Some(home);
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.started.store(false, Ordering::SeqCst);

        let trackers: Vec<NodeTracker> =
            self.trackers.iter().map(|entry| entry.value().clone()).collect();
        for tracker in trackers {
            if let Err(e) = tracker.stop_all().await {
                error!(workspace = %tracker.workspace(), error = %e, "Failed to stop workspace nodes");
            }
        }

        info!("Netkit driver stopped");
        Ok(())
    }

    fn running(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    async fn create(&self, workspace: &Workspace) -> Result<()> {
        let home = match (self.running(), self.home.lock().clone()) {
            (true, Some(home)) => home,
            _ => return Err(NetlabError::driver(NodeError::NotRunning(Self::NAME.into()).to_string())),
        };

        if self.trackers.contains_key(workspace.id()) {
            warn!(workspace = %workspace.id(), "Workspace already known to netkit");
            return Ok(());
        }

        let tracker = self.new_tracker(&home, workspace);
        self.trackers.insert(workspace.id().clone(), tracker);
        debug!(workspace = %workspace.id(), dir = %workspace.driver_dir().display(), "Netkit workspace ready");
        Ok(())
    }

    async fn destroy(&self, workspace: &Workspace) -> Result<()> {
        let Some((_, tracker)) = self.trackers.remove(workspace.id()) else {
            debug!(workspace = %workspace.id(), "Workspace unknown to netkit");
            return Ok(());
        };

        let stopped = tracker.stop_all().await;
        tracker.shutdown();
        stopped.map_err(|e| NetlabError::driver(e.to_string()))?;

        info!(workspace = %workspace.id(), "Netkit workspace destroyed");
        Ok(())
    }

    async fn start_vm(
        &self,
        workspace: &Workspace,
        node: &NodeSpec,
    ) -> std::result::Result<u16, NodeError> {
        if !self.running() {
            return Err(NodeError::NotRunning(Self::NAME.into()));
        }
        let tracker = self
            .tracker(workspace.id())
            .ok_or_else(|| NodeError::UnknownWorkspace(workspace.id().to_string()))?;
        tracker.start_node(node).await
    }

    async fn stop_vm(&self, workspace: &Workspace, node: &str) -> std::result::Result<(), NodeError> {
        match self.tracker(workspace.id()) {
            Some(tracker) => tracker.stop_node(node).await,
            // No tracker means no nodes; nothing to stop
            None => Ok(()),
        }
    }
}
