//! Node lifecycle tracker
//!
//! One tracker per workspace. It guarantees at most one in-flight start per
//! node: the first caller launches the VM and connects its console, later
//! callers queue on the entry and receive the same outcome.
//!
//! A node's entry is dropped when its start fails, or once a halt confirmed
//! the VM is gone, whether the stop was explicit or the VM closed its
//! console (the reaper task). Disk and log files go with it. A node whose
//! halt failed stays registered so the next stop halts it again.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use netlab_protocol::{NodeSpec, WorkspaceId, WorkspaceUpdate};

use super::process::{CommandRunner, CommandSpec, ProcessHandle, ProcessLauncher};
use super::NodeError;
use crate::multiplexer::{Multiplexer, MultiplexerClosed, MultiplexerConfig, MultiplexerState};
use crate::watcher::{Watcher, WatcherEvent, WatcherOptions};

/// Capacity of the console-closed notification channel
const CLOSED_CHANNEL_CAPACITY: usize = 32;

/// Driver-specific command lines for one workspace
pub trait VmToolkit: Send + Sync {
    /// Command starting `node` with its console on `console_port`
    fn launch(&self, node: &NodeSpec, console_port: u16, watch_port: Option<u16>) -> CommandSpec;

    /// Graceful shutdown
    fn halt(&self, node: &str) -> CommandSpec;

    /// Forceful termination
    fn crash(&self, node: &str) -> CommandSpec;

    /// List running VMs
    fn list(&self) -> CommandSpec;

    /// Files left behind by a node
    fn artifacts(&self, node: &str) -> Vec<PathBuf>;
}

/// Console and watcher settings for started nodes
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub console: MultiplexerConfig,
    /// `None` disables address watching
    pub watcher: Option<WatcherOptions>,
}

type StartResult = Result<u16, NodeError>;

enum NodeEntry {
    Starting {
        waiters: Vec<oneshot::Sender<StartResult>>,
    },
    Started(StartedNode),
    /// Halt in progress; waiters are woken once it settled either way
    Stopping {
        waiters: Vec<oneshot::Sender<()>>,
    },
}

/// Transition another caller is waiting out
enum Settle {
    Start(oneshot::Receiver<StartResult>),
    Stop(oneshot::Receiver<()>),
}

impl Settle {
    async fn wait(self) {
        // A dropped sender means the transition is over too
        match self {
            Settle::Start(rx) => {
                let _ = rx.await;
            }
            Settle::Stop(rx) => {
                let _ = rx.await;
            }
        }
    }
}

struct StartedNode {
    port: u16,
    multiplexer: Multiplexer,
    process: ProcessHandle,
    watcher: Option<Watcher>,
}

struct TrackerInner {
    workspace: WorkspaceId,
    toolkit: Arc<dyn VmToolkit>,
    launcher: Arc<dyn ProcessLauncher>,
    runner: Arc<dyn CommandRunner>,
    config: TrackerConfig,
    nodes: Mutex<HashMap<String, NodeEntry>>,
    closed_tx: mpsc::Sender<MultiplexerClosed>,
    updates: Option<mpsc::Sender<WorkspaceUpdate>>,
    shutdown: CancellationToken,
}

/// Per-workspace registry of node lifecycles
#[derive(Clone)]
pub struct NodeTracker {
    inner: Arc<TrackerInner>,
}

impl NodeTracker {
    pub fn new(
        workspace: WorkspaceId,
        toolkit: Arc<dyn VmToolkit>,
        launcher: Arc<dyn ProcessLauncher>,
        runner: Arc<dyn CommandRunner>,
        config: TrackerConfig,
        updates: Option<mpsc::Sender<WorkspaceUpdate>>,
    ) -> Self {
        let (closed_tx, closed_rx) = mpsc::channel(CLOSED_CHANNEL_CAPACITY);
        let inner = Arc::new(TrackerInner {
            workspace,
            toolkit,
            launcher,
            runner,
            config,
            nodes: Mutex::new(HashMap::new()),
            closed_tx,
            updates,
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(reap_closed(inner.clone(), closed_rx));
        Self { inner }
    }

    pub fn workspace(&self) -> &WorkspaceId {
        &self.inner.workspace
    }

    /// Names of nodes that are started or starting
    pub fn nodes(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.nodes.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Start `node`, or join a start already in flight
    ///
    /// Returns the console port users connect to.
    pub async fn start_node(&self, node: &NodeSpec) -> Result<u16, NodeError> {
        let name = node.name.clone();

        loop {
            let settle = {
                let mut nodes = self.inner.nodes.lock();
                match nodes.get_mut(&name) {
                    Some(NodeEntry::Started(started)) => {
                        debug!(workspace = %self.inner.workspace, node = %name, "Node already started");
                        return Ok(started.port);
                    }
                    Some(NodeEntry::Starting { waiters }) => {
                        let (tx, rx) = oneshot::channel();
                        waiters.push(tx);
                        Settle::Start(rx)
                    }
                    Some(NodeEntry::Stopping { waiters }) => {
                        let (tx, rx) = oneshot::channel();
                        waiters.push(tx);
                        Settle::Stop(rx)
                    }
                    None => {
                        nodes.insert(name.clone(), NodeEntry::Starting { waiters: Vec::new() });
                        break;
                    }
                }
            };

            match settle {
                Settle::Start(rx) => {
                    debug!(workspace = %self.inner.workspace, node = %name, "Waiting for start in progress");
                    return rx.await.unwrap_or(Err(NodeError::Abandoned(name)));
                }
                stopping => {
                    debug!(workspace = %self.inner.workspace, node = %name, "Waiting for stop in progress");
                    stopping.wait().await;
                }
            }
        }

        let launched = self.inner.launch(node).await;
        let result = launched.as_ref().map(|started| started.port).map_err(Clone::clone);

        let waiters = {
            let mut nodes = self.inner.nodes.lock();
            let previous = match launched {
                Ok(started) => nodes.insert(name.clone(), NodeEntry::Started(started)),
                Err(_) => nodes.remove(&name),
            };
            match previous {
                Some(NodeEntry::Starting { waiters }) => waiters,
                _ => Vec::new(),
            }
        };

        for waiter in waiters {
            // A waiter that gave up is not an error
            let _ = waiter.send(result.clone());
        }

        match &result {
            Ok(port) => info!(workspace = %self.inner.workspace, node = %name, port, "Node started"),
            Err(e) => warn!(workspace = %self.inner.workspace, node = %name, error = %e, "Node start failed"),
        }
        result
    }

    /// Stop `node`; stopping a node that is not running succeeds
    pub async fn stop_node(&self, node: &str) -> Result<(), NodeError> {
        let started = loop {
            let settle = {
                let mut nodes = self.inner.nodes.lock();
                match nodes.remove(node) {
                    None => {
                        debug!(workspace = %self.inner.workspace, node, "Node not running");
                        return Ok(());
                    }
                    Some(NodeEntry::Started(started)) => {
                        nodes.insert(node.to_string(), NodeEntry::Stopping { waiters: Vec::new() });
                        break started;
                    }
                    Some(NodeEntry::Starting { mut waiters }) => {
                        let (tx, rx) = oneshot::channel();
                        waiters.push(tx);
                        nodes.insert(node.to_string(), NodeEntry::Starting { waiters });
                        Settle::Start(rx)
                    }
                    Some(NodeEntry::Stopping { mut waiters }) => {
                        let (tx, rx) = oneshot::channel();
                        waiters.push(tx);
                        nodes.insert(node.to_string(), NodeEntry::Stopping { waiters });
                        Settle::Stop(rx)
                    }
                }
            };

            // Starts are never cancelled; let it settle first
            settle.wait().await;
        };

        info!(
            workspace = %self.inner.workspace,
            node,
            pid = ?started.process.pid,
            users = started.multiplexer.user_count(),
            initialized = started.multiplexer.is_initialized(),
            "Stopping node"
        );
        self.inner.teardown(node, started).await
    }

    /// Stop every node, reporting the first failure
    pub async fn stop_all(&self) -> Result<(), NodeError> {
        let mut first_error = None;
        for node in self.nodes() {
            if let Err(e) = self.stop_node(&node).await {
                error!(workspace = %self.inner.workspace, node = %node, error = %e, "Failed to stop node");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Stop the reaper task
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }
}

impl StartedNode {
    /// Close the console and watcher without triggering the reaper
    fn detach(&self) {
        if let Some(watcher) = &self.watcher {
            watcher.stop();
        }
        self.multiplexer.close();
    }
}

impl TrackerInner {
    /// Halt a node whose entry was marked `Stopping`
    ///
    /// The entry and the node's files are dropped only once the VM is gone;
    /// on failure the node goes back to `Started`.
    async fn teardown(&self, node: &str, started: StartedNode) -> Result<(), NodeError> {
        started.detach();
        let result = self.halt(node).await;
        if result.is_ok() {
            self.remove_artifacts(node).await;
        }

        let waiters = {
            let mut nodes = self.nodes.lock();
            let previous = match &result {
                Ok(()) => nodes.remove(node),
                Err(_) => nodes.insert(node.to_string(), NodeEntry::Started(started)),
            };
            match previous {
                Some(NodeEntry::Stopping { waiters }) => waiters,
                _ => Vec::new(),
            }
        };
        for waiter in waiters {
            let _ = waiter.send(());
        }

        if let Err(e) = &result {
            warn!(workspace = %self.workspace, node, error = %e, "Node still registered after failed halt");
        }
        result
    }

    async fn launch(&self, node: &NodeSpec) -> Result<StartedNode, NodeError> {
        let name = node.name.clone();

        let console_port = reserve_port().map_err(NodeError::Port)?;
        let watch_port = match self.config.watcher {
            Some(_) => Some(reserve_port().map_err(NodeError::Port)?),
            None => None,
        };

        let spec = self.toolkit.launch(node, console_port, watch_port);
        let process = self
            .launcher
            .spawn(&spec)
            .await
            .map_err(|message| NodeError::Spawn {
                node: name.clone(),
                message,
            })?;
        debug!(workspace = %self.workspace, node = %name, console_port, ?watch_port, "VM launched");

        let multiplexer = Multiplexer::new(
            name.clone(),
            console_port,
            self.config.console.clone(),
            Some(self.closed_tx.clone()),
        );

        let port = match multiplexer.connect().await {
            Ok(port) => port,
            Err(source) => {
                // The VM may be up without a usable console; take it down
                // before the entry is released for another start
                if let Err(e) = self.halt(&name).await {
                    warn!(workspace = %self.workspace, node = %name, error = %e, "Cleanup halt failed");
                }
                return Err(NodeError::Console {
                    node: name,
                    message: source.to_string(),
                });
            }
        };

        let watcher = match (&self.config.watcher, watch_port) {
            (Some(options), Some(watch_port)) => {
                let watcher = Watcher::new(name.clone(), watch_port, options.clone());
                self.spawn_watch(watcher.clone());
                Some(watcher)
            }
            _ => None,
        };

        Ok(StartedNode {
            port,
            multiplexer,
            process,
            watcher,
        })
    }

    /// Run the watcher in the background, forwarding addresses as updates
    fn spawn_watch(&self, watcher: Watcher) {
        let workspace = self.workspace.clone();
        let updates = self.updates.clone();
        let node = watcher.node().to_string();

        tokio::spawn(async move {
            let mut events = match watcher.connect().await {
                Ok(events) => events,
                Err(e) => {
                    warn!(workspace = %workspace, node = %node, error = %e, "Address watcher failed");
                    return;
                }
            };

            while let Some(event) = events.recv().await {
                match event {
                    WatcherEvent::Address { interface, address } => {
                        info!(workspace = %workspace, node = %node, %interface, %address, "Interface address changed");
                        let Some(updates) = &updates else { continue };
                        let update = WorkspaceUpdate {
                            workspace: workspace.clone(),
                            node: node.clone(),
                            interface,
                            address,
                        };
                        if updates.send(update).await.is_err() {
                            debug!(workspace = %workspace, node = %node, "Update sink closed");
                        }
                    }
                    WatcherEvent::Closed => {
                        info!(workspace = %workspace, node = %node, "Address watcher closed");
                    }
                }
            }
        });
    }

    /// Halt, fall back to crash, and confirm the VM is gone
    async fn halt(&self, node: &str) -> Result<(), NodeError> {
        let halt = self.toolkit.halt(node);
        let output = self.run(&halt, node).await?;
        if !output.success {
            warn!(workspace = %self.workspace, node, code = ?output.code, "Graceful halt failed");
        }

        if self.listed(node).await? {
            warn!(workspace = %self.workspace, node, "Node still listed after halt, crashing it");
            let crash = self.toolkit.crash(node);
            let output = self.run(&crash, node).await?;
            if !output.success {
                warn!(workspace = %self.workspace, node, code = ?output.code, "Forceful halt failed");
            }

            if self.listed(node).await? {
                return Err(NodeError::StillRunning(node.to_string()));
            }
        }

        debug!(workspace = %self.workspace, node, "Node halted");
        Ok(())
    }

    async fn listed(&self, node: &str) -> Result<bool, NodeError> {
        let list = self.toolkit.list();
        let output = self.run(&list, node).await?;
        if !output.success {
            return Err(NodeError::Command {
                command: list.name(),
                node: node.to_string(),
                message: format!("exit status {:?}", output.code),
            });
        }
        Ok(is_listed(&output.stdout, node))
    }

    async fn run(
        &self,
        spec: &CommandSpec,
        node: &str,
    ) -> Result<super::process::CommandOutput, NodeError> {
        self.runner
            .run(spec)
            .await
            .map_err(|e| NodeError::Command {
                command: spec.name(),
                node: node.to_string(),
                message: e.to_string(),
            })
    }

    async fn remove_artifacts(&self, node: &str) {
        for path in self.toolkit.artifacts(node) {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => debug!(node, path = %path.display(), "Removed node artifact"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(node, path = %path.display(), error = %e, "Failed to remove node artifact")
                }
            }
        }
    }
}

/// Tear down nodes whose console was closed by the VM
async fn reap_closed(inner: Arc<TrackerInner>, mut closed_rx: mpsc::Receiver<MultiplexerClosed>) {
    loop {
        let closed = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            closed = closed_rx.recv() => match closed {
                Some(closed) => closed,
                None => break,
            },
        };

        let node = closed.node;
        let started = {
            let mut nodes = inner.nodes.lock();
            // Only the entry whose console actually went away
            let closed_here = matches!(
                nodes.get(&node),
                Some(NodeEntry::Started(started))
                    if started.multiplexer.state() == MultiplexerState::Stopped
            );
            if closed_here {
                match nodes.insert(node.clone(), NodeEntry::Stopping { waiters: Vec::new() }) {
                    Some(NodeEntry::Started(started)) => Some(started),
                    _ => None,
                }
            } else {
                None
            }
        };

        let Some(started) = started else {
            debug!(workspace = %inner.workspace, node = %node, "Console closed for untracked node");
            continue;
        };

        info!(workspace = %inner.workspace, node = %node, "Console closed by VM, tearing node down");
        if let Err(e) = inner.teardown(&node, started).await {
            warn!(workspace = %inner.workspace, node = %node, error = %e, "Teardown halt failed");
        }
    }
    debug!(workspace = %inner.workspace, "Node reaper exiting");
}

/// Grab an ephemeral port from the OS and release it immediately
fn reserve_port() -> Result<u16, String> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").map_err(|e| e.to_string())?;
    let port = listener.local_addr().map_err(|e| e.to_string())?.port();
    Ok(port)
}

/// Whether `vlist`-style output names `node`
fn is_listed(output: &str, node: &str) -> bool {
    output
        .lines()
        .any(|line| line.split_whitespace().any(|field| field == node))
}
