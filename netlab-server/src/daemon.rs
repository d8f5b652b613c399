//! Daemon composition root
//!
//! Owns the broker, the driver and workspace registries, and the handler
//! context, and sequences startup and shutdown.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use netlab_protocol::routing::update_key;
use netlab_protocol::WorkspaceUpdate;
use netlab_utils::{NetlabError, Result};

use crate::broker::{Bridge, Broker, LocalBroker};
use crate::config::{AppConfig, ConfigHandle};
use crate::driver::{Driver, DriverRegistry, NetkitDriver, TrackerConfig};
use crate::handlers::{controller, HandlerContext};
use crate::multiplexer::MultiplexerConfig;
use crate::watcher::WatcherOptions;
use crate::workspace::WorkspaceRegistry;

/// Capacity of the address update channel
const UPDATE_CHANNEL_CAPACITY: usize = 256;

/// The running daemon
pub struct Daemon {
    config: ConfigHandle,
    broker: Arc<LocalBroker>,
    ctx: Arc<HandlerContext>,
    updates: mpsc::Receiver<WorkspaceUpdate>,
    shutdown: CancellationToken,
}

impl Daemon {
    /// Build the daemon with the drivers this host supports
    pub async fn new(config: ConfigHandle) -> Self {
        let (updates_tx, updates) = mpsc::channel(UPDATE_CHANNEL_CAPACITY);
        let snapshot = config.load_full();

        let netkit =
            NetkitDriver::new(&snapshot.netkit, tracker_config(&snapshot)).with_updates(updates_tx);
        let drivers: Vec<Arc<dyn Driver>> = vec![Arc::new(netkit)];

        Self::with_drivers(config, drivers, updates).await
    }

    /// Build the daemon around an explicit driver list
    ///
    /// Drivers that fail to start are logged and left out.
    pub async fn with_drivers(
        config: ConfigHandle,
        drivers: Vec<Arc<dyn Driver>>,
        updates: mpsc::Receiver<WorkspaceUpdate>,
    ) -> Self {
        let snapshot = config.load_full();
        let shutdown = CancellationToken::new();
        let broker = Arc::new(LocalBroker::new());

        let mut registry = DriverRegistry::new();
        for driver in drivers {
            match driver.start().await {
                Ok(()) => {
                    registry.add(driver);
                }
                Err(e) => error!(driver = %driver.name(), error = %e, "Driver not started"),
            }
        }
        if registry.is_empty() {
            warn!("No driver available, every workspace request will fail");
        }

        let ctx = Arc::new(HandlerContext::new(
            snapshot.general.environment.as_str(),
            snapshot.general.workspace_root.clone(),
            broker.clone(),
            Arc::new(registry),
            Arc::new(WorkspaceRegistry::new()),
            shutdown.clone(),
        ));

        Self {
            config,
            broker,
            ctx,
            updates,
            shutdown,
        }
    }

    #[cfg(test)]
    pub fn broker(&self) -> Arc<LocalBroker> {
        self.broker.clone()
    }

    #[cfg(test)]
    pub fn context(&self) -> Arc<HandlerContext> {
        self.ctx.clone()
    }

    /// Token cancelling the whole daemon
    #[cfg(test)]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Serve until Ctrl-C, SIGTERM, or the shutdown token fires
    pub async fn run(self) -> Result<()> {
        let config = self.config.load_full();
        tokio::fs::create_dir_all(&config.general.workspace_root)
            .await
            .map_err(|e| NetlabError::FileWrite {
                path: config.general.workspace_root.clone(),
                source: e,
            })?;

        controller::restore_all(&self.ctx).await;

        let create = tokio::spawn(controller::run(self.ctx.clone()));
        let forward = tokio::spawn(forward_updates(
            self.broker.clone(),
            update_key(config.general.environment.as_str()),
            self.updates,
            self.shutdown.clone(),
        ));

        let bridge = if config.broker.enabled {
            let bridge = Bridge::bind(&config.broker.listen).await.map_err(|e| {
                NetlabError::connection(format!("bind broker bridge {}: {}", config.broker.listen, e))
            })?;
            Some(tokio::spawn(bridge.run(self.broker.clone(), self.shutdown.clone())))
        } else {
            info!("Broker bridge disabled");
            None
        };

        info!(
            environment = %config.general.environment,
            root = %config.general.workspace_root.display(),
            drivers = ?self.ctx.drivers.names(),
            "netlab daemon ready"
        );

        tokio::select! {
            _ = wait_for_signal() => {}
            _ = self.shutdown.cancelled() => {
                info!("Shutdown requested");
            }
        }

        shutdown(&self.ctx, &self.shutdown, create, forward, bridge).await;
        Ok(())
    }
}

/// Console and watcher settings derived from the configuration
pub fn tracker_config(config: &AppConfig) -> TrackerConfig {
    TrackerConfig {
        console: MultiplexerConfig::from(&config.console),
        watcher: config
            .watcher
            .enabled
            .then(|| WatcherOptions::from_config(&config.console, &config.watcher)),
    }
}

async fn shutdown(
    ctx: &HandlerContext,
    token: &CancellationToken,
    create: JoinHandle<std::result::Result<(), crate::broker::BrokerError>>,
    forward: JoinHandle<()>,
    bridge: Option<JoinHandle<()>>,
) {
    info!("Shutting down");
    token.cancel();

    match create.await {
        Ok(Err(e)) => error!(error = %e, "Create consumer failed"),
        Err(e) => warn!(error = %e, "Create consumer task panicked"),
        Ok(Ok(())) => {}
    }
    if let Some(bridge) = bridge {
        let _ = bridge.await;
    }
    let _ = forward.await;

    // Workspaces stay on disk and come back on the next start
    for driver in ctx.drivers.all() {
        if let Err(e) = driver.stop().await {
            error!(driver = %driver.name(), error = %e, "Driver did not stop cleanly");
        }
    }
    info!("netlab daemon stopped");
}

/// Publish address updates on the update routing key
async fn forward_updates(
    broker: Arc<LocalBroker>,
    routing_key: String,
    mut updates: mpsc::Receiver<WorkspaceUpdate>,
    shutdown: CancellationToken,
) {
    loop {
        let update = tokio::select! {
            _ = shutdown.cancelled() => break,
            update = updates.recv() => match update {
                Some(update) => update,
                None => break,
            },
        };

        let payload = match serde_json::to_vec(&update) {
            Ok(payload) => Bytes::from(payload),
            Err(e) => {
                warn!(error = %e, "Failed to encode workspace update");
                continue;
            }
        };
        if let Err(e) = broker.publish(&routing_key, payload).await {
            warn!(routing_key = %routing_key, error = %e, "Failed to publish workspace update");
        } else {
            debug!(workspace = %update.workspace, node = %update.node, "Workspace update published");
        }
    }
}

async fn wait_for_signal() {
    let mut sigterm =
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(e) => {
                warn!(error = %e, "Cannot listen for SIGTERM");
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Received SIGINT, initiating shutdown");
                }
                return;
            }
        };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received SIGINT, initiating shutdown"),
        _ = sigterm.recv() => info!("Received SIGTERM, initiating shutdown"),
    }
}
