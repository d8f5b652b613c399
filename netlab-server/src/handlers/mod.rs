//! Broker request handlers
//!
//! [`controller`] consumes the create queue and registers workspaces;
//! [`orchestration`] consumes each workspace's start/stop/destroy queues.

pub mod controller;
pub mod orchestration;

use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use netlab_protocol::WorkspaceId;

use crate::broker::{Broker, Delivery};
use crate::driver::DriverRegistry;
use crate::workspace::WorkspaceRegistry;

/// Everything a handler needs, owned by the daemon
pub struct HandlerContext {
    /// Environment name scoping queue names
    pub environment: String,
    /// Directory holding the workspace directories
    pub root: PathBuf,
    pub broker: Arc<dyn Broker>,
    pub drivers: Arc<DriverRegistry>,
    pub workspaces: Arc<WorkspaceRegistry>,
    consumers: DashMap<WorkspaceId, CancellationToken>,
    shutdown: CancellationToken,
}

impl HandlerContext {
    pub fn new(
        environment: impl Into<String>,
        root: PathBuf,
        broker: Arc<dyn Broker>,
        drivers: Arc<DriverRegistry>,
        workspaces: Arc<WorkspaceRegistry>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            environment: environment.into(),
            root,
            broker,
            drivers,
            workspaces,
            consumers: DashMap::new(),
            shutdown,
        }
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Publish `reply` to the delivery's reply key, or log it when there is none
    pub async fn reply<T: Serialize>(&self, delivery: &Delivery, reply: &T) {
        let payload = match serde_json::to_vec(reply) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(queue = %delivery.queue, error = %e, "Failed to encode reply");
                return;
            }
        };

        let Some(reply_to) = &delivery.reply_to else {
            info!(
                queue = %delivery.queue,
                reply = %String::from_utf8_lossy(&payload),
                "No reply key, dropping reply"
            );
            return;
        };

        if let Err(e) = self.broker.publish(reply_to, Bytes::from(payload)).await {
            warn!(queue = %delivery.queue, reply_to = %reply_to, error = %e, "Failed to publish reply");
        }
    }
}

impl std::fmt::Debug for HandlerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerContext")
            .field("environment", &self.environment)
            .field("root", &self.root)
            .field("workspaces", &self.workspaces.len())
            .finish()
    }
}
