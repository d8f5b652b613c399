//! Workspace creation
//!
//! Create requests are handled one at a time, in arrival order, so two
//! requests for the same workspace id cannot race.

use std::sync::Arc;

use tracing::{debug, info, warn};

use netlab_protocol::routing::create_queue;
use netlab_protocol::{CreateWorkspaceRequest, StatusReply};
use netlab_utils::{NetlabError, Result};

use super::orchestration;
use super::HandlerContext;
use crate::broker::BrokerError;
use crate::workspace::{self, Workspace};

/// Consume the create queue until shutdown
pub async fn run(ctx: Arc<HandlerContext>) -> std::result::Result<(), BrokerError> {
    let queue = create_queue(&ctx.environment);
    let mut deliveries = ctx.broker.subscribe(&queue).await?;
    info!(queue = %queue, "Consuming workspace create requests");

    loop {
        let delivery = tokio::select! {
            _ = ctx.shutdown_token().cancelled() => break,
            delivery = deliveries.recv() => match delivery {
                Some(delivery) => delivery,
                None => break,
            },
        };

        let reply = create(&ctx, &delivery.payload).await;
        ctx.reply(&delivery, &reply).await;
    }

    if let Err(e) = ctx.broker.unsubscribe(&queue).await {
        debug!(queue = %queue, error = %e, "Create queue already gone");
    }
    info!(queue = %queue, "Create consumer stopped");
    Ok(())
}

/// Handle one create request body
pub async fn create(ctx: &Arc<HandlerContext>, payload: &[u8]) -> StatusReply {
    let request = match CreateWorkspaceRequest::parse(payload) {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "Malformed create request");
            return StatusReply::error(e.to_string());
        }
    };

    let id = request.workspace.clone();
    match register(ctx, Workspace::new(&ctx.root, request)).await {
        Ok(_) => {
            info!(workspace = %id, "Workspace created");
            StatusReply::success_on(hostname())
        }
        Err(e) => {
            warn!(workspace = %id, error = %e, "Workspace not created");
            StatusReply::error(e.to_string())
        }
    }
}

/// Provision a workspace, hand it to its driver, and start its consumers
///
/// Stops at the first failing step.
pub async fn register(ctx: &Arc<HandlerContext>, workspace: Workspace) -> Result<Arc<Workspace>> {
    let driver = ctx
        .drivers
        .get(workspace.driver())
        .ok_or_else(|| NetlabError::DriverNotFound {
            driver: workspace.driver().to_string(),
            workspace: workspace.id().to_string(),
        })?;

    if ctx.workspaces.contains(workspace.id()) {
        return Err(NetlabError::WorkspaceExists(workspace.id().to_string()));
    }

    workspace::provision(&workspace).await?;
    driver.create(&workspace).await?;
    let workspace = ctx.workspaces.insert(workspace)?;

    orchestration::spawn_consumers(ctx, workspace.clone())
        .await
        .map_err(|e| NetlabError::internal(e.to_string()))?;
    Ok(workspace)
}

/// Re-register every workspace saved under the root
///
/// Returns how many workspaces came back.
pub async fn restore_all(ctx: &Arc<HandlerContext>) -> usize {
    let mut restored = 0;
    for workspace in workspace::load_saved(&ctx.root).await {
        let id = workspace.id().clone();
        match register(ctx, workspace).await {
            Ok(_) => {
                restored += 1;
                debug!(workspace = %id, "Workspace restored");
            }
            Err(e) => warn!(workspace = %id, error = %e, "Workspace not restored"),
        }
    }
    info!(count = restored, "Saved workspaces restored");
    restored
}

/// Name of this host, reported in create replies
pub fn hostname() -> String {
    let mut buf = [0u8; 256];
    // SAFETY: buf is valid for writes of buf.len() bytes
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if rc != 0 {
        return "localhost".to_string();
    }
    let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..len]).into_owned()
}
