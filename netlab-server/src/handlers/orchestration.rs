//! Per-workspace start/stop/destroy consumers
//!
//! Each delivery is handled in its own task, so a slow VM boot never holds
//! up other requests. Within one request, nodes are started concurrently
//! and the reply lists them in request order once all have settled.

use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use netlab_protocol::routing::workspace_queue;
use netlab_protocol::{
    DestroyRequest, NodeReply, NodeRequest, ProtocolError, StatusReply, StopRequest, WorkspaceId,
    WorkspaceOp,
};
use netlab_utils::{NetlabError, Result};

use super::HandlerContext;
use crate::broker::{BrokerError, Delivery};
use crate::driver::Driver;
use crate::workspace::{self, Workspace};

/// Subscribe the workspace's queues and consume them in the background
pub async fn spawn_consumers(
    ctx: &Arc<HandlerContext>,
    workspace: Arc<Workspace>,
) -> std::result::Result<(), BrokerError> {
    let mut subscribed = Vec::new();
    for op in WorkspaceOp::ALL {
        let queue = workspace_queue(&ctx.environment, workspace.id(), op);
        match ctx.broker.subscribe(&queue).await {
            Ok(deliveries) => subscribed.push((op, queue, deliveries)),
            Err(e) => {
                for (_, queue, _) in &subscribed {
                    let _ = ctx.broker.unsubscribe(queue).await;
                }
                return Err(e);
            }
        }
    }

    let token = ctx.shutdown_token().child_token();
    ctx.consumers.insert(workspace.id().clone(), token.clone());

    for (op, queue, deliveries) in subscribed {
        debug!(workspace = %workspace.id(), queue = %queue, "Consuming workspace queue");
        tokio::spawn(consume(
            ctx.clone(),
            workspace.clone(),
            op,
            deliveries,
            token.clone(),
        ));
    }
    Ok(())
}

/// Cancel the workspace's consumers and drop its queues
pub async fn stop_consumers(ctx: &HandlerContext, id: &WorkspaceId) {
    if let Some((_, token)) = ctx.consumers.remove(id) {
        token.cancel();
    }
    for op in WorkspaceOp::ALL {
        let queue = workspace_queue(&ctx.environment, id, op);
        if let Err(e) = ctx.broker.unsubscribe(&queue).await {
            debug!(workspace = %id, queue = %queue, error = %e, "Queue already gone");
        }
    }
}

async fn consume(
    ctx: Arc<HandlerContext>,
    workspace: Arc<Workspace>,
    op: WorkspaceOp,
    mut deliveries: mpsc::Receiver<Delivery>,
    token: CancellationToken,
) {
    loop {
        let delivery = tokio::select! {
            _ = token.cancelled() => break,
            delivery = deliveries.recv() => match delivery {
                Some(delivery) => delivery,
                None => break,
            },
        };

        let ctx = ctx.clone();
        let workspace = workspace.clone();
        tokio::spawn(async move {
            let reply = handle(&ctx, &workspace, op, &delivery.payload).await;
            ctx.reply(&delivery, &reply).await;
        });
    }
    debug!(workspace = %workspace.id(), op = op.as_str(), "Workspace consumer stopped");
}

/// Process one request body, producing the JSON reply
pub async fn handle(
    ctx: &Arc<HandlerContext>,
    workspace: &Arc<Workspace>,
    op: WorkspaceOp,
    payload: &[u8],
) -> serde_json::Value {
    let reply = match op {
        WorkspaceOp::Start => start(ctx, workspace, payload).await,
        WorkspaceOp::Stop => stop(ctx, workspace, payload).await,
        WorkspaceOp::Destroy => destroy(ctx, workspace, payload).await,
    };

    let reply = reply.and_then(|reply| {
        serde_json::to_value(reply).map_err(|e| NetlabError::internal(e.to_string()))
    });
    match reply {
        Ok(reply) => reply,
        Err(e) => {
            warn!(workspace = %workspace.id(), op = op.as_str(), error = %e, "Request failed");
            serde_json::to_value(StatusReply::error(e.to_string())).unwrap_or_default()
        }
    }
}

#[derive(serde::Serialize)]
#[serde(untagged)]
enum Reply {
    Nodes(Vec<NodeReply>),
    Status(StatusReply),
}

async fn start(ctx: &HandlerContext, workspace: &Workspace, payload: &[u8]) -> Result<Reply> {
    let request = NodeRequest::parse(payload).map_err(invalid)?;
    check_target(workspace, &request.workspace)?;
    let driver = driver_of(ctx, workspace)?;

    let replies = join_all(request.parameters.iter().map(|node| {
        let driver = driver.clone();
        async move {
            match driver.start_vm(workspace, node).await {
                Ok(port) => NodeReply::started(&node.name, port),
                Err(e) => NodeReply::failed(&node.name, e.to_string()),
            }
        }
    }))
    .await;

    info!(workspace = %workspace.id(), nodes = replies.len(), "Start request settled");
    Ok(Reply::Nodes(replies))
}

async fn stop(ctx: &HandlerContext, workspace: &Workspace, payload: &[u8]) -> Result<Reply> {
    let request = StopRequest::parse(payload).map_err(invalid)?;
    check_target(workspace, &request.workspace)?;
    let driver = driver_of(ctx, workspace)?;

    let replies = join_all(request.parameters.iter().map(|node| {
        let driver = driver.clone();
        async move {
            match driver.stop_vm(workspace, &node.name).await {
                Ok(()) => NodeReply::stopped(&node.name),
                Err(e) => NodeReply::failed(&node.name, e.to_string()),
            }
        }
    }))
    .await;

    info!(workspace = %workspace.id(), nodes = replies.len(), "Stop request settled");
    Ok(Reply::Nodes(replies))
}

async fn destroy(ctx: &HandlerContext, workspace: &Workspace, payload: &[u8]) -> Result<Reply> {
    let request = DestroyRequest::parse(payload).map_err(invalid)?;
    check_target(workspace, &request.workspace)?;
    let driver = driver_of(ctx, workspace)?;

    driver.destroy(workspace).await?;
    workspace::remove(workspace).await?;
    ctx.workspaces.remove(workspace.id());
    stop_consumers(ctx, workspace.id()).await;

    info!(workspace = %workspace.id(), "Workspace destroyed");
    Ok(Reply::Status(StatusReply::success()))
}

fn invalid(e: ProtocolError) -> NetlabError {
    NetlabError::InvalidMessage(e.to_string())
}

fn check_target(workspace: &Workspace, requested: &WorkspaceId) -> Result<()> {
    if requested != workspace.id() {
        return Err(NetlabError::InvalidMessage(format!(
            "request for workspace {} on queue of workspace {}",
            requested,
            workspace.id()
        )));
    }
    Ok(())
}

fn driver_of(ctx: &HandlerContext, workspace: &Workspace) -> Result<Arc<dyn Driver>> {
    ctx.drivers
        .get(workspace.driver())
        .ok_or_else(|| NetlabError::DriverNotFound {
            driver: workspace.driver().to_string(),
            workspace: workspace.id().to_string(),
        })
}
