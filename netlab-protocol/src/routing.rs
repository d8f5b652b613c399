//! Queue and routing-key naming
//!
//! Every name is scoped by the daemon environment (`development`, `test`,
//! `production`) so several daemons can share one broker.

use crate::types::WorkspaceId;

/// Operations consumed on per-workspace queues
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkspaceOp {
    Start,
    Stop,
    Destroy,
}

impl WorkspaceOp {
    pub const ALL: [WorkspaceOp; 3] = [WorkspaceOp::Start, WorkspaceOp::Stop, WorkspaceOp::Destroy];

    pub fn as_str(self) -> &'static str {
        match self {
            WorkspaceOp::Start => "start",
            WorkspaceOp::Stop => "stop",
            WorkspaceOp::Destroy => "destroy",
        }
    }
}

/// Queue receiving workspace creation requests
pub fn create_queue(env: &str) -> String {
    format!("workspace.{}.create", env)
}

/// Queue receiving one kind of request for one workspace
pub fn workspace_queue(env: &str, workspace: &WorkspaceId, op: WorkspaceOp) -> String {
    format!("workspace.{}.{}.{}", env, workspace, op.as_str())
}

/// Routing key for address-change updates
pub fn update_key(env: &str) -> String {
    format!("netlab.services.{}.workspace.update", env)
}

/// Whether a routing key carries workspace updates
pub fn is_update_key(key: &str) -> bool {
    key.starts_with("netlab.services.") && key.ends_with(".workspace.update")
}
