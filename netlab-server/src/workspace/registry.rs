//! Workspace registry

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use netlab_protocol::WorkspaceId;
use netlab_utils::{NetlabError, Result};

use super::Workspace;

/// Registry of live workspaces, owned by the daemon
#[derive(Debug, Default)]
pub struct WorkspaceRegistry {
    workspaces: DashMap<WorkspaceId, Arc<Workspace>>,
}

impl WorkspaceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a workspace, rejecting duplicate ids
    pub fn insert(&self, workspace: Workspace) -> Result<Arc<Workspace>> {
        match self.workspaces.entry(workspace.id().clone()) {
            Entry::Occupied(entry) => Err(NetlabError::WorkspaceExists(entry.key().to_string())),
            Entry::Vacant(entry) => {
                let workspace = Arc::new(workspace);
                entry.insert(workspace.clone());
                Ok(workspace)
            }
        }
    }

    pub fn contains(&self, id: &WorkspaceId) -> bool {
        self.workspaces.contains_key(id)
    }

    pub fn remove(&self, id: &WorkspaceId) -> Option<Arc<Workspace>> {
        self.workspaces.remove(id).map(|(_, workspace)| workspace)
    }

    pub fn len(&self) -> usize {
        self.workspaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workspaces.is_empty()
    }
}
