//! On-disk provisioning of workspace directories

use std::path::Path;

use tracing::{debug, info, warn};

use netlab_protocol::CreateWorkspaceRequest;
use netlab_utils::{NetlabError, Result};

use super::{Workspace, CONFIG_FILE_NAME, WORKSPACE_DIR_PREFIX};

/// Create the workspace directory, its `config.json`, and the driver directory
///
/// Existing pieces are left untouched, so provisioning a reloaded workspace
/// is a no-op.
pub async fn provision(workspace: &Workspace) -> Result<()> {
    ensure_dir(workspace.base_path()).await?;

    let config_file = workspace.config_file();
    if !tokio::fs::try_exists(&config_file).await.unwrap_or(false) {
        let content = serde_json::to_vec(workspace.request())
            .map_err(|e| NetlabError::internal(format!("serialize workspace config: {}", e)))?;
        tokio::fs::write(&config_file, content)
            .await
            .map_err(|e| NetlabError::FileWrite {
                path: config_file.clone(),
                source: e,
            })?;
        debug!(path = %config_file.display(), "Wrote workspace config");
    }

    ensure_dir(&workspace.driver_dir()).await?;
    info!(workspace = %workspace.id(), path = %workspace.base_path().display(), "Workspace provisioned");
    Ok(())
}

/// Remove the workspace directory and everything in it
///
/// Succeeds if the directory is already gone.
pub async fn remove(workspace: &Workspace) -> Result<()> {
    match tokio::fs::remove_dir_all(workspace.base_path()).await {
        Ok(()) => {
            debug!(path = %workspace.base_path().display(), "Removed workspace directory");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(NetlabError::Io(e)),
    }
}

/// Read every `<root>/workspace*/config.json`
///
/// Unreadable or malformed entries are logged and skipped.
pub async fn load_saved(root: &Path) -> Vec<Workspace> {
    let mut entries = match tokio::fs::read_dir(root).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
        Err(e) => {
            warn!(root = %root.display(), error = %e, "Cannot scan workspace root");
            return Vec::new();
        }
    };

    let mut workspaces = Vec::new();
    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => {
                warn!(root = %root.display(), error = %e, "Workspace scan interrupted");
                break;
            }
        };

        let name = entry.file_name();
        if !name.to_string_lossy().starts_with(WORKSPACE_DIR_PREFIX) {
            continue;
        }

        let config_file = entry.path().join(CONFIG_FILE_NAME);
        let content = match tokio::fs::read(&config_file).await {
            Ok(content) => content,
            Err(e) => {
                warn!(path = %config_file.display(), error = %e, "Skipping workspace without readable config");
                continue;
            }
        };

        match CreateWorkspaceRequest::parse(&content) {
            Ok(request) => workspaces.push(Workspace::new(root, request)),
            Err(e) => {
                warn!(path = %config_file.display(), error = %e, "Skipping workspace with invalid config");
            }
        }
    }

    workspaces.sort_by(|a, b| a.id().cmp(b.id()));
    workspaces
}

async fn ensure_dir(path: &Path) -> Result<()> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|e| NetlabError::FileWrite {
            path: path.to_path_buf(),
            source: e,
        })
}
