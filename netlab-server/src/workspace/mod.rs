//! Workspaces
//!
//! A workspace is one isolated lab. Its on-disk layout is:
//! ```text
//! <root>/
//! └── workspace<ID>/
//!     ├── config.json      the create request, written once
//!     └── <driver>/        VM working directory (disks, logs)
//! ```

mod provision;
mod registry;

use std::path::{Path, PathBuf};

use netlab_protocol::{CreateWorkspaceRequest, WorkspaceId};

pub use provision::{load_saved, provision, remove};
pub use registry::WorkspaceRegistry;

/// Prefix of every workspace directory under the root
pub const WORKSPACE_DIR_PREFIX: &str = "workspace";

/// Persisted create request inside a workspace directory
pub const CONFIG_FILE_NAME: &str = "config.json";

/// One provisioned lab
#[derive(Debug, Clone, PartialEq)]
pub struct Workspace {
    request: CreateWorkspaceRequest,
    base_path: PathBuf,
}

impl Workspace {
    pub fn new(root: &Path, request: CreateWorkspaceRequest) -> Self {
        let base_path = root.join(format!("{}{}", WORKSPACE_DIR_PREFIX, request.workspace));
        Self { request, base_path }
    }

    pub fn id(&self) -> &WorkspaceId {
        &self.request.workspace
    }

    /// Name of the driver running this workspace's VMs
    pub fn driver(&self) -> &str {
        &self.request.driver
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Working directory for the driver's VMs
    pub fn driver_dir(&self) -> PathBuf {
        self.base_path.join(&self.request.driver)
    }

    pub fn config_file(&self) -> PathBuf {
        self.base_path.join(CONFIG_FILE_NAME)
    }

    pub fn request(&self) -> &CreateWorkspaceRequest {
        &self.request
    }
}
