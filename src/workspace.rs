use crate::error::SimdockError;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkspaceDirectory {
    pub host_path: PathBuf,
    pub mount_point: String,
}

impl WorkspaceDirectory {
    pub fn for_container(root: &Path, container_name: &str, mount_point: &str) -> Self {
        Self {
            host_path: root.join(format!("{container_name}_shared_volume")),
            mount_point: mount_point.to_string(),
        }
    }

    /// Created on first use and never touched again; ownership stays with the host.
    pub fn ensure(&self) -> Result<(), SimdockError> {
        if self.host_path.is_dir() {
            return Ok(());
        }
        fs::create_dir_all(&self.host_path).map_err(|source| SimdockError::WorkspaceCreate {
            path: self.host_path.clone(),
            source,
        })?;
        info!(path = %self.host_path.display(), "created workspace directory");
        Ok(())
    }

    pub fn volume_spec(&self) -> String {
        format!("{}:{}:rw", self.host_path.display(), self.mount_point)
    }
}
