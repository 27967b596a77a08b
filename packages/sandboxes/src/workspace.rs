// ABOUTME: Per-VM workspace directories under the runner's base dir
// ABOUTME: Holds the overlay, hypervisor config, sockets, and metadata used by crash reconciliation

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use stratus_core::constants::{
    API_SOCKET_FILE, HYPERVISOR_LOG_FILE, OVERLAY_FILE, VM_CONFIG_FILE, VSOCK_SOCKET_FILE,
    WORKSPACE_METADATA_FILE,
};
use stratus_core::{generate_vm_id, WORKSPACE_PREFIX};
use tracing::debug;

use crate::error::{Result, SandboxError};

/// Persisted alongside the workspace so a restarted runner can clean it up
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceMetadata {
    pub vm_id: String,
    pub run_id: String,
    pub owner_pid: u32,
    #[serde(default)]
    pub hypervisor_pid: Option<u32>,
    #[serde(default)]
    pub netns: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct VmWorkspace {
    vm_id: String,
    run_id: String,
    dir: PathBuf,
}

impl VmWorkspace {
    /// Create a fresh workspace with a never-before-used VM ID.
    pub fn create(workspaces_dir: &Path, run_id: &str) -> Result<Self> {
        fs::create_dir_all(workspaces_dir)?;
        loop {
            let vm_id = generate_vm_id();
            let dir = workspaces_dir.join(format!("{}{}", WORKSPACE_PREFIX, vm_id));
            match fs::create_dir(&dir) {
                Ok(()) => {
                    let workspace = Self {
                        vm_id: vm_id.clone(),
                        run_id: run_id.to_string(),
                        dir,
                    };
                    workspace.write_metadata(&WorkspaceMetadata {
                        vm_id,
                        run_id: run_id.to_string(),
                        owner_pid: std::process::id(),
                        hypervisor_pid: None,
                        netns: None,
                        created_at: Utc::now(),
                    })?;
                    debug!("Created workspace {}", workspace.dir.display());
                    return Ok(workspace);
                }
                // Astronomically unlikely, but an ID is never reused
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Open an existing workspace, falling back to the directory name when metadata is gone.
    pub fn open(dir: &Path) -> Result<Self> {
        let name = dir
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| SandboxError::Workspace(format!("Bad workspace path {}", dir.display())))?;
        let vm_id = name
            .strip_prefix(WORKSPACE_PREFIX)
            .ok_or_else(|| SandboxError::Workspace(format!("{} is not a VM workspace", name)))?
            .to_string();

        let mut workspace = Self {
            vm_id,
            run_id: String::new(),
            dir: dir.to_path_buf(),
        };
        if let Ok(metadata) = workspace.metadata() {
            workspace.run_id = metadata.run_id;
        }
        Ok(workspace)
    }

    pub fn vm_id(&self) -> &str {
        &self.vm_id
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn overlay_path(&self) -> PathBuf {
        self.dir.join(OVERLAY_FILE)
    }

    pub fn config_path(&self) -> PathBuf {
        self.dir.join(VM_CONFIG_FILE)
    }

    pub fn api_socket_path(&self) -> PathBuf {
        self.dir.join(API_SOCKET_FILE)
    }

    pub fn vsock_socket_path(&self) -> PathBuf {
        self.dir.join(VSOCK_SOCKET_FILE)
    }

    pub fn log_path(&self) -> PathBuf {
        self.dir.join(HYPERVISOR_LOG_FILE)
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.dir.join(WORKSPACE_METADATA_FILE)
    }

    pub fn metadata(&self) -> Result<WorkspaceMetadata> {
        let content = fs::read_to_string(self.metadata_path())?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn record_hypervisor_pid(&self, pid: u32) -> Result<()> {
        self.update_metadata(|m| m.hypervisor_pid = Some(pid))
    }

    pub fn record_netns(&self, name: &str) -> Result<()> {
        self.update_metadata(|m| m.netns = Some(name.to_string()))
    }

    pub fn update_metadata<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut WorkspaceMetadata),
    {
        let mut metadata = self.metadata()?;
        f(&mut metadata);
        self.write_metadata(&metadata)
    }

    fn write_metadata(&self, metadata: &WorkspaceMetadata) -> Result<()> {
        let tmp = self.dir.join(format!("{}.tmp", WORKSPACE_METADATA_FILE));
        fs::write(&tmp, serde_json::to_vec_pretty(metadata)?)?;
        fs::rename(&tmp, self.metadata_path())?;
        Ok(())
    }

    /// Delete the workspace tree. Already gone counts as success.
    pub fn remove(&self) -> Result<()> {
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Workspace directories under `workspaces_dir`, identified by their prefix.
pub fn list_workspaces(workspaces_dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(workspaces_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut dirs = Vec::new();
    for entry in entries {
        let entry = entry?;
        let is_workspace = entry
            .file_name()
            .to_str()
            .map(|n| n.starts_with(WORKSPACE_PREFIX))
            .unwrap_or(false);
        if is_workspace && entry.file_type()?.is_dir() {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    Ok(dirs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_create_writes_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let ws = VmWorkspace::create(dir.path(), "run_abc").unwrap();

        assert!(ws.dir().starts_with(dir.path()));
        assert!(ws
            .dir()
            .file_name()
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with(WORKSPACE_PREFIX));

        let metadata = ws.metadata().unwrap();
        assert_eq!(metadata.vm_id, ws.vm_id());
        assert_eq!(metadata.run_id, "run_abc");
        assert_eq!(metadata.owner_pid, std::process::id());
        assert_eq!(metadata.hypervisor_pid, None);

        ws.record_hypervisor_pid(4242).unwrap();
        ws.record_netns("stratus-ns-3").unwrap();
        let metadata = ws.metadata().unwrap();
        assert_eq!(metadata.hypervisor_pid, Some(4242));
        assert_eq!(metadata.netns.as_deref(), Some("stratus-ns-3"));
    }

    #[test]
    fn test_vm_ids_are_unique() {
        let dir = tempfile::tempdir().unwrap();
        let a = VmWorkspace::create(dir.path(), "run_1").unwrap();
        let b = VmWorkspace::create(dir.path(), "run_1").unwrap();
        assert_ne!(a.vm_id(), b.vm_id());
    }

    #[test]
    fn test_list_filters_by_prefix_and_open_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let ws = VmWorkspace::create(dir.path(), "run_1").unwrap();
        fs::create_dir(dir.path().join("unrelated")).unwrap();
        fs::write(dir.path().join("vm-not-a-dir"), b"x").unwrap();

        let listed = list_workspaces(dir.path()).unwrap();
        assert_eq!(listed, vec![ws.dir().to_path_buf()]);

        let reopened = VmWorkspace::open(&listed[0]).unwrap();
        assert_eq!(reopened.vm_id(), ws.vm_id());
        assert_eq!(reopened.run_id(), "run_1");
    }

    #[test]
    fn test_remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let ws = VmWorkspace::create(dir.path(), "run_1").unwrap();
        ws.remove().unwrap();
        ws.remove().unwrap();
        assert!(!ws.dir().exists());
        assert!(list_workspaces(&dir.path().join("missing")).unwrap().is_empty());
    }
}
