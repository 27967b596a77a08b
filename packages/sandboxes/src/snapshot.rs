// ABOUTME: Golden snapshot artifacts and their offline generation
// ABOUTME: Boots a reference guest once, lets it settle, and captures memory, device state and overlay

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use stratus_core::constants::{
    SNAPSHOT_MANIFEST_FILE, SNAPSHOT_MEMORY_FILE, SNAPSHOT_OVERLAY_FILE, SNAPSHOT_STATE_FILE,
};
use tracing::{info, warn};

use crate::error::{Result, SandboxError};
use crate::guest_channel::GuestChannel;
use crate::host::HostResources;
use crate::hypervisor::{BootSource, HypervisorProcess, SnapshotOutput, VmLaunchSpec};
use crate::workspace::VmWorkspace;

/// Describes what a snapshot was captured from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotManifest {
    /// Digest of the kernel and root filesystem images
    pub source_hash: String,
    pub kernel_image: PathBuf,
    pub rootfs_image: PathBuf,
    pub vcpus: u32,
    pub memory_mb: u32,
    pub created_at: DateTime<Utc>,
}

/// A completed snapshot directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotArtifact {
    pub dir: PathBuf,
    pub manifest: SnapshotManifest,
}

impl SnapshotArtifact {
    pub fn load(dir: &Path) -> Result<Self> {
        let content = fs::read_to_string(dir.join(SNAPSHOT_MANIFEST_FILE))?;
        let manifest: SnapshotManifest = serde_json::from_str(&content)?;
        let artifact = Self {
            dir: dir.to_path_buf(),
            manifest,
        };
        for part in [
            artifact.memory_path(),
            artifact.state_path(),
            artifact.overlay_path(),
        ] {
            if !part.is_file() {
                return Err(SandboxError::Snapshot(format!(
                    "{} is missing {}",
                    dir.display(),
                    part.display()
                )));
            }
        }
        Ok(artifact)
    }

    /// Newest complete snapshot under `root`, if any.
    pub fn latest(root: &Path) -> Result<Option<Self>> {
        let entries = match fs::read_dir(root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut newest: Option<Self> = None;
        for entry in entries {
            let path = entry?.path();
            // Half-written snapshots live in dot-prefixed staging dirs
            let hidden = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with('.'))
                .unwrap_or(true);
            if hidden || !path.is_dir() {
                continue;
            }
            let Ok(artifact) = Self::load(&path) else {
                continue;
            };
            if newest
                .as_ref()
                .map(|n| artifact.manifest.created_at > n.manifest.created_at)
                .unwrap_or(true)
            {
                newest = Some(artifact);
            }
        }
        Ok(newest)
    }

    pub fn memory_path(&self) -> PathBuf {
        self.dir.join(SNAPSHOT_MEMORY_FILE)
    }

    pub fn state_path(&self) -> PathBuf {
        self.dir.join(SNAPSHOT_STATE_FILE)
    }

    /// Golden overlay every pooled overlay is copied from
    pub fn overlay_path(&self) -> PathBuf {
        self.dir.join(SNAPSHOT_OVERLAY_FILE)
    }

    /// Short prefix used to tie pool entries to this snapshot
    pub fn pool_prefix(&self) -> &str {
        let hash = self.manifest.source_hash.as_str();
        &hash[..hash.len().min(16)]
    }
}

/// SHA-256 over the kernel followed by the root filesystem.
pub fn golden_source_hash(kernel: &Path, rootfs: &Path) -> Result<String> {
    let mut hasher = Sha256::new();
    for path in [kernel, rootfs] {
        let mut file = File::open(path).map_err(|e| {
            SandboxError::Snapshot(format!("Cannot read {}: {}", path.display(), e))
        })?;
        std::io::copy(&mut file, &mut hasher)?;
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Create a sparse overlay of `size_mb`; the guest formats it on first boot.
pub fn create_sparse_overlay(path: &Path, size_mb: u64) -> Result<()> {
    let file = File::create(path)?;
    file.set_len(size_mb * 1024 * 1024)?;
    Ok(())
}

pub struct SnapshotGenerator {
    host: Arc<HostResources>,
}

impl SnapshotGenerator {
    pub fn new(host: Arc<HostResources>) -> Self {
        Self { host }
    }

    /// Boot a reference guest from the configured images and capture it.
    pub async fn generate(&self) -> Result<SnapshotArtifact> {
        let config = &self.host.config;
        let kernel = config.kernel_image.clone();
        let rootfs = config.rootfs_image.clone();
        let source_hash = {
            let (kernel, rootfs) = (kernel.clone(), rootfs.clone());
            tokio::task::spawn_blocking(move || golden_source_hash(&kernel, &rootfs))
                .await
                .map_err(|e| SandboxError::Snapshot(format!("Hashing task failed: {}", e)))??
        };

        let workspace = VmWorkspace::create(&config.workspaces_dir(), "snapshot")?;
        info!(
            vm_id = %workspace.vm_id(),
            "Generating snapshot for images {}",
            &source_hash[..16]
        );

        let mut process: Option<HypervisorProcess> = None;
        let result = self
            .capture(&workspace, source_hash, &mut process)
            .await;
        self.host.teardown(workspace.dir(), process.as_mut()).await;

        match &result {
            Ok(artifact) => info!("Snapshot written to {}", artifact.dir.display()),
            Err(e) => warn!("Snapshot generation failed: {}", e),
        }
        result
    }

    async fn capture(
        &self,
        workspace: &VmWorkspace,
        source_hash: String,
        process: &mut Option<HypervisorProcess>,
    ) -> Result<SnapshotArtifact> {
        let config = &self.host.config;
        create_sparse_overlay(&workspace.overlay_path(), config.overlay_size_mb)?;
        let entry = self.host.reserve_network(workspace).await?;

        let spec = VmLaunchSpec {
            vm_id: workspace.vm_id().to_string(),
            netns: entry.name.clone(),
            boot: BootSource::Cold,
            vcpus: config.vm_vcpus,
            memory_mb: config.vm_memory_mb,
            kernel_image: config.kernel_image.clone(),
            rootfs_image: config.rootfs_image.clone(),
            socket_ready_timeout: config.socket_ready_timeout,
        };
        self.host.hypervisor.prepare(workspace, &spec).await?;
        let launched = process.insert(self.host.hypervisor.launch(workspace, &spec).await?);

        // A cold boot takes longer than a restore; the agent answering means userspace is up
        let boot_budget = config.socket_ready_timeout * 6;
        drop(GuestChannel::connect(&workspace.vsock_socket_path(), config.guest_port, boot_budget).await?);
        tokio::time::sleep(config.snapshot_settle).await;

        let output = SnapshotOutput {
            memory_path: workspace.dir().join(SNAPSHOT_MEMORY_FILE),
            state_path: workspace.dir().join(SNAPSHOT_STATE_FILE),
        };
        self.host.hypervisor.snapshot(workspace, &output).await?;
        launched.kill().await?;

        let manifest = SnapshotManifest {
            source_hash,
            kernel_image: config.kernel_image.clone(),
            rootfs_image: config.rootfs_image.clone(),
            vcpus: config.vm_vcpus,
            memory_mb: config.vm_memory_mb,
            created_at: Utc::now(),
        };
        let name = format!(
            "{}-{}",
            manifest.created_at.format("%Y%m%dT%H%M%S"),
            &manifest.source_hash[..12]
        );
        let staging = config.snapshot_dir.join(format!(".{}.tmp", name));
        let final_dir = config.snapshot_dir.join(&name);

        let workspace_overlay = workspace.overlay_path();
        let manifest_json = serde_json::to_vec_pretty(&manifest)?;
        let staging_dir = staging.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let _ = fs::remove_dir_all(&staging_dir);
            fs::create_dir_all(&staging_dir)?;
            move_file(&output.memory_path, &staging_dir.join(SNAPSHOT_MEMORY_FILE))?;
            move_file(&output.state_path, &staging_dir.join(SNAPSHOT_STATE_FILE))?;
            fs::copy(&workspace_overlay, staging_dir.join(SNAPSHOT_OVERLAY_FILE))?;
            fs::write(staging_dir.join(SNAPSHOT_MANIFEST_FILE), manifest_json)?;
            Ok(())
        })
        .await
        .map_err(|e| SandboxError::Snapshot(format!("Copy task failed: {}", e)))??;

        fs::rename(&staging, &final_dir)?;
        SnapshotArtifact::load(&final_dir)
    }
}

fn move_file(from: &Path, to: &Path) -> Result<()> {
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    // Different filesystem
    fs::copy(from, to)?;
    fs::remove_file(from)?;
    Ok(())
}
