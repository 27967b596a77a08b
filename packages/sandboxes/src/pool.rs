// ABOUTME: Pool of ready-to-use overlays derived from the latest snapshot
// ABOUTME: Acquisition is a single rename; replenishment runs in the background under a file lock

use fs2::FileExt;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use stratus_core::constants::OVERLAY_POOL_LOCK_FILE;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Result, SandboxError};
use crate::snapshot::SnapshotArtifact;

const OVERLAY_SUFFIX: &str = ".ext4";
const STAGING_SUFFIX: &str = ".tmp";

/// An overlay handed to one VM
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayPoolEntry {
    pub path: PathBuf,
    pub source_hash: String,
}

#[derive(Debug)]
pub struct OverlayPool {
    dir: PathBuf,
    lock_path: PathBuf,
    target_size: usize,
    low_water: usize,
    replenishing: AtomicBool,
}

impl OverlayPool {
    pub fn new(dir: impl Into<PathBuf>, target_size: usize, low_water: usize) -> Self {
        let dir = dir.into();
        let lock_path = dir.join(OVERLAY_POOL_LOCK_FILE);
        Self {
            dir,
            lock_path,
            target_size,
            low_water,
            replenishing: AtomicBool::new(false),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Move a ready overlay for `artifact` to `dest`. `None` when the pool is empty.
    pub fn acquire(
        &self,
        artifact: &SnapshotArtifact,
        dest: &Path,
    ) -> Result<Option<OverlayPoolEntry>> {
        for candidate in self.ready_entries(Some(artifact.pool_prefix()))? {
            match fs::rename(&candidate, dest) {
                Ok(()) => {
                    debug!("Acquired pooled overlay {}", candidate.display());
                    return Ok(Some(OverlayPoolEntry {
                        path: dest.to_path_buf(),
                        source_hash: artifact.manifest.source_hash.clone(),
                    }));
                }
                // Taken by a concurrent acquire
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(SandboxError::Pool(format!(
                        "Failed to take {}: {}",
                        candidate.display(),
                        e
                    )))
                }
            }
        }
        Ok(None)
    }

    /// Number of overlays ready for `artifact`, or of any snapshot when `None`.
    pub fn ready_count(&self, artifact: Option<&SnapshotArtifact>) -> usize {
        self.ready_entries(artifact.map(|a| a.pool_prefix()))
            .map(|entries| entries.len())
            .unwrap_or(0)
    }

    /// Fill the pool up to its target. Blocking; holds the cross-process replenish lock.
    pub fn replenish(&self, artifact: &SnapshotArtifact) -> Result<usize> {
        fs::create_dir_all(&self.dir)?;
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&self.lock_path)?;
        FileExt::lock_exclusive(&lock)?;
        let result = self.fill(artifact);
        let _ = FileExt::unlock(&lock);
        result
    }

    fn fill(&self, artifact: &SnapshotArtifact) -> Result<usize> {
        let prefix = artifact.pool_prefix();
        self.purge_stale(prefix)?;

        let mut created = 0;
        let mut ready = self.ready_entries(Some(prefix))?.len();
        while ready < self.target_size {
            let name = format!("{}-{}{}", prefix, Uuid::new_v4().simple(), OVERLAY_SUFFIX);
            let staging = self.dir.join(format!("{}{}", name, STAGING_SUFFIX));
            // std::fs::copy uses copy_file_range, which reflinks on filesystems that support it
            if let Err(e) = fs::copy(artifact.overlay_path(), &staging) {
                let _ = fs::remove_file(&staging);
                return Err(SandboxError::Pool(format!(
                    "Failed to copy golden overlay: {}",
                    e
                )));
            }
            fs::rename(&staging, self.dir.join(&name))?;
            created += 1;
            ready += 1;
        }
        if created > 0 {
            info!("Replenished overlay pool with {} entries", created);
        }
        Ok(created)
    }

    /// Remove overlays of older snapshots and abandoned staging copies.
    fn purge_stale(&self, prefix: &str) -> Result<()> {
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let stale = name.ends_with(STAGING_SUFFIX)
                || (name.ends_with(OVERLAY_SUFFIX) && !name.starts_with(prefix));
            if stale {
                debug!("Removing stale pool file {}", name);
                let _ = fs::remove_file(&path);
            }
        }
        Ok(())
    }

    fn ready_entries(&self, prefix: Option<&str>) -> Result<Vec<PathBuf>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut ready = Vec::new();
        for entry in entries {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.ends_with(OVERLAY_SUFFIX) && prefix.map(|p| name.starts_with(p)).unwrap_or(true)
            {
                ready.push(path);
            }
        }
        ready.sort();
        Ok(ready)
    }

    /// Replenish in the background when the pool has dropped below its low-water mark.
    pub fn trigger_replenish(
        self: &Arc<Self>,
        artifact: &SnapshotArtifact,
    ) -> Option<JoinHandle<Result<usize>>> {
        if self.ready_count(Some(artifact)) >= self.low_water {
            return None;
        }
        self.spawn_replenish(artifact)
    }

    /// Replenish in the background unless a replenish is already running.
    pub fn spawn_replenish(
        self: &Arc<Self>,
        artifact: &SnapshotArtifact,
    ) -> Option<JoinHandle<Result<usize>>> {
        if self.replenishing.swap(true, Ordering::AcqRel) {
            return None;
        }
        let pool = Arc::clone(self);
        let artifact = artifact.clone();
        Some(tokio::task::spawn_blocking(move || {
            let _running = ReplenishGuard(&pool.replenishing);
            let result = pool.replenish(&artifact);
            if let Err(e) = &result {
                warn!("Overlay pool replenishment failed: {}", e);
            }
            result
        }))
    }
}

/// Clears the in-progress flag even if replenishment panics
struct ReplenishGuard<'a>(&'a AtomicBool);

impl Drop for ReplenishGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
