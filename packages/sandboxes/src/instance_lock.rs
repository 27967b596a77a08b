// ABOUTME: Single-instance guard for a runner base directory
// ABOUTME: Exclusive advisory lock held for the life of the runner, failing fast when taken

use fs2::FileExt;
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::{Result, SandboxError};

/// Held for as long as this runner owns its base directory
#[derive(Debug)]
pub struct InstanceLock {
    file: File,
    path: PathBuf,
}

impl InstanceLock {
    /// Lock `<run_dir>/runner-<hash(base_dir)>.lock`, recording our PID.
    pub fn acquire(run_dir: &Path, base_dir: &Path) -> Result<Self> {
        fs::create_dir_all(run_dir)?;
        let path = run_dir.join(lock_file_name(base_dir));
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)?;

        if FileExt::try_lock_exclusive(&file).is_err() {
            let mut content = String::new();
            let pid = file
                .read_to_string(&mut content)
                .ok()
                .and_then(|_| content.trim().parse::<u32>().ok());
            return Err(SandboxError::InstanceLocked { path, pid });
        }

        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        write!(file, "{}", std::process::id())?;
        file.flush()?;

        info!("Acquired runner lock {}", path.display());
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

fn lock_file_name(base_dir: &Path) -> String {
    let digest = Sha256::digest(base_dir.to_string_lossy().as_bytes());
    format!("runner-{}.lock", &hex::encode(digest)[..16])
}
