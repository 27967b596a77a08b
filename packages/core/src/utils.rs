// ABOUTME: Shared utility functions for Stratus
// ABOUTME: ID generation and path checks

use std::path::Path;
use tokio::fs;

const ID_CHARSET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

fn random_id(len: usize) -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| {
            let idx = rng.gen_range(0..ID_CHARSET.len());
            ID_CHARSET[idx] as char
        })
        .collect()
}

/// Generate a run ID (`run_` + 16 lowercase alphanumerics)
pub fn generate_run_id() -> String {
    format!("run_{}", random_id(16))
}

/// Generate a VM ID. Lowercase so it is safe in file and device names.
pub fn generate_vm_id() -> String {
    random_id(12)
}

/// Checks if a path exists
pub async fn path_exists(path: impl AsRef<Path>) -> bool {
    fs::metadata(path).await.is_ok()
}
