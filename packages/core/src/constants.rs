// ABOUTME: Filesystem layout constants shared by the runner and the proxy
// ABOUTME: Directory helpers for the host-wide run dir, per-runner base dir, and temp-scoped files

use std::env;
use std::path::PathBuf;

/// Runner groups under this prefix are reserved for official runners
pub const OFFICIAL_RUNNER_GROUP_PREFIX: &str = "stratus/";

/// Every per-VM workspace directory name starts with this prefix
pub const WORKSPACE_PREFIX: &str = "vm-";

// Host-wide run directory
pub const DEFAULT_RUN_DIR: &str = "/var/run/stratus";
pub const NETNS_REGISTRY_FILE: &str = "netns-registry.json";
pub const NETNS_REGISTRY_LOCK_FILE: &str = "netns-registry.lock";

// Per-runner base directory
pub const WORKSPACES_DIR: &str = "workspaces";
pub const OVERLAY_POOL_DIR: &str = "overlay-pool";
pub const OVERLAY_POOL_LOCK_FILE: &str = "replenish.lock";
pub const SNAPSHOTS_DIR: &str = "snapshots";
pub const STATUS_FILE: &str = "status.json";

// Per-VM workspace files (relative to the workspace directory)
pub const WORKSPACE_METADATA_FILE: &str = "workspace.json";
pub const VM_CONFIG_FILE: &str = "vm-config.json";
pub const API_SOCKET_FILE: &str = "firecracker.sock";
pub const VSOCK_SOCKET_FILE: &str = "vsock.sock";
pub const OVERLAY_FILE: &str = "overlay.ext4";
pub const HYPERVISOR_LOG_FILE: &str = "firecracker.log";

// Per-snapshot output
pub const SNAPSHOT_MEMORY_FILE: &str = "memory.bin";
pub const SNAPSHOT_STATE_FILE: &str = "vmstate.bin";
pub const SNAPSHOT_OVERLAY_FILE: &str = "overlay.ext4";
pub const SNAPSHOT_MANIFEST_FILE: &str = "manifest.json";

// Temp-scoped proxy state
pub const PROXY_CA_DIR: &str = "stratus-proxy-ca";
pub const PROXY_REGISTRY_FILE: &str = "stratus-proxy-registry.json";
pub const NETWORK_LOG_DIR: &str = "stratus-network-logs";

/// Get the path to the Stratus directory (~/.stratus)
pub fn stratus_dir() -> PathBuf {
    // HOME first so tests can redirect it
    if let Ok(home) = env::var("HOME") {
        PathBuf::from(home).join(".stratus")
    } else {
        dirs::home_dir()
            .unwrap_or_else(env::temp_dir)
            .join(".stratus")
    }
}

/// Default per-runner base directory (~/.stratus/runner)
pub fn default_base_dir() -> PathBuf {
    stratus_dir().join("runner")
}

/// Default host-wide run directory
pub fn default_run_dir() -> PathBuf {
    PathBuf::from(DEFAULT_RUN_DIR)
}
