// ABOUTME: Runner configuration loaded from environment variables
// ABOUTME: Every path the runner touches is derived from here so tests can point it at a temp dir

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use stratus_config::constants::*;
use stratus_config::{env_parse, env_string, env_u64_in_range};
use stratus_core::constants::{
    default_base_dir, default_run_dir, NETNS_REGISTRY_FILE, OVERLAY_POOL_DIR, PROXY_CA_DIR,
    PROXY_REGISTRY_FILE, SNAPSHOTS_DIR, STATUS_FILE, WORKSPACES_DIR,
};
use stratus_core::validate_runner_group;

use crate::error::{Result, SandboxError};

pub const DEFAULT_API_URL: &str = "http://127.0.0.1:4100";
pub const DEFAULT_RUNNER_GROUP: &str = "stratus/default";
pub const DEFAULT_FIRECRACKER_BIN: &str = "/usr/local/bin/firecracker";
pub const DEFAULT_KERNEL_IMAGE: &str = "/var/lib/stratus/vmlinux";
pub const DEFAULT_ROOTFS_IMAGE: &str = "/var/lib/stratus/rootfs.ext4";
pub const DEFAULT_GUEST_PORT: u32 = 1024;
pub const DEFAULT_PROXY_PORT: u16 = 8118;
pub const DEFAULT_NETNS_SUBNET: Ipv4Addr = Ipv4Addr::new(10, 200, 0, 0);

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Per-runner state: workspaces, overlay pool, status file
    pub base_dir: PathBuf,
    /// Host-wide state shared by every runner: instance locks, namespace registry
    pub run_dir: PathBuf,
    /// Proxy CA, proxy registry, network logs
    pub temp_dir: PathBuf,
    pub snapshot_dir: PathBuf,

    pub api_url: String,
    pub runner_token: Option<String>,
    pub runner_group: String,
    pub http_timeout: Duration,

    pub max_concurrent_vms: usize,
    pub job_timeout: Duration,
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub event_channel_size: usize,

    pub pool_target_size: usize,
    pub pool_low_water: usize,
    pub overlay_size_mb: u64,

    pub firecracker_bin: PathBuf,
    pub kernel_image: PathBuf,
    pub rootfs_image: PathBuf,
    pub vm_vcpus: u32,
    pub vm_memory_mb: u32,
    pub socket_ready_timeout: Duration,
    pub guest_port: u32,
    pub snapshot_settle: Duration,

    pub netns_subnet: Ipv4Addr,
    pub netns_max_slots: u32,
    pub proxy_port: u16,
}

impl RunnerConfig {
    /// Load from the environment. Invalid values warn and fall back to defaults.
    pub fn from_env() -> Self {
        let base_dir = env_string(STRATUS_BASE_DIR)
            .map(PathBuf::from)
            .unwrap_or_else(default_base_dir);
        let mut config = Self::for_base_dir(&base_dir);

        config.run_dir = env_string(STRATUS_RUN_DIR)
            .map(PathBuf::from)
            .unwrap_or_else(default_run_dir);
        config.temp_dir = env_string(STRATUS_TEMP_DIR)
            .map(PathBuf::from)
            .unwrap_or_else(std::env::temp_dir);
        if let Some(dir) = env_string(STRATUS_SNAPSHOT_DIR) {
            config.snapshot_dir = PathBuf::from(dir);
        }

        config.api_url = env_string(STRATUS_API_URL).unwrap_or_else(|| DEFAULT_API_URL.to_string());
        config.runner_token = env_string(STRATUS_RUNNER_TOKEN);
        config.runner_group =
            env_string(STRATUS_RUNNER_GROUP).unwrap_or_else(|| DEFAULT_RUNNER_GROUP.to_string());
        config.http_timeout = secs(STRATUS_HTTP_TIMEOUT_SECS, 30, 1..=600);

        config.max_concurrent_vms =
            env_u64_in_range(STRATUS_MAX_CONCURRENT_VMS, 4, 1..=256) as usize;
        config.job_timeout = secs(STRATUS_JOB_TIMEOUT_SECS, 3600, 10..=86_400);
        config.poll_interval = secs(STRATUS_POLL_INTERVAL_SECS, 5, 1..=300);
        config.heartbeat_interval = secs(STRATUS_HEARTBEAT_INTERVAL_SECS, 30, 1..=600);
        config.event_channel_size =
            env_u64_in_range(STRATUS_EVENT_CHANNEL_SIZE, 256, 16..=65_536) as usize;

        config.pool_target_size = env_u64_in_range(STRATUS_POOL_TARGET_SIZE, 4, 0..=64) as usize;
        config.pool_low_water = env_u64_in_range(STRATUS_POOL_LOW_WATER, 2, 0..=64) as usize;
        config.overlay_size_mb = env_u64_in_range(STRATUS_OVERLAY_SIZE_MB, 4096, 64..=262_144);

        config.firecracker_bin = env_string(STRATUS_FIRECRACKER_BIN)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_FIRECRACKER_BIN));
        config.kernel_image = env_string(STRATUS_KERNEL_IMAGE)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_KERNEL_IMAGE));
        config.rootfs_image = env_string(STRATUS_ROOTFS_IMAGE)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_ROOTFS_IMAGE));
        config.vm_vcpus = env_u64_in_range(STRATUS_VM_VCPUS, 2, 1..=32) as u32;
        config.vm_memory_mb = env_u64_in_range(STRATUS_VM_MEMORY_MB, 2048, 128..=65_536) as u32;
        config.socket_ready_timeout = secs(STRATUS_SOCKET_READY_TIMEOUT_SECS, 10, 1..=120);
        config.guest_port = env_u64_in_range(STRATUS_GUEST_PORT, DEFAULT_GUEST_PORT as u64, 1..=u32::MAX as u64) as u32;
        config.snapshot_settle = secs(STRATUS_SNAPSHOT_SETTLE_SECS, 5, 0..=600);

        config.netns_subnet = env_parse(STRATUS_NETNS_SUBNET, DEFAULT_NETNS_SUBNET);
        config.netns_max_slots = env_u64_in_range(STRATUS_NETNS_MAX_SLOTS, 64, 1..=4096) as u32;
        config.proxy_port =
            env_u64_in_range(STRATUS_PROXY_PORT, DEFAULT_PROXY_PORT as u64, 1..=65_535) as u16;

        config
    }

    /// Self-contained config rooted at `base_dir`, with no environment lookups.
    pub fn for_base_dir(base_dir: &Path) -> Self {
        Self {
            base_dir: base_dir.to_path_buf(),
            run_dir: base_dir.join("run"),
            temp_dir: base_dir.join("tmp"),
            snapshot_dir: base_dir.join(SNAPSHOTS_DIR),
            api_url: DEFAULT_API_URL.to_string(),
            runner_token: None,
            runner_group: DEFAULT_RUNNER_GROUP.to_string(),
            http_timeout: Duration::from_secs(30),
            max_concurrent_vms: 4,
            job_timeout: Duration::from_secs(3600),
            poll_interval: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(30),
            event_channel_size: 256,
            pool_target_size: 4,
            pool_low_water: 2,
            overlay_size_mb: 4096,
            firecracker_bin: PathBuf::from(DEFAULT_FIRECRACKER_BIN),
            kernel_image: PathBuf::from(DEFAULT_KERNEL_IMAGE),
            rootfs_image: PathBuf::from(DEFAULT_ROOTFS_IMAGE),
            vm_vcpus: 2,
            vm_memory_mb: 2048,
            socket_ready_timeout: Duration::from_secs(10),
            guest_port: DEFAULT_GUEST_PORT,
            snapshot_settle: Duration::from_secs(5),
            netns_subnet: DEFAULT_NETNS_SUBNET,
            netns_max_slots: 64,
            proxy_port: DEFAULT_PROXY_PORT,
        }
    }

    /// Reject combinations the runner cannot work with.
    pub fn validate(&self) -> Result<()> {
        validate_runner_group(&self.runner_group)
            .map_err(|e| SandboxError::InvalidConfiguration(e.to_string()))?;
        if self.pool_low_water > self.pool_target_size {
            return Err(SandboxError::InvalidConfiguration(format!(
                "Pool low-water mark {} exceeds target size {}",
                self.pool_low_water, self.pool_target_size
            )));
        }
        if self.max_concurrent_vms as u32 > self.netns_max_slots {
            return Err(SandboxError::InvalidConfiguration(format!(
                "{} concurrent VMs need more than {} namespace slots",
                self.max_concurrent_vms, self.netns_max_slots
            )));
        }
        let last = u32::from(self.netns_subnet) as u64 + self.netns_max_slots as u64 * 4;
        if last > u32::MAX as u64 || u32::from(self.netns_subnet) % 4 != 0 {
            return Err(SandboxError::InvalidConfiguration(format!(
                "Namespace subnet {} cannot hold {} /30 slots",
                self.netns_subnet, self.netns_max_slots
            )));
        }
        Ok(())
    }

    pub fn workspaces_dir(&self) -> PathBuf {
        self.base_dir.join(WORKSPACES_DIR)
    }

    pub fn overlay_pool_dir(&self) -> PathBuf {
        self.base_dir.join(OVERLAY_POOL_DIR)
    }

    pub fn status_file(&self) -> PathBuf {
        self.base_dir.join(STATUS_FILE)
    }

    pub fn netns_registry_path(&self) -> PathBuf {
        self.run_dir.join(NETNS_REGISTRY_FILE)
    }

    pub fn proxy_registry_path(&self) -> PathBuf {
        self.temp_dir.join(PROXY_REGISTRY_FILE)
    }

    pub fn proxy_ca_dir(&self) -> PathBuf {
        self.temp_dir.join(PROXY_CA_DIR)
    }
}

fn secs(name: &str, default: u64, range: std::ops::RangeInclusive<u64>) -> Duration {
    Duration::from_secs(env_u64_in_range(name, default, range))
}
