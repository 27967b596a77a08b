// ABOUTME: Environment variable name constants
// ABOUTME: Centralized definitions of all environment variable names used across Stratus

// Logging
pub const RUST_LOG: &str = "RUST_LOG";
pub const STRATUS_LOG_JSON: &str = "STRATUS_LOG_JSON";

// Runner Layout
pub const STRATUS_BASE_DIR: &str = "STRATUS_BASE_DIR";
pub const STRATUS_RUN_DIR: &str = "STRATUS_RUN_DIR";
pub const STRATUS_TEMP_DIR: &str = "STRATUS_TEMP_DIR";
pub const STRATUS_SNAPSHOT_DIR: &str = "STRATUS_SNAPSHOT_DIR";

// Control Plane Connection
pub const STRATUS_API_URL: &str = "STRATUS_API_URL";
pub const STRATUS_RUNNER_TOKEN: &str = "STRATUS_RUNNER_TOKEN";
pub const STRATUS_RUNNER_GROUP: &str = "STRATUS_RUNNER_GROUP";
pub const STRATUS_HTTP_TIMEOUT_SECS: &str = "STRATUS_HTTP_TIMEOUT_SECS";

// Runner Scheduling
pub const STRATUS_MAX_CONCURRENT_VMS: &str = "STRATUS_MAX_CONCURRENT_VMS";
pub const STRATUS_JOB_TIMEOUT_SECS: &str = "STRATUS_JOB_TIMEOUT_SECS";
pub const STRATUS_POLL_INTERVAL_SECS: &str = "STRATUS_POLL_INTERVAL_SECS";
pub const STRATUS_HEARTBEAT_INTERVAL_SECS: &str = "STRATUS_HEARTBEAT_INTERVAL_SECS";
pub const STRATUS_EVENT_CHANNEL_SIZE: &str = "STRATUS_EVENT_CHANNEL_SIZE";

// Overlay Pool
pub const STRATUS_POOL_TARGET_SIZE: &str = "STRATUS_POOL_TARGET_SIZE";
pub const STRATUS_POOL_LOW_WATER: &str = "STRATUS_POOL_LOW_WATER";
pub const STRATUS_OVERLAY_SIZE_MB: &str = "STRATUS_OVERLAY_SIZE_MB";

// Hypervisor
pub const STRATUS_FIRECRACKER_BIN: &str = "STRATUS_FIRECRACKER_BIN";
pub const STRATUS_KERNEL_IMAGE: &str = "STRATUS_KERNEL_IMAGE";
pub const STRATUS_ROOTFS_IMAGE: &str = "STRATUS_ROOTFS_IMAGE";
pub const STRATUS_VM_VCPUS: &str = "STRATUS_VM_VCPUS";
pub const STRATUS_VM_MEMORY_MB: &str = "STRATUS_VM_MEMORY_MB";
pub const STRATUS_SOCKET_READY_TIMEOUT_SECS: &str = "STRATUS_SOCKET_READY_TIMEOUT_SECS";
pub const STRATUS_GUEST_PORT: &str = "STRATUS_GUEST_PORT";
pub const STRATUS_SNAPSHOT_SETTLE_SECS: &str = "STRATUS_SNAPSHOT_SETTLE_SECS";

// Host Networking
pub const STRATUS_NETNS_SUBNET: &str = "STRATUS_NETNS_SUBNET";
pub const STRATUS_NETNS_MAX_SLOTS: &str = "STRATUS_NETNS_MAX_SLOTS";
pub const STRATUS_PROXY_PORT: &str = "STRATUS_PROXY_PORT";

// Control Plane Server
pub const STRATUS_DATABASE_URL: &str = "STRATUS_DATABASE_URL";
pub const STRATUS_ENCRYPTION_KEY: &str = "STRATUS_ENCRYPTION_KEY";
pub const STRATUS_CONTROL_PLANE_HOST: &str = "STRATUS_CONTROL_PLANE_HOST";
pub const STRATUS_CONTROL_PLANE_PORT: &str = "STRATUS_CONTROL_PLANE_PORT";
pub const STRATUS_HEARTBEAT_EXPIRY_SECS: &str = "STRATUS_HEARTBEAT_EXPIRY_SECS";
