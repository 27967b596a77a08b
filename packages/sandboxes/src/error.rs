// ABOUTME: Error types for the microVM runner
// ABOUTME: Separates claim rejections, boot failures, and host bookkeeping errors

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for runner operations
#[derive(Error, Debug)]
pub enum SandboxError {
    /// Another runner already owns this base directory
    #[error("Another runner holds {path} (pid {pid:?})")]
    InstanceLocked { path: PathBuf, pid: Option<u32> },

    /// Every namespace slot is in use
    #[error("No free network namespace slot (max {max_slots})")]
    NetnsExhausted { max_slots: u32 },

    /// Namespace registry or host networking command failed
    #[error("Network error: {0}")]
    Network(String),

    /// Hypervisor process could not be started or exited early
    #[error("Hypervisor error: {0}")]
    Hypervisor(String),

    /// Hypervisor API rejected a request
    #[error("Hypervisor API {operation} failed with status {status}: {body}")]
    HypervisorApi {
        operation: &'static str,
        status: u16,
        body: String,
    },

    /// A socket did not become ready in time
    #[error("{what} not ready after {seconds}s")]
    BootTimeout { what: &'static str, seconds: u64 },

    /// Guest channel protocol violation
    #[error("Guest channel error: {0}")]
    GuestChannel(String),

    /// Frame exceeds the channel limit
    #[error("Frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },

    /// Snapshot generation or loading failed
    #[error("Snapshot error: {0}")]
    Snapshot(String),

    /// Overlay pool failure
    #[error("Overlay pool error: {0}")]
    Pool(String),

    /// Workspace file access failed
    #[error("Workspace error: {0}")]
    Workspace(String),

    /// Control plane unreachable or returned garbage
    #[error("Control plane error: {0}")]
    ControlPlane(String),

    /// Control plane refused a claim, heartbeat, or completion
    #[error("Control plane rejected request ({code}): {message}")]
    ClaimRejected { code: String, message: String },

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Proxy registry or CA error
    #[error("Proxy error: {0}")]
    Proxy(#[from] stratus_proxy::ProxyError),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SandboxError {
    /// Someone else owns the job; skip it quietly
    pub fn is_race_lost(&self) -> bool {
        matches!(self, Self::ClaimRejected { code, .. } if code == "CONFLICT" || code == "NOT_FOUND")
    }

    /// Caller is not permitted; never retried
    pub fn is_authorization(&self) -> bool {
        matches!(self, Self::ClaimRejected { code, .. } if code == "UNAUTHORIZED" || code == "FORBIDDEN")
    }

    /// The job itself can never be claimed; never retried
    pub fn is_bad_request(&self) -> bool {
        matches!(self, Self::ClaimRejected { code, .. } if code == "BAD_REQUEST")
    }
}

/// Type alias for Results that return SandboxError
pub type Result<T> = std::result::Result<T, SandboxError>;
