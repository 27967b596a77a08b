// ABOUTME: MicroVM execution runner for Stratus
// ABOUTME: Claims jobs, runs each in a Firecracker microVM behind its own network namespace, and tears it down

pub mod claim_client;
pub mod config;
pub mod error;
pub mod guest_channel;
pub mod host;
pub mod hypervisor;
pub mod instance_lock;
pub mod netns;
pub mod orchestrator;
pub mod pool;
pub mod process;
pub mod runner;
pub mod snapshot;
pub mod status;
pub mod types;
pub mod workspace;

// Re-export commonly used types
pub use claim_client::{HttpJobSource, JobSource};
pub use config::RunnerConfig;
pub use error::{Result, SandboxError};
pub use guest_channel::{GuestChannel, GuestMessage, JobRequest, MAX_FRAME_BYTES};
pub use host::{HostResources, ReconcileReport, TeardownReport};
pub use hypervisor::{
    BootSource, FirecrackerHypervisor, Hypervisor, HypervisorProcess, SnapshotOutput,
    VmLaunchSpec,
};
pub use instance_lock::InstanceLock;
pub use netns::{HostNetwork, IpCommandNetwork, NetNsAllocator, NetNsEntry};
pub use orchestrator::VmOrchestrator;
pub use pool::{OverlayPool, OverlayPoolEntry};
pub use runner::Runner;
pub use snapshot::{SnapshotArtifact, SnapshotGenerator, SnapshotManifest};
pub use status::{RunnerState, RunnerStatus, StatusFile};
pub use types::{BootMode, JobReport, VmEvent, VmEventKind, VmState};
pub use workspace::{list_workspaces, VmWorkspace, WorkspaceMetadata};
