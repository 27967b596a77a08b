// ABOUTME: Hypervisor abstraction and the Firecracker implementation
// ABOUTME: Writes the VM config, launches inside the VM's namespace, and drives the API socket

use async_trait::async_trait;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Method, Request, Uri};
use hyper_util::client::legacy::Client;
use hyperlocal::{UnixClientExt, UnixConnector, Uri as UnixUri};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use stratus_core::constants::{HYPERVISOR_LOG_FILE, OVERLAY_FILE, VM_CONFIG_FILE, VSOCK_SOCKET_FILE};
use tokio::net::UnixStream;
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::{Result, SandboxError};
use crate::netns::GUEST_TAP_DEVICE;
use crate::snapshot::SnapshotArtifact;
use crate::workspace::VmWorkspace;

/// Guest CID on the vsock device; each VM has its own device so it never collides
pub const GUEST_CID: u32 = 3;

const GUEST_MAC: &str = "06:00:AC:10:00:02";
const BOOT_ARGS: &str = "console=ttyS0 reboot=k panic=1 pci=off \
                         ip=172.16.0.2::172.16.0.1:255.255.255.252::eth0:off";
const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Where a VM's memory and device state come from
#[derive(Debug, Clone)]
pub enum BootSource {
    /// Boot the kernel from scratch
    Cold,
    /// Resume a previously captured guest
    Snapshot(SnapshotArtifact),
}

#[derive(Debug, Clone)]
pub struct VmLaunchSpec {
    pub vm_id: String,
    pub netns: String,
    pub boot: BootSource,
    pub vcpus: u32,
    pub memory_mb: u32,
    pub kernel_image: PathBuf,
    pub rootfs_image: PathBuf,
    pub socket_ready_timeout: Duration,
}

/// Destination files for a snapshot
#[derive(Debug, Clone)]
pub struct SnapshotOutput {
    pub memory_path: PathBuf,
    pub state_path: PathBuf,
}

/// A running hypervisor child
#[derive(Debug)]
pub struct HypervisorProcess {
    child: Child,
    pid: u32,
}

impl HypervisorProcess {
    pub fn new(child: Child) -> Result<Self> {
        let pid = child
            .id()
            .ok_or_else(|| SandboxError::Hypervisor("Process exited before it had a pid".into()))?;
        Ok(Self { child, pid })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// SIGKILL and reap. Safe to call more than once.
    pub async fn kill(&mut self) -> Result<()> {
        if self.is_running() {
            self.child.start_kill()?;
        }
        self.child.wait().await?;
        Ok(())
    }
}

#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Write whatever the hypervisor needs into the workspace before launch
    async fn prepare(&self, workspace: &VmWorkspace, spec: &VmLaunchSpec) -> Result<()>;

    /// Start the VM and return once its control socket answers.
    /// The process pid is recorded in the workspace metadata before waiting.
    async fn launch(&self, workspace: &VmWorkspace, spec: &VmLaunchSpec)
        -> Result<HypervisorProcess>;

    /// Pause the running VM and capture its memory and device state
    async fn snapshot(&self, workspace: &VmWorkspace, output: &SnapshotOutput) -> Result<()>;
}

/// Poll until `path` accepts connections, failing early if the process dies.
pub async fn wait_for_socket(
    path: &Path,
    ready_timeout: Duration,
    process: &mut HypervisorProcess,
    what: &'static str,
) -> Result<()> {
    let deadline = Instant::now() + ready_timeout;
    loop {
        if UnixStream::connect(path).await.is_ok() {
            return Ok(());
        }
        if !process.is_running() {
            return Err(SandboxError::Hypervisor(format!(
                "Process {} exited before {} was ready",
                process.pid(),
                what
            )));
        }
        if Instant::now() >= deadline {
            return Err(SandboxError::BootTimeout {
                what,
                seconds: ready_timeout.as_secs(),
            });
        }
        tokio::time::sleep(SOCKET_POLL_INTERVAL).await;
    }
}

/// Firecracker configuration. Overlay, vsock and log paths are relative so a snapshot
/// taken in one workspace restores against another.
pub fn firecracker_config(spec: &VmLaunchSpec) -> Value {
    json!({
        "boot-source": {
            "kernel_image_path": spec.kernel_image,
            "boot_args": BOOT_ARGS,
        },
        "drives": [
            {
                "drive_id": "rootfs",
                "path_on_host": spec.rootfs_image,
                "is_root_device": true,
                "is_read_only": true,
            },
            {
                "drive_id": "overlay",
                "path_on_host": OVERLAY_FILE,
                "is_root_device": false,
                "is_read_only": false,
            }
        ],
        "machine-config": {
            "vcpu_count": spec.vcpus,
            "mem_size_mib": spec.memory_mb,
        },
        "network-interfaces": [
            {
                "iface_id": "eth0",
                "host_dev_name": GUEST_TAP_DEVICE,
                "guest_mac": GUEST_MAC,
            }
        ],
        "vsock": {
            "guest_cid": GUEST_CID,
            "uds_path": VSOCK_SOCKET_FILE,
        },
        "logger": {
            "log_path": HYPERVISOR_LOG_FILE,
            "level": "Warning",
        },
    })
}

/// Minimal client for the Firecracker API socket
#[derive(Debug, Clone)]
pub struct FirecrackerApi {
    socket: PathBuf,
}

impl FirecrackerApi {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
        }
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Value,
        operation: &'static str,
    ) -> Result<()> {
        let client: Client<UnixConnector, Full<Bytes>> = Client::unix();
        let uri: Uri = UnixUri::new(&self.socket, path).into();
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .header("accept", "application/json")
            .body(Full::new(Bytes::from(body.to_string())))
            .map_err(|e| SandboxError::Hypervisor(format!("{}: {}", operation, e)))?;

        let response = client
            .request(request)
            .await
            .map_err(|e| SandboxError::Hypervisor(format!("{}: {}", operation, e)))?;
        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .map_err(|e| SandboxError::Hypervisor(format!("{}: {}", operation, e)))?
            .to_bytes();

        if status.is_success() {
            debug!("Firecracker {} -> {}", operation, status);
            Ok(())
        } else {
            Err(SandboxError::HypervisorApi {
                operation,
                status: status.as_u16(),
                body: String::from_utf8_lossy(&bytes).into_owned(),
            })
        }
    }

    pub async fn load_snapshot(&self, artifact: &SnapshotArtifact) -> Result<()> {
        self.send(
            Method::PUT,
            "/snapshot/load",
            json!({
                "snapshot_path": artifact.state_path(),
                "mem_backend": {
                    "backend_type": "File",
                    "backend_path": artifact.memory_path(),
                },
                "enable_diff_snapshots": false,
                "resume_vm": true,
            }),
            "load_snapshot",
        )
        .await
    }

    pub async fn pause(&self) -> Result<()> {
        self.send(Method::PATCH, "/vm", json!({ "state": "Paused" }), "pause_vm")
            .await
    }

    pub async fn create_snapshot(&self, output: &SnapshotOutput) -> Result<()> {
        self.send(
            Method::PUT,
            "/snapshot/create",
            json!({
                "snapshot_type": "Full",
                "snapshot_path": output.state_path,
                "mem_file_path": output.memory_path,
            }),
            "create_snapshot",
        )
        .await
    }
}

/// Runs Firecracker inside the VM's network namespace via `ip netns exec`
#[derive(Debug, Clone)]
pub struct FirecrackerHypervisor {
    binary: PathBuf,
}

impl FirecrackerHypervisor {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

#[async_trait]
impl Hypervisor for FirecrackerHypervisor {
    async fn prepare(&self, workspace: &VmWorkspace, spec: &VmLaunchSpec) -> Result<()> {
        let config = serde_json::to_vec_pretty(&firecracker_config(spec))?;
        tokio::fs::write(workspace.config_path(), config).await?;
        // Firecracker refuses to start if the log file is missing
        tokio::fs::write(workspace.log_path(), b"").await?;
        Ok(())
    }

    async fn launch(
        &self,
        workspace: &VmWorkspace,
        spec: &VmLaunchSpec,
    ) -> Result<HypervisorProcess> {
        let api_socket = workspace.api_socket_path();
        let _ = tokio::fs::remove_file(&api_socket).await;

        let mut command = Command::new("ip");
        command
            .args(["netns", "exec", spec.netns.as_str()])
            .arg(&self.binary)
            // Absolute, so the recorded cmdline identifies the workspace
            .arg("--api-sock")
            .arg(&api_socket);
        if matches!(spec.boot, BootSource::Cold) {
            command.arg("--config-file").arg(VM_CONFIG_FILE);
        }
        command
            .current_dir(workspace.dir())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let child = command.spawn().map_err(|e| {
            SandboxError::Hypervisor(format!("Failed to start {}: {}", self.binary.display(), e))
        })?;
        let mut process = HypervisorProcess::new(child)?;
        workspace.record_hypervisor_pid(process.pid())?;

        wait_for_socket(
            &api_socket,
            spec.socket_ready_timeout,
            &mut process,
            "hypervisor API socket",
        )
        .await?;

        if let BootSource::Snapshot(artifact) = &spec.boot {
            FirecrackerApi::new(&api_socket).load_snapshot(artifact).await?;
        }

        info!(
            vm_id = %spec.vm_id,
            pid = process.pid(),
            "Firecracker started in {}",
            spec.netns
        );
        Ok(process)
    }

    async fn snapshot(&self, workspace: &VmWorkspace, output: &SnapshotOutput) -> Result<()> {
        let api = FirecrackerApi::new(workspace.api_socket_path());
        api.pause().await?;
        api.create_snapshot(output).await
    }
}
