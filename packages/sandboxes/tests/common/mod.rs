// ABOUTME: Shared fakes for runner integration tests
// ABOUTME: A hypervisor that spawns a real killable process with a scripted guest, and a recording network

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use stratus_core::constants::{
    SNAPSHOT_MANIFEST_FILE, SNAPSHOT_MEMORY_FILE, SNAPSHOT_OVERLAY_FILE, SNAPSHOT_STATE_FILE,
};
use stratus_core::{CliAgentType, ExecutionContext, FirewallPolicy};
use stratus_sandboxes::guest_channel::{read_frame, write_frame};
use stratus_sandboxes::hypervisor::{firecracker_config, wait_for_socket};
use stratus_sandboxes::{
    BootMode, BootSource, GuestMessage, HostNetwork, HostResources, Hypervisor,
    HypervisorProcess, JobRequest, NetNsEntry, OverlayPool, Result, RunnerConfig, SandboxError,
    SnapshotArtifact, SnapshotManifest, SnapshotOutput, VmLaunchSpec, VmOrchestrator, VmWorkspace,
};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::process::Command;
use tokio::task::AbortHandle;

/// One recorded hypervisor launch
#[derive(Debug, Clone)]
pub struct Launch {
    pub vm_id: String,
    pub netns: String,
    pub boot_mode: BootMode,
    pub pid: u32,
}

/// Spawns `sh` as a stand-in VM process and serves a scripted guest agent on the vsock socket.
///
/// The guest reacts to the job prompt: `complete`, `fail`, `exit-3`, `hang`, or `hangup`.
pub struct FakeHypervisor {
    guest_enabled: bool,
    launches: Mutex<Vec<Launch>>,
    tasks: Mutex<Vec<AbortHandle>>,
}

impl FakeHypervisor {
    pub fn new() -> Self {
        Self {
            guest_enabled: true,
            launches: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// The VM starts but its guest agent never answers
    pub fn without_guest() -> Self {
        Self {
            guest_enabled: false,
            launches: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn launches(&self) -> Vec<Launch> {
        self.launches.lock().unwrap().clone()
    }

    fn track(&self, handle: AbortHandle) {
        self.tasks.lock().unwrap().push(handle);
    }
}

impl Drop for FakeHypervisor {
    fn drop(&mut self) {
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }
}

/// Spawn a process whose command line names `workspace`, like a real hypervisor would.
pub fn spawn_vm_process(workspace: &Path) -> tokio::process::Child {
    Command::new("sh")
        .args(["-c", "while :; do sleep 1; done", "stratus-fake-vm"])
        .arg(workspace)
        .kill_on_drop(true)
        .spawn()
        .unwrap()
}

async fn serve_api(listener: UnixListener) {
    // Accept and ignore; readiness is all the orchestrator checks
    while let Ok((stream, _)) = listener.accept().await {
        drop(stream);
    }
}

async fn serve_guest(listener: UnixListener) {
    while let Ok((stream, _)) = listener.accept().await {
        tokio::spawn(guest_connection(stream));
    }
}

async fn guest_connection(mut stream: UnixStream) {
    let mut line = Vec::new();
    loop {
        let Ok(byte) = stream.read_u8().await else {
            return;
        };
        if byte == b'\n' {
            break;
        }
        line.push(byte);
    }
    if !line.starts_with(b"CONNECT ") {
        let _ = stream.write_all(b"ERR unexpected handshake\n").await;
        return;
    }
    if stream.write_all(b"OK 1073741824\n").await.is_err() {
        return;
    }

    // Probe connections close without sending a job
    let Ok(Some(request)) = read_frame::<_, JobRequest>(&mut stream).await else {
        return;
    };
    match request.prompt.as_str() {
        "complete" => {
            let _ = write_frame(
                &mut stream,
                &GuestMessage::Event {
                    event: serde_json::json!({ "line": format!("working on {}", request.run_id) }),
                },
            )
            .await;
            let _ = write_frame(
                &mut stream,
                &GuestMessage::Completed {
                    exit_code: 0,
                    output: Some(serde_json::json!("done")),
                },
            )
            .await;
        }
        "fail" => {
            let _ = write_frame(
                &mut stream,
                &GuestMessage::Failed {
                    error: "agent crashed".to_string(),
                },
            )
            .await;
        }
        "exit-3" => {
            let _ = write_frame(
                &mut stream,
                &GuestMessage::Completed {
                    exit_code: 3,
                    output: None,
                },
            )
            .await;
        }
        "hangup" => {}
        _ => std::future::pending::<()>().await,
    }
}

#[async_trait]
impl Hypervisor for FakeHypervisor {
    async fn prepare(&self, workspace: &VmWorkspace, spec: &VmLaunchSpec) -> Result<()> {
        let config = serde_json::to_vec_pretty(&firecracker_config(spec))?;
        tokio::fs::write(workspace.config_path(), config).await?;
        Ok(())
    }

    async fn launch(
        &self,
        workspace: &VmWorkspace,
        spec: &VmLaunchSpec,
    ) -> Result<HypervisorProcess> {
        let mut process = HypervisorProcess::new(spawn_vm_process(workspace.dir()))?;
        workspace.record_hypervisor_pid(process.pid())?;

        let api = UnixListener::bind(workspace.api_socket_path())?;
        self.track(tokio::spawn(serve_api(api)).abort_handle());
        if self.guest_enabled {
            let vsock = UnixListener::bind(workspace.vsock_socket_path())?;
            self.track(tokio::spawn(serve_guest(vsock)).abort_handle());
        }

        wait_for_socket(
            &workspace.api_socket_path(),
            spec.socket_ready_timeout,
            &mut process,
            "hypervisor API socket",
        )
        .await?;

        self.launches.lock().unwrap().push(Launch {
            vm_id: spec.vm_id.clone(),
            netns: spec.netns.clone(),
            boot_mode: match spec.boot {
                BootSource::Cold => BootMode::Cold,
                BootSource::Snapshot(_) => BootMode::Restore,
            },
            pid: process.pid(),
        });
        Ok(process)
    }

    async fn snapshot(&self, _workspace: &VmWorkspace, output: &SnapshotOutput) -> Result<()> {
        tokio::fs::write(&output.memory_path, b"guest memory").await?;
        tokio::fs::write(&output.state_path, b"device state").await?;
        Ok(())
    }
}

/// Records namespace setup and teardown instead of touching the host
#[derive(Default)]
pub struct FakeNetwork {
    pub fail_setup: AtomicBool,
    setups: Mutex<Vec<String>>,
    teardowns: Mutex<Vec<String>>,
}

impl FakeNetwork {
    pub fn setups(&self) -> Vec<String> {
        self.setups.lock().unwrap().clone()
    }

    pub fn teardowns(&self) -> Vec<String> {
        self.teardowns.lock().unwrap().clone()
    }
}

#[async_trait]
impl HostNetwork for FakeNetwork {
    async fn setup(&self, entry: &NetNsEntry, _proxy_port: u16) -> Result<()> {
        if self.fail_setup.load(Ordering::SeqCst) {
            return Err(SandboxError::Network("ip netns add: permission denied".to_string()));
        }
        self.setups.lock().unwrap().push(entry.vm_id.clone());
        Ok(())
    }

    async fn teardown(&self, entry: &NetNsEntry) -> Result<()> {
        self.teardowns.lock().unwrap().push(entry.vm_id.clone());
        Ok(())
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub hypervisor: Arc<FakeHypervisor>,
    pub network: Arc<FakeNetwork>,
    pub host: Arc<HostResources>,
    pub pool: Arc<OverlayPool>,
}

pub fn test_config(base: &Path) -> RunnerConfig {
    let mut config = RunnerConfig::for_base_dir(base);
    config.job_timeout = Duration::from_secs(20);
    config.socket_ready_timeout = Duration::from_secs(3);
    config.poll_interval = Duration::from_millis(50);
    config.heartbeat_interval = Duration::from_millis(200);
    config.overlay_size_mb = 1;
    config.pool_target_size = 2;
    config.pool_low_water = 1;
    config.snapshot_settle = Duration::from_millis(10);
    config.kernel_image = base.join("images").join("vmlinux");
    config.rootfs_image = base.join("images").join("rootfs.ext4");
    config
}

impl Harness {
    pub fn new() -> Self {
        Self::build(FakeHypervisor::new(), |_| {})
    }

    pub fn build(hypervisor: FakeHypervisor, configure: impl FnOnce(&mut RunnerConfig)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        configure(&mut config);
        config.validate().unwrap();

        let images = dir.path().join("images");
        fs::create_dir_all(&images).unwrap();
        fs::write(&config.kernel_image, b"kernel image").unwrap();
        fs::write(&config.rootfs_image, b"root filesystem").unwrap();

        let hypervisor = Arc::new(hypervisor);
        let network = Arc::new(FakeNetwork::default());
        let pool = Arc::new(OverlayPool::new(
            config.overlay_pool_dir(),
            config.pool_target_size,
            config.pool_low_water,
        ));
        let host = Arc::new(HostResources::new(
            config,
            hypervisor.clone(),
            network.clone(),
        ));
        Self {
            dir,
            hypervisor,
            network,
            host,
            pool,
        }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.host.config
    }

    pub fn orchestrator(&self) -> VmOrchestrator {
        VmOrchestrator::new(self.host.clone(), self.pool.clone())
    }

    /// Lay down a complete snapshot directory without booting anything.
    pub fn write_snapshot(&self) -> SnapshotArtifact {
        let dir = self.config().snapshot_dir.join("20260101T000000-feedfacecafe");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(SNAPSHOT_MEMORY_FILE), b"guest memory").unwrap();
        fs::write(dir.join(SNAPSHOT_STATE_FILE), b"device state").unwrap();
        fs::write(dir.join(SNAPSHOT_OVERLAY_FILE), b"golden overlay").unwrap();
        let manifest = SnapshotManifest {
            source_hash: "feedfacecafebeef0000000000000000".to_string(),
            kernel_image: self.config().kernel_image.clone(),
            rootfs_image: self.config().rootfs_image.clone(),
            vcpus: self.config().vm_vcpus,
            memory_mb: self.config().vm_memory_mb,
            created_at: Utc::now(),
        };
        fs::write(
            dir.join(SNAPSHOT_MANIFEST_FILE),
            serde_json::to_vec(&manifest).unwrap(),
        )
        .unwrap();
        SnapshotArtifact::load(&dir).unwrap()
    }

    pub fn workspace_dirs(&self) -> Vec<PathBuf> {
        stratus_sandboxes::list_workspaces(&self.config().workspaces_dir()).unwrap()
    }
}

pub fn context(run_id: &str, prompt: &str) -> ExecutionContext {
    ExecutionContext {
        run_id: run_id.to_string(),
        prompt: prompt.to_string(),
        agent_compose_version_id: "compose_v1".to_string(),
        vars: HashMap::new(),
        secret_names: vec!["API_KEY".to_string()],
        checkpoint_id: None,
        sandbox_token: "sandbox-token".to_string(),
        working_dir: "/home/agent/workspace".to_string(),
        storage_manifest: None,
        environment: HashMap::new(),
        resume_session: None,
        secret_values: HashMap::from([("API_KEY".to_string(), "sk-test".to_string())]),
        cli_agent_type: CliAgentType::default(),
        firewall: Some(FirewallPolicy::default()),
    }
}

/// PID of a process that has already exited and been reaped
pub fn dead_pid() -> u32 {
    let mut child = std::process::Command::new("true").spawn().unwrap();
    let pid = child.id();
    child.wait().unwrap();
    pid
}
