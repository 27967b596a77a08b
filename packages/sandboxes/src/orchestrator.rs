// ABOUTME: Per-job VM lifecycle from provisioning to teardown
// ABOUTME: Races the guest against the job budget and external cancellation, then always tears down

use chrono::Utc;
use std::sync::Arc;
use stratus_core::{ExecutionContext, JobOutcome};
use stratus_proxy::{network_log_path, ProxyVmEntry};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::error::{Result, SandboxError};
use crate::guest_channel::{GuestChannel, GuestMessage, JobRequest};
use crate::host::{HostResources, ReconcileReport};
use crate::hypervisor::{BootSource, HypervisorProcess, VmLaunchSpec};
use crate::pool::OverlayPool;
use crate::snapshot::{create_sparse_overlay, SnapshotArtifact};
use crate::types::{BootMode, JobReport, VmEvent, VmEventKind, VmState};
use crate::workspace::VmWorkspace;

/// Mutable per-job state the driver fills in as it goes
struct ActiveVm {
    workspace: VmWorkspace,
    process: Option<HypervisorProcess>,
    boot_mode: Option<BootMode>,
}

pub struct VmOrchestrator {
    host: Arc<HostResources>,
    pool: Arc<OverlayPool>,
    events: broadcast::Sender<VmEvent>,
    ca_cert_pem: Option<String>,
}

impl VmOrchestrator {
    pub fn new(host: Arc<HostResources>, pool: Arc<OverlayPool>) -> Self {
        let (events, _) = broadcast::channel(host.config.event_channel_size);
        Self {
            host,
            pool,
            events,
            ca_cert_pem: None,
        }
    }

    /// CA certificate guests must trust when their traffic is inspected
    pub fn with_ca_cert(mut self, pem: impl Into<String>) -> Self {
        self.ca_cert_pem = Some(pem.into());
        self
    }

    pub fn host(&self) -> &Arc<HostResources> {
        &self.host
    }

    pub fn pool(&self) -> &Arc<OverlayPool> {
        &self.pool
    }

    /// Lifecycle and guest events. Slow subscribers lag and lose events.
    pub fn subscribe(&self) -> broadcast::Receiver<VmEvent> {
        self.events.subscribe()
    }

    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        self.host.reconcile().await
    }

    fn emit(&self, run_id: &str, vm_id: Option<&str>, kind: VmEventKind) {
        // No subscribers is fine
        let _ = self.events.send(VmEvent {
            run_id: run_id.to_string(),
            vm_id: vm_id.map(str::to_string),
            kind,
        });
    }

    fn transition(&self, run_id: &str, vm_id: &str, state: VmState) {
        debug!(run_id, vm_id, "VM -> {}", state);
        self.emit(run_id, Some(vm_id), VmEventKind::StateChanged { state });
    }

    /// Run one claimed job to a terminal outcome. Teardown always happens before returning.
    pub async fn run_job(
        &self,
        ctx: ExecutionContext,
        mut cancel: watch::Receiver<bool>,
    ) -> JobReport {
        let run_id = ctx.run_id.clone();
        let budget = self.host.config.job_timeout;
        self.emit(
            &run_id,
            None,
            VmEventKind::StateChanged {
                state: VmState::Dispatched,
            },
        );

        let workspace = match VmWorkspace::create(&self.host.config.workspaces_dir(), &run_id) {
            Ok(ws) => ws,
            Err(e) => {
                warn!(run_id = %run_id, "Failed to create workspace: {}", e);
                return JobReport {
                    run_id,
                    vm_id: None,
                    boot_mode: None,
                    outcome: JobOutcome::Failed {
                        error: format!("Failed to create workspace: {}", e),
                    },
                    final_state: VmState::Failed,
                };
            }
        };
        let vm_id = workspace.vm_id().to_string();
        let mut vm = ActiveVm {
            workspace,
            process: None,
            boot_mode: None,
        };

        let outcome = tokio::select! {
            result = self.drive(&ctx, &mut vm) => match result {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(run_id = %run_id, vm_id = %vm_id, "Job failed: {}", e);
                    JobOutcome::Failed { error: e.to_string() }
                }
            },
            _ = tokio::time::sleep(budget) => {
                warn!(run_id = %run_id, vm_id = %vm_id, "No result within {}s", budget.as_secs());
                JobOutcome::Timeout { budget_secs: budget.as_secs() }
            }
            _ = wait_for_cancel(&mut cancel) => {
                info!(run_id = %run_id, vm_id = %vm_id, "Job cancelled");
                JobOutcome::Cancelled { reason: "Cancelled by runner".to_string() }
            }
        };

        let final_state = match outcome {
            JobOutcome::Completed { .. } => VmState::Completed,
            JobOutcome::Failed { .. } => VmState::Failed,
            JobOutcome::Timeout { .. } | JobOutcome::Cancelled { .. } => VmState::Cancelled,
        };
        self.transition(&run_id, &vm_id, final_state);

        let report = self
            .host
            .teardown(vm.workspace.dir(), vm.process.as_mut())
            .await;
        debug!(run_id = %run_id, vm_id = %vm_id, "Teardown: {:?}", report);
        self.transition(&run_id, &vm_id, VmState::TornDown);

        JobReport {
            run_id,
            vm_id: Some(vm_id),
            boot_mode: vm.boot_mode,
            outcome,
            final_state,
        }
    }

    async fn drive(&self, ctx: &ExecutionContext, vm: &mut ActiveVm) -> Result<JobOutcome> {
        let config = &self.host.config;
        let run_id = ctx.run_id.as_str();
        let vm_id = vm.workspace.vm_id().to_string();
        self.transition(run_id, &vm_id, VmState::Provisioning);

        let boot = self.provision_overlay(&vm.workspace).await?;
        let boot_mode = match boot {
            BootSource::Cold => BootMode::Cold,
            BootSource::Snapshot(_) => BootMode::Restore,
        };

        let entry = self.host.reserve_network(&vm.workspace).await?;
        self.host.proxy_registry.register(ProxyVmEntry {
            vm_id: vm_id.clone(),
            run_id: run_id.to_string(),
            source_ip: entry.ns_ip,
            firewall: ctx.firewall.clone(),
            network_log_path: network_log_path(&config.temp_dir, run_id),
            registered_at: Utc::now(),
        })?;

        let spec = VmLaunchSpec {
            vm_id: vm_id.clone(),
            netns: entry.name.clone(),
            boot,
            vcpus: config.vm_vcpus,
            memory_mb: config.vm_memory_mb,
            kernel_image: config.kernel_image.clone(),
            rootfs_image: config.rootfs_image.clone(),
            socket_ready_timeout: config.socket_ready_timeout,
        };
        self.host.hypervisor.prepare(&vm.workspace, &spec).await?;
        vm.boot_mode = Some(boot_mode);
        vm.process = Some(self.host.hypervisor.launch(&vm.workspace, &spec).await?);

        let mut channel = GuestChannel::connect(
            &vm.workspace.vsock_socket_path(),
            config.guest_port,
            config.socket_ready_timeout,
        )
        .await?;
        info!(run_id, vm_id = %vm_id, "VM booted ({:?})", boot_mode);
        self.transition(run_id, &vm_id, VmState::Booted);

        let proxy_url = format!("http://{}:{}", entry.host_ip, config.proxy_port);
        let inspect = ctx.firewall.as_ref().map(|f| f.inspect_tls).unwrap_or(false);
        let request = JobRequest::from_context(
            ctx,
            Some(proxy_url),
            if inspect { self.ca_cert_pem.clone() } else { None },
            config.job_timeout.as_secs(),
        );
        channel.send_job(&request).await?;
        self.transition(run_id, &vm_id, VmState::Executing);

        loop {
            match channel.next_message().await? {
                Some(GuestMessage::Event { event }) => {
                    self.emit(
                        run_id,
                        Some(&vm_id),
                        VmEventKind::GuestEvent { payload: event },
                    );
                }
                Some(GuestMessage::Completed { exit_code: 0, output }) => {
                    return Ok(JobOutcome::Completed {
                        exit_code: 0,
                        output,
                    });
                }
                Some(GuestMessage::Completed { exit_code, .. }) => {
                    return Ok(JobOutcome::Failed {
                        error: format!("Agent exited with code {}", exit_code),
                    });
                }
                Some(GuestMessage::Failed { error }) => return Ok(JobOutcome::Failed { error }),
                None => {
                    return Err(SandboxError::GuestChannel(
                        "Guest closed the channel without a result".to_string(),
                    ))
                }
            }
        }
    }

    /// Place an overlay in the workspace: pooled for a restore, blank for a cold boot.
    async fn provision_overlay(&self, workspace: &VmWorkspace) -> Result<BootSource> {
        let artifact = match SnapshotArtifact::latest(&self.host.config.snapshot_dir) {
            Ok(artifact) => artifact,
            Err(e) => {
                warn!("Cannot read snapshots, booting cold: {}", e);
                None
            }
        };

        if let Some(artifact) = artifact {
            let acquired = self.pool.acquire(&artifact, &workspace.overlay_path());
            self.pool.trigger_replenish(&artifact);
            match acquired {
                Ok(Some(_)) => return Ok(BootSource::Snapshot(artifact)),
                Ok(None) => debug!("Overlay pool empty, booting cold"),
                Err(e) => warn!("Overlay pool unavailable, booting cold: {}", e),
            }
        }

        create_sparse_overlay(&workspace.overlay_path(), self.host.config.overlay_size_mb)?;
        Ok(BootSource::Cold)
    }
}

/// Resolves once the flag is set, and never if the sender is dropped without setting it.
async fn wait_for_cancel(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
