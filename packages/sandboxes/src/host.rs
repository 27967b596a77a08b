// ABOUTME: Host-side resources shared by every VM a runner manages
// ABOUTME: Network reservation, idempotent teardown, and crash reconciliation of leftovers

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use stratus_proxy::ProxyVmRegistry;
use tracing::{info, warn};

use crate::config::RunnerConfig;
use crate::error::{Result, SandboxError};
use crate::hypervisor::{Hypervisor, HypervisorProcess};
use crate::netns::{HostNetwork, NetNsAllocator, NetNsEntry};
use crate::process::{is_process_alive, kill_if_owned};
use crate::workspace::{list_workspaces, VmWorkspace};

const NETNS_RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// What one teardown pass actually did
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TeardownReport {
    pub killed: bool,
    pub netns_released: bool,
    pub proxy_unregistered: bool,
    pub workspace_removed: bool,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub workspaces_removed: usize,
    pub orphaned_namespaces: usize,
    pub stale_proxy_entries: usize,
}

pub struct HostResources {
    pub config: RunnerConfig,
    pub hypervisor: Arc<dyn Hypervisor>,
    pub network: Arc<dyn HostNetwork>,
    pub allocator: NetNsAllocator,
    pub proxy_registry: ProxyVmRegistry,
}

impl HostResources {
    pub fn new(
        config: RunnerConfig,
        hypervisor: Arc<dyn Hypervisor>,
        network: Arc<dyn HostNetwork>,
    ) -> Self {
        let allocator = NetNsAllocator::new(
            config.netns_registry_path(),
            config.netns_subnet,
            config.netns_max_slots,
        );
        let proxy_registry = ProxyVmRegistry::new(config.proxy_registry_path());
        Self {
            config,
            hypervisor,
            network,
            allocator,
            proxy_registry,
        }
    }

    /// Reserve a namespace for the workspace's VM and build it. Nothing stays reserved on failure.
    pub async fn reserve_network(&self, workspace: &VmWorkspace) -> Result<NetNsEntry> {
        let entry = self.reserve_slot(workspace.vm_id()).await?;

        let setup = async {
            workspace.record_netns(&entry.name)?;
            self.network.setup(&entry, self.config.proxy_port).await
        };
        if let Err(e) = setup.await {
            if let Err(release) = self.allocator.release(&entry) {
                warn!("Failed to release {} after setup error: {}", entry.name, release);
            }
            return Err(e);
        }
        Ok(entry)
    }

    /// Wait for a namespace slot. The registry is shared by every runner on the host, so a
    /// full registry is transient; the caller's job budget bounds the wait.
    async fn reserve_slot(&self, vm_id: &str) -> Result<NetNsEntry> {
        let mut waiting = false;
        loop {
            match self.allocator.reserve(vm_id, std::process::id()) {
                Err(SandboxError::NetnsExhausted { max_slots }) => {
                    if !waiting {
                        warn!(vm_id, "All {} namespace slots in use, waiting", max_slots);
                        waiting = true;
                    }
                    tokio::time::sleep(NETNS_RETRY_BACKOFF).await;
                }
                other => return other,
            }
        }
    }

    /// Tear down everything belonging to one workspace. Each step is best-effort and
    /// safe to repeat, so a partial or already-finished teardown can be re-run.
    pub async fn teardown(
        &self,
        workspace_dir: &Path,
        process: Option<&mut HypervisorProcess>,
    ) -> TeardownReport {
        let mut report = TeardownReport::default();
        let workspace = match VmWorkspace::open(workspace_dir) {
            Ok(ws) => ws,
            Err(e) => {
                warn!("Cannot tear down {}: {}", workspace_dir.display(), e);
                return report;
            }
        };
        let vm_id = workspace.vm_id().to_string();
        let metadata = workspace.metadata().ok();

        match process {
            Some(process) => {
                report.killed = process.is_running();
                if let Err(e) = process.kill().await {
                    warn!(vm_id = %vm_id, "Failed to kill hypervisor: {}", e);
                }
            }
            None => {
                if let Some(pid) = metadata.as_ref().and_then(|m| m.hypervisor_pid) {
                    report.killed = kill_if_owned(pid, workspace.dir());
                }
            }
        }

        // Remove the namespace before freeing its slot so a new VM never inherits it
        match self.allocator.entries() {
            Ok(entries) => {
                if let Some(entry) = entries.into_iter().find(|e| e.vm_id == vm_id) {
                    if let Err(e) = self.network.teardown(&entry).await {
                        warn!(vm_id = %vm_id, "Failed to remove {}: {}", entry.name, e);
                    }
                    match self.allocator.release(&entry) {
                        Ok(released) => report.netns_released = released,
                        Err(e) => warn!(vm_id = %vm_id, "Failed to release {}: {}", entry.name, e),
                    }
                }
            }
            Err(e) => warn!("Failed to read namespace registry: {}", e),
        }

        match self.proxy_registry.unregister(&vm_id) {
            Ok(removed) => report.proxy_unregistered = removed,
            Err(e) => warn!(vm_id = %vm_id, "Failed to unregister from proxy: {}", e),
        }

        let existed = workspace.dir().exists();
        match workspace.remove() {
            Ok(()) => report.workspace_removed = existed,
            Err(e) => warn!(vm_id = %vm_id, "Failed to remove workspace: {}", e),
        }

        report
    }

    /// Clean up whatever a crashed predecessor left behind.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();

        for dir in list_workspaces(&self.config.workspaces_dir())? {
            let owner_alive = VmWorkspace::open(&dir)
                .and_then(|ws| ws.metadata())
                .map(|m| is_process_alive(m.owner_pid))
                .unwrap_or(false);
            if owner_alive {
                continue;
            }
            let result = self.teardown(&dir, None).await;
            if result.workspace_removed {
                report.workspaces_removed += 1;
            }
        }

        for entry in self.allocator.reconcile_orphans()? {
            if let Err(e) = self.network.teardown(&entry).await {
                warn!("Failed to remove orphaned {}: {}", entry.name, e);
            }
            report.orphaned_namespaces += 1;
        }

        let live: Vec<String> = self
            .allocator
            .entries()?
            .into_iter()
            .map(|e| e.vm_id)
            .collect();
        report.stale_proxy_entries = self
            .proxy_registry
            .retain(|entry| live.contains(&entry.vm_id))?
            .len();

        if report != ReconcileReport::default() {
            info!(
                "Reconciled {} workspaces, {} namespaces, {} proxy entries",
                report.workspaces_removed, report.orphaned_namespaces, report.stale_proxy_entries
            );
        }
        Ok(report)
    }

    /// Release every namespace this process still holds. Used on shutdown.
    pub async fn release_owned_networks(&self) -> usize {
        let entries = match self.allocator.release_owned_by(std::process::id()) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Failed to release owned namespaces: {}", e);
                return 0;
            }
        };
        for entry in &entries {
            if let Err(e) = self.network.teardown(entry).await {
                warn!("Failed to remove {}: {}", entry.name, e);
            }
            if let Err(e) = self.proxy_registry.unregister(&entry.vm_id) {
                warn!("Failed to unregister {} from proxy: {}", entry.vm_id, e);
            }
        }
        entries.len()
    }
}
