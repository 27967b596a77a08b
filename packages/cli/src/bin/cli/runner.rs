// ABOUTME: Runner subcommands: start the claim loop, print the status file, reconcile leftovers
// ABOUTME: Wires the egress proxy, Firecracker driver, host networking, and control-plane client together

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::*;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, ContentArrangement, Table};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use stratus_config::constants::STRATUS_RUNNER_TOKEN;
use stratus_proxy::{
    default_upstream_tls, start_proxy, CertificateAuthority, ProxyServer, ProxyVmRegistry,
};
use stratus_sandboxes::process::is_process_alive;
use stratus_sandboxes::{
    FirecrackerHypervisor, HostResources, HttpJobSource, InstanceLock, IpCommandNetwork,
    NetNsAllocator, OverlayPool, Runner, RunnerConfig, RunnerState, StatusFile, VmEvent,
    VmEventKind, VmOrchestrator,
};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info};

use super::shutdown_signal;

#[derive(Subcommand)]
pub enum RunnerCommands {
    /// Start polling the control plane and running jobs in microVMs
    Start,
    /// Show the status of the runner on this host
    Status,
    /// Clean up VMs, namespaces, and proxy entries left by a crashed runner
    Reconcile,
}

impl RunnerCommands {
    pub async fn execute(self) -> Result<()> {
        let config = RunnerConfig::from_env();
        match self {
            RunnerCommands::Start => start(config).await,
            RunnerCommands::Status => status(&config),
            RunnerCommands::Reconcile => reconcile(config).await,
        }
    }
}

/// Host resources backed by the real Firecracker binary and `ip` tooling
pub fn host_resources(config: RunnerConfig) -> Arc<HostResources> {
    let hypervisor = Arc::new(FirecrackerHypervisor::new(config.firecracker_bin.clone()));
    Arc::new(HostResources::new(
        config,
        hypervisor,
        Arc::new(IpCommandNetwork::new()),
    ))
}

pub fn overlay_pool(config: &RunnerConfig) -> Arc<OverlayPool> {
    Arc::new(OverlayPool::new(
        config.overlay_pool_dir(),
        config.pool_target_size,
        config.pool_low_water,
    ))
}

async fn start(config: RunnerConfig) -> Result<()> {
    config.validate()?;
    let token = config
        .runner_token
        .clone()
        .with_context(|| format!("{} is not set", STRATUS_RUNNER_TOKEN))?;
    // Before the proxy binds its port, so a second runner gets a clear error
    let lock = InstanceLock::acquire(&config.run_dir, &config.base_dir)?;

    let ca = Arc::new(
        CertificateAuthority::load_or_generate(&config.proxy_ca_dir())
            .context("Failed to load the proxy CA")?,
    );
    let proxy_server = ProxyServer::new(
        ProxyVmRegistry::new(config.proxy_registry_path()),
        ca,
        default_upstream_tls()?,
    );
    let proxy = start_proxy(
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.proxy_port)),
        proxy_server,
    )
    .await
    .context("Failed to start the egress proxy")?;

    let source = Arc::new(HttpJobSource::new(
        &config.api_url,
        &token,
        config.http_timeout,
    )?);
    let pool = overlay_pool(&config);
    let orchestrator = Arc::new(
        VmOrchestrator::new(host_resources(config.clone()), pool)
            .with_ca_cert(proxy.ca_cert_pem.clone()),
    );
    tokio::spawn(log_events(orchestrator.subscribe()));

    println!(
        "{} Runner for {} polling {}",
        "▶".green(),
        config.runner_group.cyan(),
        config.api_url
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let result = Runner::new(orchestrator, source)
        .with_instance_lock(lock)
        .run(shutdown_rx)
        .await;
    proxy.shutdown().await;
    result?;

    println!("{} Runner stopped", "■".yellow());
    Ok(())
}

async fn log_events(mut events: broadcast::Receiver<VmEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => match event.kind {
                VmEventKind::StateChanged { state } => info!(
                    run_id = %event.run_id,
                    vm_id = event.vm_id.as_deref().unwrap_or("-"),
                    "VM {}",
                    state
                ),
                VmEventKind::GuestEvent { payload } => {
                    debug!(run_id = %event.run_id, "Guest event: {}", payload)
                }
            },
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!("Event logger skipped {} events", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn status(config: &RunnerConfig) -> Result<()> {
    let status_file = StatusFile::new(config.status_file());
    let Some(status) = status_file.read()? else {
        println!("{}", "No runner has started on this host yet".yellow());
        println!(
            "{}",
            format!("Expected a status file at {}", status_file.path().display()).dimmed()
        );
        return Ok(());
    };

    let alive = is_process_alive(status.pid);
    let state = match (status.state, alive) {
        (RunnerState::Stopped, _) => status.state.to_string().dimmed(),
        (_, false) => format!("{} (stale, pid gone)", status.state).red(),
        (RunnerState::Running, true) => status.state.to_string().green(),
        _ => status.state.to_string().yellow(),
    };

    println!("{}", "Stratus runner".blue().bold());
    println!("  State:          {}", state);
    println!("  PID:            {}", status.pid);
    println!("  Runner group:   {}", status.runner_group);
    println!(
        "  Active jobs:    {}/{}",
        status.active_jobs, status.max_concurrent_vms
    );
    println!("  Ready overlays: {}", status.ready_overlays);
    println!(
        "  Updated:        {}",
        status.updated_at.format("%Y-%m-%d %H:%M:%S UTC")
    );

    let allocator = NetNsAllocator::new(
        config.netns_registry_path(),
        config.netns_subnet,
        config.netns_max_slots,
    );
    let entries = allocator.entries()?;
    if entries.is_empty() {
        return Ok(());
    }

    println!();
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["VM", "Namespace", "Guest address", "Owner", "Since"]);
    for entry in entries {
        table.add_row(vec![
            entry.vm_id.clone(),
            entry.name.clone(),
            entry.ns_ip.to_string(),
            entry.owner_pid.to_string(),
            entry.created_at.format("%H:%M:%S").to_string(),
        ]);
    }
    println!("{table}");
    Ok(())
}

async fn reconcile(config: RunnerConfig) -> Result<()> {
    // Refuse to clean up underneath a live runner
    let _lock = InstanceLock::acquire(&config.run_dir, &config.base_dir)?;
    let report = host_resources(config).reconcile().await?;

    println!("{} Reconciliation complete", "✓".green());
    println!("  Workspaces removed:    {}", report.workspaces_removed);
    println!("  Orphaned namespaces:   {}", report.orphaned_namespaces);
    println!("  Stale proxy entries:   {}", report.stale_proxy_entries);
    Ok(())
}
