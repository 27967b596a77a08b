// ABOUTME: Snapshot subcommands: boot a reference VM and capture a golden snapshot
// ABOUTME: Optionally pre-fills the overlay pool from the new golden overlay

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::*;
use stratus_sandboxes::{RunnerConfig, SnapshotArtifact, SnapshotGenerator};

use super::runner::{host_resources, overlay_pool};

#[derive(Subcommand)]
pub enum SnapshotCommands {
    /// Boot the configured kernel and rootfs, then capture a golden snapshot
    Generate {
        /// Skip filling the overlay pool from the new snapshot
        #[arg(long)]
        skip_pool: bool,
    },
    /// Show the snapshot restores will use
    Show,
}

impl SnapshotCommands {
    pub async fn execute(self) -> Result<()> {
        let config = RunnerConfig::from_env();
        match self {
            SnapshotCommands::Generate { skip_pool } => generate(config, skip_pool).await,
            SnapshotCommands::Show => show(&config),
        }
    }
}

async fn generate(config: RunnerConfig, skip_pool: bool) -> Result<()> {
    config.validate()?;
    let pool = overlay_pool(&config);

    println!("{} Booting reference VM...", "▶".cyan());
    let artifact = SnapshotGenerator::new(host_resources(config))
        .generate()
        .await
        .context("Snapshot generation failed")?;

    println!("{} Snapshot written to {}", "✓".green(), artifact.dir.display());
    println!("  Source hash: {}", artifact.manifest.source_hash);

    if !skip_pool {
        let fill_from = artifact.clone();
        let created = tokio::task::spawn_blocking(move || pool.replenish(&fill_from))
            .await
            .context("Overlay pool fill panicked")??;
        println!("  Overlay pool: {} new overlay(s)", created);
    }
    Ok(())
}

fn show(config: &RunnerConfig) -> Result<()> {
    match SnapshotArtifact::latest(&config.snapshot_dir)? {
        Some(artifact) => {
            let manifest = &artifact.manifest;
            println!("{}", "Golden snapshot".blue().bold());
            println!("  Directory:   {}", artifact.dir.display());
            println!("  Source hash: {}", manifest.source_hash);
            println!("  Kernel:      {}", manifest.kernel_image.display());
            println!("  Rootfs:      {}", manifest.rootfs_image.display());
            println!(
                "  Machine:     {} vCPU, {} MiB",
                manifest.vcpus, manifest.memory_mb
            );
            println!(
                "  Created:     {}",
                manifest.created_at.format("%Y-%m-%d %H:%M:%S UTC")
            );
            let ready = overlay_pool(config).ready_count(Some(&artifact));
            println!("  Ready overlays: {}", ready);
        }
        None => {
            println!("{}", "No snapshot found; VMs will cold boot".yellow());
            println!(
                "{}",
                "Use 'stratus snapshot generate' to create one".dimmed()
            );
        }
    }
    Ok(())
}
