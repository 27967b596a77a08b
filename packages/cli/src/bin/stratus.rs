// ABOUTME: Entry point for the stratus binary
// ABOUTME: Parses subcommands for the runner, snapshot generation, and the control plane

use clap::{Parser, Subcommand};
use colored::*;
use std::process;

mod cli;

use cli::control_plane::ControlPlaneCommands;
use cli::runner::RunnerCommands;
use cli::snapshot::SnapshotCommands;

#[derive(Parser)]
#[command(name = "stratus")]
#[command(about = "Stratus - self-hosted microVM runner for agent jobs")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run and inspect the job runner on this host
    #[command(subcommand)]
    Runner(RunnerCommands),
    /// Manage golden snapshots
    #[command(subcommand)]
    Snapshot(SnapshotCommands),
    /// Serve the runner job API and manage runner credentials
    #[command(subcommand)]
    ControlPlane(ControlPlaneCommands),
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    stratus_cli::init_logging();

    let result = match cli.command {
        Commands::Runner(cmd) => cmd.execute().await,
        Commands::Snapshot(cmd) => cmd.execute().await,
        Commands::ControlPlane(cmd) => cmd.execute().await,
    };

    if let Err(e) = result {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        process::exit(1);
    }
}
