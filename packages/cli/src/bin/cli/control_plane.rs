// ABOUTME: Control-plane subcommands: serve the runner API, issue runner tokens, grant groups
// ABOUTME: Tokens are printed once and stored only as hashes

use anyhow::Result;
use clap::{Subcommand, ValueEnum};
use colored::*;
use stratus_cli::{grant_group, issue_token, open_storage, ControlPlane, ControlPlaneConfig};
use stratus_executions::RunnerTokenKind;

use super::shutdown_signal;

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum TokenKind {
    /// Serves the reserved official groups for every user
    Official,
    /// Serves only runs owned by one user, in groups granted to them
    User,
}

impl From<TokenKind> for RunnerTokenKind {
    fn from(kind: TokenKind) -> Self {
        match kind {
            TokenKind::Official => RunnerTokenKind::Official,
            TokenKind::User => RunnerTokenKind::User,
        }
    }
}

#[derive(Subcommand)]
pub enum ControlPlaneCommands {
    /// Serve the runner job API
    Serve,
    /// Create a runner token
    CreateToken {
        /// Token kind
        #[arg(long, value_enum, default_value = "user")]
        kind: TokenKind,
        /// Owning user (required for user tokens)
        #[arg(long)]
        user: Option<String>,
        /// Human-readable label, e.g. the runner host
        #[arg(long, default_value = "runner")]
        name: String,
    },
    /// Allow a user's runners to serve a runner group
    Grant {
        #[arg(long)]
        user: String,
        /// Group in `scope/name` form
        #[arg(long)]
        group: String,
    },
}

impl ControlPlaneCommands {
    pub async fn execute(self) -> Result<()> {
        let config = ControlPlaneConfig::from_env();
        match self {
            ControlPlaneCommands::Serve => {
                let control_plane = ControlPlane::open(&config).await?;
                println!(
                    "{} Control plane on http://{}",
                    "▶".green(),
                    config.listen_addr
                );
                control_plane.serve(&config, shutdown_signal()).await
            }
            ControlPlaneCommands::CreateToken { kind, user, name } => {
                let storage = open_storage(&config.database_url).await?;
                let issued = issue_token(&storage, kind.into(), user.as_deref(), &name).await?;
                println!("{} Created runner token {}", "✓".green(), issued.id.cyan());
                println!();
                println!("  {}", issued.token.bold());
                println!();
                println!(
                    "{}",
                    "Store it now; it cannot be shown again.".yellow()
                );
                Ok(())
            }
            ControlPlaneCommands::Grant { user, group } => {
                let storage = open_storage(&config.database_url).await?;
                grant_group(&storage, &user, &group).await?;
                println!(
                    "{} {} may now serve {}",
                    "✓".green(),
                    user,
                    group.cyan()
                );
                Ok(())
            }
        }
    }
}
