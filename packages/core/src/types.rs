// ABOUTME: Core type definitions shared across Stratus packages
// ABOUTME: Execution contexts, runner auth scopes, firewall policies, and job outcomes

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Agent CLI that the guest should drive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CliAgentType {
    ClaudeCode,
    Codex,
    Gemini,
}

impl Default for CliAgentType {
    fn default() -> Self {
        Self::ClaudeCode
    }
}

/// Session data used to resume a previous agent conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeSession {
    pub session_id: String,
    pub session_history: String,
}

/// Whether a firewall rule admits or rejects traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FirewallAction {
    Allow,
    Deny,
}

impl fmt::Display for FirewallAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Allow => write!(f, "allow"),
            Self::Deny => write!(f, "deny"),
        }
    }
}

/// One destination rule.
///
/// `destination` is a domain (`api.example.com`), a wildcard (`*.example.com`),
/// an IP literal, or a CIDR block (`10.0.0.0/8`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallRule {
    pub action: FirewallAction,
    pub destination: String,
}

impl FirewallRule {
    pub fn allow(destination: impl Into<String>) -> Self {
        Self {
            action: FirewallAction::Allow,
            destination: destination.into(),
        }
    }

    pub fn deny(destination: impl Into<String>) -> Self {
        Self {
            action: FirewallAction::Deny,
            destination: destination.into(),
        }
    }
}

/// Egress policy enforced by the proxy for one run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FirewallPolicy {
    #[serde(default)]
    pub rules: Vec<FirewallRule>,
    #[serde(default = "default_action")]
    pub default_action: FirewallAction,
    /// Terminate and re-originate TLS so inner requests can be logged
    #[serde(default)]
    pub inspect_tls: bool,
}

fn default_action() -> FirewallAction {
    FirewallAction::Deny
}

impl Default for FirewallPolicy {
    fn default() -> Self {
        Self {
            rules: Vec::new(),
            default_action: FirewallAction::Deny,
            inspect_tls: false,
        }
    }
}

/// Execution context as persisted in the job queue row.
///
/// Secrets are stored as a single encrypted bundle and only decrypted at claim time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredExecutionContext {
    pub prompt: String,
    pub agent_compose_version_id: String,
    #[serde(default)]
    pub vars: HashMap<String, String>,
    #[serde(default)]
    pub secret_names: Vec<String>,
    #[serde(default)]
    pub checkpoint_id: Option<String>,
    pub sandbox_token: String,
    pub working_dir: String,
    #[serde(default)]
    pub storage_manifest: Option<serde_json::Value>,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    #[serde(default)]
    pub resume_session: Option<ResumeSession>,
    #[serde(default)]
    pub encrypted_secrets: Option<String>,
    #[serde(default)]
    pub cli_agent_type: CliAgentType,
    #[serde(default)]
    pub firewall: Option<FirewallPolicy>,
}

/// Execution context handed to a runner by a successful claim
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionContext {
    pub run_id: String,
    pub prompt: String,
    pub agent_compose_version_id: String,
    pub vars: HashMap<String, String>,
    pub secret_names: Vec<String>,
    pub checkpoint_id: Option<String>,
    pub sandbox_token: String,
    pub working_dir: String,
    pub storage_manifest: Option<serde_json::Value>,
    pub environment: HashMap<String, String>,
    pub resume_session: Option<ResumeSession>,
    pub secret_values: HashMap<String, String>,
    pub cli_agent_type: CliAgentType,
    pub firewall: Option<FirewallPolicy>,
}

impl ExecutionContext {
    /// Build the runner-facing context from the stored row and the decrypted secrets.
    pub fn from_stored(
        run_id: impl Into<String>,
        stored: StoredExecutionContext,
        secret_values: HashMap<String, String>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            prompt: stored.prompt,
            agent_compose_version_id: stored.agent_compose_version_id,
            vars: stored.vars,
            secret_names: stored.secret_names,
            checkpoint_id: stored.checkpoint_id,
            sandbox_token: stored.sandbox_token,
            working_dir: stored.working_dir,
            storage_manifest: stored.storage_manifest,
            environment: stored.environment,
            resume_session: stored.resume_session,
            secret_values,
            cli_agent_type: stored.cli_agent_type,
            firewall: stored.firewall,
        }
    }

    pub fn firewall_enabled(&self) -> bool {
        self.firewall.is_some()
    }
}

/// Identity a runner authenticated as
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunnerAuthScope {
    /// Platform-operated runner, restricted to reserved runner groups
    Official { runner_id: String },
    /// Self-hosted runner, restricted to groups granted to its user
    User { runner_id: String, user_id: String },
}

impl RunnerAuthScope {
    pub fn runner_id(&self) -> &str {
        match self {
            Self::Official { runner_id } | Self::User { runner_id, .. } => runner_id,
        }
    }

    pub fn is_official(&self) -> bool {
        matches!(self, Self::Official { .. })
    }
}

/// Terminal, job-scoped outcome reported to the control plane
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobOutcome {
    Completed {
        exit_code: i32,
        #[serde(default)]
        output: Option<serde_json::Value>,
    },
    Failed {
        error: String,
    },
    Timeout {
        budget_secs: u64,
    },
    Cancelled {
        reason: String,
    },
}

impl JobOutcome {
    pub fn run_status(&self) -> RunStatus {
        match self {
            Self::Completed { .. } => RunStatus::Completed,
            Self::Failed { .. } => RunStatus::Failed,
            Self::Timeout { .. } => RunStatus::Timeout,
            Self::Cancelled { .. } => RunStatus::Cancelled,
        }
    }

    pub fn error_message(&self) -> Option<String> {
        match self {
            Self::Completed { .. } => None,
            Self::Failed { error } => Some(error.clone()),
            Self::Timeout { budget_secs } => {
                Some(format!("Run exceeded its {}s budget", budget_secs))
            }
            Self::Cancelled { reason } => Some(reason.clone()),
        }
    }
}

/// Control-plane status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Queued | Self::Running)
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "timeout" => Ok(Self::Timeout),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid run status: {}", s)),
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
