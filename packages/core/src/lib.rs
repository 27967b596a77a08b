// ABOUTME: Core types, constants, and utilities for Stratus
// ABOUTME: Shared wire types between the control plane, the runner, and the proxy

pub mod constants;
pub mod types;
pub mod utils;
pub mod validation;

// Re-export main types
pub use types::{
    CliAgentType, ExecutionContext, FirewallAction, FirewallPolicy, FirewallRule, JobOutcome,
    ResumeSession, RunStatus, RunnerAuthScope, StoredExecutionContext,
};

// Re-export constants
pub use constants::{stratus_dir, OFFICIAL_RUNNER_GROUP_PREFIX, WORKSPACE_PREFIX};

// Re-export utilities
pub use utils::{generate_run_id, generate_vm_id, path_exists};

// Re-export validation
pub use validation::{
    is_official_group, validate_runner_group, validate_stored_context, ValidationError,
};
