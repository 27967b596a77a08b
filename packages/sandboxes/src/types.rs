// ABOUTME: Core type definitions for the microVM runner
// ABOUTME: VM lifecycle states, broadcast events, and per-job reports

use serde::{Deserialize, Serialize};
use std::fmt;
use stratus_core::JobOutcome;

/// Lifecycle of one job's VM
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmState {
    Dispatched,
    Provisioning,
    Booted,
    Executing,
    Completed,
    Failed,
    /// Also reached on timeout
    Cancelled,
    TornDown,
}

impl VmState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dispatched => "dispatched",
            Self::Provisioning => "provisioning",
            Self::Booted => "booted",
            Self::Executing => "executing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::TornDown => "torn_down",
        }
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a VM was booted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BootMode {
    /// Fresh kernel boot against a blank overlay
    Cold,
    /// Restored from a snapshot with a pooled overlay
    Restore,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VmEventKind {
    StateChanged { state: VmState },
    /// Streamed output from the guest, forwarded as-is
    GuestEvent { payload: serde_json::Value },
}

/// Broadcast to subscribers of the orchestrator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmEvent {
    pub run_id: String,
    pub vm_id: Option<String>,
    #[serde(flatten)]
    pub kind: VmEventKind,
}

/// What happened to one job
#[derive(Debug, Clone, PartialEq)]
pub struct JobReport {
    pub run_id: String,
    pub vm_id: Option<String>,
    pub boot_mode: Option<BootMode>,
    pub outcome: JobOutcome,
    /// Terminal state before teardown
    pub final_state: VmState,
}
