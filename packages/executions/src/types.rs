// ABOUTME: Job queue and claim type definitions
// ABOUTME: Queue rows, run records, runner tokens, and the structured claim error taxonomy

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use stratus_core::{RunStatus, StoredExecutionContext};
use stratus_storage::StorageError;
use thiserror::Error;

/// A pending row in the runner job queue
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedJob {
    pub run_id: String,
    pub runner_group: String,
    /// Raw JSON; parsed and validated only at claim time
    pub execution_context: Option<String>,
    pub claimed_at: Option<String>,
    pub created_at: String,
}

/// A run as tracked by the control plane
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: String,
    pub user_id: String,
    pub runner_group: String,
    pub status: RunStatus,
    pub claimed_by: Option<String>,
    pub last_heartbeat_at: Option<String>,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub error_message: Option<String>,
    pub result: Option<serde_json::Value>,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerTokenKind {
    Official,
    User,
}

impl RunnerTokenKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Official => "official",
            Self::User => "user",
        }
    }
}

/// Stored runner credential (hash only)
#[derive(Debug, Clone, PartialEq)]
pub struct RunnerToken {
    pub id: String,
    pub kind: RunnerTokenKind,
    pub user_id: Option<String>,
    pub name: String,
    pub token_hash: String,
}

/// Everything needed to dispatch a run to a runner group.
///
/// `secrets` are plaintext here and encrypted before they reach the queue.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub user_id: String,
    pub runner_group: String,
    pub context: StoredExecutionContext,
    pub secrets: HashMap<String, String>,
}

/// Machine-readable claim failure
#[derive(Debug, Error)]
pub enum ClaimError {
    #[error("Runner credential missing or invalid")]
    Unauthorized,

    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Job already claimed: {0}")]
    Conflict(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ClaimError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthorized => "UNAUTHORIZED",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Conflict(_) => "CONFLICT",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Lost races are expected under contention and should not be logged as errors.
    pub fn is_race_lost(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::Conflict(_))
    }
}

impl From<sqlx::Error> for ClaimError {
    fn from(err: sqlx::Error) -> Self {
        ClaimError::Internal(format!("database error: {}", err))
    }
}

impl From<StorageError> for ClaimError {
    fn from(err: StorageError) -> Self {
        ClaimError::Internal(err.to_string())
    }
}

pub type ClaimResult<T> = std::result::Result<T, ClaimError>;

/// Timestamp format shared with the SQL defaults so string comparison orders correctly
pub fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn now_timestamp() -> String {
    timestamp(Utc::now())
}
