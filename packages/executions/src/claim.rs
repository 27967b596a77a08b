// ABOUTME: Job Claim Service handing queued runs to authorized runners exactly once
// ABOUTME: Also serves polling, heartbeats, and exactly-once completion reports

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use stratus_core::{
    validate_stored_context, ExecutionContext, JobOutcome, RunStatus, RunnerAuthScope,
    StoredExecutionContext,
};
use stratus_security::SecretsCipher;
use tracing::{debug, info, warn};

use crate::auth::{authorize_claim, authorize_group};
use crate::storage::JobQueueStorage;
use crate::types::{timestamp, ClaimError, ClaimResult};

/// Upper bound on run IDs returned by one poll
pub const MAX_POLL_BATCH: i64 = 20;

#[derive(Clone)]
pub struct ClaimService {
    storage: JobQueueStorage,
    cipher: Arc<SecretsCipher>,
}

impl ClaimService {
    pub fn new(storage: JobQueueStorage, cipher: Arc<SecretsCipher>) -> Self {
        Self { storage, cipher }
    }

    pub fn storage(&self) -> &JobQueueStorage {
        &self.storage
    }

    /// Claim `run_id` for the runner identified by `scope`.
    pub async fn claim(
        &self,
        scope: &RunnerAuthScope,
        run_id: &str,
    ) -> ClaimResult<ExecutionContext> {
        // Authorize before the queue row is touched
        let job = match self.storage.get_queued_job(run_id).await? {
            Some(job) => job,
            None => return Err(self.classify_unclaimable(run_id).await),
        };
        let run = self
            .storage
            .get_run(run_id)
            .await?
            .ok_or_else(|| ClaimError::NotFound(run_id.to_string()))?;
        authorize_claim(&self.storage, scope, &run, &job.runner_group).await?;

        let cipher = Arc::clone(&self.cipher);
        let claim_run_id = run_id.to_string();
        let claimed = self
            .storage
            .claim_job(run_id, scope.runner_id(), move |stored| {
                build_context(&cipher, &claim_run_id, stored)
            })
            .await?;

        match claimed {
            Some(context) => {
                info!(run_id = %run_id, runner_id = %scope.runner_id(), "Run claimed");
                Ok(context)
            }
            None => Err(self.classify_unclaimable(run_id).await),
        }
    }

    /// Unclaimed run IDs in `runner_group` visible to `scope`.
    pub async fn poll(
        &self,
        scope: &RunnerAuthScope,
        runner_group: &str,
    ) -> ClaimResult<Vec<String>> {
        authorize_group(&self.storage, scope, runner_group).await?;

        let user_filter = match scope {
            RunnerAuthScope::Official { .. } => None,
            RunnerAuthScope::User { user_id, .. } => Some(user_id.as_str()),
        };
        Ok(self
            .storage
            .list_claimable(runner_group, user_filter, MAX_POLL_BATCH)
            .await?)
    }

    pub async fn heartbeat(&self, scope: &RunnerAuthScope, run_id: &str) -> ClaimResult<()> {
        if self
            .storage
            .record_heartbeat(run_id, scope.runner_id())
            .await?
        {
            return Ok(());
        }
        Err(self.classify_inactive(run_id).await)
    }

    /// Record the terminal outcome. A second report for the same run is a CONFLICT.
    pub async fn complete(
        &self,
        scope: &RunnerAuthScope,
        run_id: &str,
        outcome: &JobOutcome,
    ) -> ClaimResult<()> {
        if self
            .storage
            .complete_run(run_id, scope.runner_id(), outcome)
            .await?
        {
            info!(
                run_id = %run_id,
                status = %outcome.run_status(),
                "Run finished"
            );
            return Ok(());
        }
        Err(self.classify_inactive(run_id).await)
    }

    /// Fail running runs whose last heartbeat is older than `max_age`.
    pub async fn expire_stale_runs(&self, max_age: Duration) -> ClaimResult<Vec<String>> {
        let max_age = chrono::Duration::from_std(max_age)
            .map_err(|e| ClaimError::BadRequest(format!("Invalid heartbeat expiry: {}", e)))?;
        let cutoff = timestamp(Utc::now() - max_age);
        let expired = self.storage.expire_stale_runs(&cutoff).await?;
        for run_id in &expired {
            warn!(run_id = %run_id, "Run failed after its runner stopped heartbeating");
        }
        Ok(expired)
    }

    /// Distinguish "someone else has it" from "never existed" after a failed claim.
    async fn classify_unclaimable(&self, run_id: &str) -> ClaimError {
        match self.storage.get_queued_job(run_id).await {
            Ok(Some(job)) if job.claimed_at.is_some() => {
                return ClaimError::Conflict(run_id.to_string())
            }
            Ok(_) => {}
            Err(e) => return ClaimError::from(e),
        }
        match self.storage.get_run(run_id).await {
            Ok(Some(run)) if run.status != RunStatus::Queued => {
                ClaimError::Conflict(run_id.to_string())
            }
            Ok(_) => ClaimError::NotFound(run_id.to_string()),
            Err(e) => ClaimError::from(e),
        }
    }

    async fn classify_inactive(&self, run_id: &str) -> ClaimError {
        match self.storage.get_run(run_id).await {
            Ok(Some(run)) => {
                debug!(
                    "Run {} is {} (claimed by {:?})",
                    run_id, run.status, run.claimed_by
                );
                ClaimError::Conflict(format!("run {} is {}", run_id, run.status))
            }
            Ok(None) => ClaimError::NotFound(run_id.to_string()),
            Err(e) => ClaimError::from(e),
        }
    }
}

fn build_context(
    cipher: &SecretsCipher,
    run_id: &str,
    stored: Option<String>,
) -> ClaimResult<ExecutionContext> {
    let raw = stored.ok_or_else(|| {
        ClaimError::BadRequest(format!("Run {} has no stored execution context", run_id))
    })?;

    let stored: StoredExecutionContext = serde_json::from_str(&raw).map_err(|e| {
        ClaimError::BadRequest(format!("Stored execution context is malformed: {}", e))
    })?;
    validate_stored_context(&stored).map_err(|e| ClaimError::BadRequest(e.to_string()))?;

    let secret_values = match stored.encrypted_secrets.as_deref() {
        Some(bundle) if !bundle.is_empty() => {
            cipher.decrypt_bundle(run_id, bundle).map_err(|e| {
                warn!("Failed to decrypt secrets for run {}: {}", run_id, e);
                ClaimError::Internal("Failed to decrypt run secrets".to_string())
            })?
        }
        _ => HashMap::new(),
    };

    Ok(ExecutionContext::from_stored(run_id, stored, secret_values))
}
