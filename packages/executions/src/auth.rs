// ABOUTME: Runner authentication and job authorization
// ABOUTME: Resolves bearer tokens to auth scopes and checks them against a job's run and group

use stratus_core::{is_official_group, RunnerAuthScope};
use stratus_security::hash_token;
use tracing::{debug, warn};

use crate::storage::JobQueueStorage;
use crate::types::{ClaimError, ClaimResult, RunRecord, RunnerTokenKind};

#[derive(Clone)]
pub struct RunnerAuthenticator {
    storage: JobQueueStorage,
}

impl RunnerAuthenticator {
    pub fn new(storage: JobQueueStorage) -> Self {
        Self { storage }
    }

    /// Resolve a bearer token into the runner's scope.
    pub async fn authenticate(&self, bearer: &str) -> ClaimResult<RunnerAuthScope> {
        let bearer = bearer.trim();
        if bearer.is_empty() {
            return Err(ClaimError::Unauthorized);
        }

        let token = self
            .storage
            .find_token_by_hash(&hash_token(bearer))
            .await?
            .ok_or(ClaimError::Unauthorized)?;

        if let Err(e) = self.storage.touch_token(&token.id).await {
            warn!("Failed to update last_used_at for runner token {}: {}", token.id, e);
        }

        match (token.kind, token.user_id) {
            (RunnerTokenKind::Official, _) => Ok(RunnerAuthScope::Official {
                runner_id: token.id,
            }),
            (RunnerTokenKind::User, Some(user_id)) => Ok(RunnerAuthScope::User {
                runner_id: token.id,
                user_id,
            }),
            (RunnerTokenKind::User, None) => {
                warn!("Runner token {} has no owning user", token.id);
                Err(ClaimError::Unauthorized)
            }
        }
    }
}

/// Check that `scope` may act on jobs in `runner_group`.
pub async fn authorize_group(
    storage: &JobQueueStorage,
    scope: &RunnerAuthScope,
    runner_group: &str,
) -> ClaimResult<()> {
    match scope {
        RunnerAuthScope::Official { .. } => {
            if is_official_group(runner_group) {
                Ok(())
            } else {
                Err(ClaimError::Forbidden(format!(
                    "Official runners cannot serve group '{}'",
                    runner_group
                )))
            }
        }
        RunnerAuthScope::User { user_id, .. } => {
            if is_official_group(runner_group) {
                return Err(ClaimError::Forbidden(format!(
                    "Group '{}' is reserved for official runners",
                    runner_group
                )));
            }
            if !storage.has_group_grant(user_id, runner_group).await? {
                debug!("User {} has no grant for group {}", user_id, runner_group);
                return Err(ClaimError::Forbidden(format!(
                    "Runner group '{}' is not granted to this runner",
                    runner_group
                )));
            }
            Ok(())
        }
    }
}

/// Check that `scope` may claim the job for `run` queued in `runner_group`.
pub async fn authorize_claim(
    storage: &JobQueueStorage,
    scope: &RunnerAuthScope,
    run: &RunRecord,
    runner_group: &str,
) -> ClaimResult<()> {
    if let RunnerAuthScope::User { user_id, .. } = scope {
        if &run.user_id != user_id {
            return Err(ClaimError::Forbidden(format!(
                "Run {} does not belong to this runner's user",
                run.id
            )));
        }
    }
    authorize_group(storage, scope, runner_group).await
}
