// ABOUTME: Supervised dispatch of runs into the runner job queue
// ABOUTME: Enqueueing runs in a background task; failures mark the run failed exactly once

use std::sync::Arc;

use stratus_core::{generate_run_id, validate_runner_group, validate_stored_context};
use stratus_security::SecretsCipher;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::storage::JobQueueStorage;
use crate::types::{ClaimError, ClaimResult, DispatchRequest};

/// Handle returned to the caller of [`JobDispatcher::dispatch`]
#[derive(Debug)]
pub struct DispatchHandle {
    pub run_id: String,
    completion: oneshot::Receiver<Result<(), String>>,
}

impl DispatchHandle {
    /// Wait until the run is either queued or marked failed.
    pub async fn wait(self) -> Result<(), String> {
        self.completion
            .await
            .unwrap_or_else(|_| Err("Dispatch supervisor dropped".to_string()))
    }
}

pub struct JobDispatcher {
    storage: JobQueueStorage,
    cipher: Arc<SecretsCipher>,
}

impl JobDispatcher {
    pub fn new(storage: JobQueueStorage, cipher: Arc<SecretsCipher>) -> Self {
        Self { storage, cipher }
    }

    /// Create the run synchronously, then enqueue it from a supervised background task.
    pub async fn dispatch(self: &Arc<Self>, request: DispatchRequest) -> ClaimResult<DispatchHandle> {
        validate_runner_group(&request.runner_group)
            .map_err(|e| ClaimError::BadRequest(e.to_string()))?;

        let run_id = generate_run_id();
        self.storage
            .create_run(&run_id, &request.user_id, &request.runner_group)
            .await?;

        let (tx, rx) = oneshot::channel();
        let worker = {
            let this = Arc::clone(self);
            let run_id = run_id.clone();
            tokio::spawn(async move { this.enqueue(&run_id, request).await })
        };

        let storage = self.storage.clone();
        let supervised_run = run_id.clone();
        tokio::spawn(async move {
            let failure = match worker.await {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(join_error) => Some(format!("Dispatch task aborted: {}", join_error)),
            };

            let report = match failure {
                None => {
                    debug!("Run {} queued", supervised_run);
                    Ok(())
                }
                Some(message) => {
                    error!("Dispatch of run {} failed: {}", supervised_run, message);
                    match storage.fail_run_if_active(&supervised_run, &message).await {
                        Ok(true) => {}
                        Ok(false) => warn!(
                            "Run {} already reached a terminal state before dispatch failure",
                            supervised_run
                        ),
                        Err(e) => error!("Failed to mark run {} failed: {}", supervised_run, e),
                    }
                    Err(message)
                }
            };
            // Caller may have dropped the handle
            let _ = tx.send(report);
        });

        info!("Dispatched run {}", run_id);
        Ok(DispatchHandle {
            run_id,
            completion: rx,
        })
    }

    async fn enqueue(&self, run_id: &str, request: DispatchRequest) -> ClaimResult<()> {
        let mut context = request.context;
        validate_stored_context(&context).map_err(|e| ClaimError::BadRequest(e.to_string()))?;

        if !request.secrets.is_empty() {
            let bundle = self
                .cipher
                .encrypt_bundle(run_id, &request.secrets)
                .map_err(|e| ClaimError::Internal(format!("Failed to encrypt secrets: {}", e)))?;
            context.encrypted_secrets = Some(bundle);
            let mut names: Vec<String> = request.secrets.keys().cloned().collect();
            names.sort();
            context.secret_names = names;
        }

        let payload = serde_json::to_string(&context)
            .map_err(|e| ClaimError::Internal(format!("Failed to serialize context: {}", e)))?;
        self.storage
            .enqueue_job(run_id, &request.runner_group, Some(&payload))
            .await?;
        Ok(())
    }
}
