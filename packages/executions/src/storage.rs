// ABOUTME: Runner job queue storage layer using SQLite
// ABOUTME: Runs, queue rows, transactional claims, runner tokens, and group grants

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use stratus_core::{JobOutcome, RunStatus};
use stratus_storage::StorageError;
use tracing::{debug, warn};

use crate::types::{
    now_timestamp, ClaimError, ClaimResult, QueuedJob, RunRecord, RunnerToken, RunnerTokenKind,
};

#[derive(Clone)]
pub struct JobQueueStorage {
    pool: SqlitePool,
}

impl JobQueueStorage {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ==================== Runs ====================

    /// Create a run in the `queued` state
    pub async fn create_run(
        &self,
        run_id: &str,
        user_id: &str,
        runner_group: &str,
    ) -> Result<(), StorageError> {
        debug!("Creating run: {} for user: {}", run_id, user_id);

        let now = now_timestamp();
        sqlx::query(
            r#"
            INSERT INTO runs (id, user_id, runner_group, status, created_at, updated_at)
            VALUES (?, ?, ?, 'queued', ?, ?)
            "#,
        )
        .bind(run_id)
        .bind(user_id)
        .bind(runner_group)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(StorageError::Sqlx)?;

        Ok(())
    }

    /// Get a single run by ID
    pub async fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>, StorageError> {
        let row = sqlx::query("SELECT * FROM runs WHERE id = ?")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(StorageError::Sqlx)?;

        row.as_ref().map(row_to_run).transpose()
    }

    /// Record a heartbeat for a running run owned by `runner_id`.
    /// Returns false when the run is not running under that runner.
    pub async fn record_heartbeat(
        &self,
        run_id: &str,
        runner_id: &str,
    ) -> Result<bool, StorageError> {
        let now = now_timestamp();
        let result = sqlx::query(
            r#"
            UPDATE runs SET last_heartbeat_at = ?, updated_at = ?
            WHERE id = ? AND status = 'running' AND claimed_by = ?
            "#,
        )
        .bind(&now)
        .bind(&now)
        .bind(run_id)
        .bind(runner_id)
        .execute(&self.pool)
        .await
        .map_err(StorageError::Sqlx)?;

        Ok(result.rows_affected() == 1)
    }

    /// Move a running run to its terminal status. Only the first call for a run succeeds.
    pub async fn complete_run(
        &self,
        run_id: &str,
        runner_id: &str,
        outcome: &JobOutcome,
    ) -> Result<bool, StorageError> {
        let now = now_timestamp();
        let result_json = match outcome {
            JobOutcome::Completed {
                output: Some(output),
                ..
            } => Some(serde_json::to_string(output).map_err(|e| {
                StorageError::Database(format!("Failed to serialize run output: {}", e))
            })?),
            _ => None,
        };

        let result = sqlx::query(
            r#"
            UPDATE runs
            SET status = ?, completed_at = ?, error_message = ?, result = ?, updated_at = ?
            WHERE id = ? AND status = 'running' AND claimed_by = ?
            "#,
        )
        .bind(outcome.run_status().as_str())
        .bind(&now)
        .bind(outcome.error_message())
        .bind(result_json)
        .bind(&now)
        .bind(run_id)
        .bind(runner_id)
        .execute(&self.pool)
        .await
        .map_err(StorageError::Sqlx)?;

        Ok(result.rows_affected() == 1)
    }

    /// Fail a run that has not reached a terminal state yet. Returns false if it already had.
    pub async fn fail_run_if_active(
        &self,
        run_id: &str,
        error: &str,
    ) -> Result<bool, StorageError> {
        let now = now_timestamp();
        let result = sqlx::query(
            r#"
            UPDATE runs SET status = 'failed', completed_at = ?, error_message = ?, updated_at = ?
            WHERE id = ? AND status IN ('queued', 'running')
            "#,
        )
        .bind(&now)
        .bind(error)
        .bind(&now)
        .bind(run_id)
        .execute(&self.pool)
        .await
        .map_err(StorageError::Sqlx)?;

        Ok(result.rows_affected() == 1)
    }

    /// Fail every running run whose last heartbeat is older than `cutoff`.
    pub async fn expire_stale_runs(&self, cutoff: &str) -> Result<Vec<String>, StorageError> {
        let now = now_timestamp();
        let expired: Vec<String> = sqlx::query_scalar(
            r#"
            UPDATE runs
            SET status = 'failed', completed_at = ?, error_message = 'Runner heartbeat lost',
                updated_at = ?
            WHERE status = 'running' AND last_heartbeat_at IS NOT NULL AND last_heartbeat_at < ?
            RETURNING id
            "#,
        )
        .bind(&now)
        .bind(&now)
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(StorageError::Sqlx)?;

        Ok(expired)
    }

    // ==================== Job Queue ====================

    /// Insert the pending queue row for a run
    pub async fn enqueue_job(
        &self,
        run_id: &str,
        runner_group: &str,
        execution_context: Option<&str>,
    ) -> Result<(), StorageError> {
        debug!("Enqueueing run: {} into group: {}", run_id, runner_group);

        sqlx::query(
            r#"
            INSERT INTO runner_job_queue (run_id, runner_group, execution_context, created_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(run_id)
        .bind(runner_group)
        .bind(execution_context)
        .bind(now_timestamp())
        .execute(&self.pool)
        .await
        .map_err(StorageError::Sqlx)?;

        Ok(())
    }

    pub async fn get_queued_job(&self, run_id: &str) -> Result<Option<QueuedJob>, StorageError> {
        let row = sqlx::query(
            r#"
            SELECT run_id, runner_group, execution_context, claimed_at, created_at
            FROM runner_job_queue WHERE run_id = ?
            "#,
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(StorageError::Sqlx)?;

        Ok(row.map(|row| QueuedJob {
            run_id: row.get("run_id"),
            runner_group: row.get("runner_group"),
            execution_context: row.get("execution_context"),
            claimed_at: row.get("claimed_at"),
            created_at: row.get("created_at"),
        }))
    }

    /// Unclaimed run IDs in a group, oldest first. `user_id` narrows to one owner.
    pub async fn list_claimable(
        &self,
        runner_group: &str,
        user_id: Option<&str>,
        limit: i64,
    ) -> Result<Vec<String>, StorageError> {
        let run_ids: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT q.run_id FROM runner_job_queue q
            JOIN runs r ON r.id = q.run_id
            WHERE q.runner_group = ? AND q.claimed_at IS NULL
              AND (? IS NULL OR r.user_id = ?)
            ORDER BY q.created_at ASC
            LIMIT ?
            "#,
        )
        .bind(runner_group)
        .bind(user_id)
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(StorageError::Sqlx)?;

        Ok(run_ids)
    }

    /// Claim a queue row atomically.
    ///
    /// The conditional `UPDATE ... WHERE claimed_at IS NULL` is the only atomicity
    /// boundary: exactly one caller sees one affected row. That caller's `finalize`
    /// turns the stored context into the claim result; if it fails, the whole
    /// transaction rolls back and the row stays unclaimed. On success the run is marked
    /// running and the queue row is deleted before commit.
    ///
    /// Returns `Ok(None)` when no unclaimed row matched.
    pub async fn claim_job<T, F>(
        &self,
        run_id: &str,
        claimed_by: &str,
        finalize: F,
    ) -> ClaimResult<Option<T>>
    where
        F: FnOnce(Option<String>) -> ClaimResult<T>,
    {
        let now = now_timestamp();
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE runner_job_queue SET claimed_at = ? WHERE run_id = ? AND claimed_at IS NULL",
        )
        .bind(&now)
        .bind(run_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            tx.rollback().await?;
            return Ok(None);
        }

        let stored: Option<String> =
            sqlx::query_scalar("SELECT execution_context FROM runner_job_queue WHERE run_id = ?")
                .bind(run_id)
                .fetch_one(&mut *tx)
                .await?;

        let value = match finalize(stored) {
            Ok(value) => value,
            Err(ClaimError::BadRequest(reason)) => {
                // Never claimable, so fail the run and drop it from the queue
                sqlx::query(
                    r#"
                    UPDATE runs SET status = 'failed', completed_at = ?, error_message = ?,
                        updated_at = ?
                    WHERE id = ? AND status = 'queued'
                    "#,
                )
                .bind(&now)
                .bind(&reason)
                .bind(&now)
                .bind(run_id)
                .execute(&mut *tx)
                .await?;
                sqlx::query("DELETE FROM runner_job_queue WHERE run_id = ?")
                    .bind(run_id)
                    .execute(&mut *tx)
                    .await?;
                tx.commit().await?;
                warn!("Run {} failed at claim: {}", run_id, reason);
                return Err(ClaimError::BadRequest(reason));
            }
            // Dropping `tx` on any other error rolls the claim back
            Err(e) => return Err(e),
        };

        sqlx::query(
            r#"
            UPDATE runs
            SET status = 'running', claimed_by = ?, started_at = ?, last_heartbeat_at = ?,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(claimed_by)
        .bind(&now)
        .bind(&now)
        .bind(&now)
        .bind(run_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM runner_job_queue WHERE run_id = ?")
            .bind(run_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        debug!("Run {} claimed by {}", run_id, claimed_by);
        Ok(Some(value))
    }

    // ==================== Runner Tokens ====================

    pub async fn insert_runner_token(&self, token: &RunnerToken) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO runner_tokens (id, token_hash, kind, user_id, name, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&token.id)
        .bind(&token.token_hash)
        .bind(token.kind.as_str())
        .bind(&token.user_id)
        .bind(&token.name)
        .bind(now_timestamp())
        .execute(&self.pool)
        .await
        .map_err(StorageError::Sqlx)?;

        Ok(())
    }

    /// Look up an active (non-revoked) token by hash
    pub async fn find_token_by_hash(
        &self,
        token_hash: &str,
    ) -> Result<Option<RunnerToken>, StorageError> {
        let row = sqlx::query(
            r#"
            SELECT id, token_hash, kind, user_id, name FROM runner_tokens
            WHERE token_hash = ? AND revoked_at IS NULL
            "#,
        )
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await
        .map_err(StorageError::Sqlx)?;

        let Some(row) = row else {
            return Ok(None);
        };

        let kind = match row.get::<String, _>("kind").as_str() {
            "official" => RunnerTokenKind::Official,
            "user" => RunnerTokenKind::User,
            other => {
                return Err(StorageError::Database(format!(
                    "Invalid runner token kind: {}",
                    other
                )))
            }
        };

        Ok(Some(RunnerToken {
            id: row.get("id"),
            kind,
            user_id: row.get("user_id"),
            name: row.get("name"),
            token_hash: row.get("token_hash"),
        }))
    }

    pub async fn touch_token(&self, token_id: &str) -> Result<(), StorageError> {
        sqlx::query("UPDATE runner_tokens SET last_used_at = ? WHERE id = ?")
            .bind(now_timestamp())
            .bind(token_id)
            .execute(&self.pool)
            .await
            .map_err(StorageError::Sqlx)?;
        Ok(())
    }

    pub async fn revoke_token(&self, token_id: &str) -> Result<bool, StorageError> {
        let result = sqlx::query(
            "UPDATE runner_tokens SET revoked_at = ? WHERE id = ? AND revoked_at IS NULL",
        )
        .bind(now_timestamp())
        .bind(token_id)
        .execute(&self.pool)
        .await
        .map_err(StorageError::Sqlx)?;
        Ok(result.rows_affected() == 1)
    }

    // ==================== Group Grants ====================

    pub async fn grant_group(&self, user_id: &str, runner_group: &str) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT OR IGNORE INTO runner_group_grants (user_id, runner_group, created_at) VALUES (?, ?, ?)",
        )
        .bind(user_id)
        .bind(runner_group)
        .bind(now_timestamp())
        .execute(&self.pool)
        .await
        .map_err(StorageError::Sqlx)?;
        Ok(())
    }

    pub async fn has_group_grant(
        &self,
        user_id: &str,
        runner_group: &str,
    ) -> Result<bool, StorageError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM runner_group_grants WHERE user_id = ? AND runner_group = ?",
        )
        .bind(user_id)
        .bind(runner_group)
        .fetch_one(&self.pool)
        .await
        .map_err(StorageError::Sqlx)?;
        Ok(count > 0)
    }
}

fn row_to_run(row: &SqliteRow) -> Result<RunRecord, StorageError> {
    let status_str: String = row.try_get("status")?;
    let status = status_str
        .parse::<RunStatus>()
        .map_err(StorageError::Database)?;

    let result = row
        .try_get::<Option<String>, _>("result")?
        .map(|raw| serde_json::from_str(&raw))
        .transpose()
        .map_err(|e| StorageError::Database(format!("Invalid run result JSON: {}", e)))?;

    Ok(RunRecord {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        runner_group: row.try_get("runner_group")?,
        status,
        claimed_by: row.try_get("claimed_by")?,
        last_heartbeat_at: row.try_get("last_heartbeat_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        error_message: row.try_get("error_message")?,
        result,
        created_at: row.try_get("created_at")?,
    })
}
