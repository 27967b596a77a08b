// ABOUTME: SQLite persistence bootstrap for the Stratus control plane
// ABOUTME: Opens the connection pool with WAL and busy timeouts, then applies migrations

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

const MAX_CONNECTIONS: u32 = 10;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Database error: {0}")]
    Database(String),
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("Sqlx error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Open (creating if needed) the database at `database_url` and run migrations.
///
/// Accepts `sqlite:` URLs, `sqlite::memory:`, or a bare file path.
pub async fn init_pool(database_url: &str) -> StorageResult<SqlitePool> {
    let url = if database_url.starts_with("sqlite:") {
        database_url.to_string()
    } else {
        let path = Path::new(database_url);
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        format!("sqlite://{}", path.display())
    };

    debug!("Connecting to database: {}", url);

    let options = SqliteConnectOptions::from_str(&url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .foreign_keys(true)
        .busy_timeout(BUSY_TIMEOUT);

    let pool = SqlitePoolOptions::new()
        .max_connections(MAX_CONNECTIONS)
        .acquire_timeout(ACQUIRE_TIMEOUT)
        .connect_with(options)
        .await?;

    info!("Database connection established");

    run_migrations(&pool).await?;
    Ok(pool)
}

/// Apply the bundled migrations to an existing pool.
pub async fn run_migrations(pool: &SqlitePool) -> StorageResult<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(StorageError::Migration)?;
    debug!("Database migrations completed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_init_pool_creates_schema() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("nested").join("stratus.db");
        let pool = init_pool(db_path.to_str().unwrap()).await.unwrap();

        let tables: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE '_sqlx%' ORDER BY name",
        )
        .fetch_all(&pool)
        .await
        .unwrap();

        assert_eq!(
            tables,
            vec![
                "runner_group_grants",
                "runner_job_queue",
                "runner_tokens",
                "runs"
            ]
        );
        assert!(db_path.exists());
    }

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("stratus.db");
        let pool = init_pool(db_path.to_str().unwrap()).await.unwrap();
        run_migrations(&pool).await.unwrap();
    }

    #[tokio::test]
    async fn test_queue_row_requires_existing_run() {
        let dir = tempfile::tempdir().unwrap();
        let pool = init_pool(dir.path().join("fk.db").to_str().unwrap())
            .await
            .unwrap();

        let result = sqlx::query(
            "INSERT INTO runner_job_queue (run_id, runner_group) VALUES ('missing', 'acme/default')",
        )
        .execute(&pool)
        .await;
        assert!(result.is_err());
    }
}
