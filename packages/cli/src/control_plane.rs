// ABOUTME: Control-plane assembly: database, cipher, runner router, and heartbeat expiry sweep
// ABOUTME: Also issues runner tokens and group grants for the create-token and grant commands

use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use axum::Router;
use stratus_api::{create_runner_router, RunnerApiState};
use stratus_config::constants::{
    STRATUS_CONTROL_PLANE_HOST, STRATUS_CONTROL_PLANE_PORT, STRATUS_DATABASE_URL,
    STRATUS_ENCRYPTION_KEY, STRATUS_HEARTBEAT_EXPIRY_SECS,
};
use stratus_config::{env_parse, env_string, env_u64_in_range};
use stratus_core::{is_official_group, stratus_dir, validate_runner_group};
use stratus_executions::{
    ClaimService, JobQueueStorage, RunnerAuthenticator, RunnerToken, RunnerTokenKind,
};
use stratus_security::{generate_runner_token, SecretsCipher};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_DATABASE_FILE: &str = "control-plane.db";
const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ControlPlaneConfig {
    pub database_url: String,
    /// Base64 ChaCha20-Poly1305 key; required to serve, not to manage tokens
    pub encryption_key: Option<String>,
    pub listen_addr: SocketAddr,
    /// Running runs without a heartbeat for this long are failed
    pub heartbeat_expiry: Duration,
}

impl ControlPlaneConfig {
    pub fn from_env() -> Self {
        let database_url = env_string(STRATUS_DATABASE_URL).unwrap_or_else(|| {
            stratus_dir()
                .join(DEFAULT_DATABASE_FILE)
                .to_string_lossy()
                .into_owned()
        });
        let host: IpAddr = env_parse(
            STRATUS_CONTROL_PLANE_HOST,
            IpAddr::V4(Ipv4Addr::LOCALHOST),
        );
        let port = env_u64_in_range(STRATUS_CONTROL_PLANE_PORT, DEFAULT_PORT as u64, 1..=65_535);

        Self {
            database_url,
            encryption_key: env_string(STRATUS_ENCRYPTION_KEY),
            listen_addr: SocketAddr::new(host, port as u16),
            heartbeat_expiry: Duration::from_secs(env_u64_in_range(
                STRATUS_HEARTBEAT_EXPIRY_SECS,
                180,
                30..=86_400,
            )),
        }
    }

    /// How often the expiry sweep runs
    pub fn sweep_interval(&self) -> Duration {
        (self.heartbeat_expiry / 3).max(MIN_SWEEP_INTERVAL)
    }
}

/// A freshly minted runner token. The plaintext is never stored.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub id: String,
    pub token: String,
}

/// Open (and migrate) the control-plane database.
pub async fn open_storage(database_url: &str) -> Result<JobQueueStorage> {
    let pool = stratus_storage::init_pool(database_url)
        .await
        .with_context(|| format!("Failed to open database {}", database_url))?;
    Ok(JobQueueStorage::new(pool))
}

/// Create a runner token. User tokens need an owner; official tokens must not have one.
pub async fn issue_token(
    storage: &JobQueueStorage,
    kind: RunnerTokenKind,
    user_id: Option<&str>,
    name: &str,
) -> Result<IssuedToken> {
    match (kind, user_id) {
        (RunnerTokenKind::User, None) => bail!("User runner tokens need a --user"),
        (RunnerTokenKind::Official, Some(_)) => bail!("Official runner tokens cannot belong to a user"),
        _ => {}
    }

    let generated = generate_runner_token().context("Failed to generate runner token")?;
    let id = format!("rtk_{}", uuid::Uuid::new_v4().simple());
    storage
        .insert_runner_token(&RunnerToken {
            id: id.clone(),
            kind,
            user_id: user_id.map(str::to_string),
            name: name.to_string(),
            token_hash: generated.token_hash,
        })
        .await
        .context("Failed to store runner token")?;

    info!("Issued {} runner token {}", kind.as_str(), id);
    Ok(IssuedToken {
        id,
        token: generated.token,
    })
}

/// Let `user_id`'s runners serve `runner_group`.
pub async fn grant_group(storage: &JobQueueStorage, user_id: &str, runner_group: &str) -> Result<()> {
    validate_runner_group(runner_group)?;
    if is_official_group(runner_group) {
        bail!(
            "Group '{}' is reserved for official runners and cannot be granted",
            runner_group
        );
    }
    storage
        .grant_group(user_id, runner_group)
        .await
        .context("Failed to store group grant")?;
    info!("Granted {} to user {}", runner_group, user_id);
    Ok(())
}

/// The serving half of the control plane
#[derive(Clone)]
pub struct ControlPlane {
    claims: ClaimService,
    authenticator: RunnerAuthenticator,
}

impl ControlPlane {
    pub fn new(storage: JobQueueStorage, cipher: Arc<SecretsCipher>) -> Self {
        Self {
            authenticator: RunnerAuthenticator::new(storage.clone()),
            claims: ClaimService::new(storage, cipher),
        }
    }

    /// Open the database and load the secrets key from `config`.
    pub async fn open(config: &ControlPlaneConfig) -> Result<Self> {
        let Some(key) = config.encryption_key.as_deref() else {
            bail!(
                "{} must be set to a base64-encoded 32-byte key",
                STRATUS_ENCRYPTION_KEY
            );
        };
        let cipher = SecretsCipher::from_base64_key(key)
            .with_context(|| format!("{} is not a valid key", STRATUS_ENCRYPTION_KEY))?;
        let storage = open_storage(&config.database_url).await?;
        Ok(Self::new(storage, Arc::new(cipher)))
    }

    pub fn storage(&self) -> &JobQueueStorage {
        self.claims.storage()
    }

    pub fn router(&self) -> Router {
        create_runner_router(RunnerApiState {
            authenticator: self.authenticator.clone(),
            claims: self.claims.clone(),
        })
    }

    /// Periodically fail runs whose runner stopped heartbeating.
    pub fn spawn_expiry_sweep(
        &self,
        max_age: Duration,
        every: Duration,
        mut stop: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let claims = self.claims.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match claims.expire_stale_runs(max_age).await {
                            Ok(expired) if !expired.is_empty() => {
                                warn!("Expired {} run(s) with stale heartbeats", expired.len());
                            }
                            Ok(_) => {}
                            Err(e) => error!("Heartbeat expiry sweep failed: {}", e),
                        }
                    }
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Serve the runner API until `shutdown` resolves.
    pub async fn serve<F>(&self, config: &ControlPlaneConfig, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(config.listen_addr)
            .await
            .with_context(|| format!("Failed to bind {}", config.listen_addr))?;
        info!("Control plane listening on {}", listener.local_addr()?);

        let (stop_tx, stop_rx) = watch::channel(false);
        let sweeper =
            self.spawn_expiry_sweep(config.heartbeat_expiry, config.sweep_interval(), stop_rx);

        let served = axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await;

        let _ = stop_tx.send(true);
        if let Err(e) = sweeper.await {
            warn!("Expiry sweep ended abnormally: {}", e);
        }
        served.context("Control plane server failed")?;
        info!("Control plane stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sweep_interval_has_a_floor() {
        let mut config = ControlPlaneConfig {
            database_url: "control.db".to_string(),
            encryption_key: None,
            listen_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)),
            heartbeat_expiry: Duration::from_secs(180),
        };
        assert_eq!(config.sweep_interval(), Duration::from_secs(60));

        config.heartbeat_expiry = Duration::from_secs(6);
        assert_eq!(config.sweep_interval(), MIN_SWEEP_INTERVAL);
    }
}
