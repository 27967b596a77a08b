// ABOUTME: Runner main loop: poll, claim, run jobs concurrently, and report each outcome once
// ABOUTME: Owns startup reconciliation, the status file, heartbeats, and graceful shutdown

use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use stratus_core::{ExecutionContext, JobOutcome};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::claim_client::JobSource;
use crate::config::RunnerConfig;
use crate::error::Result;
use crate::instance_lock::InstanceLock;
use crate::orchestrator::VmOrchestrator;
use crate::snapshot::SnapshotArtifact;
use crate::status::{RunnerState, RunnerStatus, StatusFile};

/// Result of one job task, as seen by the supervisor
#[derive(Debug)]
struct FinishedJob {
    run_id: String,
    outcome: JobOutcome,
}

pub struct Runner {
    orchestrator: Arc<VmOrchestrator>,
    source: Arc<dyn JobSource>,
    status: StatusFile,
    /// Runs the control plane refused us; never claimed again
    rejected: HashSet<String>,
    cancels: HashMap<String, Arc<watch::Sender<bool>>>,
    lock: Option<InstanceLock>,
}

impl Runner {
    pub fn new(orchestrator: Arc<VmOrchestrator>, source: Arc<dyn JobSource>) -> Self {
        let status = StatusFile::new(orchestrator.host().config.status_file());
        Self {
            orchestrator,
            source,
            status,
            rejected: HashSet::new(),
            cancels: HashMap::new(),
            lock: None,
        }
    }

    /// Use a lock the caller already holds, so host resources set up before
    /// the loop starts are never touched by a second runner.
    pub fn with_instance_lock(mut self, lock: InstanceLock) -> Self {
        self.lock = Some(lock);
        self
    }

    fn config(&self) -> &RunnerConfig {
        &self.orchestrator.host().config
    }

    /// Run until `shutdown` flips to true, then drain and clean up.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let config = self.config().clone();
        let _lock = match self.lock.take() {
            Some(lock) => lock,
            None => InstanceLock::acquire(&config.run_dir, &config.base_dir)?,
        };
        self.write_status(RunnerState::Starting);

        match self.orchestrator.reconcile().await {
            Ok(report) => debug!("Startup reconciliation: {:?}", report),
            Err(e) => warn!("Startup reconciliation incomplete: {}", e),
        }
        match SnapshotArtifact::latest(&config.snapshot_dir) {
            Ok(Some(artifact)) => {
                self.orchestrator.pool().spawn_replenish(&artifact);
            }
            Ok(None) => info!("No snapshot available, every VM will boot cold"),
            Err(e) => warn!("Cannot read snapshots: {}", e),
        }

        info!(
            "Runner {} serving group {} with up to {} VMs",
            std::process::id(),
            config.runner_group,
            config.max_concurrent_vms
        );
        self.write_status(RunnerState::Running);

        let slots = Arc::new(Semaphore::new(config.max_concurrent_vms));
        let mut jobs: JoinSet<FinishedJob> = JoinSet::new();
        let mut ticker = interval(config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.poll_once(&slots, &mut jobs).await;
                }
                Some(joined) = jobs.join_next(), if !jobs.is_empty() => {
                    self.finish(joined);
                }
            }
            self.write_status(RunnerState::Running);
        }

        info!("Shutting down, cancelling {} jobs", self.cancels.len());
        self.write_status(RunnerState::Draining);
        for cancel in self.cancels.values() {
            let _ = cancel.send(true);
        }
        while let Some(joined) = jobs.join_next().await {
            self.finish(joined);
            self.write_status(RunnerState::Draining);
        }

        let released = self.orchestrator.host().release_owned_networks().await;
        if released > 0 {
            warn!("Released {} namespaces left after drain", released);
        }
        self.write_status(RunnerState::Stopped);
        info!("Runner stopped");
        Ok(())
    }

    async fn poll_once(&mut self, slots: &Arc<Semaphore>, jobs: &mut JoinSet<FinishedJob>) {
        if slots.available_permits() == 0 {
            return;
        }
        let group = self.config().runner_group.clone();
        let run_ids = match self.source.poll(&group).await {
            Ok(ids) => ids,
            Err(e) if e.is_authorization() => {
                error!("Not allowed to poll {}: {}", group, e);
                return;
            }
            Err(e) => {
                warn!("Poll failed, retrying next tick: {}", e);
                return;
            }
        };

        for run_id in run_ids {
            if self.cancels.contains_key(&run_id) || self.rejected.contains(&run_id) {
                continue;
            }
            let Ok(permit) = Arc::clone(slots).try_acquire_owned() else {
                break;
            };
            match self.source.claim(&run_id).await {
                Ok(ctx) => self.spawn_job(ctx, permit, jobs),
                Err(e) if e.is_race_lost() => debug!("Run {} taken elsewhere: {}", run_id, e),
                Err(e) if e.is_authorization() => {
                    error!("Refused run {}: {}", run_id, e);
                    self.rejected.insert(run_id);
                }
                Err(e) if e.is_bad_request() => {
                    warn!("Run {} cannot be claimed: {}", run_id, e);
                    self.rejected.insert(run_id);
                }
                // Retried next tick; later runs still get their turn
                Err(e) => warn!("Claim of {} failed: {}", run_id, e),
            }
        }
    }

    fn spawn_job(
        &mut self,
        ctx: ExecutionContext,
        permit: OwnedSemaphorePermit,
        jobs: &mut JoinSet<FinishedJob>,
    ) {
        let run_id = ctx.run_id.clone();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let cancel_tx = Arc::new(cancel_tx);
        self.cancels.insert(run_id.clone(), Arc::clone(&cancel_tx));

        let orchestrator = Arc::clone(&self.orchestrator);
        let source = Arc::clone(&self.source);
        let heartbeat_every = self.config().heartbeat_interval;
        info!(run_id = %run_id, "Claimed run");

        jobs.spawn(async move {
            let _permit = permit;
            // Inner task so a panic in the lifecycle surfaces as a JoinError here
            let mut job = tokio::spawn(async move { orchestrator.run_job(ctx, cancel_rx).await });
            let mut heartbeat = interval(heartbeat_every);
            heartbeat.tick().await;

            let outcome = loop {
                tokio::select! {
                    joined = &mut job => break match joined {
                        Ok(report) => report.outcome,
                        Err(e) => JobOutcome::Failed { error: describe_join_error(&e) },
                    },
                    _ = heartbeat.tick() => {
                        if let Err(e) = source.heartbeat(&run_id).await {
                            if e.is_race_lost() || e.is_authorization() {
                                warn!(run_id = %run_id, "Lost ownership, cancelling: {}", e);
                                let _ = cancel_tx.send(true);
                            } else {
                                debug!(run_id = %run_id, "Heartbeat failed: {}", e);
                            }
                        }
                    }
                }
            };

            if let Err(e) = source.complete(&run_id, &outcome).await {
                warn!(run_id = %run_id, "Failed to report outcome: {}", e);
            }
            FinishedJob { run_id, outcome }
        });
    }

    fn finish(&mut self, joined: std::result::Result<FinishedJob, JoinError>) {
        match joined {
            Ok(job) => {
                info!(run_id = %job.run_id, "Run finished: {}", job.outcome.run_status());
                self.cancels.remove(&job.run_id);
            }
            Err(e) => {
                // The wrapper itself never panics unless reporting does; nothing left to report
                error!("Job supervisor task failed: {}", describe_join_error(&e));
                self.cancels.retain(|_, tx| tx.receiver_count() > 0);
            }
        }
    }

    fn write_status(&self, state: RunnerState) {
        let config = self.config();
        let status = RunnerStatus {
            pid: std::process::id(),
            state,
            runner_group: config.runner_group.clone(),
            active_jobs: self.cancels.len(),
            ready_overlays: self.orchestrator.pool().ready_count(None),
            max_concurrent_vms: config.max_concurrent_vms,
            updated_at: Utc::now(),
        };
        if let Err(e) = self.status.write(&status) {
            warn!("Failed to write status file: {}", e);
        }
    }
}

fn describe_join_error(e: &JoinError) -> String {
    if e.is_panic() {
        "Job task panicked".to_string()
    } else {
        "Job task was aborted".to_string()
    }
}
