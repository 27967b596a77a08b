// ABOUTME: Runner loop tests with an in-memory job source
// ABOUTME: Exactly-once reporting, claim rejections, graceful shutdown, and the single-instance guard

mod common;

use async_trait::async_trait;
use common::{context, FakeHypervisor, Harness};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use stratus_core::{ExecutionContext, JobOutcome};
use stratus_sandboxes::{
    InstanceLock, JobSource, Result, Runner, RunnerState, SandboxError, StatusFile,
};
use tokio::sync::watch;

fn rejected(code: &str) -> SandboxError {
    SandboxError::ClaimRejected {
        code: code.to_string(),
        message: format!("{} from test source", code),
    }
}

/// Queue of runs; some are claimed elsewhere or forbidden
#[derive(Default)]
struct FakeJobSource {
    queued: Mutex<Vec<ExecutionContext>>,
    claimed: Mutex<HashSet<String>>,
    taken_elsewhere: HashSet<String>,
    forbidden: HashSet<String>,
    malformed: Vec<String>,
    claim_attempts: Mutex<HashMap<String, usize>>,
    heartbeats: Mutex<usize>,
    completions: Mutex<Vec<(String, JobOutcome)>>,
}

impl FakeJobSource {
    fn new(jobs: Vec<ExecutionContext>) -> Self {
        Self {
            queued: Mutex::new(jobs),
            ..Default::default()
        }
    }

    fn completions(&self) -> Vec<(String, JobOutcome)> {
        self.completions.lock().unwrap().clone()
    }

    fn attempts(&self, run_id: &str) -> usize {
        *self.claim_attempts.lock().unwrap().get(run_id).unwrap_or(&0)
    }
}

#[async_trait]
impl JobSource for FakeJobSource {
    async fn poll(&self, _group: &str) -> Result<Vec<String>> {
        let claimed = self.claimed.lock().unwrap();
        // Malformed runs are the oldest, so they come first
        let mut ids: Vec<String> = self.malformed.clone();
        ids.extend(
            self.queued
                .lock()
                .unwrap()
                .iter()
                .map(|c| c.run_id.clone())
                .filter(|id| !claimed.contains(id)),
        );
        ids.extend(self.taken_elsewhere.iter().cloned());
        ids.extend(self.forbidden.iter().cloned());
        Ok(ids)
    }

    async fn claim(&self, run_id: &str) -> Result<ExecutionContext> {
        *self
            .claim_attempts
            .lock()
            .unwrap()
            .entry(run_id.to_string())
            .or_default() += 1;
        if self.taken_elsewhere.contains(run_id) {
            return Err(rejected("CONFLICT"));
        }
        if self.forbidden.contains(run_id) {
            return Err(rejected("FORBIDDEN"));
        }
        if self.malformed.iter().any(|id| id == run_id) {
            return Err(rejected("BAD_REQUEST"));
        }
        if !self.claimed.lock().unwrap().insert(run_id.to_string()) {
            return Err(rejected("CONFLICT"));
        }
        self.queued
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.run_id == run_id)
            .cloned()
            .ok_or_else(|| rejected("NOT_FOUND"))
    }

    async fn heartbeat(&self, _run_id: &str) -> Result<()> {
        *self.heartbeats.lock().unwrap() += 1;
        Ok(())
    }

    async fn complete(&self, run_id: &str, outcome: &JobOutcome) -> Result<()> {
        self.completions
            .lock()
            .unwrap()
            .push((run_id.to_string(), outcome.clone()));
        Ok(())
    }
}

async fn wait_until<F: Fn() -> bool>(what: &str, condition: F) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[tokio::test]
async fn test_runner_reports_each_outcome_once() {
    let harness = Harness::new();
    let mut source = FakeJobSource::new(vec![
        context("run_a", "complete"),
        context("run_b", "fail"),
        context("run_c", "complete"),
    ]);
    source.taken_elsewhere.insert("run_taken".to_string());
    source.forbidden.insert("run_forbidden".to_string());
    let source = Arc::new(source);

    let runner = Runner::new(Arc::new(harness.orchestrator()), source.clone());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(runner.run(shutdown_rx));

    wait_until("three completions", || source.completions().len() == 3).await;
    // Give the loop a few more ticks to prove nothing is reported twice
    tokio::time::sleep(Duration::from_millis(300)).await;
    shutdown_tx.send(true).unwrap();
    task.await.unwrap().unwrap();

    let completions: HashMap<String, JobOutcome> = source.completions().into_iter().collect();
    assert_eq!(source.completions().len(), 3);
    assert!(matches!(completions["run_a"], JobOutcome::Completed { .. }));
    assert!(matches!(completions["run_b"], JobOutcome::Failed { .. }));
    assert!(matches!(completions["run_c"], JobOutcome::Completed { .. }));

    assert_eq!(source.attempts("run_forbidden"), 1);
    assert!(source.attempts("run_taken") >= 1);

    let status = StatusFile::new(harness.config().status_file())
        .read()
        .unwrap()
        .unwrap();
    assert_eq!(status.state, RunnerState::Stopped);
    assert_eq!(status.active_jobs, 0);
    assert!(harness.workspace_dirs().is_empty());
    assert!(harness.host.allocator.entries().unwrap().is_empty());
}

#[tokio::test]
async fn test_malformed_run_does_not_block_the_queue() {
    let harness = Harness::new();
    let mut source = FakeJobSource::new(vec![context("run_good", "complete")]);
    source.malformed.push("run_bad".to_string());
    let source = Arc::new(source);

    let runner = Runner::new(Arc::new(harness.orchestrator()), source.clone());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(runner.run(shutdown_rx));

    wait_until("run_good to complete", || source.completions().len() == 1).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    shutdown_tx.send(true).unwrap();
    task.await.unwrap().unwrap();

    assert_eq!(source.completions()[0].0, "run_good");
    assert_eq!(source.attempts("run_good"), 1);
    assert_eq!(source.attempts("run_bad"), 1);
}

#[tokio::test]
async fn test_shutdown_cancels_running_jobs() {
    let harness = Harness::build(FakeHypervisor::new(), |config| {
        config.job_timeout = Duration::from_secs(120);
    });
    let source = Arc::new(FakeJobSource::new(vec![context("run_long", "hang")]));
    let runner = Runner::new(Arc::new(harness.orchestrator()), source.clone());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(runner.run(shutdown_rx));

    wait_until("the VM to launch", || !harness.hypervisor.launches().is_empty()).await;
    let status = StatusFile::new(harness.config().status_file());
    wait_until("status to show the job", || {
        status
            .read()
            .ok()
            .flatten()
            .map(|s| s.state == RunnerState::Running && s.active_jobs == 1)
            .unwrap_or(false)
    })
    .await;
    wait_until("a heartbeat", || *source.heartbeats.lock().unwrap() > 0).await;

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(10), task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    let completions = source.completions();
    assert_eq!(completions.len(), 1);
    assert!(matches!(completions[0].1, JobOutcome::Cancelled { .. }));
    assert_eq!(status.read().unwrap().unwrap().state, RunnerState::Stopped);
    assert!(harness.workspace_dirs().is_empty());
    assert!(harness.host.allocator.entries().unwrap().is_empty());
}

#[tokio::test]
async fn test_second_runner_on_same_base_dir_fails_fast() {
    let harness = Harness::new();
    let _held = InstanceLock::acquire(&harness.config().run_dir, &harness.config().base_dir).unwrap();

    let runner = Runner::new(
        Arc::new(harness.orchestrator()),
        Arc::new(FakeJobSource::default()),
    );
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let err = runner.run(shutdown_rx).await.unwrap_err();
    assert!(matches!(err, SandboxError::InstanceLocked { .. }));
}

#[tokio::test]
async fn test_runner_keeps_a_lock_taken_before_startup() {
    let harness = Harness::new();
    let config = harness.config().clone();
    let lock = InstanceLock::acquire(&config.run_dir, &config.base_dir).unwrap();

    // A second runner is refused while the first holds the lock
    assert!(matches!(
        InstanceLock::acquire(&config.run_dir, &config.base_dir),
        Err(SandboxError::InstanceLocked { .. })
    ));

    let source = Arc::new(FakeJobSource::new(vec![context("run_locked", "complete")]));
    let runner = Runner::new(Arc::new(harness.orchestrator()), source.clone())
        .with_instance_lock(lock);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(runner.run(shutdown_rx));

    wait_until("run_locked to complete", || source.completions().len() == 1).await;
    assert!(InstanceLock::acquire(&config.run_dir, &config.base_dir).is_err());
    shutdown_tx.send(true).unwrap();
    task.await.unwrap().unwrap();

    // Released on exit
    InstanceLock::acquire(&config.run_dir, &config.base_dir).unwrap();
}
