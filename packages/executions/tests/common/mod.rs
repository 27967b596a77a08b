// ABOUTME: Shared fixtures for claim service integration tests
// ABOUTME: Temp-file databases with real migrations, seeded runs, tokens, and grants

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use stratus_core::{CliAgentType, RunnerAuthScope, StoredExecutionContext};
use stratus_executions::{ClaimService, JobQueueStorage, RunnerToken, RunnerTokenKind};
use stratus_security::{generate_runner_token, SecretsCipher};
use tempfile::TempDir;

pub struct Fixture {
    pub _dir: TempDir,
    pub storage: JobQueueStorage,
    pub cipher: Arc<SecretsCipher>,
    pub service: ClaimService,
}

pub async fn setup() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let pool = stratus_storage::init_pool(dir.path().join("control.db").to_str().unwrap())
        .await
        .unwrap();
    let storage = JobQueueStorage::new(pool);
    let cipher = Arc::new(
        SecretsCipher::from_base64_key(&SecretsCipher::generate_key().unwrap()).unwrap(),
    );
    let service = ClaimService::new(storage.clone(), Arc::clone(&cipher));
    Fixture {
        _dir: dir,
        storage,
        cipher,
        service,
    }
}

pub fn stored_context() -> StoredExecutionContext {
    StoredExecutionContext {
        prompt: "Refactor the parser".to_string(),
        agent_compose_version_id: "cv_1".to_string(),
        vars: HashMap::from([("BRANCH".to_string(), "main".to_string())]),
        secret_names: vec![],
        checkpoint_id: Some("ckpt_1".to_string()),
        sandbox_token: "sbx_tok".to_string(),
        working_dir: "/home/user/workspace".to_string(),
        storage_manifest: None,
        environment: HashMap::from([("CI".to_string(), "1".to_string())]),
        resume_session: None,
        encrypted_secrets: None,
        cli_agent_type: CliAgentType::ClaudeCode,
        firewall: None,
    }
}

/// Create a run plus its queue row, with an encrypted secret bundle
pub async fn queue_run(
    fixture: &Fixture,
    run_id: &str,
    user_id: &str,
    group: &str,
    secrets: &HashMap<String, String>,
) {
    let mut context = stored_context();
    if !secrets.is_empty() {
        context.encrypted_secrets = Some(fixture.cipher.encrypt_bundle(run_id, secrets).unwrap());
        context.secret_names = secrets.keys().cloned().collect();
    }
    fixture
        .storage
        .create_run(run_id, user_id, group)
        .await
        .unwrap();
    fixture
        .storage
        .enqueue_job(
            run_id,
            group,
            Some(&serde_json::to_string(&context).unwrap()),
        )
        .await
        .unwrap();
}

pub fn user_scope(user_id: &str) -> RunnerAuthScope {
    RunnerAuthScope::User {
        runner_id: format!("rnr_{}", user_id),
        user_id: user_id.to_string(),
    }
}

pub fn official_scope() -> RunnerAuthScope {
    RunnerAuthScope::Official {
        runner_id: "rnr_official".to_string(),
    }
}

/// Store a token and return its plaintext
pub async fn create_token(
    fixture: &Fixture,
    id: &str,
    kind: RunnerTokenKind,
    user_id: Option<&str>,
) -> String {
    let generated = generate_runner_token().unwrap();
    fixture
        .storage
        .insert_runner_token(&RunnerToken {
            id: id.to_string(),
            kind,
            user_id: user_id.map(str::to_string),
            name: format!("{} token", id),
            token_hash: generated.token_hash,
        })
        .await
        .unwrap();
    generated.token
}
