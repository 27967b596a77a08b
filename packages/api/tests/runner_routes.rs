// ABOUTME: Integration tests for the runner job HTTP routes
// ABOUTME: Drives the router in-process and checks status codes and error bodies

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use pretty_assertions::assert_eq;
use serde_json::Value;
use stratus_api::{create_runner_router, RunnerApiState};
use stratus_core::{CliAgentType, StoredExecutionContext};
use stratus_executions::{
    ClaimService, JobQueueStorage, RunnerAuthenticator, RunnerToken, RunnerTokenKind,
};
use stratus_security::{generate_runner_token, SecretsCipher};
use tempfile::TempDir;
use tower::ServiceExt;

struct TestApp {
    _dir: TempDir,
    router: Router,
    storage: JobQueueStorage,
    token: String,
}

async fn setup() -> TestApp {
    let dir = tempfile::tempdir().unwrap();
    let pool = stratus_storage::init_pool(dir.path().join("api.db").to_str().unwrap())
        .await
        .unwrap();
    let storage = JobQueueStorage::new(pool);
    let cipher = Arc::new(
        SecretsCipher::from_base64_key(&SecretsCipher::generate_key().unwrap()).unwrap(),
    );

    let generated = generate_runner_token().unwrap();
    storage
        .insert_runner_token(&RunnerToken {
            id: "tok_1".to_string(),
            kind: RunnerTokenKind::User,
            user_id: Some("user_1".to_string()),
            name: "laptop".to_string(),
            token_hash: generated.token_hash,
        })
        .await
        .unwrap();
    storage.grant_group("user_1", "acme/default").await.unwrap();

    let context = StoredExecutionContext {
        prompt: "hello".to_string(),
        agent_compose_version_id: "cv_1".to_string(),
        vars: HashMap::new(),
        secret_names: vec![],
        checkpoint_id: None,
        sandbox_token: "sbx".to_string(),
        working_dir: "/home/user".to_string(),
        storage_manifest: None,
        environment: HashMap::new(),
        resume_session: None,
        encrypted_secrets: None,
        cli_agent_type: CliAgentType::Codex,
        firewall: None,
    };
    storage
        .create_run("run_1", "user_1", "acme/default")
        .await
        .unwrap();
    storage
        .enqueue_job(
            "run_1",
            "acme/default",
            Some(&serde_json::to_string(&context).unwrap()),
        )
        .await
        .unwrap();

    let state = RunnerApiState {
        authenticator: RunnerAuthenticator::new(storage.clone()),
        claims: ClaimService::new(storage.clone(), cipher),
    };

    TestApp {
        _dir: dir,
        router: create_runner_router(state),
        storage,
        token: generated.token,
    }
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn post(uri: &str, token: Option<&str>, body: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method("POST").uri(uri);
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {}", token));
    }
    match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

#[tokio::test]
async fn test_claim_then_conflict() {
    let app = setup().await;

    let (status, body) = send(
        &app.router,
        post("/api/runners/jobs/run_1/claim", Some(&app.token), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["runId"], "run_1");
    assert_eq!(body["cliAgentType"], "codex");

    let (status, body) = send(
        &app.router,
        post("/api/runners/jobs/run_1/claim", Some(&app.token), None),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "CONFLICT");
}

#[tokio::test]
async fn test_missing_token_is_unauthorized() {
    let app = setup().await;
    let (status, body) = send(&app.router, post("/api/runners/jobs/run_1/claim", None, None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "UNAUTHORIZED");

    let (status, _) = send(
        &app.router,
        post("/api/runners/jobs/run_1/claim", Some("strn_wrong"), None),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_unknown_run_is_not_found() {
    let app = setup().await;
    let (status, body) = send(
        &app.router,
        post("/api/runners/jobs/run_nope/claim", Some(&app.token), None),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "NOT_FOUND");
}

#[tokio::test]
async fn test_poll_heartbeat_and_complete() {
    let app = setup().await;

    let request = Request::builder()
        .uri("/api/runners/jobs?group=acme/default")
        .header("authorization", format!("Bearer {}", app.token))
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&app.router, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["runIds"], serde_json::json!(["run_1"]));

    send(
        &app.router,
        post("/api/runners/jobs/run_1/claim", Some(&app.token), None),
    )
    .await;

    let (status, _) = send(
        &app.router,
        post("/api/runners/jobs/run_1/heartbeat", Some(&app.token), None),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let outcome = r#"{"status":"completed","exit_code":0,"output":{"summary":"done"}}"#;
    let (status, _) = send(
        &app.router,
        post("/api/runners/jobs/run_1/complete", Some(&app.token), Some(outcome)),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, body) = send(
        &app.router,
        post("/api/runners/jobs/run_1/complete", Some(&app.token), Some(outcome)),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "CONFLICT");

    let run = app.storage.get_run("run_1").await.unwrap().unwrap();
    assert_eq!(run.result.unwrap()["summary"], "done");
}

#[tokio::test]
async fn test_malformed_outcome_is_bad_request() {
    let app = setup().await;
    let (status, body) = send(
        &app.router,
        post(
            "/api/runners/jobs/run_1/complete",
            Some(&app.token),
            Some(r#"{"status":"exploded"}"#),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "BAD_REQUEST");
}

#[tokio::test]
async fn test_forbidden_group_poll() {
    let app = setup().await;
    let request = Request::builder()
        .uri("/api/runners/jobs?group=stratus/us-east-1")
        .header("authorization", format!("Bearer {}", app.token))
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&app.router, request).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["code"], "FORBIDDEN");
}
