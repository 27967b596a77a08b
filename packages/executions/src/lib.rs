// ABOUTME: Control-plane side of runner job execution
// ABOUTME: Job queue storage, runner authentication, the claim service, and supervised dispatch

pub mod auth;
pub mod claim;
pub mod dispatch;
pub mod storage;
pub mod types;

pub use auth::RunnerAuthenticator;
pub use claim::ClaimService;
pub use dispatch::{DispatchHandle, JobDispatcher};
pub use storage::JobQueueStorage;
pub use types::{
    ClaimError, ClaimResult, DispatchRequest, QueuedJob, RunRecord, RunnerToken, RunnerTokenKind,
};
