// ABOUTME: Validation of execution contexts and runner group names
// ABOUTME: Rejects incomplete queue payloads before any secret is decrypted

use std::path::Path;
use thiserror::Error;

use crate::constants::OFFICIAL_RUNNER_GROUP_PREFIX;
use crate::types::StoredExecutionContext;

const MAX_PROMPT_LENGTH: usize = 1_000_000;
const MAX_GROUP_LENGTH: usize = 128;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Field '{0}' is required")]
    Missing(&'static str),
    #[error("Field '{field}' is invalid: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Check a stored execution context for the fields a runner cannot work without.
pub fn validate_stored_context(ctx: &StoredExecutionContext) -> Result<(), ValidationError> {
    if ctx.prompt.trim().is_empty() {
        return Err(ValidationError::Missing("prompt"));
    }
    if ctx.prompt.len() > MAX_PROMPT_LENGTH {
        return Err(ValidationError::Invalid {
            field: "prompt",
            reason: format!("exceeds {} bytes", MAX_PROMPT_LENGTH),
        });
    }
    if ctx.agent_compose_version_id.trim().is_empty() {
        return Err(ValidationError::Missing("agentComposeVersionId"));
    }
    if ctx.sandbox_token.trim().is_empty() {
        return Err(ValidationError::Missing("sandboxToken"));
    }
    if ctx.working_dir.trim().is_empty() {
        return Err(ValidationError::Missing("workingDir"));
    }
    if !Path::new(&ctx.working_dir).is_absolute() {
        return Err(ValidationError::Invalid {
            field: "workingDir",
            reason: "must be an absolute path".to_string(),
        });
    }
    if let Some(key) = ctx.environment.keys().find(|k| !is_env_key(k)) {
        return Err(ValidationError::Invalid {
            field: "environment",
            reason: format!("'{}' is not a valid variable name", key),
        });
    }
    Ok(())
}

/// Runner groups look like `scope/name`, lowercase, no whitespace.
pub fn validate_runner_group(group: &str) -> Result<(), ValidationError> {
    if group.is_empty() {
        return Err(ValidationError::Missing("runnerGroup"));
    }
    if group.len() > MAX_GROUP_LENGTH {
        return Err(ValidationError::Invalid {
            field: "runnerGroup",
            reason: format!("exceeds {} characters", MAX_GROUP_LENGTH),
        });
    }
    let Some((scope, name)) = group.split_once('/') else {
        return Err(ValidationError::Invalid {
            field: "runnerGroup",
            reason: "expected 'scope/name'".to_string(),
        });
    };
    let valid_part = |part: &str| {
        !part.is_empty()
            && part
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "-_.".contains(c))
    };
    if !valid_part(scope) || !valid_part(name) {
        return Err(ValidationError::Invalid {
            field: "runnerGroup",
            reason: "only lowercase letters, digits, '-', '_' and '.' are allowed".to_string(),
        });
    }
    Ok(())
}

/// Whether the group lives in the namespace reserved for official runners.
pub fn is_official_group(group: &str) -> bool {
    group.starts_with(OFFICIAL_RUNNER_GROUP_PREFIX)
}

fn is_env_key(key: &str) -> bool {
    let mut chars = key.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CliAgentType;
    use std::collections::HashMap;

    fn context() -> StoredExecutionContext {
        StoredExecutionContext {
            prompt: "write tests".to_string(),
            agent_compose_version_id: "cv_123".to_string(),
            vars: HashMap::new(),
            secret_names: vec![],
            checkpoint_id: None,
            sandbox_token: "sbx_token".to_string(),
            working_dir: "/home/user/workspace".to_string(),
            storage_manifest: None,
            environment: HashMap::from([("API_BASE".to_string(), "x".to_string())]),
            resume_session: None,
            encrypted_secrets: None,
            cli_agent_type: CliAgentType::ClaudeCode,
            firewall: None,
        }
    }

    #[test]
    fn test_valid_context_passes() {
        assert_eq!(validate_stored_context(&context()), Ok(()));
    }

    #[test]
    fn test_missing_fields_are_reported() {
        let mut ctx = context();
        ctx.prompt = "  ".to_string();
        assert_eq!(
            validate_stored_context(&ctx),
            Err(ValidationError::Missing("prompt"))
        );

        let mut ctx = context();
        ctx.sandbox_token.clear();
        assert_eq!(
            validate_stored_context(&ctx),
            Err(ValidationError::Missing("sandboxToken"))
        );
    }

    #[test]
    fn test_relative_working_dir_rejected() {
        let mut ctx = context();
        ctx.working_dir = "workspace".to_string();
        assert!(matches!(
            validate_stored_context(&ctx),
            Err(ValidationError::Invalid { field: "workingDir", .. })
        ));
    }

    #[test]
    fn test_bad_environment_key_rejected() {
        let mut ctx = context();
        ctx.environment.insert("1BAD=KEY".to_string(), "v".to_string());
        assert!(validate_stored_context(&ctx).is_err());
    }

    #[test]
    fn test_runner_group_format() {
        assert!(validate_runner_group("acme/default").is_ok());
        assert!(validate_runner_group("stratus/us-east-1").is_ok());
        assert!(validate_runner_group("acme").is_err());
        assert!(validate_runner_group("Acme/default").is_err());
        assert!(validate_runner_group("acme/").is_err());
        assert!(is_official_group("stratus/us-east-1"));
        assert!(!is_official_group("acme/stratus"));
    }
}
