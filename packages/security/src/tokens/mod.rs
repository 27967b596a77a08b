// ABOUTME: Runner bearer token generation and verification
// ABOUTME: Only SHA-256 hashes are stored; comparisons run in constant time

use ring::rand::{SecureRandom, SystemRandom};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::encryption::EncryptionError;

/// Prefix that makes runner tokens recognizable in logs and secret scanners
pub const RUNNER_TOKEN_PREFIX: &str = "strn_";

const TOKEN_BYTES: usize = 32;

/// Token generation result. The plaintext token is only available here.
#[derive(Debug, Clone)]
pub struct TokenGeneration {
    pub token: String,
    pub token_hash: String,
}

/// Generate a new runner token and its storage hash.
pub fn generate_runner_token() -> Result<TokenGeneration, EncryptionError> {
    let mut bytes = [0u8; TOKEN_BYTES];
    SystemRandom::new()
        .fill(&mut bytes)
        .map_err(|_| EncryptionError::RandomGeneration("Failed to generate token".to_string()))?;

    let token = format!("{}{}", RUNNER_TOKEN_PREFIX, hex::encode(bytes));
    let token_hash = hash_token(&token);
    Ok(TokenGeneration { token, token_hash })
}

/// Hex-encoded SHA-256 of the token.
pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Check a presented token against a stored hash.
pub fn verify_token(token: &str, stored_hash: &str) -> bool {
    let computed = hash_token(token);
    computed.as_bytes().ct_eq(stored_hash.as_bytes()).unwrap_u8() == 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_token_verifies() {
        let generated = generate_runner_token().unwrap();
        assert!(generated.token.starts_with(RUNNER_TOKEN_PREFIX));
        assert_eq!(generated.token_hash.len(), 64);
        assert!(verify_token(&generated.token, &generated.token_hash));
        assert!(!verify_token("strn_other", &generated.token_hash));
    }

    #[test]
    fn test_tokens_are_unique() {
        let a = generate_runner_token().unwrap();
        let b = generate_runner_token().unwrap();
        assert_ne!(a.token, b.token);
        assert_ne!(a.token_hash, b.token_hash);
    }

    #[test]
    fn test_hash_is_stable() {
        assert_eq!(hash_token("abc"), hash_token("abc"));
        assert_eq!(
            hash_token("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
