// ABOUTME: Secret bundle encryption using ChaCha20-Poly1305 AEAD
// ABOUTME: Bundles are bound to their run ID so ciphertext cannot be replayed onto another run
//
// FORMAT:
//
// - A bundle is a JSON object of secret name -> value
// - Ciphertext is base64(nonce || ciphertext || tag)
// - The run ID is the AEAD associated data
// - The service key is 32 raw bytes, supplied as base64

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ring::{
    aead::{self, Aad, Nonce, UnboundKey},
    error::Unspecified,
    rand::{SecureRandom, SystemRandom},
};
use std::collections::HashMap;
use std::sync::Arc;

/// Nonce size for ChaCha20-Poly1305
const NONCE_SIZE: usize = 12;

/// Key size for ChaCha20-Poly1305
const KEY_SIZE: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum EncryptionError {
    #[error("Failed to generate random data: {0}")]
    RandomGeneration(String),

    #[error("Failed to encrypt data: {0}")]
    Encryption(String),

    #[error("Failed to decrypt data: {0}")]
    Decryption(String),

    #[error("Failed to derive encryption key: {0}")]
    KeyDerivation(String),

    #[error("Invalid encrypted data format")]
    InvalidFormat,

    #[error("Invalid secret bundle: {0}")]
    InvalidBundle(#[from] serde_json::Error),
}

impl From<Unspecified> for EncryptionError {
    fn from(_: Unspecified) -> Self {
        EncryptionError::Encryption("Cryptographic operation failed".to_string())
    }
}

/// Service-side cipher for secret bundles
pub struct SecretsCipher {
    rng: Arc<SystemRandom>,
    key: Vec<u8>,
}

impl std::fmt::Debug for SecretsCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretsCipher").finish_non_exhaustive()
    }
}

impl SecretsCipher {
    /// Build a cipher from a base64-encoded 32-byte key.
    pub fn from_base64_key(encoded: &str) -> Result<Self, EncryptionError> {
        let key = BASE64
            .decode(encoded.trim())
            .map_err(|_| EncryptionError::KeyDerivation("Key is not valid base64".to_string()))?;
        if key.len() != KEY_SIZE {
            return Err(EncryptionError::KeyDerivation(format!(
                "Key must be {} bytes, got {}",
                KEY_SIZE,
                key.len()
            )));
        }
        Ok(Self {
            rng: Arc::new(SystemRandom::new()),
            key,
        })
    }

    /// Generate a fresh base64 key suitable for `STRATUS_ENCRYPTION_KEY`.
    pub fn generate_key() -> Result<String, EncryptionError> {
        let mut key = [0u8; KEY_SIZE];
        SystemRandom::new()
            .fill(&mut key)
            .map_err(|_| EncryptionError::RandomGeneration("Failed to generate key".to_string()))?;
        Ok(BASE64.encode(key))
    }

    /// Encrypt a bundle of secrets for `run_id`.
    pub fn encrypt_bundle(
        &self,
        run_id: &str,
        secrets: &HashMap<String, String>,
    ) -> Result<String, EncryptionError> {
        let plaintext = serde_json::to_vec(secrets)?;
        self.seal(run_id.as_bytes(), &plaintext)
    }

    /// Decrypt a bundle produced by [`encrypt_bundle`](Self::encrypt_bundle) for the same run.
    pub fn decrypt_bundle(
        &self,
        run_id: &str,
        ciphertext: &str,
    ) -> Result<HashMap<String, String>, EncryptionError> {
        let plaintext = self.open(run_id.as_bytes(), ciphertext)?;
        Ok(serde_json::from_slice(&plaintext)?)
    }

    fn seal(&self, aad: &[u8], plaintext: &[u8]) -> Result<String, EncryptionError> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        self.rng.fill(&mut nonce_bytes).map_err(|_| {
            EncryptionError::RandomGeneration("Failed to generate nonce".to_string())
        })?;
        let nonce = Nonce::try_assume_unique_for_key(&nonce_bytes)?;

        let unbound_key = UnboundKey::new(&aead::CHACHA20_POLY1305, &self.key)?;
        let sealing_key = aead::LessSafeKey::new(unbound_key);

        let mut in_out = plaintext.to_vec();
        sealing_key
            .seal_in_place_append_tag(nonce, Aad::from(aad), &mut in_out)
            .map_err(|_| EncryptionError::Encryption("Seal operation failed".to_string()))?;

        let mut result = Vec::with_capacity(NONCE_SIZE + in_out.len());
        result.extend_from_slice(&nonce_bytes);
        result.extend_from_slice(&in_out);

        Ok(BASE64.encode(&result))
    }

    fn open(&self, aad: &[u8], ciphertext: &str) -> Result<Vec<u8>, EncryptionError> {
        let encrypted_data = BASE64
            .decode(ciphertext)
            .map_err(|_| EncryptionError::InvalidFormat)?;

        if encrypted_data.len() < NONCE_SIZE + aead::CHACHA20_POLY1305.tag_len() {
            return Err(EncryptionError::InvalidFormat);
        }

        let (nonce_bytes, ciphertext_and_tag) = encrypted_data.split_at(NONCE_SIZE);
        let nonce = Nonce::try_assume_unique_for_key(nonce_bytes)?;

        let unbound_key = UnboundKey::new(&aead::CHACHA20_POLY1305, &self.key)?;
        let opening_key = aead::LessSafeKey::new(unbound_key);

        let mut in_out = ciphertext_and_tag.to_vec();
        let plaintext = opening_key
            .open_in_place(nonce, Aad::from(aad), &mut in_out)
            .map_err(|_| EncryptionError::Decryption("Open operation failed".to_string()))?;

        Ok(plaintext.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn cipher() -> SecretsCipher {
        SecretsCipher::from_base64_key(&SecretsCipher::generate_key().unwrap()).unwrap()
    }

    fn bundle() -> HashMap<String, String> {
        HashMap::from([
            ("ANTHROPIC_API_KEY".to_string(), "sk-ant-123".to_string()),
            ("GITHUB_TOKEN".to_string(), "ghp_456".to_string()),
        ])
    }

    #[test]
    fn test_bundle_decrypts_for_same_run() {
        let cipher = cipher();
        let encrypted = cipher.encrypt_bundle("run_1", &bundle()).unwrap();
        assert!(!encrypted.contains("sk-ant-123"));
        assert_eq!(cipher.decrypt_bundle("run_1", &encrypted).unwrap(), bundle());
    }

    #[test]
    fn test_bundle_bound_to_run_id() {
        let cipher = cipher();
        let encrypted = cipher.encrypt_bundle("run_1", &bundle()).unwrap();
        assert!(matches!(
            cipher.decrypt_bundle("run_2", &encrypted),
            Err(EncryptionError::Decryption(_))
        ));
    }

    #[test]
    fn test_different_nonces() {
        let cipher = cipher();
        let first = cipher.encrypt_bundle("run_1", &bundle()).unwrap();
        let second = cipher.encrypt_bundle("run_1", &bundle()).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_wrong_key_fails() {
        let encrypted = cipher().encrypt_bundle("run_1", &bundle()).unwrap();
        assert!(cipher().decrypt_bundle("run_1", &encrypted).is_err());
    }

    #[test]
    fn test_decrypt_invalid_data() {
        let cipher = cipher();
        assert!(matches!(
            cipher.decrypt_bundle("run_1", "not-valid-base64!@#"),
            Err(EncryptionError::InvalidFormat)
        ));
        assert!(matches!(
            cipher.decrypt_bundle("run_1", &BASE64.encode(b"short")),
            Err(EncryptionError::InvalidFormat)
        ));
        assert!(cipher
            .decrypt_bundle("run_1", &BASE64.encode(vec![0u8; 50]))
            .is_err());
    }

    #[test]
    fn test_key_validation() {
        assert!(SecretsCipher::from_base64_key("too-short").is_err());
        assert!(SecretsCipher::from_base64_key(&BASE64.encode([1u8; 16])).is_err());
    }
}
